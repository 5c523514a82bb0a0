// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! TOML configuration for the daemon: supervisor settings and program
//! definitions.
//!
//! All timings are in milliseconds. Absent settings take their defaults, so
//! the smallest useful config is a single `[programs.name]` table with a
//! `command`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::Error;

/// Root of the config file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    /// Program definitions, keyed by program name.
    #[serde(default)]
    pub programs: BTreeMap<String, ProgramConfig>,
}

impl Config {
    /// Read and parse a config file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = fs::read_to_string(path).map_err(|err| Error::config(err.to_string()))?;
        Self::parse(&text)
    }

    /// Parse config text. Errors carry the TOML reason without any
    /// path context; callers add that.
    pub fn parse(text: &str) -> Result<Self, Error> {
        toml::from_str(text).map_err(|err| Error::config(err.to_string()))
    }
}

/// The `[supervisor]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    /// Scheduler idle sleep, in ms.
    #[serde(default = "default_tick")]
    pub tick: u64,

    /// Backoff before retrying a Start whose dependencies are not yet
    /// satisfied, in ms.
    #[serde(default = "default_startwait")]
    pub startwait: u64,

    /// Grace between delivering TERM and the escalated KILL, in ms.
    #[serde(default = "default_killwait")]
    pub killwait: u64,

    /// Extra directory prepended to `PATH` before commands are resolved.
    pub path: Option<String>,

    /// Unix socket for control requests. No socket is bound when unset.
    pub control_socket: Option<PathBuf>,

    /// Unix socket for state broadcasts. No socket is bound when unset.
    pub status_socket: Option<PathBuf>,
}

impl SupervisorConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick)
    }

    pub fn startwait(&self) -> Duration {
        Duration::from_millis(self.startwait)
    }

    pub fn killwait(&self) -> Duration {
        Duration::from_millis(self.killwait)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            tick: default_tick(),
            startwait: default_startwait(),
            killwait: default_killwait(),
            path: None,
            control_socket: None,
            status_socket: None,
        }
    }
}

/// One `[programs.name]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct ProgramConfig {
    /// Executable name or path. Required, but validated when the program
    /// table is built so the error can name the program.
    pub command: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory the child changes into before exec.
    pub cwd: Option<PathBuf>,

    /// Restart automatically after an uncontrolled death.
    #[serde(default = "default_respawn")]
    pub respawn: bool,

    /// Started at boot; a disabled program only runs on operator request.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Environment overrides, layered over the daemon's own environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Dependencies, as `[[programs.name.depends]]` tables.
    #[serde(default)]
    pub depends: Vec<DependsConfig>,
}

/// One dependency edge.
#[derive(Debug, Clone, Deserialize)]
pub struct DependsConfig {
    /// Name of the program depended on.
    pub on: String,

    /// How long `on` must have been up before the dependency counts as
    /// satisfied, in ms.
    #[serde(default)]
    pub delay: u64,

    /// Kill the dependent (and restart it afterwards) when `on` dies.
    #[serde(default)]
    pub propagate: bool,
}

impl DependsConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay)
    }
}

fn default_tick() -> u64 {
    10
}

fn default_startwait() -> u64 {
    100
}

fn default_killwait() -> u64 {
    10_000
}

fn default_respawn() -> bool {
    true
}

fn default_enabled() -> bool {
    true
}
