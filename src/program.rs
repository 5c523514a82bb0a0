// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A supervised program and its lifecycle state.
//!
//! Every program the supervisor manages is one [`Program`] slot: its launch
//! parameters, its restart policy, and the live state of its current
//! incarnation. Incarnations are identified by a token minted from a shared
//! [`TokenMint`]; a kill request carries the token of the incarnation it was
//! aimed at, so a request that was queued against a process that has since
//! died and been replaced hits nothing.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::{error, info, warn};

use crate::fork::{EX_DATAERR, EX_NOINPUT, EX_NOPERM, EX_UNAVAILABLE};

/// Index of a program in the supervisor's program table.
pub type ProgramId = usize;

/// Incarnation token. See the constants below for the two reserved values.
pub type Token = u64;

/// Wildcard on kill requests: act on whatever incarnation is running.
pub const TOKEN_ANY: Token = 0;
/// The token of a program that is not running.
pub const TOKEN_DOWN: Token = 1;
const TOKEN_FIRST: Token = 2;

/// Mints incarnation tokens. One mint is shared by all programs so a token
/// never repeats across the supervisor's lifetime.
#[derive(Debug)]
pub struct TokenMint {
    next: Token,
}

impl TokenMint {
    pub fn new() -> Self {
        TokenMint { next: TOKEN_FIRST }
    }

    pub fn mint(&mut self) -> Token {
        let token = self.next;
        self.next += 1;
        token
    }
}

impl Default for TokenMint {
    fn default() -> Self {
        Self::new()
    }
}

/// How the last incarnation went down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownType {
    /// Never ran.
    None,
    /// Running, or died without the reaper seeing how.
    Unknown,
    /// Exited on its own.
    Exited,
    /// Killed by a signal, with a core dump.
    Dumped,
    /// Killed by a signal.
    Killed,
}

impl DownType {
    /// The tag published on the wire. A program that never ran has no tag.
    pub fn tag(self) -> &'static str {
        match self {
            DownType::None => "",
            DownType::Unknown => "UNK",
            DownType::Exited => "EXIT",
            DownType::Dumped => "DUMP",
            DownType::Killed => "KILL",
        }
    }
}

/// What a kill request amounted to, for the scheduler to follow up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    /// Program is down and the kill came from propagation: the death
    /// handling that would normally restart it has already passed, so the
    /// caller should schedule a fresh start.
    ScheduleStart,
    /// Program is down, nothing to signal.
    AlreadyDown,
    /// The request was aimed at an earlier incarnation; left alone.
    StaleToken,
    /// Delivery was attempted against the live pid.
    Delivered,
}

#[derive(Debug)]
pub struct Program {
    name: String,
    command: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: Vec<(String, String)>,
    candidates: Vec<PathBuf>,
    respawn: bool,

    operator_shutdown: bool,
    controlled_shutdown: bool,
    prop_start: bool,
    running: bool,
    pid: Option<Pid>,
    token: Token,
    started_at: SystemTime,
    down: DownType,
    state_changes: u64,

    /// Indices into the dependency arena, both roles.
    edges: Vec<usize>,
}

impl Program {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        command: String,
        args: Vec<String>,
        cwd: Option<PathBuf>,
        env: Vec<(String, String)>,
        respawn: bool,
        enabled: bool,
    ) -> Self {
        Program {
            name,
            command,
            args,
            cwd,
            env,
            candidates: Vec::new(),
            respawn,
            operator_shutdown: !enabled,
            controlled_shutdown: false,
            prop_start: false,
            running: false,
            pid: None,
            token: TOKEN_DOWN,
            started_at: UNIX_EPOCH,
            down: DownType::None,
            state_changes: 0,
            edges: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    /// Full paths tried at exec time, in order. Resolved at build time from
    /// the command and `$PATH`.
    pub fn candidates(&self) -> &[PathBuf] {
        &self.candidates
    }

    pub fn set_candidates(&mut self, candidates: Vec<PathBuf>) {
        self.candidates = candidates;
    }

    pub fn add_edge(&mut self, dep: usize) {
        self.edges.push(dep);
    }

    pub fn edges(&self) -> &[usize] {
        &self.edges
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    /// Raw pid for the wire; 0 when down.
    pub fn pid_raw(&self) -> i32 {
        self.pid.map(Pid::as_raw).unwrap_or(0)
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn down_type(&self) -> DownType {
        self.down
    }

    pub fn state_changes(&self) -> u64 {
        self.state_changes
    }

    pub fn is_operator_shutdown(&self) -> bool {
        self.operator_shutdown
    }

    pub fn is_controlled_shutdown(&self) -> bool {
        self.controlled_shutdown
    }

    /// Record a successful fork. The incarnation is considered up from here;
    /// the reaper will tell us otherwise.
    pub fn started(&mut self, pid: Pid, token: Token) {
        self.controlled_shutdown = false;
        self.pid = Some(pid);
        self.token = token;
        self.state_changes += 1;
        self.running = true;
        self.down = DownType::Unknown;
        self.prop_start = false;
        self.started_at = SystemTime::now();
    }

    /// Deliver a signal to the running incarnation identified by `token`
    /// (or any incarnation, for [`TOKEN_ANY`]).
    ///
    /// `propagate` records that the requester wants the program back up once
    /// it is down; the death handling turns that into a fresh start.
    pub fn kill(&mut self, sig: Signal, propagate: bool, token: Token) -> KillOutcome {
        if !self.running {
            if propagate {
                // The death has already been handled, so the restart that
                // propagation asks for will not come from there. Schedule it.
                return KillOutcome::ScheduleStart;
            }
            return KillOutcome::AlreadyDown;
        }

        if token != TOKEN_ANY && token != self.token {
            return KillOutcome::StaleToken;
        }

        self.prop_start = propagate;

        let pid = match self.pid {
            Some(pid) => pid,
            None => return KillOutcome::AlreadyDown,
        };

        match signal::kill(pid, sig) {
            Ok(()) => {
                // The program is being shut down by us in some capacity. If
                // delivery failed it will not die, so we do not mark it.
                self.controlled_shutdown = true;
                info!("{}: killing with signal {:?}", self.name, sig);
            }
            Err(err) => match err.as_errno() {
                Some(nix::errno::Errno::ESRCH) => (),
                _ => error!(
                    "failed to signal {} (pid {}): {}",
                    self.name,
                    pid.as_raw(),
                    err
                ),
            },
        }
        KillOutcome::Delivered
    }

    /// Record the death of the current incarnation. Returns true when a
    /// fresh start should be scheduled: either a kill with propagation asked
    /// for one, or the program respawns. The scheduler applies the
    /// operator-shutdown and global-shutdown suppression when the start is
    /// actually handled.
    pub fn died(&mut self, down: DownType, code: i32) -> bool {
        info!("died: {}", self);

        self.pid = None;
        self.running = false;
        self.down = down;
        self.token = TOKEN_DOWN;
        self.state_changes += 1;

        // Exit codes from the launch error contract of the forked child.
        match code {
            EX_NOPERM => warn!("{} was not executable due to permissions", self.name),
            EX_DATAERR => warn!("{} executable format bad", self.name),
            EX_NOINPUT => warn!("{} file not found", self.name),
            EX_UNAVAILABLE => warn!("{} could not execute for an unknown reason", self.name),
            _ => (),
        }

        if self.prop_start {
            self.prop_start = false;
            true
        } else {
            self.respawn
        }
    }

    /// Operator takes the program out of admin down.
    pub fn op_start(&mut self) {
        self.operator_shutdown = false;
        self.state_changes += 1;
    }

    /// Operator puts the program into admin down.
    pub fn op_shutdown(&mut self) {
        self.operator_shutdown = true;
        self.state_changes += 1;
    }

    /// Milliseconds of continuous uptime; 0 when down, or when the wall
    /// clock has gone backwards past the start time.
    pub fn uptime_ms(&self, now: SystemTime) -> u64 {
        if !self.running {
            return 0;
        }
        match now.duration_since(self.started_at) {
            Ok(up) => up.as_millis() as u64,
            Err(_) => {
                warn!("clock skew: {} started in the future, reporting zero uptime", self.name);
                0
            }
        }
    }

    /// True when the program has been up for at least `for_at_least`.
    ///
    /// Computed by winding `now` back and comparing against the start time,
    /// rather than converting the uptime to a number and comparing that; the
    /// latter overflows the comparison type once enough uptime accumulates.
    pub fn is_up(&self, for_at_least: Duration, now: SystemTime) -> bool {
        if !self.running {
            return false;
        }
        match now.checked_sub(for_at_least) {
            Some(started_by) => self.started_at <= started_by,
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn test_mark_running(&mut self, pid: i32, token: Token, started_ago: Duration) {
        self.running = true;
        self.pid = Some(Pid::from_raw(pid));
        self.token = token;
        self.down = DownType::Unknown;
        self.started_at = SystemTime::now() - started_ago;
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "program {} [{}", self.name, self.command)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        write!(
            f,
            "] respawn:{} enabled:{} running:{} pid:{} token:{}",
            self.respawn,
            !self.operator_shutdown,
            self.running,
            self.pid_raw(),
            self.token
        )
    }
}
