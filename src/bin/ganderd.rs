// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The supervisor daemon.
//!
//! Exit codes: 0 for a clean run or a passing configtest, 1 for a config
//! failure, 2 for a usage error, 3 for a runtime failure.

use std::path::Path;
use std::process;

use clap::{App, Arg};
use tracing::error;
use tracing_subscriber::EnvFilter;

use gander::config::Config;
use gander::signal;
use gander::supervisor::Supervisor;

fn main() {
    let app = App::new(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about("process manager for running a gaggle of daemons")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("the configuration file")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("configtest")
                .short("t")
                .long("configtest")
                .help("only test the configuration rather than running it"),
        )
        .arg(
            Arg::with_name("ignore-sigint")
                .short("n")
                .long("ignore-sigint")
                .help(
                    "disable ^C on the terminal (or SIGINT) from shutting the daemon down; \
                     shutdown should be accomplished by sending SIGTERM in this case",
                ),
        );

    let matches = match app.get_matches_safe() {
        Ok(matches) => matches,
        Err(err) => match err.kind {
            clap::ErrorKind::HelpDisplayed | clap::ErrorKind::VersionDisplayed => {
                println!("{}", err.message);
                process::exit(0);
            }
            _ => {
                eprintln!("{}", err.message);
                process::exit(2);
            }
        },
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let conf = matches.value_of("config").expect("config is required");
    let configtest = matches.is_present("configtest");

    let mut supervisor = match build(Path::new(conf)) {
        Ok(supervisor) => supervisor,
        Err(err) => {
            if configtest {
                println!("configtest {}: failed, {}", conf, err);
            } else {
                eprintln!("failed to load {}: {}", conf, err);
            }
            process::exit(1);
        }
    };

    if configtest {
        println!("configtest {}: ok", conf);
        process::exit(0);
    }

    if let Err(err) = signal::install(matches.is_present("ignore-sigint")) {
        error!("failed to install signal handlers: {}", err);
        process::exit(3);
    }

    if let Err(err) = supervisor.run() {
        error!("supervisor failed: {}", err);
        process::exit(3);
    }
}

fn build(conf: &Path) -> Result<Supervisor, gander::Error> {
    let config = Config::load(conf)?;
    Supervisor::from_config(config)
}
