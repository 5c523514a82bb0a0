// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Watch the state transitions of a running gander daemon.
//!
//! Subscribes to the daemon's status socket and prints one line per
//! transition: `[U] name` for a program coming up, `[D ...] name` with the
//! down flags for a program going down. Broadcasts may repeat after a
//! reconnect; snapshots whose sequence is not newer than the last seen for
//! that program are dropped rather than printed twice.

use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process;

use clap::{App, Arg};

use gander::config::Config;
use gander::msg::{self, ProgramState};
use gander::status::StaleFilter;

fn main() {
    let app = App::new(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about("watch the program state transitions of a running gander daemon")
        .arg(
            Arg::with_name("socket")
                .short("u")
                .long("socket")
                .value_name("PATH")
                .help("the status socket of the daemon to connect to")
                .takes_value(true)
                .conflicts_with("config"),
        )
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("the config file of the daemon to connect to, used to acquire the socket path")
                .takes_value(true),
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

    let socket = resolve_socket(matches.value_of("socket"), matches.value_of("config"));

    let mut stream = match UnixStream::connect(&socket) {
        Ok(stream) => stream,
        Err(err) => {
            eprintln!("failed to connect to {}: {}", socket.display(), err);
            process::exit(3);
        }
    };

    let mut filter = StaleFilter::new();
    loop {
        let state: ProgramState = match msg::read_frame(&mut stream) {
            Ok(state) => state,
            Err(err) => {
                eprintln!("disconnected: {}", err);
                process::exit(0);
            }
        };

        if filter.fresh(&state) {
            print_state(&state);
        }
    }
}

/// Find the status socket: given directly, or read from the daemon config.
fn resolve_socket(socket: Option<&str>, config: Option<&str>) -> PathBuf {
    if let Some(socket) = socket {
        return PathBuf::from(socket);
    }

    let file = match config {
        Some(file) => file,
        None => {
            eprintln!("socket required.");
            process::exit(2);
        }
    };

    let config = match Config::load(file.as_ref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configtest {}: failed, {}", file, err);
            process::exit(1);
        }
    };

    match config.supervisor.status_socket {
        Some(socket) => socket,
        None => {
            eprintln!("configtest {}: status_socket not set.", file);
            process::exit(1);
        }
    }
}

fn print_state(state: &ProgramState) {
    if state.up {
        println!("[U] {}", state.program);
    } else {
        println!(
            "[D shutdown={} dtyp={} depsat={} opdown={}] {}",
            state.during_shutdown as u8,
            state.down_type,
            state.dependencies_satisfied as u8,
            state.operator_shutdown as u8,
            state.program
        );
    }
}
