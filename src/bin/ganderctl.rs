// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Tool for controlling a running gander daemon over its control socket.

use std::ffi::CStr;
use std::path::PathBuf;
use std::process;

use clap::{App, Arg, ArgGroup};
use serde::Serialize;

use gander::config::Config;
use gander::control::Client;
use gander::msg::{ProgramState, Reply, Request};

fn main() {
    let app = App::new(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about("tool for controlling a running gander daemon")
        .arg(
            Arg::with_name("socket")
                .short("u")
                .long("socket")
                .value_name("PATH")
                .help("the control socket of the daemon to connect to")
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
        )
        .arg(
            Arg::with_name("start")
                .short("s")
                .long("start")
                .value_name("PROGRAM")
                .help("take the program out of admin down state; if its dependencies are met, it will start")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("restart")
                .short("r")
                .long("restart")
                .value_name("PROGRAM")
                .help("shut down the program; if configured to respawn and its dependencies are met, it will restart")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("stop")
                .short("k")
                .long("stop")
                .value_name("PROGRAM")
                .help("put the program in admin down state and shut it down")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("dump")
                .short("d")
                .long("dump")
                .help("dump a summary of the programs running and their states"),
        )
        .arg(
            Arg::with_name("pretty")
                .short("p")
                .long("pretty")
                .requires("dump")
                .help("with -d, print durations of uptime in a more readable format (D days, H:M:S)"),
        )
        .arg(
            Arg::with_name("json")
                .short("j")
                .long("json")
                .requires("dump")
                .help("with -d, print output in json instead of a visually aligned table"),
        )
        .arg(
            Arg::with_name("shutdown")
                .long("shutdown")
                .help("shut down the daemon and all running programs"),
        )
        .group(
            ArgGroup::with_name("action")
                .args(&["start", "restart", "stop", "dump", "shutdown"])
                .required(true),
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

    let socket = resolve_socket(
        matches.value_of("socket"),
        matches.value_of("config"),
    );

    let mut client = match Client::connect(&socket) {
        Ok(client) => client,
        Err(err) => {
            eprintln!("failed to connect to {}: {}", socket.display(), err);
            process::exit(3);
        }
    };

    if let Some(program) = matches.value_of("start") {
        simple_call(
            &mut client,
            program,
            Request::Start {
                program: program.to_string(),
            },
        );
    } else if let Some(program) = matches.value_of("restart") {
        simple_call(
            &mut client,
            program,
            Request::Kill {
                program: program.to_string(),
            },
        );
    } else if let Some(program) = matches.value_of("stop") {
        simple_call(
            &mut client,
            program,
            Request::Stop {
                program: program.to_string(),
            },
        );
    } else if matches.is_present("shutdown") {
        shutdown(&mut client);
    } else if matches.is_present("dump") {
        dump(
            &mut client,
            matches.is_present("pretty"),
            matches.is_present("json"),
        );
    }
}

/// Find the control socket: given directly, or read from the daemon config.
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

    match config.supervisor.control_socket {
        Some(socket) => socket,
        None => {
            eprintln!("configtest {}: control_socket not set.", file);
            process::exit(1);
        }
    }
}

fn simple_call(client: &mut Client, program: &str, request: Request) {
    match client.call(&request) {
        Ok(Reply::Ok) => (),
        Ok(Reply::UnknownProgram) => {
            eprintln!("unknown program {}", program);
            process::exit(1);
        }
        Ok(reply) => {
            eprintln!("unexpected reply: {:?}", reply);
            process::exit(3);
        }
        Err(err) => {
            eprintln!("request failed: {}", err);
            process::exit(3);
        }
    }
}

fn shutdown(client: &mut Client) {
    match client.call(&Request::Shutdown {
        initiator: username(),
    }) {
        Ok(Reply::Ok) => (),
        Ok(Reply::AlreadyStopping) => {
            eprintln!("shutdown failed, already shutting down.");
            process::exit(1);
        }
        Ok(reply) => {
            eprintln!("shutdown failed, unexpected reply: {:?}", reply);
            process::exit(1);
        }
        Err(err) => {
            eprintln!("request failed: {}", err);
            process::exit(3);
        }
    }
}

/// Name of the invoking user, best effort, for the daemon's audit log.
fn username() -> String {
    // getpwuid returns a pointer into static storage, read it immediately
    let pw = unsafe { libc::getpwuid(libc::geteuid()) };
    if pw.is_null() {
        return "unknown".to_string();
    }

    let name = unsafe { CStr::from_ptr((*pw).pw_name) };
    name.to_string_lossy().into_owned()
}

fn dump(client: &mut Client, pretty: bool, json: bool) {
    let states = match client.call(&Request::GetStates) {
        Ok(Reply::States(states)) => states,
        Ok(reply) => {
            eprintln!("unexpected reply: {:?}", reply);
            process::exit(3);
        }
        Err(err) => {
            eprintln!("request failed: {}", err);
            process::exit(3);
        }
    };

    if json {
        print_json(&states, pretty);
    } else {
        print_table(&states, pretty);
    }
}

fn status_word(state: &ProgramState) -> &'static str {
    if state.operator_shutdown && !state.up {
        "OPDOWN"
    } else if state.up {
        "UP"
    } else {
        "DOWN"
    }
}

/// Reason text for a down program: the death classification, whether its
/// dependencies are unmet, or neither (a program that never ran).
fn down_reason(state: &ProgramState) -> Option<String> {
    let has_type = !state.down_type.is_empty();
    let unsatisfied = !state.dependencies_satisfied;

    if !has_type && !unsatisfied {
        return None;
    }

    let mut reason = String::new();
    if has_type {
        reason.push_str(&state.down_type);
    }
    if unsatisfied {
        if has_type {
            reason.push_str(", ");
        }
        reason.push_str("dependencies not satisfied");
    }
    Some(reason)
}

fn format_uptime(uptime_ms: u64, pretty: bool, aligned: bool) -> String {
    let ms = uptime_ms % 1000;
    let mut secs = uptime_ms / 1000;

    if !pretty {
        return format!("{}.{:03}s", secs, ms);
    }

    let mut mins = secs / 60;
    secs -= mins * 60;
    let mut hours = mins / 60;
    mins -= hours * 60;
    let days = hours / 24;
    hours -= days * 24;

    if aligned {
        format!(
            "{:>6} days, {:02}:{:02}:{:02}.{:03}",
            days, hours, mins, secs, ms
        )
    } else {
        format!("{} days, {:02}:{:02}:{:02}.{:03}", days, hours, mins, secs, ms)
    }
}

fn print_table(states: &[ProgramState], pretty: bool) {
    let mut up = 0;
    let mut down = 0;
    let mut opdown = 0;
    for state in states {
        if state.operator_shutdown && !state.up {
            opdown += 1;
        } else if state.up {
            up += 1;
        } else {
            down += 1;
        }
    }
    println!("up: {} down: {} opdown: {}", up, down, opdown);

    let maxname = states.iter().map(|s| s.program.len()).max().unwrap_or(0);
    let maxpid = states
        .iter()
        .map(|s| s.pid.to_string().len())
        .max()
        .unwrap_or(0);

    for state in states {
        let status = match status_word(state) {
            "UP" => "UP    ",
            "DOWN" => "DOWN  ",
            other => other,
        };

        let mut line = format!("[{}] {}", status, state.program);
        line.push_str(&" ".repeat(maxname + 1 - state.program.len()));

        if state.up {
            let pid = state.pid.to_string();
            line.push_str(&pid);
            line.push_str(&" ".repeat(maxpid + 1 - pid.len()));
            line.push_str("up ");
            line.push_str(&format_uptime(state.uptime_ms, pretty, true));
        } else if let Some(reason) = down_reason(state) {
            line.push_str("due to ");
            line.push_str(&reason);
        }

        println!("{}", line.trim_end());
    }
}

#[derive(Serialize)]
struct DumpRow<'a> {
    status: &'a str,
    program: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pid: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    uptime: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    down_reason: Option<String>,
}

fn print_json(states: &[ProgramState], pretty: bool) {
    let rows: Vec<DumpRow<'_>> = states
        .iter()
        .map(|state| DumpRow {
            status: status_word(state),
            program: &state.program,
            pid: if state.up { Some(state.pid) } else { None },
            uptime: if state.up {
                Some(format_uptime(state.uptime_ms, pretty, false))
            } else {
                None
            },
            down_reason: if state.up { None } else { down_reason(state) },
        })
        .collect();

    match serde_json::to_string_pretty(&rows) {
        Ok(out) => println!("{}", out),
        Err(err) => {
            eprintln!("failed to render json: {}", err);
            process::exit(3);
        }
    }
}
