// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The scheduler: one thread, one tick loop, all state.
//!
//! Every mutation of program state happens here, driven by the three event
//! classes in strict priority order: deaths are absorbed before kills are
//! issued, kills before starts. The only concurrency is the OS delivering
//! signals (folded in as an atomic flag) and peers talking to the control
//! and status sockets (folded in as nonblocking reads between ticks).

use std::collections::{BTreeMap, HashMap};
use std::env;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, SystemTime};

use nix::sys::signal::Signal;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::control::{ConnId, ControlServer};
use crate::event::{Class, Event, Queues, CLASSES};
use crate::fork;
use crate::graph::{self, Dep};
use crate::msg::{ProgramState, Reply, Request};
use crate::program::{DownType, KillOutcome, Program, ProgramId, Token, TokenMint, TOKEN_ANY};
use crate::signal;
use crate::status::StatusServer;
use crate::Error;

#[derive(Debug)]
pub struct Supervisor {
    programs: Vec<Program>,
    names: HashMap<String, ProgramId>,
    /// Live children, for resolving deaths back to programs.
    pids: HashMap<i32, ProgramId>,
    deps: Vec<Dep>,
    queues: Queues,
    mint: TokenMint,

    tick: Duration,
    startwait: Duration,
    killwait: Duration,

    stopping: bool,

    control_path: Option<PathBuf>,
    status_path: Option<PathBuf>,
    control: Option<ControlServer>,
    status: Option<StatusServer>,
}

impl Supervisor {
    /// Build the program table and dependency graph from a parsed config.
    ///
    /// This validates everything a configtest should: commands present and
    /// resolvable to an executable, dependency names known, no cycles. The
    /// sockets are not bound until [`run`], so a configtest never disturbs
    /// a live daemon.
    ///
    /// [`run`]: Self::run
    pub fn from_config(config: Config) -> Result<Self, Error> {
        // the daemon's own PATH is what children inherit and what command
        // search uses, so apply the config's prefix to it directly
        if let Some(prefix) = config.supervisor.path.as_deref() {
            let joined = match env::var("PATH") {
                Ok(current) if !current.is_empty() => format!("{}:{}", prefix, current),
                _ => prefix.to_string(),
            };
            env::set_var("PATH", joined);
        }

        let env_map: BTreeMap<String, String> = env::vars().collect();
        let path_dirs: Vec<PathBuf> = match env::var_os("PATH") {
            Some(path) => env::split_paths(&path).collect(),
            None => Vec::new(),
        };

        let mut programs = Vec::with_capacity(config.programs.len());
        let mut names = HashMap::new();

        for (name, pc) in &config.programs {
            let command = pc.command.clone().ok_or_else(|| {
                Error::config(format!("program {} missing setting: command.", name))
            })?;

            let mut own_env = env_map.clone();
            own_env.extend(pc.env.iter().map(|(k, v)| (k.clone(), v.clone())));

            let mut program = Program::new(
                name.clone(),
                command,
                pc.args.clone(),
                pc.cwd.clone(),
                own_env.into_iter().collect(),
                pc.respawn,
                pc.enabled,
            );

            let candidates = fork::search(program.command(), &path_dirs);
            if !fork::any_executable(&candidates) {
                return Err(Error::config(format!(
                    "program {} not found, not a file, or not executable",
                    program.command()
                )));
            }
            program.set_candidates(candidates);

            names.insert(name.clone(), programs.len());
            programs.push(program);
        }

        // link after every program is loaded, so forward references work
        let mut deps = Vec::new();
        for (name, pc) in &config.programs {
            for depend in &pc.depends {
                graph::link(
                    &mut programs,
                    &mut deps,
                    &names,
                    name,
                    &depend.on,
                    depend.delay(),
                    depend.propagate,
                )?;
            }
        }

        Ok(Self {
            programs,
            names,
            pids: HashMap::new(),
            deps,
            queues: Queues::new(),
            mint: TokenMint::new(),
            tick: config.supervisor.tick(),
            startwait: config.supervisor.startwait(),
            killwait: config.supervisor.killwait(),
            stopping: false,
            control_path: config.supervisor.control_socket.clone(),
            status_path: config.supervisor.status_socket.clone(),
            control: None,
            status: None,
        })
    }

    /// Request a shutdown of every program and, once all are down, of the
    /// scheduler itself. Takes effect on the next tick.
    pub fn stop(&mut self) {
        self.stopping = true;
    }

    /// Run until a shutdown request has been honored and every child is
    /// reaped.
    pub fn run(&mut self) -> Result<(), Error> {
        if let Some(path) = self.control_path.clone() {
            self.control = Some(ControlServer::bind(&path)?);
        }
        if let Some(path) = self.status_path.clone() {
            self.status = Some(StatusServer::bind(&path)?);
        }

        self.bootstrap();

        info!(
            "running. tick={}ms control={:?} status={:?}",
            self.tick.as_millis(),
            self.control_path,
            self.status_path
        );

        let mut known_stopped = false;
        loop {
            if signal::stop_requested() {
                self.stopping = true;
            }
            if self.stopping && self.pids.is_empty() {
                break;
            }

            // first tick after a stop request: queue the terminations here,
            // never in the signal handler
            if known_stopped != self.stopping {
                info!("caught shutdown request, stopping all programs.");
                for id in 0..self.programs.len() {
                    self.queues.push(Event::Kill {
                        program: id,
                        signal: Signal::SIGTERM,
                        propagate: false,
                        token: TOKEN_ANY,
                    });
                }
            }
            known_stopped = self.stopping;

            if let Some(status) = self.status.as_mut() {
                status.accept_new();
            }

            for death in fork::reap() {
                self.queues.push(Event::Died {
                    pid: death.pid,
                    down: death.down,
                    code: death.code,
                });
            }

            let processed = self.drain();

            // the control socket wait doubles as the idle sleep: full tick
            // when nothing happened, zero when there is a backlog
            let timeout = if processed == 0 {
                self.tick
            } else {
                Duration::from_millis(0)
            };
            match self.control.as_mut() {
                Some(control) => {
                    let requests = match control.run_once(timeout) {
                        Ok(requests) => requests,
                        Err(err) => {
                            warn!("control socket failed: {}", err);
                            Vec::new()
                        }
                    };
                    self.apply(requests);
                }
                None => {
                    if processed == 0 {
                        thread::sleep(self.tick);
                    }
                }
            }
        }

        info!("all programs down, exiting.");
        self.control = None;
        self.status = None;
        Ok(())
    }

    /// Queue the boot starts: one per program not administratively down.
    fn bootstrap(&mut self) {
        for id in 0..self.programs.len() {
            if !self.programs[id].is_operator_shutdown() {
                self.queues.push(Event::Start { program: id });
            }
        }
    }

    /// One pass over the class queues in priority order. Returns how many
    /// events completed; deferred events do not count.
    fn drain(&mut self) -> usize {
        let mut processed = 0;
        for &class in CLASSES.iter() {
            // starts are not even looked at while stopping; queued ones
            // keep until exit
            if self.stopping && class == Class::Start {
                continue;
            }
            let batch = self.queues.take_class(class);
            for queued in batch {
                if !queued.ready(SystemTime::now()) {
                    self.queues.requeue(queued);
                    continue;
                }
                if self.handle(queued.event) {
                    processed += 1;
                }
            }
        }
        processed
    }

    /// Returns false when the event deferred itself instead of completing.
    fn handle(&mut self, event: Event) -> bool {
        match event {
            Event::Died { pid, down, code } => {
                self.handle_died(pid, down, code);
                true
            }
            Event::Kill {
                program,
                signal,
                propagate,
                token,
            } => {
                self.handle_kill(program, signal, propagate, token);
                true
            }
            Event::Start { program } => self.handle_start(program),
        }
    }

    fn handle_start(&mut self, id: ProgramId) -> bool {
        if self.programs[id].is_running() {
            return true;
        }
        if self.programs[id].is_operator_shutdown() {
            return true;
        }
        if !graph::deps_satisfied(id, &self.programs, &self.deps, SystemTime::now()) {
            self.queues
                .push_delayed(Event::Start { program: id }, self.startwait);
            return false;
        }

        self.start_program(id);
        true
    }

    fn handle_kill(&mut self, id: ProgramId, sig: Signal, propagate: bool, token: Token) {
        // every TERM is backed by a KILL against the same incarnation; if
        // the program exits (or is replaced) in time, the token goes stale
        // and the KILL is a no-op
        if sig == Signal::SIGTERM {
            self.queues.push_delayed(
                Event::Kill {
                    program: id,
                    signal: Signal::SIGKILL,
                    propagate,
                    token,
                },
                self.killwait,
            );
        }

        match self.programs[id].kill(sig, propagate, token) {
            KillOutcome::ScheduleStart => self.queues.push(Event::Start { program: id }),
            KillOutcome::StaleToken => {
                debug!("stale kill for {} discarded", self.programs[id].name())
            }
            KillOutcome::AlreadyDown | KillOutcome::Delivered => (),
        }
    }

    fn handle_died(&mut self, pid: i32, down: DownType, code: i32) {
        let id = match self.pids.remove(&pid) {
            Some(id) => id,
            None => {
                info!("unknown child {} died. discarding.", pid);
                return;
            }
        };

        let restart = self.programs[id].died(down, code);
        self.broadcast(id);

        if restart {
            self.queues.push(Event::Start { program: id });
        }

        // anything that propagate-depends on the dead program is cycled
        for event in graph::propagate_down(id, &self.programs, &self.deps, self.stopping) {
            self.queues.push(event);
        }
    }

    fn start_program(&mut self, id: ProgramId) {
        if self.stopping {
            info!(
                "not starting {}, shutting down.",
                self.programs[id].name()
            );
            return;
        }

        match fork::spawn(&self.programs[id]) {
            Ok(pid) => {
                let token = self.mint.mint();
                self.programs[id].started(pid, token);
                self.pids.insert(pid.as_raw(), id);
                info!("forked for {}", self.programs[id]);
                self.broadcast(id);
            }
            Err(err) => error!("fork failed for {}: {}", self.programs[id].name(), err),
        }
    }

    /// Handle the requests one control poll returned.
    fn apply(&mut self, requests: Vec<(ConnId, Request)>) {
        for (conn, request) in requests {
            let reply = self.dispatch(request);
            if let Some(control) = self.control.as_mut() {
                control.respond(conn, &reply);
            }
        }
    }

    fn dispatch(&mut self, request: Request) -> Reply {
        match request {
            Request::Start { program } => match self.lookup(&program) {
                Some(id) => {
                    info!("control: starting {}", program);
                    self.op_start(id);
                    Reply::Ok
                }
                None => Reply::UnknownProgram,
            },
            Request::Kill { program } => match self.lookup(&program) {
                Some(id) => {
                    info!("control: killing {}", program);
                    self.op_kill(id);
                    Reply::Ok
                }
                None => Reply::UnknownProgram,
            },
            Request::Stop { program } => match self.lookup(&program) {
                Some(id) => {
                    info!("control: stopping {}", program);
                    self.op_shutdown(id);
                    Reply::Ok
                }
                None => Reply::UnknownProgram,
            },
            Request::GetStates => Reply::States(self.states()),
            Request::Shutdown { initiator } => {
                if self.stopping {
                    Reply::AlreadyStopping
                } else {
                    info!("control: shutdown requested by {}", initiator);
                    self.stopping = true;
                    Reply::Ok
                }
            }
        }
    }

    fn lookup(&self, name: &str) -> Option<ProgramId> {
        self.names.get(name).copied()
    }

    /// Operator start: clear admin down and schedule a start.
    fn op_start(&mut self, id: ProgramId) {
        self.programs[id].op_start();
        self.broadcast(id);
        self.queues.push(Event::Start { program: id });
    }

    /// Operator kill: cycle the current incarnation. Respawn (if
    /// configured) brings it back.
    fn op_kill(&mut self, id: ProgramId) {
        let token = self.programs[id].token();
        self.queues.push(Event::Kill {
            program: id,
            signal: Signal::SIGTERM,
            propagate: false,
            token,
        });
    }

    /// Operator stop: admin down, cancel pending starts, terminate.
    fn op_shutdown(&mut self, id: ProgramId) {
        self.programs[id].op_shutdown();
        self.broadcast(id);
        self.queues.flush_starts(id);

        let token = self.programs[id].token();
        self.queues.push(Event::Kill {
            program: id,
            signal: Signal::SIGTERM,
            propagate: false,
            token,
        });
    }

    fn write_state(&self, id: ProgramId) -> ProgramState {
        let program = &self.programs[id];
        let now = SystemTime::now();
        let up = program.is_running();

        ProgramState {
            program: program.name().to_string(),
            up,
            pid: if up { program.pid_raw() } else { 0 },
            uptime_ms: if up { program.uptime_ms(now) } else { 0 },
            dependencies_satisfied: graph::deps_satisfied(id, &self.programs, &self.deps, now),
            operator_shutdown: program.is_operator_shutdown(),
            during_shutdown: if up {
                false
            } else {
                program.is_controlled_shutdown()
            },
            down_type: if up {
                "NONE".to_string()
            } else {
                program.down_type().tag().to_string()
            },
            state_sequence: program.state_changes() + 1,
        }
    }

    fn states(&self) -> Vec<ProgramState> {
        (0..self.programs.len())
            .map(|id| self.write_state(id))
            .collect()
    }

    fn broadcast(&mut self, id: ProgramId) {
        if self.status.is_none() {
            return;
        }
        let state = self.write_state(id);
        if let Some(status) = self.status.as_mut() {
            status.publish(&state);
        }
    }
}
