// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Harness for end-to-end tests: a real supervisor on its own thread,
//! driven over its control socket, with real `/bin/sh` children.

use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use gander::config::Config;
use gander::control::Client;
use gander::msg::{self, ProgramState, Reply, Request};
use gander::status::StaleFilter;
use gander::supervisor::Supervisor;

// The reaper waits on any child of the process, so two supervisors in one
// test binary would steal each other's deaths. One daemon at a time.
static SERIAL: Mutex<()> = Mutex::new(());

const DEADLINE: Duration = Duration::from_secs(10);
const POLL: Duration = Duration::from_millis(20);

pub struct TestDaemon {
    control: PathBuf,
    status: PathBuf,
    thread: Option<JoinHandle<Result<(), gander::Error>>>,
    _dir: tempfile::TempDir,
    _serial: MutexGuard<'static, ()>,
}

impl TestDaemon {
    /// Write `config_text` to a scratch config file and run a supervisor
    /// from it on a background thread. `{control}` and `{status}` in the
    /// text are replaced with socket paths inside the scratch directory.
    pub fn boot(config_text: &str) -> Self {
        let serial = SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let dir = tempfile::tempdir().expect("tempdir");
        let control = dir.path().join("control.sock");
        let status = dir.path().join("status.sock");

        let text = config_text
            .replace("{control}", control.to_str().expect("utf-8 path"))
            .replace("{status}", status.to_str().expect("utf-8 path"));
        let file = dir.path().join("gander.toml");
        std::fs::write(&file, text).expect("write config");

        let config = Config::load(&file).expect("config should load");
        let mut supervisor = Supervisor::from_config(config).expect("supervisor should build");
        let thread = thread::spawn(move || supervisor.run());

        TestDaemon {
            control,
            status,
            thread: Some(thread),
            _dir: dir,
            _serial: serial,
        }
    }

    /// Connect to the control socket, waiting for the daemon to bind it.
    pub fn client(&self) -> Client {
        let deadline = Instant::now() + DEADLINE;
        loop {
            match Client::connect(&self.control) {
                Ok(client) => return client,
                Err(err) => {
                    if Instant::now() >= deadline {
                        panic!("control socket never came up: {}", err);
                    }
                    thread::sleep(POLL);
                }
            }
        }
    }

    pub fn call(&self, request: &Request) -> Reply {
        self.client().call(request).expect("control request failed")
    }

    pub fn states(&self) -> Vec<ProgramState> {
        match self.call(&Request::GetStates) {
            Reply::States(states) => states,
            other => panic!("unexpected reply to GetStates: {:?}", other),
        }
    }

    pub fn state(&self, program: &str) -> ProgramState {
        self.states()
            .into_iter()
            .find(|state| state.program == program)
            .unwrap_or_else(|| panic!("no such program in states: {}", program))
    }

    /// Poll `GetStates` until the predicate holds, returning the matching
    /// snapshot set.
    pub fn wait_for<F>(&self, what: &str, predicate: F) -> Vec<ProgramState>
    where
        F: Fn(&[ProgramState]) -> bool,
    {
        let deadline = Instant::now() + DEADLINE;
        loop {
            let states = self.states();
            if predicate(&states) {
                return states;
            }
            if Instant::now() >= deadline {
                panic!("timed out waiting for {}; last states: {:?}", what, states);
            }
            thread::sleep(POLL);
        }
    }

    /// Poll until `program` is up, returning its snapshot.
    pub fn wait_up(&self, program: &str) -> ProgramState {
        let states = self.wait_for(&format!("{} to come up", program), |states| {
            states.iter().any(|s| s.program == program && s.up)
        });
        states
            .into_iter()
            .find(|s| s.program == program)
            .expect("program vanished from states")
    }

    /// Request a daemon shutdown and wait for the run loop to finish.
    pub fn shutdown(mut self) {
        assert_eq!(
            self.call(&Request::Shutdown {
                initiator: "test-harness".to_string(),
            }),
            Reply::Ok
        );
        let thread = self.thread.take().expect("daemon already shut down");
        thread
            .join()
            .expect("supervisor thread panicked")
            .expect("supervisor run failed");
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        // best effort teardown on panic, so a failed test does not leave a
        // reaper behind to steal the next test's children
        if let Some(thread) = self.thread.take() {
            if let Ok(mut client) = Client::connect(&self.control) {
                let _ = client.call(&Request::Shutdown {
                    initiator: "test-harness".to_string(),
                });
            }
            let _ = thread.join();
        }
    }
}

/// A subscriber on the daemon's status socket.
pub struct StatusWatch {
    stream: UnixStream,
    filter: StaleFilter,
}

impl StatusWatch {
    /// Connect to the status socket, waiting for the daemon to bind it.
    ///
    /// Connecting only queues us for the daemon's accept loop; broadcasts
    /// sent before the accept happens are not replayed. [`sync`] confirms
    /// the subscription before anything interesting is allowed to happen.
    ///
    /// [`sync`]: Self::sync
    pub fn connect(daemon: &TestDaemon) -> Self {
        let deadline = Instant::now() + DEADLINE;
        let stream = loop {
            match UnixStream::connect(&daemon.status) {
                Ok(stream) => break stream,
                Err(err) => {
                    if Instant::now() >= deadline {
                        panic!("status socket never came up: {}", err);
                    }
                    thread::sleep(POLL);
                }
            }
        };
        stream
            .set_read_timeout(Some(Duration::from_millis(50)))
            .expect("read timeout");

        StatusWatch {
            stream,
            filter: StaleFilter::new(),
        }
    }

    /// Prove the daemon is broadcasting to us by poking a canary program
    /// (admin down, never running) until one of its broadcasts arrives.
    /// Every poke is a fresh transition, so one is bound to land after the
    /// daemon has accepted the subscription.
    pub fn sync(&mut self, daemon: &TestDaemon, canary: &str) {
        let deadline = Instant::now() + DEADLINE;
        loop {
            assert_eq!(
                daemon.call(&Request::Stop {
                    program: canary.to_string(),
                }),
                Reply::Ok
            );
            let poked_by = Instant::now() + Duration::from_millis(200);
            while let Some(state) = self.next_fresh(poked_by) {
                if state.program == canary {
                    return;
                }
            }
            if Instant::now() >= deadline {
                panic!("status subscription never became live");
            }
        }
    }

    /// The next not-yet-seen state broadcast, or `None` once `deadline`
    /// passes without one.
    pub fn next_fresh(&mut self, deadline: Instant) -> Option<ProgramState> {
        loop {
            if Instant::now() >= deadline {
                return None;
            }
            match msg::read_frame::<_, ProgramState>(&mut self.stream) {
                Ok(state) => {
                    if self.filter.fresh(&state) {
                        return Some(state);
                    }
                }
                // read timed out; have another look at the deadline
                Err(_) => continue,
            }
        }
    }

    /// Collect fresh broadcasts until one matches the predicate (returned
    /// last in the collection) or the deadline passes (panics).
    pub fn collect_until<F>(&mut self, what: &str, predicate: F) -> Vec<ProgramState>
    where
        F: Fn(&ProgramState) -> bool,
    {
        let deadline = Instant::now() + DEADLINE;
        let mut seen = Vec::new();
        while let Some(state) = self.next_fresh(deadline) {
            let done = predicate(&state);
            seen.push(state);
            if done {
                return seen;
            }
        }
        panic!("timed out waiting for {}; broadcasts seen: {:?}", what, seen);
    }
}
