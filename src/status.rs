// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The status socket: state broadcasts out of the scheduler.
//!
//! Fire-and-forget pub/sub. Every observable transition is published to all
//! subscribers; a subscriber that falls behind or hangs up is dropped, the
//! daemon never waits for one. Subscribers reconstruct ordering from
//! `state_sequence`, so a dropped frame costs nothing but latency.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};

use mio_uds::{UnixListener, UnixStream};
use tracing::{debug, warn};

use crate::msg::{self, ProgramState};
use crate::Error;

/// Broadcasting side, owned by the daemon.
#[derive(Debug)]
pub struct StatusServer {
    path: PathBuf,
    listener: UnixListener,
    subscribers: Vec<UnixStream>,
}

impl StatusServer {
    /// Bind the status socket, replacing a stale socket file if one was
    /// left behind by an earlier run.
    pub fn bind(path: &Path) -> Result<Self, Error> {
        match fs::remove_file(path) {
            Err(err) if err.kind() == io::ErrorKind::NotFound => (),
            other => other?,
        }

        let listener = UnixListener::bind(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            listener,
            subscribers: Vec::new(),
        })
    }

    /// Accept any subscribers waiting on the listener. Called once per
    /// scheduler tick; the listener is nonblocking, so this never waits.
    pub fn accept_new(&mut self) {
        loop {
            match self.listener.accept() {
                Ok(Some((stream, _addr))) => {
                    debug!("status subscriber connected");
                    self.subscribers.push(stream);
                }
                Ok(None) => break,
                Err(err) => {
                    warn!("status accept failed: {}", err);
                    break;
                }
            }
        }
    }

    /// Broadcast one state snapshot, dropping any subscriber that fails
    /// to take it.
    pub fn publish(&mut self, state: &ProgramState) {
        if self.subscribers.is_empty() {
            return;
        }

        let frame = match msg::encode_frame(state) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("failed to encode state broadcast: {}", err);
                return;
            }
        };

        for i in (0..self.subscribers.len()).rev() {
            if let Err(err) = self.subscribers[i].write_all(&frame) {
                debug!("dropping status subscriber: {}", err);
                self.subscribers.swap_remove(i);
            }
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl Drop for StatusServer {
    fn drop(&mut self) {
        fs::remove_file(&self.path)
            .map_err(|err| debug!("failed to remove status socket: {}", err))
            .ok();
    }
}

/// Subscriber-side filter that skips stale or duplicate snapshots.
///
/// Broadcasts carry a per-program `state_sequence`; a snapshot is fresh
/// only if its sequence is newer than the last one seen for that program.
#[derive(Default)]
pub struct StaleFilter {
    seen: HashMap<String, u64>,
}

impl StaleFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if this snapshot should be surfaced, updating the watermark.
    pub fn fresh(&mut self, state: &ProgramState) -> bool {
        match self.seen.get(&state.program) {
            Some(&last) if state.state_sequence <= last => false,
            _ => {
                self.seen.insert(state.program.clone(), state.state_sequence);
                true
            }
        }
    }
}
