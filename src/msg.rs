// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Wire messages for the control and status sockets.
//!
//! Every message is a frame: a little-endian `u32` length followed by the
//! bincode encoding of the message. The same framing is used in both
//! directions and on the status socket, so one set of helpers covers the
//! daemon, the controller, and the watcher.

use std::io;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Upper bound on a single frame's payload, headers excluded.
///
/// A `States` reply for a large program table is the biggest message we
/// ever produce, and it stays well under this.
pub const MAX_FRAME: usize = 256 * 1024;

const FRAME_HEADER: usize = 4;

/// Requests accepted on the control socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Clear the program's operator shutdown and schedule a start.
    Start { program: String },
    /// Set operator shutdown and terminate the program.
    Stop { program: String },
    /// Terminate the program so it respawns with a fresh incarnation.
    Kill { program: String },
    /// Snapshot the state of every program.
    GetStates,
    /// Stop every program and exit the daemon.
    Shutdown { initiator: String },
}

/// Replies sent back on the control socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    Ok,
    UnknownProgram,
    /// A shutdown was refused because one is already underway.
    AlreadyStopping,
    States(Vec<ProgramState>),
}

/// One program's externally visible state.
///
/// Sent in `States` replies and broadcast on the status socket after every
/// observable transition. `state_sequence` increases with each transition;
/// consumers drop snapshots whose sequence is not newer than the last one
/// seen for that program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramState {
    pub program: String,
    pub up: bool,
    /// Pid when up, `0` when down.
    pub pid: i32,
    /// Milliseconds since the current incarnation started, `0` when down.
    pub uptime_ms: u64,
    pub dependencies_satisfied: bool,
    pub operator_shutdown: bool,
    /// True while down from a supervisor-issued signal rather than a crash.
    pub during_shutdown: bool,
    /// Tag for the most recent death, empty if the program never ran.
    pub down_type: String,
    pub state_sequence: u64,
}

/// Encode a message as a length-prefixed frame.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, Error> {
    let payload = bincode::serialize(msg)?;
    if payload.len() > MAX_FRAME {
        return Err(Error::from("frame exceeds maximum size"));
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Write one frame to a blocking stream.
pub fn write_frame<W: io::Write, T: Serialize>(writer: &mut W, msg: &T) -> Result<(), Error> {
    let frame = encode_frame(msg)?;
    writer.write_all(&frame)?;
    Ok(())
}

/// Read one frame from a blocking stream.
pub fn read_frame<R: io::Read, T: DeserializeOwned>(reader: &mut R) -> Result<T, Error> {
    let mut header = [0u8; FRAME_HEADER];
    reader.read_exact(&mut header)?;

    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_FRAME {
        return Err(Error::from("frame exceeds maximum size"));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(bincode::deserialize(&payload)?)
}

/// Take one complete frame off the front of a nonblocking read buffer.
///
/// Returns `Ok(None)` until a whole frame has accumulated; bytes beyond the
/// first frame are left in place for the next call.
pub fn take_frame<T: DeserializeOwned>(buf: &mut Vec<u8>) -> Result<Option<T>, Error> {
    if buf.len() < FRAME_HEADER {
        return Ok(None);
    }

    let mut header = [0u8; FRAME_HEADER];
    header.copy_from_slice(&buf[..FRAME_HEADER]);
    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_FRAME {
        return Err(Error::from("frame exceeds maximum size"));
    }

    if buf.len() < FRAME_HEADER + len {
        return Ok(None);
    }

    let msg = bincode::deserialize(&buf[FRAME_HEADER..FRAME_HEADER + len])?;
    buf.drain(..FRAME_HEADER + len);
    Ok(Some(msg))
}
