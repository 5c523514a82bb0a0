// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The control socket: operator requests into the scheduler.
//!
//! The server side is nonblocking and polled from inside the scheduler's
//! tick, doubling as its idle wait. Requests are decoded here but handled
//! by the scheduler, so all state mutation stays on the one thread.

use std::fs;
use std::io::{self, Read as _, Write as _};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use mio::{Events, Poll, PollOpt, Ready, Token};
use mio_uds::{UnixListener, UnixStream};
use tracing::{debug, warn};

use crate::msg::{self, Reply, Request};
use crate::Error;

const LISTENER: Token = Token(0);
const CONN_BASE: usize = 1;

/// Identifies the connection a request arrived on, for `respond`.
pub type ConnId = usize;

#[derive(Debug)]
struct Conn {
    stream: UnixStream,
    buf: Vec<u8>,
}

/// Listening side, owned by the daemon.
#[derive(Debug)]
pub struct ControlServer {
    path: PathBuf,
    poll: Poll,
    events: Events,
    listener: UnixListener,
    conns: Vec<Option<Conn>>,
}

impl ControlServer {
    /// Bind the control socket, replacing a stale socket file if one was
    /// left behind by an earlier run.
    pub fn bind(path: &Path) -> Result<Self, Error> {
        match fs::remove_file(path) {
            Err(err) if err.kind() == io::ErrorKind::NotFound => (),
            other => other?,
        }

        let listener = UnixListener::bind(path)?;
        let poll = Poll::new()?;
        poll.register(&listener, LISTENER, Ready::readable(), PollOpt::level())?;

        Ok(Self {
            path: path.to_path_buf(),
            poll,
            events: Events::with_capacity(64),
            listener,
            conns: Vec::new(),
        })
    }

    /// Wait up to `timeout` for activity, then decode whatever requests
    /// have fully arrived. A zero timeout makes this a plain poll.
    pub fn run_once(&mut self, timeout: Duration) -> Result<Vec<(ConnId, Request)>, Error> {
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(_) => (),
            // woken by a signal; the scheduler checks its stop flag next
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        }

        let tokens: Vec<Token> = self.events.iter().map(|event| event.token()).collect();

        let mut requests = Vec::new();
        for token in tokens {
            if token == LISTENER {
                self.accept_all();
            } else {
                self.read_conn(token.0 - CONN_BASE, &mut requests);
            }
        }

        Ok(requests)
    }

    /// Write a reply back on the connection a request came in on. A peer
    /// that hung up or stopped reading just loses its reply.
    pub fn respond(&mut self, id: ConnId, reply: &Reply) {
        let frame = match msg::encode_frame(reply) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("failed to encode reply: {}", err);
                return;
            }
        };

        let failed = match self.conns.get_mut(id).and_then(Option::as_mut) {
            Some(conn) => match conn.stream.write_all(&frame) {
                Ok(()) => false,
                Err(err) => {
                    warn!("failed to write reply: {}", err);
                    true
                }
            },
            None => {
                debug!("connection {} gone before reply", id);
                false
            }
        };

        if failed {
            self.close_conn(id);
        }
    }

    fn accept_all(&mut self) {
        loop {
            match self.listener.accept() {
                Ok(Some((stream, _addr))) => {
                    if let Err(err) = self.register_conn(stream) {
                        warn!("failed to register control connection: {}", err);
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!("control accept failed: {}", err);
                    break;
                }
            }
        }
    }

    fn register_conn(&mut self, stream: UnixStream) -> Result<(), Error> {
        let slot = match self.conns.iter().position(Option::is_none) {
            Some(slot) => slot,
            None => {
                self.conns.push(None);
                self.conns.len() - 1
            }
        };

        self.poll.register(
            &stream,
            Token(CONN_BASE + slot),
            Ready::readable(),
            PollOpt::level(),
        )?;
        self.conns[slot] = Some(Conn {
            stream,
            buf: Vec::new(),
        });
        debug!("control connection {} accepted", slot);
        Ok(())
    }

    fn read_conn(&mut self, slot: usize, requests: &mut Vec<(ConnId, Request)>) {
        let mut closed = false;

        if let Some(conn) = self.conns.get_mut(slot).and_then(Option::as_mut) {
            let mut chunk = [0u8; 4096];
            loop {
                match conn.stream.read(&mut chunk) {
                    Ok(0) => {
                        closed = true;
                        break;
                    }
                    Ok(n) => conn.buf.extend_from_slice(&chunk[..n]),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        warn!("control read failed: {}", err);
                        closed = true;
                        break;
                    }
                }
            }

            loop {
                match msg::take_frame(&mut conn.buf) {
                    Ok(Some(request)) => requests.push((slot, request)),
                    Ok(None) => break,
                    Err(err) => {
                        warn!("dropping malformed control connection: {}", err);
                        closed = true;
                        break;
                    }
                }
            }
        }

        if closed {
            self.close_conn(slot);
        }
    }

    fn close_conn(&mut self, slot: usize) {
        if let Some(conn) = self.conns.get_mut(slot).and_then(Option::take) {
            let _ = self.poll.deregister(&conn.stream);
            debug!("control connection {} closed", slot);
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        fs::remove_file(&self.path)
            .map_err(|err| debug!("failed to remove control socket: {}", err))
            .ok();
    }
}

/// Blocking side, used by the controller and by tests.
pub struct Client {
    stream: StdUnixStream,
}

impl Client {
    pub fn connect(path: &Path) -> Result<Self, Error> {
        let stream = StdUnixStream::connect(path)?;
        Ok(Self { stream })
    }

    /// Send one request and block for its reply.
    pub fn call(&mut self, request: &Request) -> Result<Reply, Error> {
        msg::write_frame(&mut self.stream, request)?;
        msg::read_frame(&mut self.stream)
    }
}
