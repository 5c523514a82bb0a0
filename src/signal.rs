// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Process signal handling for the daemon.
//!
//! Handlers only flip an atomic flag; the scheduler polls it between ticks
//! and does all consequential work there.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::Error;

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn request_stop(_signal: libc::c_int) {
    STOP.store(true, Ordering::SeqCst);
}

/// Install the daemon's handlers.
///
/// TERM always requests shutdown. INT does too unless `ignore_sigint` is
/// set, for running in a terminal where ^C should not take the whole
/// process tree down. PIPE is ignored so a status subscriber that hangs up
/// mid-write surfaces as an `EPIPE` error instead of killing the daemon.
pub fn install(ignore_sigint: bool) -> Result<(), Error> {
    let stop = SigAction::new(
        SigHandler::Handler(request_stop),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());

    unsafe {
        sigaction(Signal::SIGTERM, &stop)?;
        if ignore_sigint {
            sigaction(Signal::SIGINT, &ignore)?;
        } else {
            sigaction(Signal::SIGINT, &stop)?;
        }
        sigaction(Signal::SIGPIPE, &ignore)?;
    }

    Ok(())
}

/// True once TERM (or INT, unless ignored) has been delivered.
pub fn stop_requested() -> bool {
    STOP.load(Ordering::SeqCst)
}
