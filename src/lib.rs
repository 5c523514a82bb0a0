// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Common library functions for Gander, a dependency-aware process
//! supervisor: programs are started in dependency order, watched, and
//! restarted or cycled when they or the things they depend on die.

pub mod config;
pub mod control;
pub mod event;
pub mod fork;
pub mod graph;
pub mod msg;
pub mod program;
pub mod signal;
pub mod status;
pub mod supervisor;
mod error;

pub use error::Error;
