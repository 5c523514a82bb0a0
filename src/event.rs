// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Scheduler events and their priority queues.
//!
//! All work the supervisor does between ticks is expressed as one of three
//! events. Each class has its own FIFO queue, and the scheduler drains the
//! classes strictly in the order deaths, kills, starts: a death observed
//! this tick is accounted for before any pending kill is delivered, and
//! kills beat starts so a restart tears down before it builds up.
//!
//! Draining works on a batch: the scheduler takes everything queued for a
//! class at once, and events pushed while handling the batch land in the
//! live queues where only later classes of the same tick (or the next tick)
//! see them. A handler that keeps generating events for its own class
//! therefore cannot starve the loop.

use std::collections::VecDeque;
use std::time::{Duration, SystemTime};

use nix::sys::signal::Signal;

use crate::program::{DownType, ProgramId, Token};

/// Everything the scheduler can be asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Start a program, once its dependencies hold still.
    Start { program: ProgramId },
    /// Deliver a signal to the incarnation identified by `token`.
    Kill {
        program: ProgramId,
        signal: Signal,
        propagate: bool,
        token: Token,
    },
    /// A child process was reaped; `pid` still needs resolving to a program.
    Died { pid: i32, down: DownType, code: i32 },
}

impl Event {
    pub fn class(&self) -> Class {
        match self {
            Event::Died { .. } => Class::Died,
            Event::Kill { .. } => Class::Kill,
            Event::Start { .. } => Class::Start,
        }
    }
}

/// Event class, in drain order. During global shutdown the start class is
/// not drained at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Class {
    Died = 0,
    Kill = 1,
    Start = 2,
}

/// All classes, in drain order.
pub const CLASSES: [Class; 3] = [Class::Died, Class::Kill, Class::Start];

/// An event waiting in a queue, possibly not due yet.
#[derive(Debug)]
pub struct Queued {
    pub event: Event,
    due: Option<SystemTime>,
}

impl Queued {
    fn immediate(event: Event) -> Self {
        Queued { event, due: None }
    }

    fn delayed(event: Event, delay: Duration) -> Self {
        let due = SystemTime::now().checked_add(delay);
        Queued { event, due }
    }

    /// Whether the event may be handled at `now`. Events whose due time
    /// cannot be represented are treated as due immediately.
    pub fn ready(&self, now: SystemTime) -> bool {
        match self.due {
            None => true,
            Some(due) => now >= due,
        }
    }
}

/// The three class queues.
#[derive(Debug)]
pub struct Queues {
    queues: [VecDeque<Queued>; 3],
}

impl Queues {
    pub fn new() -> Self {
        Queues {
            queues: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
        }
    }

    pub fn push(&mut self, event: Event) {
        let class = event.class();
        self.queues[class as usize].push_back(Queued::immediate(event));
    }

    pub fn push_delayed(&mut self, event: Event, delay: Duration) {
        let class = event.class();
        self.queues[class as usize].push_back(Queued::delayed(event, delay));
    }

    /// Take the whole current batch for one class. Anything pushed while the
    /// caller works through the batch queues up fresh.
    pub fn take_class(&mut self, class: Class) -> VecDeque<Queued> {
        std::mem::replace(&mut self.queues[class as usize], VecDeque::new())
    }

    /// Put an event that is not due yet back on its class queue, keeping its
    /// due time.
    pub fn requeue(&mut self, queued: Queued) {
        let class = queued.event.class();
        self.queues[class as usize].push_back(queued);
    }

    /// Drop every queued start for one program. Used when an operator puts
    /// a program into admin down: starts deferred on dependencies must not
    /// fire afterwards.
    pub fn flush_starts(&mut self, program: ProgramId) {
        self.queues[Class::Start as usize]
            .retain(|q| q.event != Event::Start { program });
    }

    pub fn len(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub(crate) fn class_len(&self, class: Class) -> usize {
        self.queues[class as usize].len()
    }
}

impl Default for Queues {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(program: ProgramId) -> Event {
        Event::Start { program }
    }

    #[test]
    fn test_events_sort_into_their_class() {
        let mut q = Queues::new();
        q.push(start(0));
        q.push(Event::Kill {
            program: 0,
            signal: Signal::SIGTERM,
            propagate: false,
            token: 0,
        });
        q.push(Event::Died {
            pid: 42,
            down: DownType::Exited,
            code: 0,
        });
        assert_eq!(q.class_len(Class::Died), 1);
        assert_eq!(q.class_len(Class::Kill), 1);
        assert_eq!(q.class_len(Class::Start), 1);
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn test_fifo_within_a_class() {
        let mut q = Queues::new();
        q.push(start(1));
        q.push(start(2));
        q.push(start(3));
        let batch = q.take_class(Class::Start);
        let order: Vec<_> = batch
            .into_iter()
            .map(|e| match e.event {
                Event::Start { program } => program,
                other => panic!("unexpected event {:?}", other),
            })
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_take_class_leaves_room_for_new_pushes() {
        let mut q = Queues::new();
        q.push(start(1));
        let batch = q.take_class(Class::Start);
        assert_eq!(batch.len(), 1);
        assert_eq!(q.class_len(Class::Start), 0, "batch is moved out");
        // pushes during batch handling land in the live queue
        q.push(start(2));
        assert_eq!(q.class_len(Class::Start), 1);
    }

    #[test]
    fn test_delayed_events_become_ready() {
        let mut q = Queues::new();
        q.push_delayed(start(1), Duration::from_millis(200));
        let batch = q.take_class(Class::Start);
        let queued = batch.into_iter().next().expect("queued start");

        let now = SystemTime::now();
        assert!(!queued.ready(now));
        assert!(queued.ready(now + Duration::from_millis(300)));

        // a requeue keeps the original due time
        q.requeue(queued);
        let batch = q.take_class(Class::Start);
        let queued = batch.into_iter().next().expect("requeued start");
        assert!(queued.ready(now + Duration::from_millis(300)));
    }

    #[test]
    fn test_flush_starts_is_per_program() {
        let mut q = Queues::new();
        q.push(start(1));
        q.push_delayed(start(2), Duration::from_millis(100));
        q.push(start(1));
        q.push(Event::Died {
            pid: 42,
            down: DownType::Exited,
            code: 0,
        });

        q.flush_starts(1);
        assert_eq!(q.class_len(Class::Start), 1, "only program 2's start survives");
        assert_eq!(q.class_len(Class::Died), 1, "other classes untouched");
    }
}
