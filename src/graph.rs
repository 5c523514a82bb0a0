// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The dependency graph between programs.
//!
//! Edges live in one flat arena owned by the supervisor; programs refer to
//! their edges by index. An edge `of -> on` means `of` requires `on` to have
//! been up for `delay` before `of` may start, and (when `propagate` is set)
//! that `of` is restarted whenever `on` goes down.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, SystemTime};

use nix::sys::signal::Signal;

use crate::event::Event;
use crate::program::{Program, ProgramId};
use crate::Error;

/// One dependency edge: `of` depends on `on`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dep {
    pub of: ProgramId,
    pub on: ProgramId,
    /// Continuous uptime `on` must show before the edge is satisfied.
    pub delay: Duration,
    /// Restart `of` when `on` goes down.
    pub propagate: bool,
}

/// Resolve names, reject cycles, and register a new edge on both endpoints.
///
/// The cycle check walks outbound edges from `on` breadth-first; reaching
/// `of` (or any program twice) means the new edge would close a loop. Only
/// edges linked so far take part, so configurations are checked
/// incrementally in declaration order.
pub fn link(
    programs: &mut [Program],
    deps: &mut Vec<Dep>,
    names: &HashMap<String, ProgramId>,
    of_name: &str,
    on_name: &str,
    delay: Duration,
    propagate: bool,
) -> Result<usize, Error> {
    let of = *names.get(of_name).ok_or_else(|| {
        Error::config(format!(
            "dependency of linkage failed: program {} does not exist.",
            of_name
        ))
    })?;
    let on = *names.get(on_name).ok_or_else(|| {
        Error::config(format!(
            "dependency on linkage failed: program {} does not exist.",
            on_name
        ))
    })?;

    let mut seen: HashSet<ProgramId> = HashSet::new();
    let mut queue: VecDeque<ProgramId> = VecDeque::new();
    seen.insert(of);
    queue.push_back(on);

    while let Some(node) = queue.pop_front() {
        if !seen.insert(node) {
            return Err(Error::config(format!(
                "{} cannot depend on {} as this would create a dependency cycle.",
                of_name, on_name
            )));
        }
        for &edge in programs[node].edges() {
            if deps[edge].of == node {
                queue.push_back(deps[edge].on);
            }
        }
    }

    let index = deps.len();
    deps.push(Dep {
        of,
        on,
        delay,
        propagate,
    });
    programs[on].add_edge(index);
    programs[of].add_edge(index);
    Ok(index)
}

/// Whether the `on` side of an edge has been up long enough.
pub fn satisfied(dep: &Dep, programs: &[Program], now: SystemTime) -> bool {
    programs[dep.on].is_up(dep.delay, now)
}

/// Whether every dependency of `id` is satisfied.
pub fn deps_satisfied(
    id: ProgramId,
    programs: &[Program],
    deps: &[Dep],
    now: SystemTime,
) -> bool {
    programs[id]
        .edges()
        .iter()
        .filter(|&&edge| deps[edge].of == id)
        .all(|&edge| satisfied(&deps[edge], programs, now))
}

/// Kill events to fan out when `died` has gone down: every propagating
/// dependent gets a conditional restarting TERM aimed at its current
/// incarnation. Quiet during global shutdown, when nothing restarts anyway.
pub fn propagate_down(
    died: ProgramId,
    programs: &[Program],
    deps: &[Dep],
    stopping: bool,
) -> Vec<Event> {
    if stopping {
        return Vec::new();
    }
    programs[died]
        .edges()
        .iter()
        .filter(|&&edge| deps[edge].on == died && deps[edge].propagate)
        .map(|&edge| {
            let of = deps[edge].of;
            Event::Kill {
                program: of,
                signal: Signal::SIGTERM,
                propagate: true,
                token: programs[of].token(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{TOKEN_ANY, TOKEN_DOWN};

    fn world(names: &[&str]) -> (Vec<Program>, Vec<Dep>, HashMap<String, ProgramId>) {
        let programs = names
            .iter()
            .map(|n| {
                Program::new(
                    n.to_string(),
                    format!("/bin/{}", n),
                    vec![],
                    None,
                    vec![],
                    true,
                    true,
                )
            })
            .collect();
        let map = names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.to_string(), i))
            .collect();
        (programs, Vec::new(), map)
    }

    fn link_ok(
        programs: &mut [Program],
        deps: &mut Vec<Dep>,
        names: &HashMap<String, ProgramId>,
        of: &str,
        on: &str,
    ) {
        link(programs, deps, names, of, on, Duration::from_millis(0), false)
            .unwrap_or_else(|e| panic!("linking {} -> {} failed: {}", of, on, e));
    }

    #[test]
    fn test_unknown_names_are_config_errors() {
        let (mut programs, mut deps, names) = world(&["a"]);
        let err = link(&mut programs, &mut deps, &names, "a", "ghost", Duration::from_millis(0), false)
            .unwrap_err();
        assert!(err.is_config());
        let err = link(&mut programs, &mut deps, &names, "ghost", "a", Duration::from_millis(0), false)
            .unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_chain_links_but_cycle_is_rejected() {
        let (mut programs, mut deps, names) = world(&["a", "b", "c"]);
        link_ok(&mut programs, &mut deps, &names, "a", "b");
        link_ok(&mut programs, &mut deps, &names, "b", "c");
        // closing the loop c -> a must fail
        let err = link(&mut programs, &mut deps, &names, "c", "a", Duration::from_millis(0), false)
            .unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("dependency cycle"));
        // the rejected edge must not have been registered anywhere
        assert_eq!(deps.len(), 2);
        assert_eq!(programs[0].edges().len(), 2);
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let (mut programs, mut deps, names) = world(&["a"]);
        let err = link(&mut programs, &mut deps, &names, "a", "a", Duration::from_millis(0), false)
            .unwrap_err();
        assert!(err.to_string().contains("dependency cycle"));
    }

    #[test]
    fn test_diamond_is_not_a_cycle() {
        let (mut programs, mut deps, names) = world(&["top", "left", "right", "base"]);
        link_ok(&mut programs, &mut deps, &names, "top", "left");
        link_ok(&mut programs, &mut deps, &names, "top", "right");
        link_ok(&mut programs, &mut deps, &names, "left", "base");
        link_ok(&mut programs, &mut deps, &names, "right", "base");
    }

    #[test]
    fn test_satisfaction_waits_for_delay() {
        let (mut programs, mut deps, names) = world(&["api", "db"]);
        link(&mut programs, &mut deps, &names, "api", "db", Duration::from_millis(500), false)
            .expect("link failed");

        let now = SystemTime::now();
        assert!(!deps_satisfied(0, &programs, &deps, now), "db is down");

        programs[1].test_mark_running(999_999_999, 2, Duration::from_millis(100));
        assert!(!deps_satisfied(0, &programs, &deps, now), "db not up long enough");

        programs[1].test_mark_running(999_999_999, 2, Duration::from_millis(600));
        assert!(deps_satisfied(0, &programs, &deps, now));

        // the on side has no dependencies of its own, so it is always satisfied
        assert!(deps_satisfied(1, &programs, &deps, now));
    }

    #[test]
    fn test_propagate_down_targets_current_incarnation() {
        let (mut programs, mut deps, names) = world(&["api", "worker", "db"]);
        link(&mut programs, &mut deps, &names, "api", "db", Duration::from_millis(0), true)
            .expect("link failed");
        link(&mut programs, &mut deps, &names, "worker", "db", Duration::from_millis(0), false)
            .expect("link failed");

        programs[0].test_mark_running(999_999_999, 7, Duration::from_secs(1));

        let events = propagate_down(2, &programs, &deps, false);
        assert_eq!(events.len(), 1, "only the propagating edge fans out");
        match &events[0] {
            Event::Kill {
                program,
                signal,
                propagate,
                token,
            } => {
                assert_eq!(*program, 0);
                assert_eq!(*signal, Signal::SIGTERM);
                assert!(*propagate);
                assert_eq!(*token, 7, "kill is aimed at the live incarnation");
                assert_ne!(*token, TOKEN_ANY);
            }
            other => panic!("expected a kill event, got {:?}", other),
        }

        // a downed dependent is targeted at its down token: handling either
        // schedules the fresh start propagation wants, or no-ops against a
        // newer incarnation that raced up in between
        let (mut programs, mut deps, names) = world(&["api", "db"]);
        link(&mut programs, &mut deps, &names, "api", "db", Duration::from_millis(0), true)
            .expect("link failed");
        let events = propagate_down(1, &programs, &deps, false);
        match &events[0] {
            Event::Kill { token, .. } => assert_eq!(*token, TOKEN_DOWN),
            other => panic!("expected a kill event, got {:?}", other),
        }

        assert!(propagate_down(1, &programs, &deps, true).is_empty(), "quiet while stopping");
    }
}
