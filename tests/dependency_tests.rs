// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! End-to-end tests of dependency ordering and failure propagation.

mod common;

use std::time::{Duration, Instant};

use gander::config::Config;
use gander::msg::{Reply, Request};
use gander::supervisor::Supervisor;

use common::{StatusWatch, TestDaemon};

#[test]
fn test_cycle_rejected_before_anything_starts() {
    let cyclic = r#"
        [programs.a]
        command = "/bin/sh"
        [[programs.a.depends]]
        on = "b"

        [programs.b]
        command = "/bin/sh"
        [[programs.b.depends]]
        on = "a"
    "#;

    let config = Config::parse(cyclic).expect("config should parse");
    let err = Supervisor::from_config(config).expect_err("cycle must be rejected");
    assert!(err.is_config());
    assert!(err.to_string().contains("dependency cycle"));

    // the same set minus the closing edge is fine
    let acyclic = r#"
        [programs.a]
        command = "/bin/sh"
        [[programs.a.depends]]
        on = "b"

        [programs.b]
        command = "/bin/sh"
    "#;

    let config = Config::parse(acyclic).expect("config should parse");
    Supervisor::from_config(config).expect("acyclic set must link");
}

#[test]
fn test_dependent_waits_for_its_dependency() {
    let daemon = TestDaemon::boot(
        r#"
        [supervisor]
        tick = 5
        startwait = 25
        control_socket = "{control}"
        status_socket = "{status}"

        [programs.alpha]
        command = "/bin/sh"
        args = ["-c", "sleep 600"]
        enabled = false

        [programs.bravo]
        command = "/bin/sh"
        args = ["-c", "sleep 600"]
        enabled = false
        [[programs.bravo.depends]]
        on = "alpha"
        delay = 400

        [programs.canary]
        command = "/bin/sh"
        enabled = false
        "#,
    );

    let mut watch = StatusWatch::connect(&daemon);
    watch.sync(&daemon, "canary");

    // ask for the dependent first; it has to wait for alpha regardless
    assert_eq!(
        daemon.call(&Request::Start {
            program: "bravo".to_string(),
        }),
        Reply::Ok
    );
    assert_eq!(
        daemon.call(&Request::Start {
            program: "alpha".to_string(),
        }),
        Reply::Ok
    );

    let deadline = Instant::now() + Duration::from_secs(10);
    let mut alpha_up_at: Option<Instant> = None;
    let bravo_frame = loop {
        let state = watch
            .next_fresh(deadline)
            .expect("timed out waiting for bravo to come up");
        if state.program == "alpha" && state.up {
            alpha_up_at = Some(Instant::now());
        } else if state.program == "bravo" && state.up {
            break state;
        }
    };

    let alpha_up_at = alpha_up_at.expect("bravo came up before alpha was ever up");
    let waited = alpha_up_at.elapsed();
    assert!(
        waited >= Duration::from_millis(250),
        "bravo started {:?} after alpha, ignoring the 400ms delay",
        waited
    );
    assert!(bravo_frame.dependencies_satisfied);

    let states = daemon.states();
    assert!(states.iter().all(|s| s.program == "canary" || s.up));

    daemon.shutdown();
}

#[test]
fn test_death_propagation_cycles_the_dependent() {
    let daemon = TestDaemon::boot(
        r#"
        [supervisor]
        tick = 5
        startwait = 25
        killwait = 3000
        control_socket = "{control}"
        status_socket = "{status}"

        [programs.alpha]
        command = "/bin/sh"
        args = ["-c", "sleep 600"]

        [programs.bravo]
        command = "/bin/sh"
        args = ["-c", "sleep 600"]
        [[programs.bravo.depends]]
        on = "alpha"
        propagate = true

        [programs.canary]
        command = "/bin/sh"
        enabled = false
        "#,
    );

    let alpha_before = daemon.wait_up("alpha");
    let bravo_before = daemon.wait_up("bravo");

    let mut watch = StatusWatch::connect(&daemon);
    watch.sync(&daemon, "canary");

    assert_eq!(
        daemon.call(&Request::Kill {
            program: "alpha".to_string(),
        }),
        Reply::Ok
    );

    let frames = watch.collect_until("bravo's fresh incarnation", |s| {
        s.program == "bravo" && s.up && s.pid != bravo_before.pid
    });

    let alpha_down = frames
        .iter()
        .position(|s| s.program == "alpha" && !s.up)
        .expect("alpha's death was never broadcast");
    let bravo_down = frames
        .iter()
        .position(|s| s.program == "bravo" && !s.up)
        .expect("bravo was never torn down");
    assert!(
        alpha_down < bravo_down,
        "the propagated kill cannot precede the death that caused it"
    );

    let torn_down = &frames[bravo_down];
    assert!(
        torn_down.during_shutdown,
        "propagation is a controlled shutdown, not a crash"
    );
    assert_eq!(torn_down.down_type, "KILL");

    let alpha_after = frames
        .iter()
        .find(|s| s.program == "alpha" && s.up)
        .expect("alpha never respawned");
    assert_ne!(alpha_after.pid, alpha_before.pid);

    assert!(daemon.state("alpha").up);
    assert!(daemon.state("bravo").up);

    daemon.shutdown();
}
