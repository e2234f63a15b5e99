// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
#![cfg(target_os = "linux")]

mod common;

use common::{eventually, MockCoordinator};
use libust_comm::{Config, Lifecycle, RegisterTimeout, Scope};
use std::time::{Duration, Instant};

#[test]
#[cfg_attr(miri, ignore)]
fn test_no_coordinator_releases_startup() {
    let coordinator = MockCoordinator::absent("absent");
    let config = Config {
        register_timeout: RegisterTimeout::Forever,
        ..coordinator.config()
    };
    let start = Instant::now();
    let lifecycle = Lifecycle::start(config);
    assert!(start.elapsed() < Duration::from_secs(5));
    assert!(lifecycle.registration_released());

    let status = lifecycle.status(Scope::System);
    assert!(status.registration_settled);
    assert!(!status.connected);
    assert!(eventually(|| lifecycle.status(Scope::System).wait_blocking.is_some()));

    lifecycle.exit();
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_silent_coordinator_times_out() {
    let coordinator = MockCoordinator::start("silent");
    let timeout = Duration::from_millis(200);
    let config = Config {
        register_timeout: RegisterTimeout::Timeout(timeout),
        ..coordinator.config()
    };
    // the connection sits in the backlog: registered, never acknowledged
    let start = Instant::now();
    let lifecycle = Lifecycle::start(config);
    assert!(start.elapsed() >= timeout);
    assert!(!lifecycle.registration_released());
    assert_eq!(1, lifecycle.registration_pending());

    lifecycle.exit();
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_no_wait_returns_immediately() {
    let coordinator = MockCoordinator::start("nowait");
    let start = Instant::now();
    let lifecycle = Lifecycle::start(coordinator.config());
    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(!lifecycle.wait_for_registration(RegisterTimeout::NoWait));

    let session = coordinator.accept();
    assert_eq!(std::process::id() as i32, session.registration.pid);
    lifecycle.exit();
}

#[test]
fn test_all_scopes_disabled() {
    let lifecycle = Lifecycle::start(Config {
        register_timeout: RegisterTimeout::Forever,
        system: None,
        user: None,
        ..Default::default()
    });
    assert!(lifecycle.registration_released());
    assert_eq!(0, lifecycle.registration_pending());
    lifecycle.exit();
}
