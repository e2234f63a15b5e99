// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
#![cfg(target_os = "linux")]

//! Measures the CPU time of the whole process, alone in its binary so other
//! tests do not count.

mod common;

use common::{eventually, MockCoordinator};
use libust_comm::{Lifecycle, Scope};
use libust_shm::WaitChannel;
use std::thread;
use std::time::Duration;

fn cpu_time() -> Duration {
    let mut usage = std::mem::MaybeUninit::<libc::rusage>::zeroed();
    // Safety: getrusage fills the struct, RUSAGE_SELF is always valid.
    let usage = unsafe {
        assert_eq!(0, libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()));
        usage.assume_init()
    };
    let time = |t: libc::timeval| {
        Duration::from_secs(t.tv_sec as u64) + Duration::from_micros(t.tv_usec as u64)
    };
    time(usage.ru_utime) + time(usage.ru_stime)
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_stale_wait_flag_does_not_spin() {
    let coordinator = MockCoordinator::absent("stale-flag");
    let lifecycle = Lifecycle::start(coordinator.config());
    assert!(eventually(|| lifecycle.status(Scope::System).wait_blocking == Some(true)));

    // the coordinator announced itself, then went away
    WaitChannel::notify(&coordinator.paths.wait_shm_path).unwrap();
    let before = cpu_time();
    thread::sleep(Duration::from_secs(1));
    let used = cpu_time() - before;

    assert!(!lifecycle.status(Scope::System).connected);
    assert!(used < Duration::from_millis(250), "{used:?} of CPU in 1s");
    lifecycle.exit();
}
