// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
#![cfg(target_os = "linux")]

//! The process-wide runtime stops when the process exits. Alone in its binary
//! because it forks.

use libust_comm::lifecycle::{global, init_with};
use libust_comm::{Config, RegisterTimeout};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult};

// Registered before the runtime's own hook, so it runs after it.
extern "C" fn check_stopped() {
    let stopped = global().is_some_and(|lifecycle| lifecycle.is_stopped());
    // Safety: nothing is left to run in this process.
    unsafe { libc::_exit(if stopped { 0 } else { 7 }) }
}

fn child_main() -> ! {
    if unsafe { libc::atexit(check_stopped) } != 0 {
        unsafe { libc::_exit(2) }
    }
    let lifecycle = init_with(Config {
        register_timeout: RegisterTimeout::NoWait,
        system: None,
        user: None,
        ..Default::default()
    });
    if lifecycle.is_stopped() {
        unsafe { libc::_exit(3) }
    }
    std::process::exit(4)
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_runtime_stops_at_process_exit() {
    // Safety: the child only runs the code above before exiting.
    let child = match unsafe { fork() }.unwrap() {
        ForkResult::Child => child_main(),
        ForkResult::Parent { child } => child,
    };
    assert_eq!(WaitStatus::Exited(child, 0), waitpid(child, None).unwrap());
}
