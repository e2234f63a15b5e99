// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::config::RegisterTimeout;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// Countdown released once every scope has either registered or given up
/// for this process incarnation.
#[derive(Debug)]
pub struct RegistrationBarrier {
    remaining: Mutex<u32>,
    released: Condvar,
}

impl RegistrationBarrier {
    pub fn new(count: u32) -> Self {
        RegistrationBarrier {
            remaining: Mutex::new(count),
            released: Condvar::new(),
        }
    }

    fn remaining_guard(&self) -> MutexGuard<'_, u32> {
        self.remaining
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Decrements the countdown. Returns `true` for the call that released
    /// the barrier. Extra calls after release are no-ops.
    pub fn count_down(&self) -> bool {
        let mut remaining = self.remaining_guard();
        if *remaining == 0 {
            return false;
        }
        *remaining -= 1;
        if *remaining == 0 {
            self.released.notify_all();
            return true;
        }
        false
    }

    pub fn remaining(&self) -> u32 {
        *self.remaining_guard()
    }

    pub fn is_released(&self) -> bool {
        self.remaining() == 0
    }

    /// Blocks according to `timeout`. Returns whether the barrier is
    /// released.
    pub fn wait(&self, timeout: RegisterTimeout) -> bool {
        let remaining = self.remaining_guard();
        match timeout {
            RegisterTimeout::NoWait => *remaining == 0,
            RegisterTimeout::Forever => {
                let remaining = self
                    .released
                    .wait_while(remaining, |remaining| *remaining > 0)
                    .unwrap_or_else(PoisonError::into_inner);
                *remaining == 0
            }
            RegisterTimeout::Timeout(timeout) => {
                let deadline = Instant::now() + timeout;
                let mut remaining = remaining;
                while *remaining > 0 {
                    let Some(left) = deadline.checked_duration_since(Instant::now()) else {
                        break;
                    };
                    remaining = self
                        .released
                        .wait_timeout(remaining, left)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
                *remaining == 0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_releases_once_after_count() {
        let barrier = RegistrationBarrier::new(2);
        assert!(!barrier.count_down());
        assert!(!barrier.is_released());
        assert!(barrier.count_down());
        assert!(barrier.is_released());
        assert!(!barrier.count_down());
        assert_eq!(0, barrier.remaining());
    }

    #[test]
    fn test_no_wait_returns_current_state() {
        let barrier = RegistrationBarrier::new(1);
        assert!(!barrier.wait(RegisterTimeout::NoWait));
        barrier.count_down();
        assert!(barrier.wait(RegisterTimeout::NoWait));
    }

    #[test]
    fn test_timed_wait_expires() {
        let barrier = RegistrationBarrier::new(1);
        let start = Instant::now();
        assert!(!barrier.wait(RegisterTimeout::Timeout(Duration::from_millis(50))));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_waiters_are_woken() {
        let barrier = Arc::new(RegistrationBarrier::new(2));
        let waiters: Vec<_> = [
            RegisterTimeout::Forever,
            RegisterTimeout::Timeout(Duration::from_secs(30)),
        ]
        .into_iter()
        .map(|timeout| {
            let barrier = barrier.clone();
            thread::spawn(move || barrier.wait(timeout))
        })
        .collect();

        barrier.count_down();
        barrier.count_down();
        for waiter in waiters {
            assert!(waiter.join().unwrap());
        }
    }
}
