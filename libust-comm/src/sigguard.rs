// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow};

/// Lexically-scoped block of every signal on the calling thread. The previous
/// mask is restored when the guard is dropped, whatever the exit path.
///
/// Threads spawned while the guard is alive inherit the blocked mask.
pub struct SigGuard {
    old_sigmask: SigSet,
}

impl SigGuard {
    pub fn block_all() -> nix::Result<Self> {
        let mut old_sigmask = SigSet::empty();
        pthread_sigmask(
            SigmaskHow::SIG_BLOCK,
            Some(&SigSet::all()),
            Some(&mut old_sigmask),
        )?;
        Ok(SigGuard { old_sigmask })
    }
}

impl Drop for SigGuard {
    fn drop(&mut self) {
        let _ = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.old_sigmask), None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::Signal;

    fn current_mask() -> SigSet {
        let mut mask = SigSet::empty();
        pthread_sigmask(SigmaskHow::SIG_BLOCK, None, Some(&mut mask)).unwrap();
        mask
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_blocks_and_restores() {
        // run on a fresh thread so the test harness mask does not matter
        std::thread::spawn(|| {
            let before = current_mask();
            assert!(!before.contains(Signal::SIGUSR1));
            {
                let _guard = SigGuard::block_all().unwrap();
                let blocked = current_mask();
                assert!(blocked.contains(Signal::SIGUSR1));
                assert!(blocked.contains(Signal::SIGTERM));

                let inherited = std::thread::spawn(current_mask).join().unwrap();
                assert!(inherited.contains(Signal::SIGUSR1));
            }
            assert_eq!(before, current_mask());
        })
        .join()
        .unwrap();
    }
}
