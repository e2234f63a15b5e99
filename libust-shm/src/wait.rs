// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Rendezvous channel: one page of shared memory whose first 32-bit word is
//! flipped from 0 to 1 by the coordinator when it becomes available.
//!
//! The traced process maps the page read-only and sleeps on the word with a
//! futex. When the page cannot be trusted or mapped it falls back to sleeping
//! a fixed interval between connection attempts.

use crate::mem_handle::{page_aligned_size, MapAccess, MappedMem, MemoryHandle, NamedShmHandle};
use nix::errno::Errno;
use std::ffi::CStr;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_FALLBACK_INTERVAL: Duration = Duration::from_secs(5);

const USER_WAIT_SHM_MODE: u32 = 0o640;
const SYSTEM_WAIT_SHM_MODE: u32 = 0o666;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WaitScope {
    /// Owned by a coordinator running as the same user. The page must be
    /// owned by us and writable by us when we create it.
    User,
    /// Owned by a system-wide coordinator, which can always write the page.
    System,
}

impl WaitScope {
    fn create_mode(self) -> u32 {
        match self {
            WaitScope::User => USER_WAIT_SHM_MODE,
            WaitScope::System => SYSTEM_WAIT_SHM_MODE,
        }
    }
}

enum WaitBackend {
    Futex(MappedMem<NamedShmHandle>),
    Poll,
}

pub struct WaitChannel {
    backend: WaitBackend,
    fallback_interval: Duration,
}

impl WaitChannel {
    /// Sets up the channel at `path`. Never fails: any problem degrades the
    /// channel to polling.
    pub fn open(path: &CStr, scope: WaitScope, fallback_interval: Duration) -> WaitChannel {
        let backend = match get_wait_shm(path, scope) {
            Some(handle) => match handle.map(MapAccess::ReadOnly) {
                Ok(mapped) => WaitBackend::Futex(mapped),
                Err(e) => {
                    debug!(
                        ?path,
                        "mmap error (can be caused by race with the coordinator), using poll mode: {e}"
                    );
                    WaitBackend::Poll
                }
            },
            None => WaitBackend::Poll,
        };
        WaitChannel {
            backend,
            fallback_interval,
        }
    }

    pub fn polling(fallback_interval: Duration) -> WaitChannel {
        WaitChannel {
            backend: WaitBackend::Poll,
            fallback_interval,
        }
    }

    pub fn is_blocking(&self) -> bool {
        matches!(self.backend, WaitBackend::Futex(_))
    }

    /// Blocks until the coordinator signals availability. In poll mode, or
    /// when the futex cannot be used, sleeps the fallback interval instead.
    ///
    /// Callers wait after a failed connection attempt. A flag that is already
    /// raised then belongs to a coordinator that went away after announcing
    /// itself, so this sleeps the fallback interval too.
    pub fn wait(&self) {
        match &self.backend {
            WaitBackend::Futex(mapped) => {
                let word = flag_word(mapped);
                if word.load(Ordering::Acquire) != 0 {
                    debug!("wait flag already raised, coordinator unreachable");
                    std::thread::sleep(self.fallback_interval);
                    return;
                }
                match futex_wait(word, 0) {
                    Ok(()) | Err(Errno::EAGAIN) | Err(Errno::EINTR) => {}
                    Err(e) => {
                        // futexes on read-only mappings fault on some kernels
                        warn!("futex wait failed: {e}");
                        std::thread::sleep(self.fallback_interval);
                    }
                }
            }
            WaitBackend::Poll => std::thread::sleep(self.fallback_interval),
        }
    }

    /// Coordinator side: raises the flag at `path` and wakes every waiter.
    /// Returns the number of woken waiters.
    pub fn notify(path: &CStr) -> io::Result<usize> {
        let mapped = NamedShmHandle::open_read_write(path)?.map(MapAccess::ReadWrite)?;
        let word = flag_word(&mapped);
        word.store(1, Ordering::Release);
        Ok(futex_wake(word)?)
    }
}

fn flag_word(mapped: &MappedMem<NamedShmHandle>) -> &AtomicU32 {
    // Safety: mappings are page aligned and at least one page long.
    unsafe { &*(mapped.as_ptr() as *const AtomicU32) }
}

/// Opens the wait page read-only, creating it first when it does not exist.
/// Returns `None` when the page cannot be used for blocking waits.
fn get_wait_shm(path: &CStr, scope: WaitScope) -> Option<NamedShmHandle> {
    let handle = match NamedShmHandle::open_read_only(path) {
        Ok(handle) => handle,
        Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {
            create_wait_shm(path, scope).ok()?;
            NamedShmHandle::open_read_only(path)
                .map_err(|e| warn!(?path, "error opening wait shm: {e}"))
                .ok()?
        }
        Err(e) => {
            warn!(?path, "error opening wait shm: {e}");
            return None;
        }
    };

    if scope == WaitScope::User {
        // If we do not own the page, our coordinator cannot wake us up:
        // someone else may be pretending to be it.
        let uid = nix::unistd::getuid().as_raw();
        match handle.owner_uid() {
            Ok(owner) if owner == uid => {}
            Ok(owner) => {
                warn!(?path, owner, uid, "wait shm is not owned by us, using poll mode");
                return None;
            }
            Err(e) => {
                warn!(?path, "fstat on wait shm failed: {e}");
                return None;
            }
        }
    }
    Some(handle)
}

fn create_wait_shm(path: &CStr, scope: WaitScope) -> io::Result<()> {
    let size = page_aligned_size(std::mem::size_of::<u32>());
    match NamedShmHandle::create_exclusive(path, scope.create_mode(), size) {
        Ok(_) => {
            debug!(?path, "created wait shm");
            Ok(())
        }
        Err(e) if create_error_is_usable(e.raw_os_error(), scope) => Ok(()),
        Err(e) => {
            warn!(?path, "error creating wait shm: {e}");
            Err(e)
        }
    }
}

/// Whether the page may still be waited on after creating it failed with
/// `errno`.
fn create_error_is_usable(errno: Option<i32>, scope: WaitScope) -> bool {
    match errno {
        // created concurrently by the coordinator or a sibling process
        Some(libc::EEXIST) => true,
        // The page exists but we may not write it. A system coordinator
        // runs privileged and can still wake us; a user one cannot.
        Some(libc::EACCES) => scope == WaitScope::System,
        _ => false,
    }
}

#[cfg(target_os = "linux")]
fn futex_wait(word: &AtomicU32, expected: u32) -> Result<(), Errno> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0u32,
        )
    };
    if ret == -1 {
        Err(Errno::last())
    } else {
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn futex_wake(word: &AtomicU32) -> Result<usize, Errno> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE,
            i32::MAX,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0u32,
        )
    };
    if ret == -1 {
        Err(Errno::last())
    } else {
        Ok(ret as usize)
    }
}

#[cfg(not(target_os = "linux"))]
fn futex_wait(_word: &AtomicU32, _expected: u32) -> Result<(), Errno> {
    Err(Errno::ENOSYS)
}

#[cfg(not(target_os = "linux"))]
fn futex_wake(_word: &AtomicU32) -> Result<usize, Errno> {
    Ok(0)
}
