// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-thread cache of the process name.
//!
//! Fetching the name may itself emit an event that records the name. Each
//! nesting level has its own slot, and past [`NESTING_MAX`] levels the cache
//! answers [`UNKNOWN_PROCNAME`] instead of fetching again.

use std::cell::Cell;

pub const PROCNAME_LEN: usize = 17;
pub const NESTING_MAX: usize = 2;

pub type Procname = [u8; PROCNAME_LEN];

pub const UNKNOWN_PROCNAME: Procname = *b"<unknown>\0\0\0\0\0\0\0\0";

pub struct ProcnameCache {
    entries: [Cell<Procname>; NESTING_MAX],
    nesting: Cell<usize>,
}

impl Default for ProcnameCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcnameCache {
    pub const fn new() -> Self {
        ProcnameCache {
            entries: [
                Cell::new([0; PROCNAME_LEN]),
                Cell::new([0; PROCNAME_LEN]),
            ],
            nesting: Cell::new(0),
        }
    }

    pub fn nesting(&self) -> usize {
        self.nesting.get()
    }

    /// Returns the cached name of the current nesting level, filling it with
    /// `fetch` first if empty. `fetch` may reenter the cache.
    pub fn get_with(&self, fetch: impl FnOnce(&mut Procname)) -> Procname {
        let nesting = self.nesting.get();
        let Some(entry) = self.entries.get(nesting) else {
            return UNKNOWN_PROCNAME;
        };
        if entry.get()[0] == 0 {
            self.nesting.set(nesting + 1);
            let mut name = [0; PROCNAME_LEN];
            fetch(&mut name);
            name[PROCNAME_LEN - 1] = 0;
            entry.set(name);
            self.nesting.set(nesting);
        }
        entry.get()
    }

    /// Forgets the cached names, e.g. after the process was renamed. Not
    /// signal safe.
    pub fn reset(&self) {
        for entry in self.entries.iter().rev() {
            entry.set([0; PROCNAME_LEN]);
        }
        self.nesting.set(0);
    }
}

thread_local! {
    static PROCNAME: ProcnameCache = const { ProcnameCache::new() };
}

/// The process name as seen by the calling thread.
pub fn get() -> Procname {
    PROCNAME.with(|cache| cache.get_with(fetch_procname))
}

pub fn reset() {
    PROCNAME.with(ProcnameCache::reset);
}

#[cfg(target_os = "linux")]
fn fetch_procname(buf: &mut Procname) {
    if let Ok(name) = nix::sys::prctl::get_name() {
        let name = name.as_bytes();
        let len = name.len().min(PROCNAME_LEN - 1);
        buf[..len].copy_from_slice(&name[..len]);
    }
}

#[cfg(not(target_os = "linux"))]
fn fetch_procname(buf: &mut Procname) {
    let exe = std::env::current_exe().ok();
    let name = exe
        .as_deref()
        .and_then(std::path::Path::file_name)
        .map(|name| name.as_encoded_bytes())
        .unwrap_or_default();
    let len = name.len().min(PROCNAME_LEN - 1);
    buf[..len].copy_from_slice(&name[..len]);
}

/// Name bytes up to the first NUL.
pub fn as_bytes(name: &Procname) -> &[u8] {
    let len = name.iter().position(|b| *b == 0).unwrap_or(PROCNAME_LEN);
    &name[..len]
}
