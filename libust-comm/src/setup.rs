// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use libust_shm::WaitScope;
use std::ffi::{CStr, CString};
use std::fmt;
use std::path::{Path, PathBuf};

pub const SYSTEM_APPS_SOCK_PATH: &str = "/var/run/lttng/apps-lttng-sessiond";
pub const SYSTEM_APPS_WAIT_SHM_PATH: &CStr = c"/lttng-ust-apps-wait";

/// Relative to the home directory of the user.
pub const HOME_APPS_SOCK_PATH: &str = ".lttng/apps-lttng-sessiond";
pub const HOME_APPS_WAIT_SHM_PREFIX: &str = "/lttng-ust-apps-wait-";

/// Which coordinator a connection agent talks to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    System,
    User,
}

impl Scope {
    pub const ALL: [Scope; 2] = [Scope::System, Scope::User];

    pub(crate) fn index(self) -> usize {
        match self {
            Scope::System => 0,
            Scope::User => 1,
        }
    }

    pub fn wait_scope(self) -> WaitScope {
        match self {
            Scope::System => WaitScope::System,
            Scope::User => WaitScope::User,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::System => write!(f, "system"),
            Scope::User => write!(f, "user"),
        }
    }
}

/// Where to find a coordinator: its listening socket and its wait page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopePaths {
    pub socket_path: PathBuf,
    pub wait_shm_path: CString,
}

impl ScopePaths {
    pub fn system() -> Self {
        ScopePaths {
            socket_path: PathBuf::from(SYSTEM_APPS_SOCK_PATH),
            wait_shm_path: SYSTEM_APPS_WAIT_SHM_PATH.to_owned(),
        }
    }

    pub fn user_for(home: &Path, uid: u32) -> Option<Self> {
        Some(ScopePaths {
            socket_path: home.join(HOME_APPS_SOCK_PATH),
            wait_shm_path: CString::new(format!("{HOME_APPS_WAIT_SHM_PREFIX}{uid}")).ok()?,
        })
    }

    /// Paths of the per-user coordinator of the calling user, or `None` when
    /// the user scope must not be used by this process.
    pub fn user() -> Option<Self> {
        if !user_scope_allowed() {
            tracing::debug!("real and effective uid differ, per-user tracing disabled");
            return None;
        }
        let Some(home) = std::env::var_os("HOME").filter(|h| !h.is_empty()) else {
            tracing::warn!("HOME is not set, per-user tracing disabled");
            return None;
        };
        Self::user_for(Path::new(&home), nix::unistd::getuid().as_raw())
    }
}

/// Per-user tracing is never allowed for setuid binaries: the socket lives in
/// a directory the real user controls.
pub fn user_scope_allowed() -> bool {
    nix::unistd::getuid() == nix::unistd::geteuid()
}
