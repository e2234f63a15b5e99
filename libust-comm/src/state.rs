// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-process runtime state. Every field is only accessed with the lifecycle
//! lock held.

use crate::abi::RootObject;
use crate::barrier::RegistrationBarrier;
use crate::config::Config;
use crate::handles::HandleTable;
use crate::setup::{Scope, ScopePaths};
use libust_shm::WaitChannel;
use std::net::Shutdown;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error};

pub(crate) struct ScopeState {
    pub(crate) paths: Option<ScopePaths>,
    /// Shared with the listener thread blocked on it.
    pub(crate) socket: Option<Arc<UnixStream>>,
    /// Created on the first successful connection, kept across reconnects.
    pub(crate) root_handle: Option<u32>,
    pub(crate) handles: HandleTable,
    pub(crate) registration_settled: bool,
    /// Mapped lazily the first time the coordinator is unreachable.
    pub(crate) wait_channel: Option<Arc<WaitChannel>>,
}

impl ScopeState {
    fn new(paths: Option<ScopePaths>) -> Self {
        ScopeState {
            paths,
            socket: None,
            root_handle: None,
            handles: HandleTable::new(),
            registration_settled: false,
            wait_channel: None,
        }
    }

    pub(crate) fn ensure_root_handle(&mut self) -> Option<u32> {
        if self.root_handle.is_none() {
            match self.handles.create_root(Box::new(RootObject)) {
                Ok(handle) => self.root_handle = Some(handle),
                Err(e) => error!("error creating root handle: {e}"),
            }
        }
        self.root_handle
    }

    /// Releases every per-process resource of the scope.
    fn teardown(&mut self, release: Release) {
        if let Some(socket) = self.socket.take() {
            match release {
                // wakes the listener blocked on a receive, a reply already
                // being computed can still be written
                Release::Exit => {
                    _ = socket.shutdown(Shutdown::Read);
                }
                Release::Restart => {
                    _ = socket.shutdown(Shutdown::Both);
                }
                Release::Inherited => close_inherited(socket),
            }
        }
        self.root_handle = None;
        self.handles.clear();
        self.registration_settled = false;
        self.wait_channel = None;
    }
}

/// How a scope lets go of its connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Release {
    Exit,
    /// The agents are rebuilt in the same process.
    Restart,
    /// The connection belongs to the parent of a fork whose other threads no
    /// longer exist.
    Inherited,
}

/// Closes a socket inherited through fork. The listener thread that shared it
/// did not survive the fork, so its reference will never be dropped.
fn close_inherited(socket: Arc<UnixStream>) {
    match Arc::try_unwrap(socket) {
        Ok(socket) => drop(socket),
        Err(shared) => {
            let fd = shared.as_raw_fd();
            std::mem::forget(shared);
            // Safety: the only other owner is gone, nothing uses or closes fd
            // after this point.
            drop(unsafe { OwnedFd::from_raw_fd(fd) });
        }
    }
}

pub(crate) struct RuntimeState {
    pub(crate) should_quit: bool,
    /// Bumped every time the agents are rebuilt. Listener threads of an older
    /// generation exit as soon as they notice.
    pub(crate) generation: u64,
    /// Process the agents were started in.
    pub(crate) pid: i32,
    pub(crate) barrier: Arc<RegistrationBarrier>,
    pub(crate) scopes: [ScopeState; 2],
    pub(crate) listeners: Vec<JoinHandle<()>>,
}

impl RuntimeState {
    pub(crate) fn new(config: &Config) -> Self {
        RuntimeState {
            should_quit: false,
            generation: 0,
            pid: nix::unistd::getpid().as_raw(),
            barrier: Arc::new(RegistrationBarrier::new(Scope::ALL.len() as u32)),
            scopes: [
                ScopeState::new(config.system.clone()),
                ScopeState::new(config.user.clone()),
            ],
            listeners: Vec::new(),
        }
    }

    pub(crate) fn scope(&self, scope: Scope) -> &ScopeState {
        &self.scopes[scope.index()]
    }

    pub(crate) fn scope_mut(&mut self, scope: Scope) -> &mut ScopeState {
        &mut self.scopes[scope.index()]
    }

    /// Whether a listener of `generation` may keep going.
    pub(crate) fn is_current(&self, generation: u64) -> bool {
        !self.should_quit && self.generation == generation
    }

    /// Marks the initial registration of `scope` as done, whether it
    /// succeeded or will not happen. Only the first call per scope counts.
    pub(crate) fn settle_registration(&mut self, scope: Scope) {
        let scope_state = self.scope_mut(scope);
        if scope_state.registration_settled {
            return;
        }
        scope_state.registration_settled = true;
        if self.barrier.count_down() {
            debug!(%scope, "registration barrier released");
        }
    }

    /// Tears everything down on exit. Listener threads are detached.
    pub(crate) fn teardown(&mut self) {
        for scope in &mut self.scopes {
            scope.teardown(Release::Exit);
        }
        self.listeners.clear();
    }

    /// Rebuilds a pristine state in the child of a fork. Nothing inherited
    /// from the parent is reused.
    pub(crate) fn reset_after_fork(&mut self) {
        let pid = nix::unistd::getpid().as_raw();
        let inherited = pid != self.pid;
        let release = if inherited {
            Release::Inherited
        } else {
            Release::Restart
        };
        for scope in &mut self.scopes {
            scope.teardown(release);
        }
        let listeners = std::mem::take(&mut self.listeners);
        if inherited {
            // the threads are gone, their handles cannot be joined nor detached
            std::mem::forget(listeners);
        }
        self.should_quit = false;
        self.generation += 1;
        self.pid = pid;
        self.barrier = Arc::new(RegistrationBarrier::new(Scope::ALL.len() as u32));
    }
}
