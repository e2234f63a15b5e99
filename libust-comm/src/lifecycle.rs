// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process lifecycle: startup, fork and exit of the tracing runtime.
//!
//! The runtime state lives behind a single mutex. Command handling,
//! (re)connection, fork and exit all take it, so a fork never observes a
//! half-updated connection and exit never races an in-flight command.

use crate::agent;
use crate::barrier::RegistrationBarrier;
use crate::config::{Config, RegisterTimeout};
use crate::setup::Scope;
use crate::sigguard::SigGuard;
use crate::state::RuntimeState;
use crate::{log, procname};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tracing::{debug, error, info, warn};

pub enum Fork {
    Parent(libc::pid_t),
    Child,
}

/// Snapshot of one scope, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeStatus {
    pub enabled: bool,
    pub connected: bool,
    pub socket_fd: Option<RawFd>,
    pub root_handle: Option<u32>,
    pub registration_settled: bool,
    pub handle_count: usize,
    /// `None` until the coordinator was found unavailable once.
    pub wait_blocking: Option<bool>,
}

pub struct Lifecycle {
    state: Mutex<RuntimeState>,
    config: Config,
}

impl Lifecycle {
    /// Starts one listener per enabled scope, then waits for the initial
    /// registration as configured by `register_timeout`.
    pub fn start(config: Config) -> Arc<Lifecycle> {
        let lifecycle = Arc::new(Lifecycle {
            state: Mutex::new(RuntimeState::new(&config)),
            config,
        });
        let barrier = {
            let _signals = SigGuard::block_all()
                .map_err(|e| warn!("failed to block signals: {e}"))
                .ok();
            let mut state = lifecycle.lock();
            lifecycle.spawn_agents(&mut state);
            state.barrier.clone()
        };
        lifecycle.wait_initial_registration(&barrier);
        lifecycle
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Enters the critical section. A panic in another holder does not make
    /// the state unusable: every mutation leaves it consistent.
    pub(crate) fn lock(&self) -> MutexGuard<'_, RuntimeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_agents(self: &Arc<Self>, state: &mut RuntimeState) {
        for scope in Scope::ALL {
            if state.scope(scope).paths.is_none() {
                debug!(%scope, "scope disabled");
                state.settle_registration(scope);
                continue;
            }
            match agent::spawn(self.clone(), scope, state.generation) {
                Ok(listener) => state.listeners.push(listener),
                Err(e) => {
                    error!(%scope, "error creating listener thread: {e}");
                    state.settle_registration(scope);
                }
            }
        }
    }

    fn wait_initial_registration(&self, barrier: &RegistrationBarrier) {
        let timeout = self.config.register_timeout;
        if barrier.wait(timeout) {
            debug!("initial registration done");
        } else if timeout != RegisterTimeout::NoWait {
            info!(%timeout, "timed out waiting for the coordinators, continuing");
        }
    }

    /// Blocks until the registration of the current process incarnation is
    /// settled for both scopes.
    pub fn wait_for_registration(&self, timeout: RegisterTimeout) -> bool {
        let barrier = self.lock().barrier.clone();
        barrier.wait(timeout)
    }

    pub fn registration_released(&self) -> bool {
        self.lock().barrier.is_released()
    }

    /// Number of scopes whose initial registration is not settled yet.
    pub fn registration_pending(&self) -> u32 {
        self.lock().barrier.remaining()
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub fn status(&self, scope: Scope) -> ScopeStatus {
        let state = self.lock();
        let scope_state = state.scope(scope);
        ScopeStatus {
            enabled: scope_state.paths.is_some(),
            connected: scope_state.socket.is_some(),
            socket_fd: scope_state.socket.as_ref().map(|s| s.as_raw_fd()),
            root_handle: scope_state.root_handle,
            registration_settled: scope_state.registration_settled,
            handle_count: scope_state.handles.len(),
            wait_blocking: scope_state.wait_channel.as_ref().map(|c| c.is_blocking()),
        }
    }

    /// Blocks signals and enters the critical section. Call right before
    /// forking; finish with [`ForkGuard::after_fork_parent`] in the parent
    /// and [`ForkGuard::after_fork_child`] in the child.
    pub fn before_fork(self: &Arc<Self>) -> ForkGuard<'_> {
        let signals = SigGuard::block_all()
            .map_err(|e| warn!("failed to block signals: {e}"))
            .ok();
        ForkGuard {
            lifecycle: self,
            state: self.lock(),
            _signals: signals,
        }
    }

    /// Forks the process, keeping the runtime consistent on both sides. The
    /// child gets its own agents and registers as a new process.
    pub fn fork(self: &Arc<Self>) -> io::Result<Fork> {
        let guard = self.before_fork();
        // Safety: the runtime state is locked, the listener threads cannot
        // hold any of it. Other locks of the program are its own concern.
        match unsafe { nix::unistd::fork() } {
            Ok(nix::unistd::ForkResult::Parent { child }) => {
                guard.after_fork_parent();
                Ok(Fork::Parent(child.as_raw()))
            }
            Ok(nix::unistd::ForkResult::Child) => {
                guard.after_fork_child();
                Ok(Fork::Child)
            }
            Err(e) => {
                guard.after_fork_parent();
                Err(e.into())
            }
        }
    }

    /// Stops the runtime. Listener threads are detached rather than joined:
    /// they hold nothing outside the critical section.
    pub fn exit(&self) {
        let mut state = self.lock();
        if state.should_quit {
            return;
        }
        state.should_quit = true;
        state.teardown();
        debug!("runtime stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().should_quit
    }
}

/// The critical section held across a fork, with all signals blocked.
pub struct ForkGuard<'a> {
    lifecycle: &'a Arc<Lifecycle>,
    // dropped before the signal mask is restored
    state: MutexGuard<'a, RuntimeState>,
    _signals: Option<SigGuard>,
}

impl ForkGuard<'_> {
    pub fn after_fork_parent(self) {}

    /// Rebuilds the runtime from scratch in the child. Nothing of the parent
    /// connections is reused.
    pub fn after_fork_child(self) {
        let ForkGuard {
            lifecycle,
            mut state,
            _signals,
        } = self;
        state.reset_after_fork();
        procname::reset();
        lifecycle.spawn_agents(&mut state);
        let barrier = state.barrier.clone();
        debug!(pid = state.pid, generation = state.generation, "runtime reset after fork");
        drop(state);
        drop(_signals);
        lifecycle.wait_initial_registration(&barrier);
    }
}

static RUNTIME: OnceLock<Arc<Lifecycle>> = OnceLock::new();

/// Starts the process-wide runtime from the environment. Later calls return
/// the same instance.
pub fn init() -> Arc<Lifecycle> {
    start_global(|| {
        let config = Config::get();
        if let Err(e) = log::init(&config.log) {
            warn!("failed to initialize logging: {e:#}");
        }
        config
    })
}

/// Starts the process-wide runtime with an explicit configuration. Later
/// calls, including [`init`], return the first instance.
pub fn init_with(config: Config) -> Arc<Lifecycle> {
    start_global(|| config)
}

fn start_global(config: impl FnOnce() -> Config) -> Arc<Lifecycle> {
    RUNTIME
        .get_or_init(|| {
            register_exit_hook();
            Lifecycle::start(config())
        })
        .clone()
}

pub fn global() -> Option<Arc<Lifecycle>> {
    RUNTIME.get().cloned()
}

/// Stops the process-wide runtime when the process exits normally.
fn register_exit_hook() {
    extern "C" fn exit_hook() {
        if let Some(lifecycle) = RUNTIME.get() {
            lifecycle.exit();
        }
    }
    // Safety: exit_hook only takes the runtime lock, which no exiting thread
    // keeps across a call to exit.
    if unsafe { libc::atexit(exit_hook) } != 0 {
        warn!("failed to register the runtime exit hook");
    }
}

/// Starts the runtime before `main` when the `auto-init` feature is enabled,
/// so that tracing is registered before any user code runs.
#[cfg(all(target_os = "linux", feature = "auto-init", not(test)))]
#[link_section = ".init_array"]
#[used]
static AUTO_INIT: extern "C" fn() = {
    extern "C" fn auto_init() {
        init();
    }
    auto_init
};
