// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Runtime side of the session rendezvous between a traced process and its
//! tracing coordinators.
//!
//! [`lifecycle::init`] starts one listener thread per scope (the system-wide
//! coordinator and the per-user one). Each listener connects to its
//! coordinator, registers the process, then serves the coordinator's
//! commands. While a coordinator is unavailable the listener sleeps on its
//! [`libust_shm::WaitChannel`]. Process startup waits, bounded by
//! `UST_REGISTER_TIMEOUT`, until both scopes registered or gave up.
//!
//! Programs forking without exec must go through [`Lifecycle::fork`] (or
//! [`Lifecycle::before_fork`] and its guard) so the child gets its own
//! connections.

mod agent;
mod dispatch;
mod sigguard;
mod state;

pub mod abi;
pub mod barrier;
pub mod channel;
pub mod config;
pub mod context;
pub mod error;
pub mod handles;
pub mod lifecycle;
pub mod log;
pub mod message;
pub mod procname;
pub mod setup;

pub use config::{Config, RegisterTimeout};
pub use error::{ChannelError, ContextError};
pub use lifecycle::{Fork, ForkGuard, Lifecycle, ScopeStatus};
pub use setup::{Scope, ScopePaths};
pub use sigguard::SigGuard;
