// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared memory building blocks for the userspace tracing runtime.
//!
//! - [`ShmObjectTable`]: an append-only table of anonymous shared memory
//!   regions, each paired with a wait/wakeup pipe. Data structures placed in
//!   those regions point at each other with [`ShmRef`]s, `(index, offset)`
//!   pairs that are validated against the table on every dereference.
//! - [`WaitChannel`]: the one-page named region a coordinator uses to tell
//!   traced processes it is ready to accept connections.

mod mem_handle;
mod object;
mod shm_ref;
mod table;
mod wait;

pub use mem_handle::{
    page_aligned_size, MapAccess, MappedMem, MemoryHandle, NamedShmHandle, ShmHandle,
};
pub use object::ShmObject;
pub use shm_ref::{ShmPod, ShmPtr, ShmRef, ShmShared};
pub use table::{ShmObjectData, ShmObjectTable};
pub use wait::{WaitChannel, WaitScope, DEFAULT_FALLBACK_INTERVAL};

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    #[error("shm object table is full ({max} objects)")]
    TableFull { max: usize },
    #[error("shm objects cannot be empty")]
    ZeroSize,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Os(#[from] nix::errno::Errno),
}
