// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::mem_handle::{MapAccess, MappedMem, MemoryHandle, ShmHandle};
use crate::shm_ref::ShmRef;
use crate::ShmError;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd::pipe2;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

/// One region of a [`ShmObjectTable`](crate::ShmObjectTable).
///
/// The mapped size is fixed at creation. `allocated_len` is the bump pointer
/// used by [`zalloc`](Self::zalloc).
pub struct ShmObject {
    index: usize,
    mem: MappedMem<ShmHandle>,
    /// `[read end, write end]`, used by consumers to wait for data.
    wait_fd: [OwnedFd; 2],
    allocated_len: usize,
}

impl ShmObject {
    pub(crate) fn new(index: usize, memory_map_size: usize) -> Result<Self, ShmError> {
        if memory_map_size == 0 {
            return Err(ShmError::ZeroSize);
        }
        let (wait_read, wait_write) = pipe2(OFlag::O_CLOEXEC)?;
        // the writer must never block the traced application
        fcntl(wait_write.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;

        let mem = ShmHandle::new(memory_map_size)?.map(MapAccess::ReadWrite)?;
        Ok(ShmObject {
            index,
            mem,
            wait_fd: [wait_read, wait_write],
            allocated_len: 0,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn memory_map_size(&self) -> usize {
        self.mem.get_size()
    }

    pub fn allocated_len(&self) -> usize {
        self.allocated_len
    }

    pub fn shm_fd(&self) -> BorrowedFd<'_> {
        self.mem.handle().get_fd()
    }

    pub fn wait_fd(&self) -> BorrowedFd<'_> {
        self.wait_fd[0].as_fd()
    }

    pub fn wakeup_fd(&self) -> BorrowedFd<'_> {
        self.wait_fd[1].as_fd()
    }

    pub fn as_slice(&self) -> &[u8] {
        self.mem.as_slice()
    }

    pub(crate) fn base(&self) -> *mut u8 {
        self.mem.as_ptr()
    }

    /// Pads `allocated_len` up to the next multiple of `align`, which must
    /// be a power of two. Alignments of 0 and 1 are no-ops.
    pub fn align(&mut self, align: usize) {
        if align <= 1 {
            return;
        }
        debug_assert!(align.is_power_of_two());
        let padding = self.allocated_len.wrapping_neg() & (align - 1);
        self.allocated_len = self.allocated_len.saturating_add(padding);
    }

    /// Reserves `len` bytes of this region. The memory is already zeroed.
    ///
    /// Not thread-safe: concurrent allocators of the same region must be
    /// serialized by the caller.
    pub fn zalloc(&mut self, len: usize) -> Option<ShmRef> {
        let available = self.memory_map_size().checked_sub(self.allocated_len)?;
        if available < len {
            tracing::debug!(
                index = self.index,
                len,
                available,
                "shm object has no room left for allocation"
            );
            return None;
        }
        let shm_ref = ShmRef::new(self.index as i64, self.allocated_len as i64);
        self.allocated_len += len;
        Some(shm_ref)
    }
}
