// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Append-only table of shared memory objects.
//!
//! # Trust model
//!
//! The table itself is owned by this process and trusted. The [`ShmRef`]s
//! pointing into it are not: they are stored in shared memory where a
//! cooperating peer with write access may change them at any time. Every
//! dereference therefore re-validates
//!
//! - `index < allocated_len`, and
//! - `offset + element_index * size_of::<T>() + size_of::<T>() <= region size`,
//!
//! using the size recorded in the table for that specific region, never a
//! size supplied by the caller. Anything else resolves to `None`.
//!
//! # Concurrency
//!
//! Lookups take `&self` and need no lock. Appending a region or allocating
//! inside one takes `&mut self`; the owner serializes allocation.

use crate::object::ShmObject;
use crate::shm_ref::{ShmPod, ShmPtr, ShmRef, ShmShared};
use crate::ShmError;
use nix::errno::Errno;
use std::mem::{align_of, size_of};
use std::os::fd::BorrowedFd;
use std::ptr::NonNull;

pub struct ShmObjectTable {
    objects: Vec<ShmObject>,
    max_objects: usize,
}

/// Raw descriptors and size of one region, as handed to consumers.
#[derive(Debug, Copy, Clone)]
pub struct ShmObjectData<'a> {
    pub shm_fd: BorrowedFd<'a>,
    pub wait_fd: BorrowedFd<'a>,
    pub memory_map_size: u64,
}

impl ShmObjectTable {
    pub fn create(max_objects: usize) -> Self {
        ShmObjectTable {
            objects: Vec::with_capacity(max_objects),
            max_objects,
        }
    }

    pub fn max_objects(&self) -> usize {
        self.max_objects
    }

    pub fn allocated_len(&self) -> usize {
        self.objects.len()
    }

    /// Creates a new zero-filled region of exactly `memory_map_size` bytes and
    /// returns it. Its index is the next unused one.
    pub fn append(&mut self, memory_map_size: usize) -> Result<&mut ShmObject, ShmError> {
        let index = self.objects.len();
        if index >= self.max_objects {
            return Err(ShmError::TableFull {
                max: self.max_objects,
            });
        }
        let object = ShmObject::new(index, memory_map_size)?;
        tracing::debug!(index, memory_map_size, "appended shm object");
        self.objects.push(object);
        Ok(&mut self.objects[index])
    }

    pub fn get(&self, index: usize) -> Option<&ShmObject> {
        self.objects.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut ShmObject> {
        self.objects.get_mut(index)
    }

    /// Validates `shm_ref` plus `element_index` elements of `elem_size` bytes
    /// against the table. Returns the object index and the byte offset of the
    /// element.
    fn validate(
        &self,
        shm_ref: &ShmRef,
        element_index: usize,
        elem_size: usize,
        elem_align: usize,
    ) -> Option<(usize, usize)> {
        let (index, offset) = shm_ref.snapshot();
        let index = usize::try_from(index).ok()?;
        let object = self.objects.get(index)?;

        let offset = usize::try_from(offset)
            .ok()?
            .checked_add(element_index.checked_mul(elem_size)?)?;
        // Check if part of the element would exceed the limits.
        if offset.checked_add(elem_size)? > object.memory_map_size() {
            return None;
        }
        if (object.base() as usize).checked_add(offset)? % elem_align != 0 {
            return None;
        }
        Some((index, offset))
    }

    /// Offset-level form of [`load_index`](Self::load_index), for callers
    /// that work with raw byte counts. The returned pointer is valid for
    /// `elem_size` bytes as long as the table lives; a peer may write them at
    /// any time.
    pub fn resolve_offset(
        &self,
        shm_ref: &ShmRef,
        element_index: usize,
        elem_size: usize,
    ) -> Option<NonNull<u8>> {
        let (index, offset) = self.validate(shm_ref, element_index, elem_size, 1)?;
        // Safety: offset + elem_size lies inside the mapping.
        NonNull::new(unsafe { self.objects[index].base().add(offset) })
    }

    fn element_ptr<T>(&self, ptr: &ShmPtr<T>, element_index: usize) -> Option<*mut T> {
        let (index, offset) =
            self.validate(ptr.shm_ref(), element_index, size_of::<T>(), align_of::<T>())?;
        // Safety: the whole element lies inside the mapping of this object,
        // which lives as long as the table, and is suitably aligned.
        Some(unsafe { self.objects[index].base().add(offset) } as *mut T)
    }

    /// Copies the element out of shared memory.
    pub fn load<T: ShmPod + Copy>(&self, ptr: &ShmPtr<T>) -> Option<T> {
        self.load_index(ptr, 0)
    }

    pub fn load_index<T: ShmPod + Copy>(&self, ptr: &ShmPtr<T>, element_index: usize) -> Option<T> {
        let elem = self.element_ptr(ptr, element_index)?;
        // Safety: in bounds and aligned, T is valid for any bit pattern. A
        // volatile read does not assume the bytes stay put meanwhile.
        Some(unsafe { std::ptr::read_volatile(elem) })
    }

    /// Copies `value` into shared memory. Returns `false` when `ptr` does not
    /// resolve.
    pub fn store<T: ShmPod + Copy>(&self, ptr: &ShmPtr<T>, value: T) -> bool {
        self.store_index(ptr, 0, value)
    }

    pub fn store_index<T: ShmPod + Copy>(
        &self,
        ptr: &ShmPtr<T>,
        element_index: usize,
        value: T,
    ) -> bool {
        let Some(elem) = self.element_ptr(ptr, element_index) else {
            return false;
        };
        // Safety: see load_index. The mapping is shared and writable, no
        // Rust reference covers these bytes.
        unsafe { std::ptr::write_volatile(elem, value) };
        true
    }

    /// References an element in place. Only for types whose every access is
    /// atomic: the peer may write the same bytes concurrently. Plain data goes
    /// through [`load`](Self::load) and [`store`](Self::store).
    pub fn resolve<T: ShmShared>(&self, ptr: &ShmPtr<T>) -> Option<&T> {
        self.resolve_index(ptr, 0)
    }

    pub fn resolve_index<T: ShmShared>(
        &self,
        ptr: &ShmPtr<T>,
        element_index: usize,
    ) -> Option<&T> {
        let elem = self.element_ptr(ptr, element_index)?;
        // Safety: in bounds and aligned, and T only allows atomic access.
        Some(unsafe { &*elem })
    }

    fn object_for(&self, shm_ref: &ShmRef) -> Result<&ShmObject, Errno> {
        let (index, _) = shm_ref.snapshot();
        usize::try_from(index)
            .ok()
            .and_then(|index| self.objects.get(index))
            .ok_or(Errno::EPERM)
    }

    pub fn wait_fd(&self, shm_ref: &ShmRef) -> Result<BorrowedFd<'_>, Errno> {
        Ok(self.object_for(shm_ref)?.wait_fd())
    }

    pub fn wakeup_fd(&self, shm_ref: &ShmRef) -> Result<BorrowedFd<'_>, Errno> {
        Ok(self.object_for(shm_ref)?.wakeup_fd())
    }

    pub fn object_data(&self, shm_ref: &ShmRef) -> Result<ShmObjectData<'_>, Errno> {
        let object = self.object_for(shm_ref)?;
        Ok(ShmObjectData {
            shm_fd: object.shm_fd(),
            wait_fd: object.wait_fd(),
            memory_map_size: object.memory_map_size() as u64,
        })
    }

    /// Releases every region. Equivalent to dropping the table.
    pub fn destroy(self) {}
}
