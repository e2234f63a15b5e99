// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::marker::PhantomData;
use std::sync::atomic::{
    AtomicI16, AtomicI32, AtomicI64, AtomicI8, AtomicIsize, AtomicU16, AtomicU32, AtomicU64,
    AtomicU8, AtomicUsize,
};

/// A `(object index, byte offset)` pair pointing into a [`ShmObjectTable`].
///
/// References live in shared memory and may be rewritten at any time by a
/// peer that has write access to the structure holding them. Nothing about
/// their content is trusted: they are only ever turned into addresses by the
/// table lookups such as [`ShmObjectTable::load`], which validate both fields
/// against the table.
///
/// [`ShmObjectTable`]: crate::ShmObjectTable
/// [`ShmObjectTable::load`]: crate::ShmObjectTable::load
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ShmRef {
    pub index: i64,
    pub offset: i64,
}

impl ShmRef {
    /// The reference returned when an allocation does not fit.
    pub const INVALID: ShmRef = ShmRef {
        index: -1,
        offset: -1,
    };

    pub const fn new(index: i64, offset: i64) -> Self {
        ShmRef { index, offset }
    }

    /// Reads both fields exactly once. The peer may be writing them
    /// concurrently, so every check must work on this snapshot.
    #[inline]
    pub(crate) fn snapshot(&self) -> (i64, i64) {
        unsafe {
            (
                std::ptr::read_volatile(&self.index),
                std::ptr::read_volatile(&self.offset),
            )
        }
    }

    pub fn is_invalid(&self) -> bool {
        let (index, offset) = self.snapshot();
        index < 0 || offset < 0
    }
}

/// A [`ShmRef`] tagged with the type of the element it points to.
#[repr(C)]
pub struct ShmPtr<T> {
    shm_ref: ShmRef,
    _type: PhantomData<fn() -> T>,
}

impl<T> ShmPtr<T> {
    pub const fn new(shm_ref: ShmRef) -> Self {
        ShmPtr {
            shm_ref,
            _type: PhantomData,
        }
    }

    pub fn shm_ref(&self) -> &ShmRef {
        &self.shm_ref
    }

    pub fn set(&mut self, src: ShmRef) {
        self.shm_ref = src;
    }
}

impl<T> Clone for ShmPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ShmPtr<T> {}

impl<T> std::fmt::Debug for ShmPtr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ShmPtr").field(&self.shm_ref).finish()
    }
}

/// Types that may be copied in and out of a shared memory object.
///
/// # Safety
///
/// Every bit pattern must be a valid value of the type, and the type must not
/// contain pointers: the bytes come from memory a peer process may write.
pub unsafe trait ShmPod {}

/// Types that may be referenced in place inside a shared memory object while
/// a peer writes the same bytes: every access goes through atomic operations.
///
/// # Safety
///
/// As [`ShmPod`], and all reads and writes through `&Self` must be atomic.
pub unsafe trait ShmShared: ShmPod {}

macro_rules! shm_pod {
    ($($t:ty),* $(,)?) => {
        $(unsafe impl ShmPod for $t {})*
    };
}

macro_rules! shm_shared {
    ($($t:ty),* $(,)?) => {
        $(
            unsafe impl ShmPod for $t {}
            unsafe impl ShmShared for $t {}
        )*
    };
}

shm_pod!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize, ShmRef);

shm_shared!(
    AtomicU8, AtomicU16, AtomicU32, AtomicU64, AtomicUsize,
    AtomicI8, AtomicI16, AtomicI32, AtomicI64, AtomicIsize,
);

unsafe impl<T: ShmPod, const N: usize> ShmPod for [T; N] {}
unsafe impl<T: ShmShared, const N: usize> ShmShared for [T; N] {}
unsafe impl<T: ShmPod> ShmPod for ShmPtr<T> {}
