// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use libc::off_t;
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use std::ffi::{c_void, CStr, CString};
use std::fs::File;
use std::io;
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::ptr::NonNull;

/// An anonymous, file-backed shared memory object of a fixed size.
#[derive(Debug)]
pub struct ShmHandle {
    handle: OwnedFd,
    size: usize,
}

/// A shared memory object with a name in the `shm_open` namespace.
///
/// Unlike anonymous objects, the name is never unlinked on drop: named objects
/// are owned by the coordinator, we only ever open or create them.
#[derive(Debug)]
pub struct NamedShmHandle {
    inner: ShmHandle,
    path: CString,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MapAccess {
    ReadOnly,
    ReadWrite,
}

impl MapAccess {
    fn prot(self) -> ProtFlags {
        match self {
            MapAccess::ReadOnly => ProtFlags::PROT_READ,
            MapAccess::ReadWrite => ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
        }
    }
}

pub struct MappedMem<T>
where
    T: MemoryHandle,
{
    ptr: NonNull<c_void>,
    access: MapAccess,
    mem: T,
}

pub fn page_aligned_size(size: usize) -> usize {
    let page_size = page_size::get();
    // round up to nearest page
    ((size.max(1) - 1) & !(page_size - 1)) + page_size
}

pub trait MemoryHandle {
    fn get_size(&self) -> usize;
    fn get_fd(&self) -> BorrowedFd<'_>;

    fn map(self, access: MapAccess) -> io::Result<MappedMem<Self>>
    where
        Self: Sized,
    {
        let size = NonZeroUsize::new(self.get_size())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "cannot map size zero"))?;
        let ptr = unsafe {
            mmap(
                None,
                size,
                access.prot(),
                MapFlags::MAP_SHARED,
                self.get_fd(),
                0,
            )?
        };
        Ok(MappedMem {
            ptr,
            access,
            mem: self,
        })
    }
}

impl MemoryHandle for ShmHandle {
    fn get_size(&self) -> usize {
        self.size
    }

    fn get_fd(&self) -> BorrowedFd<'_> {
        self.handle.as_fd()
    }
}

impl MemoryHandle for NamedShmHandle {
    fn get_size(&self) -> usize {
        self.inner.size
    }

    fn get_fd(&self) -> BorrowedFd<'_> {
        self.inner.handle.as_fd()
    }
}

impl ShmHandle {
    #[cfg(target_os = "linux")]
    fn open_anon_shm() -> io::Result<OwnedFd> {
        let memfd = memfd::MemfdOptions::default()
            .close_on_exec(true)
            .create("ust-shm-object")
            .map_err(|e| match e {
                memfd::Error::Create(err) => err,
                other => io::Error::other(other),
            })?;
        Ok(memfd.into_file().into())
    }

    #[cfg(not(target_os = "linux"))]
    fn open_anon_shm() -> io::Result<OwnedFd> {
        let path = format!("/ust-shm-anon-{}", std::process::id());
        let result = shm_open(
            path.as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        );
        _ = shm_unlink(path.as_str());
        Ok(result?)
    }

    /// Creates an anonymous object of exactly `size` bytes. The contents are
    /// zero-filled by the kernel.
    pub fn new(size: usize) -> io::Result<ShmHandle> {
        let handle = Self::open_anon_shm()?;
        ftruncate(&handle, size as off_t)?;
        Ok(ShmHandle { handle, size })
    }
}

impl NamedShmHandle {
    /// Opens an existing object read-only. The size is taken from the object
    /// itself, never from the caller.
    pub fn open_read_only(path: &CStr) -> io::Result<NamedShmHandle> {
        let fd = shm_open(path, OFlag::O_RDONLY, Mode::empty())?;
        Self::from_fd(fd, path)
    }

    pub fn open_read_write(path: &CStr) -> io::Result<NamedShmHandle> {
        let fd = shm_open(path, OFlag::O_RDWR, Mode::empty())?;
        Self::from_fd(fd, path)
    }

    /// Exclusively creates the object with exactly `mode` as permissions,
    /// regardless of the process umask, and sizes it to `size` bytes.
    pub fn create_exclusive(path: &CStr, mode: u32, size: usize) -> io::Result<NamedShmHandle> {
        let fd = shm_open(
            path,
            OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_EXCL,
            Mode::from_bits_truncate(mode as _),
        )?;
        let file = File::from(fd);
        file.set_permissions(std::fs::Permissions::from_mode(mode))?;
        ftruncate(&file, size as off_t)?;
        Self::from_fd(file.into(), path)
    }

    pub fn unlink(path: &CStr) -> io::Result<()> {
        Ok(shm_unlink(path)?)
    }

    fn from_fd(fd: OwnedFd, path: &CStr) -> io::Result<NamedShmHandle> {
        let file = File::from(fd);
        let size = file.metadata()?.size() as usize;
        Ok(NamedShmHandle {
            inner: ShmHandle {
                handle: file.into(),
                size,
            },
            path: path.to_owned(),
        })
    }

    pub fn get_path(&self) -> &CStr {
        &self.path
    }

    /// Owner uid of the underlying object.
    pub fn owner_uid(&self) -> io::Result<u32> {
        let file = File::from(self.inner.handle.try_clone()?);
        Ok(file.metadata()?.uid())
    }
}

impl<T: MemoryHandle> MappedMem<T> {
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr() as *mut u8
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.as_ptr() as *const u8, self.mem.get_size()) }
    }

    pub fn get_size(&self) -> usize {
        self.mem.get_size()
    }

    pub fn access(&self) -> MapAccess {
        self.access
    }

    pub fn handle(&self) -> &T {
        &self.mem
    }
}

impl<T> Drop for MappedMem<T>
where
    T: MemoryHandle,
{
    fn drop(&mut self) {
        unsafe {
            _ = munmap(self.ptr, self.mem.get_size());
        }
    }
}

unsafe impl<T> Sync for MappedMem<T> where T: MemoryHandle + Sync {}
unsafe impl<T> Send for MappedMem<T> where T: MemoryHandle + Send {}
