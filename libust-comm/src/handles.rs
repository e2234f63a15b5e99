// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Objects the coordinator refers to by integer handle.

use crate::message::PAYLOAD_LEN;
use nix::errno::Errno;

/// The handle of the object representing a coordinator connection.
pub const ROOT_HANDLE: u32 = 0;

/// What a command did, as seen by the handle table.
pub enum Outcome {
    Value(i32),
    /// The command created an object. The table assigns it a handle, which
    /// becomes the result of the command.
    Created(Box<dyn ObjectOps>),
}

impl std::fmt::Debug for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Outcome::Created(object) => f.debug_tuple("Created").field(&object.name()).finish(),
        }
    }
}

pub trait ObjectOps: Send {
    fn name(&self) -> &'static str;

    /// Executes `cmd`. Unsupported commands fail with `ENOSYS`.
    fn command(&mut self, cmd: u32, payload: &[u8; PAYLOAD_LEN]) -> Result<Outcome, Errno>;

    /// Called when the object leaves the handle table.
    fn release(&mut self) {}
}

/// Handle table of one coordinator connection. Released handles are reused.
#[derive(Default)]
pub struct HandleTable {
    entries: Vec<Option<Box<dyn ObjectOps>>>,
    free: Vec<u32>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, object: Box<dyn ObjectOps>) -> Result<u32, Errno> {
        if let Some(handle) = self.free.pop() {
            self.entries[handle as usize] = Some(object);
            return Ok(handle);
        }
        // handles travel as non-negative i32 in replies
        let handle = i32::try_from(self.entries.len()).map_err(|_| Errno::ENOMEM)? as u32;
        self.entries.push(Some(object));
        Ok(handle)
    }

    /// Creates the root object. It must be the first object of the table.
    pub fn create_root(&mut self, root: Box<dyn ObjectOps>) -> Result<u32, Errno> {
        if !self.entries.is_empty() {
            return Err(Errno::EEXIST);
        }
        self.insert(root)
    }

    pub fn contains(&self, handle: u32) -> bool {
        self.name(handle).is_some()
    }

    pub fn name(&self, handle: u32) -> Option<&'static str> {
        Some(self.entries.get(handle as usize)?.as_ref()?.name())
    }

    /// Runs `cmd` on the object behind `handle`.
    pub fn command(
        &mut self,
        handle: u32,
        cmd: u32,
        payload: &[u8; PAYLOAD_LEN],
    ) -> Result<i32, Errno> {
        let object = self
            .entries
            .get_mut(handle as usize)
            .and_then(Option::as_mut)
            .ok_or(Errno::ENOENT)?;
        match object.command(cmd, payload)? {
            Outcome::Value(value) => Ok(value),
            Outcome::Created(object) => {
                let name = object.name();
                let created = self.insert(object)?;
                tracing::debug!(parent = handle, handle = created, name, "created object");
                Ok(created as i32)
            }
        }
    }

    /// Drops the object behind `handle` and makes the handle available
    /// again.
    pub fn unref(&mut self, handle: u32) -> Result<(), Errno> {
        let mut object = self
            .entries
            .get_mut(handle as usize)
            .and_then(Option::take)
            .ok_or(Errno::EINVAL)?;
        object.release();
        self.free.push(handle);
        Ok(())
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|entry| entry.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Releases every object.
    pub fn clear(&mut self) {
        for mut object in self.entries.drain(..).flatten() {
            object.release();
        }
        self.free.clear();
    }
}

impl Drop for HandleTable {
    fn drop(&mut self) {
        self.clear();
    }
}
