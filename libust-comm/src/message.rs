// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fixed-size messages exchanged with the coordinator.
//!
//! All integers are in native byte order and there is no length prefix: both
//! ends know the size of every message from its type.

use byteorder::{NativeEndian, ReadBytesExt};
use std::io::{self, Read};

pub const COMM_VERSION_MAJOR: u32 = 0;
pub const COMM_VERSION_MINOR: u32 = 1;

/// Length of the process name field of the registration message.
pub const NAME_LEN: usize = 16;
pub const PAYLOAD_LEN: usize = 32;

pub const RET_OK: u32 = 10;
pub const RET_SESSION_FAIL: u32 = 13;

pub mod cmd {
    pub const RELEASE: u32 = 0xffff_ffff;

    // root handle
    pub const SESSION: u32 = 0x40;
    pub const TRACER_VERSION: u32 = 0x41;
    pub const TRACEPOINT_LIST: u32 = 0x42;
    pub const WAIT_QUIESCENT: u32 = 0x43;
    pub const REGISTER_DONE: u32 = 0x44;

    // session, channel and event handles
    pub const ENABLE: u32 = 0x80;
    pub const DISABLE: u32 = 0x81;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationMessage {
    pub major: u32,
    pub minor: u32,
    pub pid: i32,
    pub ppid: i32,
    pub uid: u32,
    pub gid: u32,
    pub name: [u8; NAME_LEN],
}

impl RegistrationMessage {
    pub const SIZE: usize = 24 + NAME_LEN;

    /// Describes the calling process.
    pub fn for_current_process() -> io::Result<Self> {
        Ok(RegistrationMessage {
            major: COMM_VERSION_MAJOR,
            minor: COMM_VERSION_MINOR,
            pid: nix::unistd::getpid().as_raw(),
            ppid: nix::unistd::getppid().as_raw(),
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            name: process_name()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.extend_from_slice(&self.major.to_ne_bytes());
        buf.extend_from_slice(&self.minor.to_ne_bytes());
        buf.extend_from_slice(&self.pid.to_ne_bytes());
        buf.extend_from_slice(&self.ppid.to_ne_bytes());
        buf.extend_from_slice(&self.uid.to_ne_bytes());
        buf.extend_from_slice(&self.gid.to_ne_bytes());
        buf.extend_from_slice(&self.name);
        buf
    }

    pub fn decode(mut buf: &[u8]) -> io::Result<Self> {
        let major = buf.read_u32::<NativeEndian>()?;
        let minor = buf.read_u32::<NativeEndian>()?;
        let pid = buf.read_i32::<NativeEndian>()?;
        let ppid = buf.read_i32::<NativeEndian>()?;
        let uid = buf.read_u32::<NativeEndian>()?;
        let gid = buf.read_u32::<NativeEndian>()?;
        let mut name = [0; NAME_LEN];
        buf.read_exact(&mut name)?;
        Ok(RegistrationMessage {
            major,
            minor,
            pid,
            ppid,
            uid,
            gid,
            name,
        })
    }

    /// The process name up to the first NUL.
    pub fn name(&self) -> &[u8] {
        let len = self.name.iter().position(|b| *b == 0).unwrap_or(NAME_LEN);
        &self.name[..len]
    }
}

#[cfg(target_os = "linux")]
fn process_name() -> io::Result<[u8; NAME_LEN]> {
    let name = nix::sys::prctl::get_name()?;
    Ok(truncated_name(name.as_bytes()))
}

#[cfg(not(target_os = "linux"))]
fn process_name() -> io::Result<[u8; NAME_LEN]> {
    let exe = std::env::current_exe()?;
    let name = exe.file_name().unwrap_or_default();
    Ok(truncated_name(name.as_encoded_bytes()))
}

/// Copies at most `NAME_LEN - 1` bytes, leaving the field NUL terminated.
fn truncated_name(src: &[u8]) -> [u8; NAME_LEN] {
    let mut name = [0; NAME_LEN];
    let len = src.len().min(NAME_LEN - 1);
    name[..len].copy_from_slice(&src[..len]);
    name
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CommandMessage {
    pub handle: u32,
    pub cmd: u32,
    pub payload: [u8; PAYLOAD_LEN],
}

impl CommandMessage {
    pub const SIZE: usize = 8 + PAYLOAD_LEN;

    pub fn new(handle: u32, cmd: u32) -> Self {
        CommandMessage {
            handle,
            cmd,
            payload: [0; PAYLOAD_LEN],
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.extend_from_slice(&self.handle.to_ne_bytes());
        buf.extend_from_slice(&self.cmd.to_ne_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn decode(mut buf: &[u8]) -> io::Result<Self> {
        let handle = buf.read_u32::<NativeEndian>()?;
        let cmd = buf.read_u32::<NativeEndian>()?;
        let mut payload = [0; PAYLOAD_LEN];
        buf.read_exact(&mut payload)?;
        Ok(CommandMessage {
            handle,
            cmd,
            payload,
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ReplyMessage {
    pub handle: u32,
    pub cmd: u32,
    pub ret_code: u32,
    pub ret_val: i32,
}

impl ReplyMessage {
    pub const SIZE: usize = 16;

    /// Builds the reply to `request`. Negative results are errno values and
    /// mark the reply as failed.
    pub fn for_request(request: &CommandMessage, ret_val: i32) -> Self {
        ReplyMessage {
            handle: request.handle,
            cmd: request.cmd,
            ret_code: if ret_val >= 0 {
                RET_OK
            } else {
                RET_SESSION_FAIL
            },
            ret_val,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.extend_from_slice(&self.handle.to_ne_bytes());
        buf.extend_from_slice(&self.cmd.to_ne_bytes());
        buf.extend_from_slice(&self.ret_code.to_ne_bytes());
        buf.extend_from_slice(&self.ret_val.to_ne_bytes());
        buf
    }

    pub fn decode(mut buf: &[u8]) -> io::Result<Self> {
        Ok(ReplyMessage {
            handle: buf.read_u32::<NativeEndian>()?,
            cmd: buf.read_u32::<NativeEndian>()?,
            ret_code: buf.read_u32::<NativeEndian>()?,
            ret_val: buf.read_i32::<NativeEndian>()?,
        })
    }
}
