// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::handles::{ObjectOps, Outcome};
use crate::message::{cmd, PAYLOAD_LEN};
use nix::errno::Errno;
use std::sync::atomic::{fence, Ordering};
use tracing::debug;

pub const TRACER_VERSION_MAJOR: u32 = 2;
pub const TRACER_VERSION_MINOR: u32 = 0;

/// `major << 16 | minor`, as returned by `TRACER_VERSION`.
pub const fn packed_tracer_version() -> i32 {
    ((TRACER_VERSION_MAJOR << 16) | TRACER_VERSION_MINOR) as i32
}

/// Object behind the root handle of a connection.
#[derive(Debug, Default)]
pub struct RootObject;

impl ObjectOps for RootObject {
    fn name(&self) -> &'static str {
        "root"
    }

    fn command(&mut self, cmd: u32, _payload: &[u8; PAYLOAD_LEN]) -> Result<Outcome, Errno> {
        match cmd {
            cmd::SESSION => Ok(Outcome::Created(Box::<SessionObject>::default())),
            cmd::TRACER_VERSION => Ok(Outcome::Value(packed_tracer_version())),
            // listing tracepoints belongs to the ring buffer side
            cmd::TRACEPOINT_LIST => Err(Errno::ENOSYS),
            cmd::WAIT_QUIESCENT => {
                fence(Ordering::SeqCst);
                Ok(Outcome::Value(0))
            }
            _ => Err(Errno::ENOSYS),
        }
    }
}

#[derive(Debug, Default)]
pub struct SessionObject {
    active: bool,
}

impl SessionObject {
    pub fn is_active(&self) -> bool {
        self.active
    }
}

impl ObjectOps for SessionObject {
    fn name(&self) -> &'static str {
        "session"
    }

    fn command(&mut self, cmd: u32, _payload: &[u8; PAYLOAD_LEN]) -> Result<Outcome, Errno> {
        match cmd {
            cmd::ENABLE | cmd::DISABLE => {
                let enable = cmd == cmd::ENABLE;
                if self.active == enable {
                    return Err(Errno::EBUSY);
                }
                self.active = enable;
                debug!(active = enable, "session state changed");
                Ok(Outcome::Value(0))
            }
            _ => Err(Errno::ENOSYS),
        }
    }

    fn release(&mut self) {
        debug!(active = self.active, "session released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: [u8; PAYLOAD_LEN] = [0; PAYLOAD_LEN];

    fn value(outcome: Result<Outcome, Errno>) -> Result<i32, Errno> {
        match outcome? {
            Outcome::Value(value) => Ok(value),
            Outcome::Created(object) => panic!("unexpected object {}", object.name()),
        }
    }

    #[test]
    fn test_root_commands() {
        let mut root = RootObject;
        assert_eq!(Ok(0x0002_0000), value(root.command(cmd::TRACER_VERSION, &PAYLOAD)));
        assert_eq!(Ok(0), value(root.command(cmd::WAIT_QUIESCENT, &PAYLOAD)));
        assert_eq!(Err(Errno::ENOSYS), value(root.command(cmd::TRACEPOINT_LIST, &PAYLOAD)));
        assert_eq!(Err(Errno::ENOSYS), value(root.command(cmd::ENABLE, &PAYLOAD)));
        assert!(matches!(
            root.command(cmd::SESSION, &PAYLOAD),
            Ok(Outcome::Created(session)) if session.name() == "session"
        ));
    }

    #[test]
    fn test_session_enable_disable() {
        let mut session = SessionObject::default();
        assert!(!session.is_active());
        assert_eq!(Err(Errno::EBUSY), value(session.command(cmd::DISABLE, &PAYLOAD)));
        assert_eq!(Ok(0), value(session.command(cmd::ENABLE, &PAYLOAD)));
        assert!(session.is_active());
        assert_eq!(Err(Errno::EBUSY), value(session.command(cmd::ENABLE, &PAYLOAD)));
        assert_eq!(Ok(0), value(session.command(cmd::DISABLE, &PAYLOAD)));
        assert!(!session.is_active());
        assert_eq!(Err(Errno::ENOSYS), value(session.command(cmd::SESSION, &PAYLOAD)));
    }
}
