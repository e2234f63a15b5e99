// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::handles::ROOT_HANDLE;
use crate::message::{cmd, CommandMessage, ReplyMessage};
use crate::setup::Scope;
use crate::state::RuntimeState;
use nix::errno::Errno;

/// Executes one coordinator command received by the agent of `scope` and
/// builds its reply. Must be called with the lifecycle lock held.
pub(crate) fn handle_command(
    state: &mut RuntimeState,
    scope: Scope,
    msg: &CommandMessage,
) -> ReplyMessage {
    let ret_val = match execute(state, scope, msg) {
        Ok(value) => value,
        Err(errno) => -(errno as i32),
    };
    ReplyMessage::for_request(msg, ret_val)
}

fn execute(state: &mut RuntimeState, scope: Scope, msg: &CommandMessage) -> Result<i32, Errno> {
    if state.should_quit {
        return Err(Errno::EPERM);
    }
    let handles = &mut state.scope_mut(scope).handles;
    if !handles.contains(msg.handle) {
        return Err(Errno::ENOENT);
    }
    match msg.cmd {
        cmd::REGISTER_DONE => {
            if msg.handle != ROOT_HANDLE {
                return Err(Errno::EINVAL);
            }
            state.settle_registration(scope);
            Ok(0)
        }
        cmd::RELEASE => {
            // the root handle lives as long as the agent
            if msg.handle == ROOT_HANDLE {
                return Err(Errno::EPERM);
            }
            handles.unref(msg.handle).map(|()| 0)
        }
        cmd => handles.command(msg.handle, cmd, &msg.payload),
    }
}
