// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Connection agent: one listener thread per scope that keeps the process
//! registered with its coordinator and serves the coordinator's commands.

use crate::channel::{recv_message, send_message};
use crate::dispatch;
use crate::error::ChannelError;
use crate::lifecycle::Lifecycle;
use crate::message::{CommandMessage, RegistrationMessage};
use crate::setup::Scope;
use crate::state::RuntimeState;
use libust_shm::WaitChannel;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, MutexGuard};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

pub(crate) fn spawn(
    lifecycle: Arc<Lifecycle>,
    scope: Scope,
    generation: u64,
) -> io::Result<JoinHandle<()>> {
    let agent = Agent {
        lifecycle,
        scope,
        generation,
    };
    thread::Builder::new()
        .name(format!("ust-listener-{scope}"))
        .spawn(move || agent.run())
}

struct Agent {
    lifecycle: Arc<Lifecycle>,
    scope: Scope,
    generation: u64,
}

enum Connect {
    Connected(Arc<UnixStream>),
    Failed,
    Stale,
}

impl Agent {
    fn run(self) {
        debug!(scope = %self.scope, generation = self.generation, "listener started");
        loop {
            match self.connect() {
                Connect::Connected(socket) => {
                    if !self.serve(&socket) {
                        break;
                    }
                }
                Connect::Failed => self.wait_for_coordinator(),
                Connect::Stale => break,
            }
        }
        debug!(scope = %self.scope, generation = self.generation, "listener exiting");
    }

    /// Returns `None` once this listener has been superseded.
    fn lock_current(&self) -> Option<MutexGuard<'_, RuntimeState>> {
        let state = self.lifecycle.lock();
        state.is_current(self.generation).then_some(state)
    }

    /// Connects and registers. The lock is only taken around state updates:
    /// connecting blocks for as long as the coordinator's backlog is full.
    fn connect(&self) -> Connect {
        let scope = self.scope;
        let paths = {
            let Some(mut state) = self.lock_current() else {
                return Connect::Stale;
            };
            let scope_state = state.scope_mut(scope);
            if let Some(old) = scope_state.socket.take() {
                debug!(%scope, fd = old.as_raw_fd(), "dropping previous connection");
            }
            match &scope_state.paths {
                Some(paths) => paths.clone(),
                None => {
                    state.settle_registration(scope);
                    return Connect::Stale;
                }
            }
        };

        let socket = match UnixStream::connect(&paths.socket_path) {
            Ok(socket) => socket,
            Err(e) => {
                debug!(%scope, path = ?paths.socket_path, "coordinator unavailable: {e}");
                return self.connect_failed();
            }
        };
        let registered = RegistrationMessage::for_current_process()
            .map_err(ChannelError::from)
            .and_then(|msg| send_message(&socket, &msg.encode()));
        if let Err(e) = registered {
            warn!(%scope, "error sending registration: {e}");
            return self.connect_failed();
        }

        // exit or fork may have happened meanwhile
        let Some(mut state) = self.lock_current() else {
            debug!(%scope, "runtime changed while connecting, dropping connection");
            return Connect::Stale;
        };
        let socket = Arc::new(socket);
        let scope_state = state.scope_mut(scope);
        scope_state.socket = Some(socket.clone());
        scope_state.ensure_root_handle();
        info!(%scope, fd = socket.as_raw_fd(), "registered with coordinator");
        Connect::Connected(socket)
    }

    /// The coordinator cannot be reached: the initial registration will not
    /// happen for now.
    fn connect_failed(&self) -> Connect {
        match self.lock_current() {
            Some(mut state) => {
                state.settle_registration(self.scope);
                Connect::Failed
            }
            None => Connect::Stale,
        }
    }

    /// Serves commands until the connection ends. Returns `false` when this
    /// listener must exit.
    fn serve(&self, socket: &UnixStream) -> bool {
        let scope = self.scope;
        let mut buf = [0; CommandMessage::SIZE];
        loop {
            match recv_message(socket, &mut buf) {
                Ok(()) => {}
                Err(ChannelError::ShortMessage { expected, received }) => {
                    warn!(%scope, expected, received, "ignoring truncated command");
                    continue;
                }
                Err(ChannelError::Closed) => {
                    debug!(%scope, "coordinator closed the connection");
                    return true;
                }
                Err(ChannelError::Io(e)) => {
                    warn!(%scope, "error receiving command: {e}");
                    return true;
                }
            }
            let msg = match CommandMessage::decode(&buf) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(%scope, "error decoding command: {e}");
                    continue;
                }
            };

            // A command read before exit still gets its -EPERM answer.
            let (reply, quitting) = {
                let mut state = self.lifecycle.lock();
                if state.generation != self.generation {
                    return false;
                }
                let reply = dispatch::handle_command(&mut state, scope, &msg);
                (reply, state.should_quit)
            };
            debug!(
                %scope,
                handle = msg.handle,
                cmd = msg.cmd,
                ret_code = reply.ret_code,
                ret_val = reply.ret_val,
                "command executed"
            );
            match send_message(socket, &reply.encode()) {
                Ok(()) => {}
                Err(ChannelError::Closed) => {
                    debug!(%scope, "coordinator went away before the reply");
                    return !quitting;
                }
                Err(e) => {
                    warn!(%scope, "error sending reply: {e}");
                    return !quitting;
                }
            }
            if quitting {
                return false;
            }
        }
    }

    /// Sleeps until the coordinator announces itself on the wait page, or
    /// the fallback interval elapsed.
    fn wait_for_coordinator(&self) {
        let channel = {
            let Some(mut state) = self.lock_current() else {
                return;
            };
            let interval = self.lifecycle.config().wait_fallback_interval;
            let scope_state = state.scope_mut(self.scope);
            if let Some(channel) = &scope_state.wait_channel {
                channel.clone()
            } else {
                let Some(paths) = &scope_state.paths else {
                    return;
                };
                let channel = Arc::new(WaitChannel::open(
                    &paths.wait_shm_path,
                    self.scope.wait_scope(),
                    interval,
                ));
                debug!(
                    scope = %self.scope,
                    blocking = channel.is_blocking(),
                    "wait channel ready"
                );
                scope_state.wait_channel = Some(channel.clone());
                channel
            }
        };
        channel.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, RegisterTimeout};
    use crate::handles::ROOT_HANDLE;
    use crate::message::{cmd, ReplyMessage, RET_SESSION_FAIL};
    use std::io::{Read, Write};

    fn agent() -> Agent {
        let lifecycle = Lifecycle::start(Config {
            register_timeout: RegisterTimeout::NoWait,
            system: None,
            user: None,
            ..Default::default()
        });
        Agent {
            lifecycle,
            scope: Scope::System,
            generation: 0,
        }
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_command_during_exit_is_refused() {
        let agent = agent();
        let (local, mut remote) = UnixStream::pair().unwrap();
        agent.lifecycle.lock().should_quit = true;
        let server = thread::spawn(move || agent.serve(&local));

        let msg = CommandMessage::new(ROOT_HANDLE, cmd::TRACER_VERSION);
        remote.write_all(&msg.encode()).unwrap();
        let mut buf = [0; ReplyMessage::SIZE];
        remote.read_exact(&mut buf).unwrap();
        let reply = ReplyMessage::decode(&buf).unwrap();
        assert_eq!(
            (RET_SESSION_FAIL, -libc::EPERM),
            (reply.ret_code, reply.ret_val)
        );
        assert!(!server.join().unwrap());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_superseded_listener_stops_serving() {
        let agent = agent();
        let (local, mut remote) = UnixStream::pair().unwrap();
        agent.lifecycle.lock().generation += 1;
        let server = thread::spawn(move || agent.serve(&local));

        let msg = CommandMessage::new(ROOT_HANDLE, cmd::TRACER_VERSION);
        remote.write_all(&msg.encode()).unwrap();
        assert!(!server.join().unwrap());
        // dropped without a reply
        let mut buf = [0; 1];
        assert_eq!(0, remote.read(&mut buf).unwrap());
    }
}
