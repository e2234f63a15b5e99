// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A coordinator playing the other end of the protocol in tests.

#![allow(dead_code)]

use libust_comm::message::{CommandMessage, RegistrationMessage, ReplyMessage};
use libust_comm::{Config, RegisterTimeout, ScopePaths};
use libust_shm::{NamedShmHandle, WaitChannel};
use std::ffi::CString;
use nix::errno::Errno;
use nix::sys::socket::{connect, socket, AddressFamily, SockFlag, SockType, UnixAddr};
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub struct MockCoordinator {
    pub paths: ScopePaths,
    listener: Option<UnixListener>,
    _dir: TempDir,
}

impl MockCoordinator {
    /// Starts listening. `name` keeps the wait page of concurrent tests apart.
    pub fn start(name: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let paths = ScopePaths {
            socket_path: dir.path().join("apps-lttng-sessiond"),
            wait_shm_path: CString::new(format!(
                "/ust-comm-test-{name}-{}",
                std::process::id()
            ))
            .unwrap(),
        };
        _ = NamedShmHandle::unlink(&paths.wait_shm_path);
        let mut coordinator = MockCoordinator {
            paths,
            listener: None,
            _dir: dir,
        };
        coordinator.listen();
        coordinator
    }

    /// Paths of a coordinator that is not running.
    pub fn absent(name: &str) -> Self {
        let mut coordinator = Self::start(name);
        coordinator.stop();
        coordinator
    }

    pub fn listen(&mut self) {
        let listener = UnixListener::bind(&self.paths.socket_path).unwrap();
        listener.set_nonblocking(true).unwrap();
        self.listener = Some(listener);
    }

    pub fn stop(&mut self) {
        self.listener = None;
        _ = std::fs::remove_file(&self.paths.socket_path);
    }

    /// Runtime config with only the system scope, pointed at this coordinator.
    pub fn config(&self) -> Config {
        Config {
            register_timeout: RegisterTimeout::NoWait,
            system: Some(self.paths.clone()),
            user: None,
            wait_fallback_interval: Duration::from_millis(50),
            ..Default::default()
        }
    }

    pub fn try_accept(&self, timeout: Duration) -> Option<Session> {
        let listener = self.listener.as_ref()?;
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            match listener.accept() {
                Ok((stream, _)) => return Some(Session::new(stream)),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(5))
                }
                Err(e) => panic!("accept failed: {e}"),
            }
        }
        None
    }

    /// Queues connections nobody accepts until the listen backlog is full.
    /// Connecting blocks for as long as they stay open. `None` when the
    /// descriptor limit is reached first.
    pub fn fill_backlog(&self) -> Option<Vec<OwnedFd>> {
        let addr = UnixAddr::new(&self.paths.socket_path).unwrap();
        let mut queued = Vec::new();
        loop {
            let fd = match socket(
                AddressFamily::Unix,
                SockType::Stream,
                SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
                None,
            ) {
                Ok(fd) => fd,
                Err(Errno::EMFILE | Errno::ENFILE) => return None,
                Err(e) => panic!("socket failed: {e}"),
            };
            match connect(fd.as_raw_fd(), &addr) {
                Ok(()) => queued.push(fd),
                Err(Errno::EAGAIN) => return Some(queued),
                Err(e) => panic!("connect failed: {e}"),
            }
        }
    }

    pub fn accept(&self) -> Session {
        self.try_accept(TIMEOUT)
            .expect("the traced process did not connect")
    }

    /// Announces the coordinator on the wait page until the traced process
    /// connects.
    pub fn notify_and_accept(&self) -> Session {
        let deadline = Instant::now() + TIMEOUT;
        while Instant::now() < deadline {
            // the page only exists once the traced process waited on it
            _ = WaitChannel::notify(&self.paths.wait_shm_path);
            if let Some(session) = self.try_accept(Duration::from_millis(50)) {
                return session;
            }
        }
        panic!("the traced process did not reconnect");
    }
}

impl Drop for MockCoordinator {
    fn drop(&mut self) {
        _ = NamedShmHandle::unlink(&self.paths.wait_shm_path);
    }
}

/// One accepted connection, past the registration message.
pub struct Session {
    stream: UnixStream,
    pub registration: RegistrationMessage,
}

impl Session {
    fn new(mut stream: UnixStream) -> Self {
        stream.set_nonblocking(false).unwrap();
        stream.set_read_timeout(Some(TIMEOUT)).unwrap();
        let mut buf = [0; RegistrationMessage::SIZE];
        stream.read_exact(&mut buf).unwrap();
        let registration = RegistrationMessage::decode(&buf).unwrap();
        Session {
            stream,
            registration,
        }
    }

    pub fn send(&mut self, msg: &CommandMessage) -> ReplyMessage {
        self.stream.write_all(&msg.encode()).unwrap();
        let mut buf = [0; ReplyMessage::SIZE];
        self.stream.read_exact(&mut buf).unwrap();
        ReplyMessage::decode(&buf).unwrap()
    }

    /// Sends `cmd` to `handle`, returns `(ret_code, ret_val)`.
    pub fn command(&mut self, handle: u32, cmd: u32) -> (u32, i32) {
        let reply = self.send(&CommandMessage::new(handle, cmd));
        assert_eq!((handle, cmd), (reply.handle, reply.cmd));
        (reply.ret_code, reply.ret_val)
    }

    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
    }

    /// Waits for the traced process to close the connection.
    pub fn assert_closed(&mut self) {
        let mut buf = [0; 1];
        assert_eq!(0, self.stream.read(&mut buf).unwrap());
    }
}

/// Polls `f` until it holds or the test timeout expires.
pub fn eventually(mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}
