// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::ChannelError;
use nix::errno::Errno;
use nix::sys::socket::{recv, send, MsgFlags};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;

/// Reads one fixed-size message into `buf`.
///
/// Returns [`ChannelError::Closed`] on an orderly shutdown before any byte
/// was read, and [`ChannelError::ShortMessage`] if the peer went away in the
/// middle of a message.
pub fn recv_message(socket: &UnixStream, buf: &mut [u8]) -> Result<(), ChannelError> {
    let mut received = 0;
    while received < buf.len() {
        match recv(socket.as_raw_fd(), &mut buf[received..], MsgFlags::empty()) {
            Ok(0) => break,
            Ok(n) => received += n,
            Err(Errno::EINTR) => continue,
            Err(Errno::ECONNRESET) => return Err(ChannelError::Closed),
            Err(e) => return Err(ChannelError::Io(e.into())),
        }
    }
    match received {
        0 => Err(ChannelError::Closed),
        n if n == buf.len() => Ok(()),
        n => Err(ChannelError::ShortMessage {
            expected: buf.len(),
            received: n,
        }),
    }
}

/// Writes the whole of `buf`. Never raises `SIGPIPE`: a peer that went away
/// is reported as [`ChannelError::Closed`].
pub fn send_message(socket: &UnixStream, buf: &[u8]) -> Result<(), ChannelError> {
    let mut sent = 0;
    while sent < buf.len() {
        match send(socket.as_raw_fd(), &buf[sent..], MsgFlags::MSG_NOSIGNAL) {
            Ok(0) => {
                return Err(ChannelError::ShortMessage {
                    expected: buf.len(),
                    received: sent,
                })
            }
            Ok(n) => sent += n,
            Err(Errno::EINTR) => continue,
            Err(Errno::EPIPE | Errno::ECONNRESET) => return Err(ChannelError::Closed),
            Err(e) => return Err(ChannelError::Io(e.into())),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::Shutdown;

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_message_round_trip() {
        let (a, b) = UnixStream::pair().unwrap();
        send_message(&a, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        let mut buf = [0; 8];
        recv_message(&b, &mut buf).unwrap();
        assert_eq!([1, 2, 3, 4, 5, 6, 7, 8], buf);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_message_split_across_writes() {
        let (mut a, b) = UnixStream::pair().unwrap();
        let reader = std::thread::spawn(move || {
            let mut buf = [0; 6];
            recv_message(&b, &mut buf).map(|()| buf)
        });
        a.write_all(&[1, 2, 3]).unwrap();
        a.flush().unwrap();
        a.write_all(&[4, 5, 6]).unwrap();
        assert_eq!([1, 2, 3, 4, 5, 6], reader.join().unwrap().unwrap());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_orderly_shutdown_and_short_message() {
        let (a, b) = UnixStream::pair().unwrap();
        send_message(&a, &[1, 2]).unwrap();
        a.shutdown(Shutdown::Write).unwrap();

        let mut buf = [0; 8];
        assert!(matches!(
            recv_message(&b, &mut buf),
            Err(ChannelError::ShortMessage {
                expected: 8,
                received: 2
            })
        ));
        assert!(matches!(
            recv_message(&b, &mut buf),
            Err(ChannelError::Closed)
        ));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_send_to_closed_peer() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(b);
        assert!(matches!(
            send_message(&a, &[0; 16]),
            Err(ChannelError::Closed)
        ));
    }
}
