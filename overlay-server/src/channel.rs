// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The private per-client duplex channel: a `SOCK_SEQPACKET` socket carrying
//! length-prefixed protobuf messages, with file descriptors riding as
//! `SCM_RIGHTS` ancillary data on the same `sendmsg`/`recvmsg` call. This is
//! the concrete transport behind the bus-name/object-path addressing scheme
//! described for the fabric; see [`crate::container::ipc`] for the sibling
//! eventfd-based barrier used during the initial handshake.

use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd, RawFd};

use anyhow::Context;
use hudbus_protocol::{self as protocol, MessageType};

/// Maximum number of out-of-band FDs any single message carries (`Dmabuf`
/// carries the most, at 2).
const MAX_FDS: usize = 2;

pub struct SessionChannel {
    conn: uds::UnixSeqpacketConn,
    scratch: [u8; protocol::MAX_MESSAGE_SIZE],
}

impl SessionChannel {
    pub fn new(conn: uds::UnixSeqpacketConn) -> Self {
        Self {
            conn,
            scratch: [0; protocol::MAX_MESSAGE_SIZE],
        }
    }

    pub fn pair() -> std::io::Result<(Self, Self)> {
        let (a, b) = uds::UnixSeqpacketConn::pair()?;
        Ok((Self::new(a), Self::new(b)))
    }

    /// Sends a message, along with exactly as many FDs as
    /// [`protocol::expected_fd_count`] requires for its type.
    pub fn send(&mut self, msg: &MessageType, fds: &[OwnedFd]) -> anyhow::Result<()> {
        let expected = protocol::expected_fd_count(msg);
        anyhow::ensure!(
            fds.len() == expected,
            "message {} requires {} fds, got {}",
            msg,
            expected,
            fds.len()
        );

        let len = protocol::encode_message(msg, &mut self.scratch)
            .context(format!("failed to encode {}", msg))?;

        let raw_fds: Vec<RawFd> = fds.iter().map(|fd| fd.as_fd_raw()).collect();
        self.conn
            .send_fds(&self.scratch[..len], &raw_fds)
            .context("sending message")?;

        Ok(())
    }

    /// Receives the next message, along with whatever FDs accompanied it. The
    /// returned vec always has length [`protocol::expected_fd_count`] for the
    /// decoded message's type; a mismatch is a protocol error.
    pub fn recv(&mut self) -> anyhow::Result<(MessageType, Vec<OwnedFd>)> {
        let mut fd_buf = [-1_i32; MAX_FDS];
        let mut data_buf = [0u8; protocol::MAX_MESSAGE_SIZE];

        let (data_len, truncated, fd_count) = self
            .conn
            .recv_fds(&mut data_buf, &mut fd_buf)
            .context("receiving message")?;
        anyhow::ensure!(!truncated, "message truncated");

        let (msg, _) =
            protocol::decode_message(&data_buf[..data_len]).context("decoding message")?;

        let expected = protocol::expected_fd_count(&msg);
        anyhow::ensure!(
            fd_count == expected,
            "message {} arrived with {} fds, expected {}",
            msg,
            fd_count,
            expected
        );

        let fds = fd_buf[..fd_count]
            .iter()
            .map(|&raw| unsafe { OwnedFd::from_raw_fd(raw) })
            .collect();

        Ok((msg, fds))
    }
}

trait AsFdRaw {
    fn as_fd_raw(&self) -> RawFd;
}

impl AsFdRaw for OwnedFd {
    fn as_fd_raw(&self) -> RawFd {
        use std::os::fd::AsRawFd;
        self.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hudbus_protocol::{Dmabuf, Handshake};
    use std::os::fd::AsRawFd;

    fn dummy_fd() -> OwnedFd {
        rustix::event::eventfd(0, rustix::event::EventfdFlags::NONBLOCK).unwrap()
    }

    #[test]
    fn roundtrip_message_without_fds() {
        let (mut a, mut b) = SessionChannel::pair().unwrap();

        let msg: MessageType = Handshake {
            engine_name: "quake".into(),
            render_minor: 128,
        }
        .into();

        a.send(&msg, &[]).unwrap();
        let (received, fds) = b.recv().unwrap();

        assert_eq!(received, msg);
        assert!(fds.is_empty());
    }

    #[test]
    fn roundtrip_message_with_fds() {
        let (mut a, mut b) = SessionChannel::pair().unwrap();

        let msg: MessageType = Dmabuf {
            modifier: 0,
            dmabuf_offset: 0,
            stride: 4096,
            fourcc: 0x34325241,
            plane_size: 4096 * 1080,
            width: 1920,
            height: 1080,
            server_render_minor: 128,
            has_gbm: true,
            opaque_size: 4096 * 1080,
            opaque_offset: 0,
        }
        .into();

        let gbm_fd = dummy_fd();
        let opaque_fd = dummy_fd();
        let gbm_raw = gbm_fd.as_raw_fd();
        let opaque_raw = opaque_fd.as_raw_fd();

        a.send(&msg, &[gbm_fd, opaque_fd]).unwrap();
        let (received, fds) = b.recv().unwrap();

        assert_eq!(received, msg);
        assert_eq!(fds.len(), 2);
        assert_eq!(fds[0].as_raw_fd(), gbm_raw);
        assert_eq!(fds[1].as_raw_fd(), opaque_raw);
    }

    #[test]
    fn sending_wrong_fd_count_is_rejected() {
        let (mut a, _b) = SessionChannel::pair().unwrap();

        let msg: MessageType = Handshake {
            engine_name: "quake".into(),
            render_minor: 128,
        }
        .into();

        let err = a.send(&msg, &[dummy_fd()]).unwrap_err();
        assert!(err.to_string().contains("requires 0 fds"));
    }
}
