// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The fabric: a `SOCK_SEQPACKET` listener, one [`crate::session::Session`]
//! worker thread per accepted connection, and a `mio::Waker`-driven control
//! path for clean shutdown. Unlike the QUIC-based protocol this was
//! generalized from, there's no per-message framing or multiplexing to do
//! here on the accept thread itself; each session's duplex channel is handed
//! off wholesale to its own worker, so this module's only job is accepting,
//! bookkeeping, and periodic reaping.

use std::{
    os::fd::{AsRawFd, BorrowedFd, RawFd},
    path::Path,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use crossbeam_channel::Receiver;
use mio::{unix::SourceFd, Events, Interest, Poll, Token};
use tracing::{error, info, warn};

use crate::{channel::SessionChannel, session::Session, state::SharedState, waking_sender::WakingSender};

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);

/// The reaper's forced wakeup cadence: `poll.poll`'s timeout, so a dead or
/// idle session is noticed even with no socket traffic to wake the loop. At
/// ~10 Hz, a session that dies right after a tick is still reaped well within
/// the two-tick worst case.
const TICK_INTERVAL: Duration = Duration::from_millis(100);

pub struct Server {
    listener: uds::UnixSeqpacketListener,
    poll: Poll,
    state: SharedState,
    close_recv: Receiver<()>,
    close_send: WakingSender<()>,
    shutting_down: bool,
}

impl Server {
    /// Binds the duplex socket at `path`. The caller is responsible for
    /// removing a stale socket file beforehand; `bind` itself doesn't do
    /// that, since deleting a socket out from under a still-live listener
    /// elsewhere is exactly the kind of mistake this exercise tries to avoid.
    pub fn bind(path: impl AsRef<Path>, state: SharedState) -> anyhow::Result<Self> {
        let listener =
            uds::UnixSeqpacketListener::bind(path.as_ref()).context("binding duplex socket")?;
        listener
            .set_nonblocking(true)
            .context("setting listener nonblocking")?;

        let poll = Poll::new().context("creating poll instance")?;
        let waker = Arc::new(mio::Waker::new(poll.registry(), WAKER).context("creating waker")?);

        let listener_fd = listener.as_raw_fd();
        poll.registry()
            .register(&mut SourceFd(&listener_fd), LISTENER, Interest::READABLE)
            .context("registering listener")?;

        let (close_send, close_recv) = crossbeam_channel::bounded(1);
        let close_send = WakingSender::new(waker, close_send);

        Ok(Self {
            listener,
            poll,
            state,
            close_recv,
            close_send,
            shutting_down: false,
        })
    }

    /// A cloneable handle that wakes the poll loop and requests a clean
    /// shutdown, for use from a signal handler.
    pub fn closer(&self) -> WakingSender<()> {
        self.close_send.clone()
    }

    pub fn run(&mut self) -> anyhow::Result<()> {
        let mut events = Events::with_capacity(16);

        while !self.shutting_down {
            match self.poll.poll(&mut events, Some(TICK_INTERVAL)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("polling"),
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_all(),
                    WAKER => {
                        if self.close_recv.try_recv().is_ok() {
                            info!("shutdown requested");
                            self.shutting_down = true;
                        }
                    }
                    other => warn!("unexpected poll token: {other:?}"),
                }
            }

            if let Err(e) = self.state.lock().tick() {
                error!("periodic cleanup failed: {e:#}");
            }
        }

        info!("stopping all sessions");
        let sessions = std::mem::take(&mut self.state.lock().sessions);
        for (id, session) in sessions {
            if let Err(e) = session.stop() {
                error!(client_id = id, "error stopping session: {:#}", e);
            }
        }

        Ok(())
    }

    fn accept_all(&mut self) {
        loop {
            match self.listener.accept_unix_addr() {
                Ok((conn, _addr)) => {
                    if let Err(e) = self.accept_one(conn) {
                        warn!("failed to accept client: {:#}", e);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accept failed: {:#}", e);
                    break;
                }
            }
        }
    }

    fn accept_one(&mut self, conn: uds::UnixSeqpacketConn) -> anyhow::Result<()> {
        let conn_fd: RawFd = conn.as_raw_fd();
        let channel = SessionChannel::new(conn);

        let mut state = self.state.lock();
        let vk = state.vk.clone();
        let table = state.table.clone();
        let font_size = state.cfg.font_size;

        // Safe: `channel` (which owns the underlying fd) is moved into
        // `Session::spawn` in this same call, so the fd it's duplicating from
        // stays open for the duration of the call.
        let conn_fd = unsafe { BorrowedFd::borrow_raw(conn_fd) };
        let session =
            Session::spawn(vk, channel, conn_fd, table, font_size).context("spawning session")?;

        info!(client_id = session.id, "session started");
        state.sessions.insert(session.id, session);

        Ok(())
    }
}
