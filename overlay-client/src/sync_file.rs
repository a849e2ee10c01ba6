// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

//! Sync-file polling. A sync-file is a dma-buf fence represented as a
//! pollable file descriptor: `POLLIN`/`POLLHUP` means the GPU work it guards
//! has completed. Consuming a sync-file always means closing the fd; there is
//! no way to "peek" at one twice.

use std::os::fd::{AsFd, BorrowedFd};
use std::time::Duration;

use rustix::event::{poll, PollFd, PollFlags};

/// Non-blocking check: has the fence behind this sync-file already signalled?
/// This is the `ready_frame()` contract: a zero-timeout poll, true only on
/// `POLLIN | POLLHUP`. The caller is responsible for closing the fd (by
/// dropping it) once it has acted on a `true` result.
pub fn is_signaled(fd: BorrowedFd) -> bool {
    poll_for(fd, Some(Duration::ZERO))
}

fn poll_for(fd: BorrowedFd, timeout: Option<Duration>) -> bool {
    let mut pollfd = [PollFd::new(&fd, PollFlags::IN)];

    let timeout_ms = match timeout {
        Some(d) => d.as_millis() as i32,
        None => -1,
    };

    loop {
        match poll(&mut pollfd, timeout_ms) {
            Ok(0) => return false,
            Ok(_) => {
                let revents = pollfd[0].revents();
                return revents.contains(PollFlags::IN) || revents.contains(PollFlags::HUP);
            }
            Err(rustix::io::Errno::INTR) => continue,
            Err(_) => return false,
        }
    }
}

/// Convenience for callers holding an owned fd: polls without taking
/// ownership, since checking for readiness doesn't consume the fence (only
/// the caller deciding "this frame is done" does, by dropping the fd).
pub fn is_signaled_owned(fd: &impl AsFd) -> bool {
    is_signaled(fd.as_fd())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustix::event::{eventfd, EventfdFlags};
    use rustix::io::write;

    #[test]
    fn unsignaled_eventfd_is_not_signaled() {
        let fd = eventfd(0, EventfdFlags::NONBLOCK).unwrap();
        assert!(!is_signaled_owned(&fd));
    }

    #[test]
    fn written_eventfd_is_signaled() {
        let fd = eventfd(0, EventfdFlags::NONBLOCK).unwrap();
        write(&fd, &1u64.to_ne_bytes()).unwrap();
        assert!(is_signaled_owned(&fd));
    }
}
