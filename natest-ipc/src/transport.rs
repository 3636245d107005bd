// Copyright 2021-Present natest authors
// SPDX-License-Identifier: Apache-2.0

//! Framed packet transport over a connected byte-stream socket (§4.B).
//!
//! Grounded on `ddcommon::unix_utils::process::wait_for_pollhup`'s
//! poll-loop-with-EINTR/EAGAIN-retry shape, generalized from POLLHUP-only to
//! readability/writability, and on the original `uipc_packet_send`/
//! `uipc_packet_recv`'s resumable-context design: a half-read packet must be
//! resumable after `EAGAIN`/`EINTR` without losing the bytes already read.

use crate::deadline::Deadline;
use crate::error::TransportError;
use crate::wire::{self, Packet};
use libc::{nfds_t, poll, pollfd, POLLIN, POLLOUT};
use std::os::fd::RawFd;

/// Installs a process-wide `SIG_IGN` disposition for `SIGPIPE`, matching the
/// original's per-send `signal(SIGPIPE, ...)` dance but done once: every
/// socket write in this crate already treats `EPIPE` as [`TransportError::Eof`],
/// so there is nothing gained by re-arming the ignore around each call, only
/// the cost of two extra syscalls per packet.
pub fn ignore_sigpipe() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    });
}

/// Blocks (respecting `deadline`) until `fd` is readable.
pub fn wait_readable(fd: RawFd, deadline: Deadline) -> Result<(), TransportError> {
    wait_for(fd, POLLIN, deadline)
}

/// Blocks (respecting `deadline`) until `fd` is writable.
pub fn wait_writable(fd: RawFd, deadline: Deadline) -> Result<(), TransportError> {
    wait_for(fd, POLLOUT, deadline)
}

fn wait_for(fd: RawFd, events: i16, deadline: Deadline) -> Result<(), TransportError> {
    loop {
        if deadline.has_passed() {
            return Err(TransportError::Timeout);
        }
        let mut fds = [pollfd {
            fd,
            events,
            revents: 0,
        }];
        let timeout_ms = deadline.remaining_millis_i32();
        // Safety: `fds` is a valid one-element array for the duration of
        // the call.
        let rc = unsafe { poll(fds.as_mut_ptr(), fds.len() as nfds_t, timeout_ms) };
        match rc {
            -1 => match nix::Error::last() {
                nix::Error::EINTR | nix::Error::EAGAIN => continue,
                other => return Err(other.into()),
            },
            0 => return Err(TransportError::Timeout),
            _ => {
                let revents = fds[0].revents;
                if revents & events != 0 {
                    return Ok(());
                }
                if revents & (libc::POLLHUP | libc::POLLERR) != 0 {
                    return Err(TransportError::Eof);
                }
                // Spurious wakeup; recompute remaining time and retry.
                continue;
            }
        }
    }
}

/// Writes a full packet to `fd`, looping through partial writes and
/// transient errors until either the whole packet lands or `deadline`
/// elapses.
pub fn send(fd: RawFd, packet: &Packet, deadline: Deadline) -> Result<(), TransportError> {
    ignore_sigpipe();
    let bytes = packet.encode();
    let mut written = 0usize;
    while written < bytes.len() {
        if deadline.has_passed() {
            return Err(TransportError::Timeout);
        }
        match nix::unistd::write(
            unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) },
            &bytes[written..],
        ) {
            Ok(0) => return Err(TransportError::Eof),
            Ok(n) => written += n,
            Err(nix::Error::EAGAIN) | Err(nix::Error::EINTR) => {
                wait_writable(fd, deadline)?;
            }
            Err(nix::Error::EPIPE) => return Err(TransportError::Eof),
            Err(other) => return Err(other.into()),
        }
    }
    Ok(())
}

/// Resumable receive state: tracks how much of the header and body have
/// been read so far, so a caller that gets `Retry` can call [`recv`] again
/// without re-reading already-consumed bytes.
pub struct RecvContext {
    header_buf: Vec<u8>,
    body_buf: Vec<u8>,
    body_len: Option<usize>,
    kind: Option<crate::wire::PacketKind>,
}

impl Default for RecvContext {
    fn default() -> Self {
        RecvContext {
            header_buf: Vec::with_capacity(wire::header_len()),
            body_buf: Vec::new(),
            body_len: None,
            kind: None,
        }
    }
}

impl RecvContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn reset(&mut self) {
        self.header_buf.clear();
        self.body_buf.clear();
        self.body_len = None;
        self.kind = None;
    }
}

/// Attempts to read one full packet from `fd`, resuming from `ctx` if a
/// previous call left a partial header or body buffered.
pub fn recv(fd: RawFd, ctx: &mut RecvContext) -> Result<Packet, TransportError> {
    let header_len = wire::header_len();
    while ctx.header_buf.len() < header_len {
        let mut chunk = [0u8; 64];
        let want = header_len - ctx.header_buf.len();
        match nix::unistd::read(
            unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) },
            &mut chunk[..want.min(chunk.len())],
        ) {
            Ok(0) => return Err(TransportError::Eof),
            Ok(n) => ctx.header_buf.extend_from_slice(&chunk[..n]),
            Err(other) => return Err(other.into()),
        }
    }

    if ctx.kind.is_none() {
        let mut header = [0u8; 6];
        header.copy_from_slice(&ctx.header_buf[..6]);
        let parts = wire::parse_header(&header)?;
        ctx.kind = Some(parts.kind);
        ctx.body_len = Some(parts.body_len);
        ctx.body_buf.reserve(parts.body_len);
    }
    let body_len = ctx.body_len.unwrap();

    while ctx.body_buf.len() < body_len {
        let mut chunk = [0u8; 4096];
        let want = (body_len - ctx.body_buf.len()).min(chunk.len());
        match nix::unistd::read(
            unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) },
            &mut chunk[..want],
        ) {
            Ok(0) => return Err(TransportError::Eof),
            Ok(n) => ctx.body_buf.extend_from_slice(&chunk[..n]),
            Err(other) => return Err(other.into()),
        }
    }

    let packet = wire::decode_body(ctx.kind.unwrap(), &ctx.body_buf)?;
    ctx.reset();
    Ok(packet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::MessageDescriptor;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    #[test]
    fn send_then_recv_round_trips_a_message_packet() {
        let (a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();

        let packet = Packet::Message(MessageDescriptor {
            msg_id: 1,
            msg_kind: 0,
            payload_offset: 0,
            segment_size: 64,
            segment_path: "/natest_x".to_string(),
        });
        send(a.as_raw_fd(), &packet, Deadline::after(Duration::from_secs(1))).unwrap();

        let mut ctx = RecvContext::new();
        let deadline = Deadline::after(Duration::from_secs(1));
        let mut received = None;
        while received.is_none() {
            match recv(b.as_raw_fd(), &mut ctx) {
                Ok(p) => received = Some(p),
                Err(TransportError::Retry) => {
                    wait_readable(b.as_raw_fd(), deadline).unwrap();
                }
                Err(e) => panic!("unexpected error: {e:?}"),
            }
        }
        assert_eq!(received.unwrap(), packet);
    }

    #[test]
    fn recv_reports_eof_on_closed_peer() {
        let (a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        drop(a);
        let mut ctx = RecvContext::new();
        let err = recv(b.as_raw_fd(), &mut ctx).unwrap_err();
        assert_eq!(err, TransportError::Eof);
    }

    #[test]
    fn wait_readable_times_out_with_no_data() {
        let (_a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        let err = wait_readable(b.as_raw_fd(), Deadline::after(Duration::from_millis(20)))
            .unwrap_err();
        assert_eq!(err, TransportError::Timeout);
    }
}
