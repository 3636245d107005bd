// Copyright 2021-Present natest authors
// SPDX-License-Identifier: Apache-2.0

//! The message queueing layer on top of [`crate::transport`] and
//! [`crate::segment`] (§4.C), grounded directly on `uipc_handle`/
//! `uipc_message` in `src/libuipc/shmem.c`: `uipc_process`, `uipc_waitread`
//! and `uipc_waitdone` are reproduced here as [`Channel::process`],
//! [`Channel::wait_recv`] and [`Channel::wait_done`], with the queue
//! discipline (`send_queue` / `ack_queue` / `recv_queue`) kept identical.
//!
//! One deliberate fix over the original (§9 "Open questions" /
//! SPEC_FULL.md §4.C): on `PACKET_ACK`, the original's unlink loop keeps
//! walking the rest of `ack_queue` after removing the matching entry
//! (`shmem.c`'s `for` loop has no `break`). Message ids are unique per
//! channel, so this cannot double-free in practice, but it is needless
//! work and an easy trap for a future edit that reuses ids. Here the scan
//! returns as soon as it finds the match.

use crate::deadline::Deadline;
use crate::error::TransportError;
use crate::segment::{next_segment_name, Offset, Segment};
use crate::transport::{self, RecvContext};
use crate::wire::{MessageDescriptor, Packet};
use std::collections::VecDeque;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;

/// The five payload shapes a message segment can carry (§4.D). Carried on
/// the wire as `MessageDescriptor::msg_kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PayloadKind {
    Result = 0,
    Event = 1,
    Expect = 2,
    Timeout = 3,
    Iterations = 4,
}

impl PayloadKind {
    fn from_u32(v: u32) -> Result<Self, TransportError> {
        match v {
            0 => Ok(PayloadKind::Result),
            1 => Ok(PayloadKind::Event),
            2 => Ok(PayloadKind::Expect),
            3 => Ok(PayloadKind::Timeout),
            4 => Ok(PayloadKind::Iterations),
            _ => Err(TransportError::Malformed("unknown payload kind")),
        }
    }
}

/// One in-flight message: a segment plus the routing fields needed to
/// re-send its descriptor or match an incoming ack against it. Mirrors
/// `uipc_message`, minus the original's intrusive `next` pointer -- message
/// queues here are plain `VecDeque`/`Vec`, not hand-rolled linked lists.
pub struct Message {
    pub id: u32,
    pub kind: PayloadKind,
    pub segment: Segment,
    pub payload: Offset,
}

impl Message {
    fn descriptor(&self) -> MessageDescriptor {
        MessageDescriptor {
            msg_id: self.id,
            msg_kind: self.kind as u32,
            payload_offset: self.payload.0,
            segment_size: self.segment.size() as u32,
            segment_path: self.segment.path().to_string(),
        }
    }
}

/// A connected pair of test-harness endpoints (§4.C "Channel"), one socket
/// plus the three queues `uipc_handle` maintains: `send_queue` (outgoing,
/// not yet written), `ack_queue` (written, awaiting the peer's ack before
/// the segment can be unlinked) and `recv_queue` (received, not yet taken
/// by the caller).
pub struct Channel {
    socket: UnixStream,
    recv_ctx: RecvContext,
    send_queue: VecDeque<Message>,
    ack_queue: Vec<Message>,
    recv_queue: VecDeque<Message>,
    readable: bool,
    next_id: u32,
}

impl Channel {
    pub fn new(socket: UnixStream) -> std::io::Result<Channel> {
        socket.set_nonblocking(true)?;
        Ok(Channel {
            socket,
            recv_ctx: RecvContext::new(),
            send_queue: VecDeque::new(),
            ack_queue: Vec::new(),
            recv_queue: VecDeque::new(),
            readable: true,
            next_id: 0,
        })
    }

    /// Allocates a fresh segment, writes `payload` into it via its
    /// [`crate::marshal::SegmentLayout`] impl, and queues the message for
    /// the next [`Channel::process`] call. Mirrors `uipc_msg_new` +
    /// `uipc_msg_payload_set` + `uipc_send`.
    pub fn queue_send<T: crate::marshal::SegmentLayout>(
        &mut self,
        kind: PayloadKind,
        payload: &T,
        segment_size: usize,
    ) -> Result<u32, TransportError> {
        let path = next_segment_name(self.socket.as_raw_fd());
        let segment = Segment::create(path, segment_size)
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let offset = payload
            .marshal(&segment)
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.send_queue.push_back(Message {
            id,
            kind,
            segment,
            payload: offset,
        });
        Ok(id)
    }

    /// Drains `send_queue`, then drains whatever is immediately available
    /// to read without blocking. Mirrors `uipc_process`.
    pub fn process(&mut self, deadline: Deadline) -> Result<(), TransportError> {
        while let Some(message) = self.send_queue.pop_front() {
            transport::send(
                self.socket.as_raw_fd(),
                &Packet::Message(message.descriptor()),
                deadline,
            )?;
            self.ack_queue.push(message);
        }

        while self.readable {
            match transport::recv(self.socket.as_raw_fd(), &mut self.recv_ctx) {
                Ok(Packet::Ack { msg_id }) => {
                    if let Some(pos) = self.ack_queue.iter().position(|m| m.id == msg_id) {
                        let acked = self.ack_queue.remove(pos);
                        // We created this segment; we are the only side
                        // still holding it once the peer has acked.
                        acked.segment.unlink().ok();
                    }
                }
                Ok(Packet::Message(desc)) => {
                    let segment = Segment::open(desc.segment_path.clone(), desc.segment_size as usize)
                        .map_err(|e| TransportError::Io(e.to_string()))?;
                    let message = Message {
                        id: desc.msg_id,
                        kind: PayloadKind::from_u32(desc.msg_kind)?,
                        segment,
                        payload: Offset(desc.payload_offset),
                    };
                    transport::send(
                        self.socket.as_raw_fd(),
                        &Packet::Ack { msg_id: message.id },
                        deadline,
                    )?;
                    self.recv_queue.push_back(message);
                }
                Err(TransportError::Retry) => break,
                Err(TransportError::Eof) => {
                    self.readable = false;
                    return Ok(());
                }
                Err(other) => {
                    self.readable = false;
                    return Err(other);
                }
            }
        }
        Ok(())
    }

    /// Takes the next received message if one is already queued, without
    /// blocking. Mirrors `uipc_read`.
    pub fn read(&mut self) -> Result<Option<Message>, TransportError> {
        if self.recv_queue.is_empty() && !self.readable {
            return Err(TransportError::Eof);
        }
        Ok(self.recv_queue.pop_front())
    }

    /// Blocks until a message arrives, `deadline` elapses, or the peer
    /// disconnects. Mirrors `uipc_waitread`.
    pub fn wait_recv(&mut self, deadline: Deadline) -> Result<Message, TransportError> {
        loop {
            if let Some(message) = self.recv_queue.pop_front() {
                return Ok(message);
            }
            if !self.readable {
                return Err(TransportError::Eof);
            }
            transport::wait_readable(self.socket.as_raw_fd(), deadline)?;
            self.process(deadline)?;
        }
    }

    /// Blocks until every queued send has been written and acked (or the
    /// peer disconnects). Mirrors `uipc_waitdone`.
    pub fn wait_done(&mut self, deadline: Deadline) -> Result<(), TransportError> {
        while !self.send_queue.is_empty() || !self.ack_queue.is_empty() {
            if !self.send_queue.is_empty() {
                transport::wait_writable(self.socket.as_raw_fd(), deadline)?;
                self.process(deadline)?;
            }
            if !self.ack_queue.is_empty() {
                match transport::wait_readable(self.socket.as_raw_fd(), deadline) {
                    Err(TransportError::Eof) => break,
                    Err(other) => return Err(other),
                    Ok(()) => {}
                }
                self.process(deadline)?;
            }
        }
        Ok(())
    }
}

// Queued and acked segments created by this side are unlinked explicitly
// (on ack, in `process`) or simply leaked as shared-memory objects if the
// peer vanished mid-flight; `Segment::drop` only unmaps, it never unlinks
// (see `crate::segment`), so an abandoned `Channel` cannot race an unlink
// against a peer still reading. Mirrors `uipc_disconnect`'s queue teardown.
impl Drop for Channel {
    fn drop(&mut self) {
        self.send_queue.clear();
        self.ack_queue.clear();
        self.recv_queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshal::SegmentLayout;
    use crate::protocol::{ExpectPayload, TestStatus};
    use std::time::Duration;

    #[test]
    fn a_queued_message_is_received_and_acked() {
        let (sock_a, sock_b) = UnixStream::pair().unwrap();
        let mut a = Channel::new(sock_a).unwrap();
        let mut b = Channel::new(sock_b).unwrap();

        let payload = ExpectPayload {
            expected: TestStatus::Crash,
        };
        a.queue_send(PayloadKind::Expect, &payload, 64).unwrap();

        let deadline = Deadline::after(Duration::from_secs(1));
        let received = b.wait_recv(deadline).unwrap();
        assert_eq!(received.kind, PayloadKind::Expect);
        let back = ExpectPayload::unmarshal(&received.segment, received.payload).unwrap();
        assert_eq!(back, payload);

        // Drive `a`'s side until the ack it's expecting has arrived.
        a.wait_done(deadline).unwrap();
        assert!(a.ack_queue.is_empty());
    }

    #[test]
    fn wait_recv_reports_eof_after_peer_drop() {
        let (sock_a, sock_b) = UnixStream::pair().unwrap();
        let a = Channel::new(sock_a).unwrap();
        let mut b = Channel::new(sock_b).unwrap();
        drop(a);

        let err = b
            .wait_recv(Deadline::after(Duration::from_millis(200)))
            .unwrap_err();
        assert_eq!(err, TransportError::Eof);
    }
}
