// Copyright 2021-Present natest authors
// SPDX-License-Identifier: Apache-2.0

//! On-the-wire packet format carried over the socket half of the transport
//! (§6 "Wire protocol"). The socket only ever carries routing descriptors;
//! the actual payload bytes travel through the shared-memory segment named
//! in a `Message` packet (§4.C).

use crate::error::TransportError;

/// `version` has no counterpart in the original protocol (§9 "Open
/// questions"): mixing a parent and child built from different crate
/// versions was undefined there. Here a mismatch is rejected outright,
/// since the check costs one byte and catches a whole class of
/// stale-binary bugs for free.
pub const PROTOCOL_VERSION: u8 = 1;

const HEADER_LEN: usize = 1 /* version */ + 1 /* kind */ + 4 /* body length */;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    Message = 0,
    Ack = 1,
}

impl PacketKind {
    fn from_u8(v: u8) -> Result<Self, TransportError> {
        match v {
            0 => Ok(PacketKind::Message),
            1 => Ok(PacketKind::Ack),
            _ => Err(TransportError::Malformed("unknown packet kind")),
        }
    }
}

/// The routing descriptor for one shared-memory message (§4.C, §6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDescriptor {
    pub msg_id: u32,
    pub msg_kind: u32,
    pub payload_offset: u32,
    pub segment_size: u32,
    pub segment_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Message(MessageDescriptor),
    Ack { msg_id: u32 },
}

impl Packet {
    fn kind(&self) -> PacketKind {
        match self {
            Packet::Message(_) => PacketKind::Message,
            Packet::Ack { .. } => PacketKind::Ack,
        }
    }

    fn encode_body(&self) -> Vec<u8> {
        match self {
            Packet::Message(desc) => {
                let mut body = Vec::with_capacity(16 + desc.segment_path.len() + 1);
                body.extend_from_slice(&desc.msg_id.to_le_bytes());
                body.extend_from_slice(&desc.msg_kind.to_le_bytes());
                body.extend_from_slice(&desc.payload_offset.to_le_bytes());
                body.extend_from_slice(&desc.segment_size.to_le_bytes());
                body.extend_from_slice(desc.segment_path.as_bytes());
                body.push(0);
                body
            }
            Packet::Ack { msg_id } => msg_id.to_le_bytes().to_vec(),
        }
    }

    /// Serializes a full packet (header + body) ready to write to the
    /// socket.
    pub fn encode(&self) -> Vec<u8> {
        let body = self.encode_body();
        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        out.push(PROTOCOL_VERSION);
        out.push(self.kind() as u8);
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&body);
        out
    }

    fn decode_body(kind: PacketKind, body: &[u8]) -> Result<Packet, TransportError> {
        match kind {
            PacketKind::Ack => {
                if body.len() != 4 {
                    return Err(TransportError::Malformed("ack body must be 4 bytes"));
                }
                let msg_id = u32::from_le_bytes(body[0..4].try_into().unwrap());
                Ok(Packet::Ack { msg_id })
            }
            PacketKind::Message => {
                if body.len() < 17 {
                    return Err(TransportError::Malformed("message body too short"));
                }
                let msg_id = u32::from_le_bytes(body[0..4].try_into().unwrap());
                let msg_kind = u32::from_le_bytes(body[4..8].try_into().unwrap());
                let payload_offset = u32::from_le_bytes(body[8..12].try_into().unwrap());
                let segment_size = u32::from_le_bytes(body[12..16].try_into().unwrap());
                let path_bytes = &body[16..];
                let nul_at = path_bytes
                    .iter()
                    .position(|&b| b == 0)
                    .ok_or(TransportError::Malformed("segment path not NUL-terminated"))?;
                let segment_path = std::str::from_utf8(&path_bytes[..nul_at])
                    .map_err(|_| TransportError::Malformed("segment path not valid utf-8"))?
                    .to_string();
                Ok(Packet::Message(MessageDescriptor {
                    msg_id,
                    msg_kind,
                    payload_offset,
                    segment_size,
                    segment_path,
                }))
            }
        }
    }
}

/// Resumable header-parsing state, shared by [`Packet::decode_body`]
/// callers that read a partial header.
pub(crate) struct HeaderParts {
    pub kind: PacketKind,
    pub body_len: usize,
}

pub(crate) fn parse_header(bytes: &[u8; HEADER_LEN]) -> Result<HeaderParts, TransportError> {
    if bytes[0] != PROTOCOL_VERSION {
        return Err(TransportError::VersionMismatch {
            local: PROTOCOL_VERSION,
            remote: bytes[0],
        });
    }
    let kind = PacketKind::from_u8(bytes[1])?;
    let body_len = u32::from_le_bytes(bytes[2..6].try_into().unwrap()) as usize;
    Ok(HeaderParts { kind, body_len })
}

pub(crate) const fn header_len() -> usize {
    HEADER_LEN
}

pub(crate) fn decode_body(kind: PacketKind, body: &[u8]) -> Result<Packet, TransportError> {
    Packet::decode_body(kind, body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_packet_round_trips() {
        let packet = Packet::Message(MessageDescriptor {
            msg_id: 42,
            msg_kind: 2,
            payload_offset: 128,
            segment_size: 2048,
            segment_path: "/natest_1_2_3".to_string(),
        });
        let bytes = packet.encode();
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&bytes[..HEADER_LEN]);
        let parts = parse_header(&header).unwrap();
        let decoded = decode_body(parts.kind, &bytes[HEADER_LEN..HEADER_LEN + parts.body_len])
            .unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn ack_packet_round_trips() {
        let packet = Packet::Ack { msg_id: 7 };
        let bytes = packet.encode();
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&bytes[..HEADER_LEN]);
        let parts = parse_header(&header).unwrap();
        assert_eq!(parts.kind, PacketKind::Ack);
        let decoded = decode_body(parts.kind, &bytes[HEADER_LEN..HEADER_LEN + parts.body_len])
            .unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let mut bytes = Packet::Ack { msg_id: 1 }.encode();
        bytes[0] = PROTOCOL_VERSION.wrapping_add(1);
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&bytes[..HEADER_LEN]);
        let err = parse_header(&header).unwrap_err();
        assert!(matches!(err, TransportError::VersionMismatch { .. }));
    }
}
