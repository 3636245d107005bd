// Copyright 2021-Present natest authors
// SPDX-License-Identifier: Apache-2.0

//! Leaf error types for each component boundary. Kept small and matchable,
//! in the style of `ddcommon::unix_utils::errors` in the teacher crate this
//! workspace is built from: one `thiserror` enum per failure surface, rather
//! than a single crate-wide catch-all.

/// Outcome of a single transport operation (§4.B).
///
/// `Retry` is not an error in the usual sense -- it is loop-control, meaning
/// "the deadline has not passed and the OS asked us to come back later". It
/// is folded into this enum rather than kept separate because every
/// transport call site needs to match on it alongside the real failures.
#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("operation would block; retry before the deadline")]
    Retry,
    #[error("deadline elapsed before the operation completed")]
    Timeout,
    #[error("remote end closed the connection")]
    Eof,
    #[error("out of memory while buffering a packet")]
    Nomem,
    #[error("protocol version mismatch: local={local} remote={remote}")]
    VersionMismatch { local: u8, remote: u8 },
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
    #[error("transport I/O error: {0}")]
    Io(String),
}

impl From<nix::Error> for TransportError {
    fn from(err: nix::Error) -> Self {
        match err {
            nix::Error::EAGAIN | nix::Error::EINTR => TransportError::Retry,
            nix::Error::EPIPE => TransportError::Eof,
            other => TransportError::Io(other.to_string()),
        }
    }
}

/// Errors creating, mapping, or growing a shared-memory segment (§4.C).
#[derive(Debug, thiserror::Error)]
pub enum SegmentError {
    #[error("failed to create shared memory segment {path}: {source}")]
    Create {
        path: String,
        #[source]
        source: nix::Error,
    },
    #[error("failed to open shared memory segment {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: nix::Error,
    },
    #[error("failed to map shared memory segment {path}: {source}")]
    Map {
        path: String,
        #[source]
        source: nix::Error,
    },
    #[error("segment exhausted: requested {requested} bytes, {available} available")]
    OutOfSpace { requested: usize, available: usize },
    #[error("offset {offset} is out of bounds for a segment of size {size}")]
    OutOfBounds { offset: u32, size: usize },
}

/// Errors walking a payload's [`crate::marshal::SegmentLayout`] (§4.D).
#[derive(Debug, thiserror::Error)]
pub enum MarshalError {
    #[error(transparent)]
    Segment(#[from] SegmentError),
    #[error("string field was not NUL-terminated within the segment")]
    UnterminatedString,
    #[error("string field was not valid UTF-8")]
    InvalidUtf8,
    #[error("enum discriminant {0} is out of range for {1}")]
    InvalidDiscriminant(u32, &'static str),
}
