// Copyright 2021-Present natest authors
// SPDX-License-Identifier: Apache-2.0

//! Transport primitives for the native test-runner engine: a deadline
//! clock, a framed packet transport over a connected socket, shared-memory
//! message segments, and the typed marshalling that moves Rust values
//! across them.
//!
//! Everything in this crate is concerned with getting bytes from one
//! process to another; test execution, forking, signal handling and
//! iteration policy live one layer up, in `natest-core`.

pub mod deadline;
pub mod error;
pub mod marshal;
pub mod message;
pub mod protocol;
pub mod segment;
pub mod transport;
pub mod wire;

pub use deadline::Deadline;
pub use message::{Channel, Message, PayloadKind};
pub use segment::{Offset, Segment};
