// Copyright 2021-Present natest authors
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for the dispatch layer (§4.J). Leaf failures use
//! `thiserror`, matching `natest-ipc`'s own error types and the teacher
//! crates' split; `DispatchError` is the one type a caller of
//! [`crate::dispatcher::dispatch`] actually has to handle, and folds in the
//! lower-level transport/segment/marshal errors as sources.

use natest_ipc::error::{MarshalError, SegmentError, TransportError};
use thiserror::Error;

/// Failure to set up or tear down the child side of a dispatch: fork,
/// socketpair, or the initial connect. Distinct from [`DispatchError`]
/// because these happen before a test result can even exist, so there is
/// nothing to classify (§8 "Outputs").
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("socketpair() failed: {0}")]
    SocketPair(#[source] nix::Error),
    #[error("fork() failed: {0}")]
    Fork(#[source] nix::Error),
}

/// Everything that can go wrong running one dispatch, whether the root
/// cause is a transport failure, a child that vanished unexpectedly, or
/// the deadline elapsing outright.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Segment(#[from] SegmentError),
    #[error(transparent)]
    Marshal(#[from] MarshalError),
    #[error("failed to reap child {pid}: {source}")]
    Reap {
        pid: i32,
        #[source]
        source: nix::Error,
    },
}
