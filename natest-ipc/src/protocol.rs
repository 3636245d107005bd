// Copyright 2021-Present natest authors
// SPDX-License-Identifier: Apache-2.0

//! The fixed set of typed payloads carried inside a message segment (§4.D),
//! and the shared enums (`TestStatus`, `Stage`, `LogLevel`) every component
//! from the dispatcher down to the loader trait agrees on.
//!
//! Grounded directly on `include/moonunit/test.h`'s `MuTestResult`,
//! `MuTestStage`, `MuLogLevel`, `MuTestSummary` and `MuLogEvent`, and on the
//! `MU_EXPECT` contract documented in `include/moonunit/interface.h` (a test
//! may declare, before running, the non-success status it expects to end
//! with; the dispatcher then reclassifies the observed result against that
//! declaration -- see `ExpectPayload` below).

use crate::error::MarshalError;
use crate::marshal::{marshal_opt_str, unmarshal_opt_str, SegmentLayout};
use crate::segment::{Offset, Segment};

/// Mirrors `MuTestResult`. Variant order and discriminants are load-bearing:
/// they are written to the wire as a raw `u32`, so changing them would break
/// compatibility between a parent and child built from different revisions
/// of this enum -- which is exactly the class of bug `PROTOCOL_VERSION`
/// (see `crate::wire`) exists to catch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TestStatus {
    Success = 0,
    Failure = 1,
    Assertion = 2,
    Crash = 3,
    Timeout = 4,
    /// A native exception (e.g. a C++ exception escaping a test body)
    /// propagated up rather than being reported through the token.
    Exception = 5,
    /// The test declared itself skipped (mirrors `__mu_skip`); counted
    /// neither as a pass nor a failure by a logger that distinguishes it.
    Skipped = 6,
}

impl TestStatus {
    fn from_u32(v: u32) -> Result<Self, MarshalError> {
        match v {
            0 => Ok(TestStatus::Success),
            1 => Ok(TestStatus::Failure),
            2 => Ok(TestStatus::Assertion),
            3 => Ok(TestStatus::Crash),
            4 => Ok(TestStatus::Timeout),
            5 => Ok(TestStatus::Exception),
            6 => Ok(TestStatus::Skipped),
            other => Err(MarshalError::InvalidDiscriminant(other, "TestStatus")),
        }
    }
}

/// Mirrors `MuTestStage`: which phase of a test's lifecycle a result or log
/// event belongs to. The original collapsed library- and fixture-level
/// setup/teardown into a single `MU_STAGE_SETUP`/`MU_STAGE_TEARDOWN` pair;
/// this rewrite keeps them distinct (§3 "Test result") since a logger or a
/// caller inspecting a result needs to tell "the library's one-time init
/// failed" apart from "this test's own fixture teardown failed" (§8
/// "Fixture teardown failure after test pass").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Stage {
    LibrarySetup = 0,
    FixtureSetup = 1,
    Test = 2,
    FixtureTeardown = 3,
    LibraryTeardown = 4,
    Unknown = 5,
}

impl Stage {
    fn from_u32(v: u32) -> Result<Self, MarshalError> {
        match v {
            0 => Ok(Stage::LibrarySetup),
            1 => Ok(Stage::FixtureSetup),
            2 => Ok(Stage::Test),
            3 => Ok(Stage::FixtureTeardown),
            4 => Ok(Stage::LibraryTeardown),
            5 => Ok(Stage::Unknown),
            other => Err(MarshalError::InvalidDiscriminant(other, "Stage")),
        }
    }
}

/// Mirrors `MuLogLevel`. The original's ordering -- `Warning` first,
/// `Trace` last -- reads backwards from a severity scale, but is kept
/// verbatim since `Logger::max_log_level` (§4.K) compares levels by this
/// exact discriminant order, and changing it would silently invert a
/// user's `--log-level` filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum LogLevel {
    Warning = 0,
    Info = 1,
    Verbose = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    fn from_u32(v: u32) -> Result<Self, MarshalError> {
        match v {
            0 => Ok(LogLevel::Warning),
            1 => Ok(LogLevel::Info),
            2 => Ok(LogLevel::Verbose),
            3 => Ok(LogLevel::Debug),
            4 => Ok(LogLevel::Trace),
            other => Err(MarshalError::InvalidDiscriminant(other, "LogLevel")),
        }
    }
}

/// One node of the crash backtrace chain attached to a [`ResultPayload`]
/// when `status == Crash`. Modeled as a segment-resident singly linked list
/// because the number of frames is not known until the signal handler has
/// finished walking the stack (§4.H); a fixed-size array would need to pick
/// an arbitrary cap up front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub symbol: Option<String>,
    pub address: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct RawFrame {
    symbol: Offset,
    address: u64,
    next: Offset,
}

/// Marshals a sequence of frames as a linked list, outermost frame first,
/// and returns the offset of the head node (or [`Offset::NULL`] for an
/// empty chain).
pub fn marshal_frame_chain(seg: &Segment, frames: &[Frame]) -> Result<Offset, MarshalError> {
    let mut next = Offset::NULL;
    for frame in frames.iter().rev() {
        let symbol = marshal_opt_str(seg, &frame.symbol)?;
        let raw = RawFrame {
            symbol,
            address: frame.address,
            next,
        };
        next = seg.alloc_write(raw)?;
    }
    Ok(next)
}

/// Walks a frame chain starting at `at`, returning frames in original
/// (outermost-first) order.
pub fn unmarshal_frame_chain(seg: &Segment, at: Offset) -> Result<Vec<Frame>, MarshalError> {
    let mut frames = Vec::new();
    let mut cursor = at;
    while !cursor.is_null() {
        let raw: RawFrame = seg.read_at(cursor)?;
        frames.push(Frame {
            symbol: unmarshal_opt_str(seg, raw.symbol)?,
            address: raw.address,
        });
        cursor = raw.next;
    }
    Ok(frames)
}

/// The outcome of one test run (§3 "Message", mirrors `MuTestSummary` plus
/// the backtrace the original left to a separate out-of-band mechanism,
/// see SPEC_FULL.md §4.D).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultPayload {
    pub status: TestStatus,
    /// The status this run was declared to expect, default `Success` (§3
    /// "Test result"). A result whose `status` equals `expected` is a pass
    /// from the caller's perspective, whatever that shared value is;
    /// `status` itself is always the raw observed outcome and is never
    /// rewritten to reflect that comparison.
    pub expected: TestStatus,
    pub stage: Stage,
    pub reason: Option<String>,
    pub file: Option<String>,
    pub line: u32,
    pub backtrace: Vec<Frame>,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct RawResult {
    status: u32,
    expected: u32,
    stage: u32,
    reason: Offset,
    file: Offset,
    line: u32,
    backtrace: Offset,
}

impl SegmentLayout for ResultPayload {
    fn marshal(&self, seg: &Segment) -> Result<Offset, MarshalError> {
        let reason = marshal_opt_str(seg, &self.reason)?;
        let file = marshal_opt_str(seg, &self.file)?;
        let backtrace = marshal_frame_chain(seg, &self.backtrace)?;
        let raw = RawResult {
            status: self.status as u32,
            expected: self.expected as u32,
            stage: self.stage as u32,
            reason,
            file,
            line: self.line,
            backtrace,
        };
        Ok(seg.alloc_write(raw)?)
    }

    fn unmarshal(seg: &Segment, at: Offset) -> Result<Self, MarshalError> {
        let raw: RawResult = seg.read_at(at)?;
        Ok(ResultPayload {
            status: TestStatus::from_u32(raw.status)?,
            expected: TestStatus::from_u32(raw.expected)?,
            stage: Stage::from_u32(raw.stage)?,
            reason: unmarshal_opt_str(seg, raw.reason)?,
            file: unmarshal_opt_str(seg, raw.file)?,
            line: raw.line,
            backtrace: unmarshal_frame_chain(seg, raw.backtrace)?,
        })
    }
}

/// A single logged event, emitted any number of times during a stage before
/// the terminal [`ResultPayload`] (mirrors `MuLogEvent`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventPayload {
    pub stage: Stage,
    pub file: Option<String>,
    pub line: u32,
    pub level: LogLevel,
    pub message: Option<String>,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct RawEvent {
    stage: u32,
    file: Offset,
    line: u32,
    level: u32,
    message: Offset,
}

impl SegmentLayout for EventPayload {
    fn marshal(&self, seg: &Segment) -> Result<Offset, MarshalError> {
        let file = marshal_opt_str(seg, &self.file)?;
        let message = marshal_opt_str(seg, &self.message)?;
        let raw = RawEvent {
            stage: self.stage as u32,
            file,
            line: self.line,
            level: self.level as u32,
            message,
        };
        Ok(seg.alloc_write(raw)?)
    }

    fn unmarshal(seg: &Segment, at: Offset) -> Result<Self, MarshalError> {
        let raw: RawEvent = seg.read_at(at)?;
        Ok(EventPayload {
            stage: Stage::from_u32(raw.stage)?,
            file: unmarshal_opt_str(seg, raw.file)?,
            line: raw.line,
            level: LogLevel::from_u32(raw.level)?,
            message: unmarshal_opt_str(seg, raw.message)?,
        })
    }
}

/// Declares the status a test expects to finish with, sent once from child
/// to parent before the test body runs if the test called the equivalent of
/// `MU_EXPECT` (§ interface.h "Specify expected result"). Stamped onto the
/// eventual [`ResultPayload::expected`] field unchanged; the comparison
/// against the observed `status` is left to whoever reads the result, not
/// performed by this payload or by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpectPayload {
    pub expected: TestStatus,
}

impl SegmentLayout for ExpectPayload {
    fn marshal(&self, seg: &Segment) -> Result<Offset, MarshalError> {
        Ok(seg.alloc_write(self.expected as u32)?)
    }

    fn unmarshal(seg: &Segment, at: Offset) -> Result<Self, MarshalError> {
        let raw: u32 = seg.read_at(at)?;
        Ok(ExpectPayload {
            expected: TestStatus::from_u32(raw)?,
        })
    }
}

/// Carries a per-test timeout override, in milliseconds, from parent to
/// child at dispatch time (§4.L: `EngineConfig::timeout` is the default;
/// an individual test may override it).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPayload {
    pub millis: u32,
}

impl SegmentLayout for TimeoutPayload {
    fn marshal(&self, seg: &Segment) -> Result<Offset, MarshalError> {
        Ok(seg.alloc_write(self.millis)?)
    }

    fn unmarshal(seg: &Segment, at: Offset) -> Result<Self, MarshalError> {
        Ok(TimeoutPayload {
            millis: seg.read_at(at)?,
        })
    }
}

/// Carries the iteration count and the index of the iteration currently
/// running, from parent to child, for the "run until failure" iteration
/// policy (§4.I).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterationsPayload {
    pub total: u32,
    pub index: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct RawIterations {
    total: u32,
    index: u32,
}

impl SegmentLayout for IterationsPayload {
    fn marshal(&self, seg: &Segment) -> Result<Offset, MarshalError> {
        let raw = RawIterations {
            total: self.total,
            index: self.index,
        };
        Ok(seg.alloc_write(raw)?)
    }

    fn unmarshal(seg: &Segment, at: Offset) -> Result<Self, MarshalError> {
        let raw: RawIterations = seg.read_at(at)?;
        Ok(IterationsPayload {
            total: raw.total,
            index: raw.index,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_segment(size: usize) -> Segment {
        use std::time::{SystemTime, UNIX_EPOCH};
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .subsec_nanos();
        let path = format!("/natest_protocol_test_{}_{}", std::process::id(), nanos);
        Segment::create(path, size).unwrap()
    }

    #[test]
    fn result_payload_round_trips_with_backtrace() {
        let seg = temp_segment(4096);
        let payload = ResultPayload {
            status: TestStatus::Crash,
            expected: TestStatus::Success,
            stage: Stage::Test,
            reason: Some("signal 11".to_string()),
            file: Some("f.c".to_string()),
            line: 42,
            backtrace: vec![
                Frame {
                    symbol: Some("main".to_string()),
                    address: 0x1000,
                },
                Frame {
                    symbol: None,
                    address: 0x2000,
                },
            ],
        };
        let offset = payload.marshal(&seg).unwrap();
        let back = ResultPayload::unmarshal(&seg, offset).unwrap();
        assert_eq!(back, payload);
        seg.unlink().ok();
    }

    #[test]
    fn result_payload_with_no_reason_and_empty_backtrace() {
        let seg = temp_segment(256);
        let payload = ResultPayload {
            status: TestStatus::Success,
            expected: TestStatus::Success,
            stage: Stage::LibraryTeardown,
            reason: None,
            file: None,
            line: 0,
            backtrace: Vec::new(),
        };
        let offset = payload.marshal(&seg).unwrap();
        let back = ResultPayload::unmarshal(&seg, offset).unwrap();
        assert_eq!(back, payload);
        seg.unlink().ok();
    }

    #[test]
    fn event_payload_round_trips() {
        let seg = temp_segment(512);
        let payload = EventPayload {
            stage: Stage::FixtureSetup,
            file: Some("fixture.rs".to_string()),
            line: 10,
            level: LogLevel::Verbose,
            message: Some("opening fixture".to_string()),
        };
        let offset = payload.marshal(&seg).unwrap();
        let back = EventPayload::unmarshal(&seg, offset).unwrap();
        assert_eq!(back, payload);
        seg.unlink().ok();
    }

    #[test]
    fn expect_payload_round_trips() {
        let seg = temp_segment(64);
        let payload = ExpectPayload {
            expected: TestStatus::Assertion,
        };
        let offset = payload.marshal(&seg).unwrap();
        assert_eq!(ExpectPayload::unmarshal(&seg, offset).unwrap(), payload);
        seg.unlink().ok();
    }

    #[test]
    fn timeout_and_iterations_payloads_round_trip() {
        let seg = temp_segment(64);
        let timeout = TimeoutPayload { millis: 5000 };
        let t_off = timeout.marshal(&seg).unwrap();
        assert_eq!(TimeoutPayload::unmarshal(&seg, t_off).unwrap(), timeout);

        let iterations = IterationsPayload {
            total: 100,
            index: 3,
        };
        let i_off = iterations.marshal(&seg).unwrap();
        assert_eq!(
            IterationsPayload::unmarshal(&seg, i_off).unwrap(),
            iterations
        );
        seg.unlink().ok();
    }

    #[test]
    fn invalid_status_discriminant_is_rejected() {
        let seg = temp_segment(64);
        let offset = seg.alloc_write(99u32).unwrap();
        let err = ExpectPayload::unmarshal(&seg, offset).unwrap_err();
        assert!(matches!(err, MarshalError::InvalidDiscriminant(99, "TestStatus")));
        seg.unlink().ok();
    }
}
