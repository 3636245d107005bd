// Copyright 2021-Present natest authors
// SPDX-License-Identifier: Apache-2.0

//! Test outcomes and the sink that consumes them (§6 "Logger").
//!
//! [`TestResult`] and [`LogEvent`] are the same shapes `natest-ipc` already
//! marshals across the wire ([`natest_ipc::protocol::ResultPayload`] and
//! [`natest_ipc::protocol::EventPayload`]); re-exporting them here instead
//! of declaring parallel core-side structs keeps one definition for "what a
//! test result looks like" rather than two that have to be kept in sync by
//! hand.

use crate::descriptor::TestDescriptor;

pub use natest_ipc::protocol::{EventPayload as LogEvent, Frame, ResultPayload as TestResult};
pub use natest_ipc::protocol::{LogLevel, Stage, TestStatus};

/// Receives structural and per-test events as the engine runs a library
/// (§6 "Logger interface"). `test_log`/`test_leave` are the two operations
/// every harness plugin in the original had to wire up to a reporter
/// (`MuTestToken::event`/`MuTestToken::result`); the `library_*`/`suite_*`
/// bracketing calls and `max_log_level` round out the rest of the
/// original's `MuLogger` vtable. Implemented by the embedding binary --
/// this crate has no notion of console, XML or JSON output of its own (§1
/// "Non-goals": reporting formats are out of scope), only
/// [`crate::logging::EnvLogger`] as a diagnostic default.
/// A named, typed configuration value a [`Logger`] can expose through
/// [`Logger::set`]/[`Logger::get`] (mirrors `MoonUnitOption`'s `'b'`/`'i'`/
/// `'s'`/`'f'` type tags over a `void*`; the `'p'` pointer variant has no
/// safe Rust equivalent worth keeping and is dropped). A console logger's
/// color setting or an XML logger's indent width are the kind of thing
/// this carries -- nothing this crate itself reads or writes.
#[derive(Debug, Clone, PartialEq)]
pub enum LoggerOption {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

pub trait Logger: Send + Sync {
    /// A library is about to be run. `path` is whatever the loader used to
    /// locate it; `None` if the library failed to open at all.
    fn library_enter(&mut self, _path: &str) {}
    /// The library failed to load, `construct`, or run its library-level
    /// setup; no tests from it will run.
    fn library_fail(&mut self, _reason: &str) {}
    fn library_leave(&mut self) {}

    /// A contiguous run of tests sharing `name` as their suite is about to
    /// start (tests are grouped by suite in declaration order, mirroring
    /// `MuLogger::suite_enter`/`suite_leave`).
    fn suite_enter(&mut self, _name: &str) {}
    fn suite_leave(&mut self) {}

    fn test_enter(&mut self, _test: &TestDescriptor) {}
    /// Forwards one log event emitted by a running test, subject to
    /// [`Logger::max_log_level`] filtering upstream (§4.K, §8 "Log-level
    /// ceiling").
    fn test_log(&mut self, test: &TestDescriptor, event: &LogEvent);
    fn test_leave(&mut self, test: &TestDescriptor, result: &TestResult);

    /// The most verbose [`LogLevel`] this logger wants forwarded to it.
    /// Read once per dispatched test by [`crate::dispatcher::dispatch`] and
    /// handed to the [`crate::token::Token`] it builds, which filters its
    /// own `log`/`event` calls against the ceiling before anything is even
    /// marshalled (§4.K); the default accepts everything.
    fn max_log_level(&self) -> LogLevel {
        LogLevel::Trace
    }

    /// Sets a named configuration value on this logger (mirrors
    /// `Mu_Logger_SetOption`). Unrecognized names are ignored; a logger
    /// with nothing configurable need not override this.
    fn set(&mut self, _name: &str, _value: LoggerOption) {}

    /// Reads back a named configuration value previously set through
    /// [`Logger::set`], or this logger's own default for `name` if it has
    /// one (mirrors `Mu_Logger_Get`/`Mu_Logger_OptionType`).
    fn get(&self, _name: &str) -> Option<LoggerOption> {
        None
    }
}

/// A [`Logger`] that discards everything. Useful as a default when a
/// caller only wants the returned [`TestResult`] and does not care about
/// intermediate log events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLogger;

impl Logger for NullLogger {
    fn test_log(&mut self, _test: &TestDescriptor, _event: &LogEvent) {}
    fn test_leave(&mut self, _test: &TestDescriptor, _result: &TestResult) {}
}

/// Builds the canned "unexpected termination" result the dispatcher falls
/// back to when a child vanishes without ever sending a proper result and
/// wait status does not explain why (mirrors `unixharness_dispatch`'s final
/// `else` branch).
pub fn unexpected_termination() -> TestResult {
    TestResult {
        status: TestStatus::Failure,
        expected: TestStatus::Success,
        stage: Stage::Unknown,
        reason: Some("unexpected termination".to_string()),
        file: None,
        line: 0,
        backtrace: Vec::new(),
    }
}

/// Builds the result for a child killed by a signal with no prior crash
/// report (mirrors the `WIFSIGNALED(status)` branch).
pub fn killed_by_signal(signal_name: &str) -> TestResult {
    TestResult {
        status: TestStatus::Crash,
        expected: TestStatus::Success,
        stage: Stage::Unknown,
        reason: Some(signal_name.to_string()),
        file: None,
        line: 0,
        backtrace: Vec::new(),
    }
}

/// Builds the result for a dispatch whose deadline elapsed before a result
/// arrived (mirrors the `UIPC_TIMEOUT` branch; the original's message used
/// the fixed `timeout` in milliseconds, reproduced here from
/// [`crate::config::EngineConfig`]).
pub fn timed_out(timeout: std::time::Duration) -> TestResult {
    TestResult {
        status: TestStatus::Timeout,
        expected: TestStatus::Success,
        stage: Stage::Unknown,
        reason: Some(format!(
            "test timed out after {} milliseconds",
            timeout.as_millis()
        )),
        file: None,
        line: 0,
        backtrace: Vec::new(),
    }
}

/// Stamps a declared expectation onto an observed result (§3 "Test
/// result", §7 "Test outcomes"). `status` is always left as the raw
/// observed outcome; only `expected` changes. A result whose `status`
/// equals its `expected` is a pass from the caller's perspective, whatever
/// that shared value is -- the comparison is made by whoever consumes the
/// result (a logger, a report, `§8`'s testable properties), not by this
/// function rewriting `status` itself.
pub fn apply_expectation(observed: TestResult, expected: Option<TestStatus>) -> TestResult {
    TestResult {
        expected: expected.unwrap_or(TestStatus::Success),
        ..observed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(status: TestStatus) -> TestResult {
        TestResult {
            status,
            expected: TestStatus::Success,
            stage: Stage::Test,
            reason: None,
            file: None,
            line: 0,
            backtrace: Vec::new(),
        }
    }

    #[test]
    fn declared_expectation_is_stamped_without_touching_status() {
        let observed = result(TestStatus::Crash);
        let classified = apply_expectation(observed, Some(TestStatus::Crash));
        assert_eq!(classified.status, TestStatus::Crash);
        assert_eq!(classified.expected, TestStatus::Crash);
    }

    #[test]
    fn mismatched_expectation_leaves_status_as_observed() {
        let observed = result(TestStatus::Assertion);
        let classified = apply_expectation(observed, Some(TestStatus::Crash));
        assert_eq!(classified.status, TestStatus::Assertion);
        assert_eq!(classified.expected, TestStatus::Crash);
    }

    #[test]
    fn no_expectation_defaults_to_success() {
        let observed = result(TestStatus::Failure);
        let classified = apply_expectation(observed, None);
        assert_eq!(classified.status, TestStatus::Failure);
        assert_eq!(classified.expected, TestStatus::Success);
    }
}
