// Copyright 2021-Present natest authors
// SPDX-License-Identifier: Apache-2.0

//! Structured diagnostic logging for the engine itself (§4.K), as distinct
//! from [`crate::result::LogEvent`] (a *test's* log output, carried over
//! the wire and handed to a [`crate::result::Logger`]).
//!
//! Uses the `log` facade, matching `ddcommon`'s own dependency choice
//! (`tracing` appears only in `datadog-ipc`'s dev-dependencies/benches in
//! the teacher workspace, never in its runtime logging path) rather than
//! pulling in a heavier structured-logging stack the corpus doesn't
//! otherwise reach for.

use crate::descriptor::TestDescriptor;
use crate::result::{Logger, TestResult, TestStatus};
use natest_ipc::protocol::LogLevel as TestLogLevel;

/// A [`Logger`] that reports every result and event through the `log`
/// facade, at a level derived from the outcome. Intended as the default
/// wiring for a binary that has not set up its own reporter (§1
/// "Non-goals" excludes reporting formats; this is diagnostics, not a
/// report).
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvLogger;

impl Logger for EnvLogger {
    fn library_enter(&mut self, path: &str) {
        log::info!(target: "natest", "{path}: loading");
    }

    fn library_fail(&mut self, reason: &str) {
        log::error!(target: "natest", "library failed: {reason}");
    }

    fn suite_enter(&mut self, name: &str) {
        log::debug!(target: "natest", "suite {name}: starting");
    }

    fn test_leave(&mut self, test: &TestDescriptor, result: &TestResult) {
        match result.status {
            TestStatus::Success => {
                log::info!(target: "natest", "{test}: success");
            }
            TestStatus::Skipped => {
                log::info!(target: "natest", "{test}: skipped");
            }
            TestStatus::Failure | TestStatus::Assertion | TestStatus::Exception => {
                log::warn!(
                    target: "natest",
                    "{test}: {:?}{}",
                    result.status,
                    result
                        .reason
                        .as_deref()
                        .map(|r| format!(" -- {r}"))
                        .unwrap_or_default()
                );
            }
            TestStatus::Crash | TestStatus::Timeout => {
                log::error!(
                    target: "natest",
                    "{test}: {:?}{}",
                    result.status,
                    result
                        .reason
                        .as_deref()
                        .map(|r| format!(" -- {r}"))
                        .unwrap_or_default()
                );
            }
        }
    }

    fn test_log(&mut self, test: &TestDescriptor, event: &crate::result::LogEvent) {
        let message = event.message.as_deref().unwrap_or_default();
        match event.level {
            TestLogLevel::Warning => log::warn!(target: "natest", "{test}: {message}"),
            TestLogLevel::Info => log::info!(target: "natest", "{test}: {message}"),
            TestLogLevel::Verbose => log::debug!(target: "natest", "{test}: {message}"),
            TestLogLevel::Debug => log::debug!(target: "natest", "{test}: {message}"),
            TestLogLevel::Trace => log::trace!(target: "natest", "{test}: {message}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::Stage;

    #[test]
    fn result_logging_does_not_panic_for_every_status() {
        let test = TestDescriptor {
            suite: "s".to_string(),
            name: "t".to_string(),
            file: "f.rs".to_string(),
            line: 1,
        };
        let mut logger = EnvLogger;
        for status in [
            TestStatus::Success,
            TestStatus::Failure,
            TestStatus::Assertion,
            TestStatus::Crash,
            TestStatus::Timeout,
            TestStatus::Exception,
            TestStatus::Skipped,
        ] {
            logger.test_leave(
                &test,
                &TestResult {
                    status,
                    expected: TestStatus::Success,
                    stage: Stage::Test,
                    reason: Some("detail".to_string()),
                    file: None,
                    line: 1,
                    backtrace: Vec::new(),
                },
            );
        }
    }
}
