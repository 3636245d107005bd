// Copyright 2021-Present natest authors
// SPDX-License-Identifier: Apache-2.0

//! End-to-end coverage of one dispatch at a time, through real `fork()` and
//! real signals where that is the whole point of the scenario (crash,
//! timeout), and through the in-process path where a fork only adds noise
//! (plain pass, assertion failure, fixture teardown failure, iteration
//! policy, log-level ceiling).

#![cfg(unix)]

use natest_core::config::EngineConfig;
use natest_core::descriptor::{Test, TestDescriptor};
use natest_core::result::{LogEvent, Logger, NullLogger, Stage, TestResult, TestStatus};
use natest_core::token::Token;
use natest_core::{dispatch, run_iterations};
use natest_ipc::protocol::LogLevel;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

fn descriptor(name: &str) -> TestDescriptor {
    TestDescriptor {
        suite: "scenarios".to_string(),
        name: name.to_string(),
        file: "dispatch_scenarios.rs".to_string(),
        line: 0,
    }
}

#[test]
fn plain_pass_reports_success_in_the_test_stage() {
    let test = Test {
        descriptor: descriptor("plain_pass"),
        setup: None,
        run: Arc::new(|token: &mut dyn Token| token.success()),
        teardown: None,
    };
    let config = EngineConfig::default();
    let mut logger = NullLogger;
    let result = dispatch(&test, &config, &mut logger).unwrap();
    assert_eq!(result.status, TestStatus::Success);
    assert_eq!(result.stage, Stage::Test);
    assert_eq!(result.reason, None);
}

#[test]
fn assertion_failure_reports_file_line_and_reason() {
    let test = Test {
        descriptor: descriptor("assertion_failure"),
        setup: None,
        run: Arc::new(|token: &mut dyn Token| {
            token.assert(1 + 1 == 3, true, "1+1==3", "f.c", 42);
        }),
        teardown: None,
    };
    let config = EngineConfig::default();
    let mut logger = NullLogger;
    let result = dispatch(&test, &config, &mut logger).unwrap();
    assert_eq!(result.status, TestStatus::Assertion);
    assert_eq!(result.stage, Stage::Test);
    assert_eq!(result.file.as_deref(), Some("f.c"));
    assert_eq!(result.line, 42);
    assert!(result.reason.unwrap().contains("1+1==3"));
}

#[test]
fn null_pointer_dereference_is_reported_as_a_crash() {
    let test = Test {
        descriptor: descriptor("crash"),
        setup: None,
        run: Arc::new(|_token: &mut dyn Token| {
            let p: *const i32 = std::ptr::null();
            // Safety: deliberately undefined behavior -- this is the whole
            // point of the test, run fork-isolated precisely so it cannot
            // take the test process down with it.
            unsafe {
                std::ptr::read_volatile(p);
            }
        }),
        teardown: None,
    };
    let config = EngineConfig::default();
    let mut logger = NullLogger;
    let result = dispatch(&test, &config, &mut logger).unwrap();
    assert_eq!(result.status, TestStatus::Crash);
}

#[test]
fn expected_crash_is_a_pass() {
    let test = Test {
        descriptor: descriptor("expected_crash"),
        setup: None,
        run: Arc::new(|token: &mut dyn Token| {
            token.set_expectation(TestStatus::Crash);
            let p: *const i32 = std::ptr::null();
            unsafe {
                std::ptr::read_volatile(p);
            }
        }),
        teardown: None,
    };
    let config = EngineConfig::default();
    let mut logger = NullLogger;
    let result = dispatch(&test, &config, &mut logger).unwrap();
    // §8 "Expected crash": `status` stays the raw observed outcome; it is
    // `status == expected` that makes this a pass, not a rewrite of `status`
    // itself (see `result::apply_expectation`).
    assert_eq!(result.status, TestStatus::Crash);
    assert_eq!(result.expected, TestStatus::Crash);
}

#[test]
fn timeout_kills_the_child_and_reports_timeout() {
    let test = Test {
        descriptor: descriptor("timeout"),
        setup: None,
        run: Arc::new(|_token: &mut dyn Token| {
            std::thread::sleep(std::time::Duration::from_secs(10));
        }),
        teardown: None,
    };
    let config = EngineConfig {
        timeout: std::time::Duration::from_millis(200),
        ..EngineConfig::default()
    };
    let mut logger = NullLogger;
    let result = dispatch(&test, &config, &mut logger).unwrap();
    assert_eq!(result.status, TestStatus::Timeout);
    assert!(result.reason.unwrap().contains("200"));
}

#[test]
fn fixture_teardown_failure_after_test_pass_reports_teardown_stage() {
    let test = Test {
        descriptor: descriptor("teardown_fails"),
        setup: None,
        run: Arc::new(|token: &mut dyn Token| token.success()),
        teardown: Some(Arc::new(|token: &mut dyn Token| {
            token.fail("fixture.c", 9, format_args!("bad cleanup"));
        })),
    };
    let config = EngineConfig::default();
    let mut logger = NullLogger;
    let result = dispatch(&test, &config, &mut logger).unwrap();
    assert_eq!(result.status, TestStatus::Failure);
    assert_eq!(result.stage, Stage::FixtureTeardown);
    assert_eq!(result.reason.as_deref(), Some("bad cleanup"));
}

#[test]
fn iteration_stops_at_first_failure_not_at_the_configured_count() {
    let calls = Arc::new(AtomicU32::new(0));
    let calls_for_closure = calls.clone();
    let test = Test {
        descriptor: descriptor("flaky"),
        setup: None,
        run: Arc::new(move |token: &mut dyn Token| {
            let n = calls_for_closure.fetch_add(1, Ordering::SeqCst) + 1;
            if n == 3 {
                token.fail("loader.c", 1, format_args!("failed on call {n}"));
            } else {
                token.success();
            }
        }),
        teardown: None,
    };
    let config = EngineConfig {
        debug_mode: true,
        iterations: 5,
        ..EngineConfig::default()
    };
    let mut logger = NullLogger;
    let outcome = run_iterations(&test, &config, &mut logger).unwrap();
    assert_eq!(outcome.ran, 3);
    assert_eq!(outcome.result.status, TestStatus::Failure);
}

struct RecordingLogger {
    test_logs: Mutex<Vec<LogEvent>>,
    max_log_level: LogLevel,
}

impl Logger for RecordingLogger {
    fn test_log(&mut self, _test: &TestDescriptor, event: &LogEvent) {
        self.test_logs.lock().unwrap().push(event.clone());
    }
    fn test_leave(&mut self, _test: &TestDescriptor, _result: &TestResult) {}
    fn max_log_level(&self) -> LogLevel {
        self.max_log_level
    }
}

#[test]
fn log_level_ceiling_drops_events_above_the_configured_level() {
    let test = Test {
        descriptor: descriptor("verbose"),
        setup: None,
        run: Arc::new(|token: &mut dyn Token| {
            token.event(LogLevel::Trace, "f.c", 1, format_args!("x"));
            token.success();
        }),
        teardown: None,
    };
    let config = EngineConfig {
        debug_mode: true,
        ..EngineConfig::default()
    };
    let mut logger = RecordingLogger {
        test_logs: Mutex::new(Vec::new()),
        max_log_level: LogLevel::Info,
    };
    let result = dispatch(&test, &config, &mut logger).unwrap();
    assert_eq!(result.status, TestStatus::Success);
    assert!(logger.test_logs.lock().unwrap().is_empty());
}
