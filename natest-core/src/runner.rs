// Copyright 2021-Present natest authors
// SPDX-License-Identifier: Apache-2.0

//! Library-level orchestration (§4.G step 1, §6): the one entry point that
//! ties a [`Loader`] to a [`Logger`] and an [`EngineConfig`] and actually
//! runs every test. Mirrors the outer loop `unixharness`'s `main` used to
//! drive `MuLibrary`/`MuSuite`/`MuTest` in declaration order -- load the
//! library, run its one-time setup, walk its tests grouped by suite,
//! run its one-time teardown.

use crate::config::EngineConfig;
use crate::descriptor::{LibraryHandle, Loader, Test, TestDescriptor};
use crate::iteration;
use crate::result::{Logger, TestResult};
use crate::token::InProcessToken;

/// One test's final outcome, paired back up with its descriptor since
/// [`iteration::run_iterations`] only returns the last iteration's result.
pub struct TestOutcome {
    pub descriptor: TestDescriptor,
    pub result: TestResult,
    pub iterations_ran: u32,
}

/// Top-level entry point (§6 "Loader"): resolves `path` via
/// [`Loader::open`], runs every test in the resulting library via
/// [`run_library`], then releases it via [`Loader::close`] regardless of
/// how the run went. Most callers that already hold a [`LibraryHandle`]
/// (e.g. the integration tests in `tests/dispatch_scenarios.rs`, which
/// build one directly with no real `open` behind it) can skip straight to
/// [`run_library`] instead.
pub fn run(
    path: &str,
    loader: &dyn Loader,
    config: &EngineConfig,
    logger: &mut dyn Logger,
) -> anyhow::Result<Vec<TestOutcome>> {
    let handle = match loader.open(path) {
        Ok(handle) => handle,
        Err(err) => {
            logger.library_enter(path);
            logger.library_fail(&err.to_string());
            logger.library_leave();
            return Ok(Vec::new());
        }
    };
    let outcomes = run_library(&handle, loader, config, logger);
    loader.close(handle);
    outcomes
}

/// Runs every test a [`Loader`] resolves for `handle`, grouped by suite in
/// the order the loader returned them (mirrors the original's
/// declaration-order iteration -- there is no sorting or filtering here,
/// see §1 "Non-goals" for test selection/filtering).
///
/// If `library_setup` panics or the loader has none to offer and a caller
/// still wants no tests to run without one, that is the loader's call to
/// make by simply returning no tests; this function does not second-guess
/// it. A `library_setup` that panics is caught here and reported through
/// [`Logger::library_fail`] -- no test in the library gets to run, mirroring
/// `unixharness`'s fatal-error-on-library-setup-failure behavior.
pub fn run_library(
    handle: &LibraryHandle,
    loader: &dyn Loader,
    config: &EngineConfig,
    logger: &mut dyn Logger,
) -> anyhow::Result<Vec<TestOutcome>> {
    logger.library_enter(&handle.path);

    let mut construct_token = InProcessToken::new();
    if let Err(err) = loader.construct(handle, &mut construct_token) {
        logger.library_fail(&err.to_string());
        logger.library_leave();
        return Ok(Vec::new());
    }

    if let Some(setup) = loader.library_setup(handle) {
        let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| (setup)()));
        if let Err(payload) = caught {
            logger.library_fail(&describe_panic(payload.as_ref()));
            logger.library_leave();
            return Ok(Vec::new());
        }
    }

    let tests = loader.tests(handle);
    let mut outcomes = Vec::with_capacity(tests.len());

    for suite in group_by_suite(&tests) {
        logger.suite_enter(&suite.name);
        for test in suite.tests {
            let outcome = iteration::run_iterations(test, config, logger)?;
            outcomes.push(TestOutcome {
                descriptor: test.descriptor.clone(),
                result: outcome.result,
                iterations_ran: outcome.ran,
            });
        }
        logger.suite_leave();
    }

    if let Some(teardown) = loader.library_teardown(handle) {
        let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| (teardown)()));
        if let Err(payload) = caught {
            logger.library_fail(&describe_panic(payload.as_ref()));
        }
    }

    let mut destruct_token = InProcessToken::new();
    if let Err(err) = loader.destruct(handle, &mut destruct_token) {
        logger.library_fail(&err.to_string());
    }

    logger.library_leave();
    Ok(outcomes)
}

struct Suite<'a> {
    name: String,
    tests: Vec<&'a Test>,
}

/// Groups `tests` into contiguous runs of equal `suite`, preserving the
/// loader's own order rather than sorting -- a suite split across two
/// non-adjacent ranges (an unusual loader) produces two separate groups
/// here rather than being merged, matching how the original walked its
/// `MuSuite` linked list strictly in registration order.
fn group_by_suite(tests: &[Test]) -> Vec<Suite<'_>> {
    let mut suites: Vec<Suite<'_>> = Vec::new();
    for test in tests {
        match suites.last_mut() {
            Some(last) if last.name == test.descriptor.suite => last.tests.push(test),
            _ => suites.push(Suite {
                name: test.descriptor.suite.clone(),
                tests: vec![test],
            }),
        }
    }
    suites
}

fn describe_panic(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "library setup/teardown panicked with a non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::TestDescriptor;
    use crate::result::{NullLogger, TestStatus};
    use crate::token::Token;
    use std::sync::Arc;

    struct FixedLoader {
        tests: Vec<Test>,
    }

    impl Loader for FixedLoader {
        fn tests(&self, _library: &LibraryHandle) -> Vec<Test> {
            self.tests.clone()
        }
        fn library_setup(&self, _library: &LibraryHandle) -> Option<crate::descriptor::LibraryThunk> {
            None
        }
        fn library_teardown(&self, _library: &LibraryHandle) -> Option<crate::descriptor::LibraryThunk> {
            None
        }
    }

    fn passing_test(suite: &str, name: &str) -> Test {
        Test {
            descriptor: TestDescriptor {
                suite: suite.to_string(),
                name: name.to_string(),
                file: "runner.rs".to_string(),
                line: 0,
            },
            setup: None,
            run: Arc::new(|token: &mut dyn Token| token.success()),
            teardown: None,
        }
    }

    #[test]
    fn groups_contiguous_tests_by_suite() {
        let tests = vec![
            passing_test("a", "one"),
            passing_test("a", "two"),
            passing_test("b", "three"),
        ];
        let suites = group_by_suite(&tests);
        assert_eq!(suites.len(), 2);
        assert_eq!(suites[0].name, "a");
        assert_eq!(suites[0].tests.len(), 2);
        assert_eq!(suites[1].name, "b");
        assert_eq!(suites[1].tests.len(), 1);
    }

    #[test]
    fn runs_every_test_the_loader_returns() {
        let loader = FixedLoader {
            tests: vec![passing_test("s", "t1"), passing_test("s", "t2")],
        };
        let handle = LibraryHandle {
            path: "mem://test".to_string(),
        };
        let config = EngineConfig {
            debug_mode: true,
            ..EngineConfig::default()
        };
        let mut logger = NullLogger;
        let outcomes = run_library(&handle, &loader, &config, &mut logger).unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes
            .iter()
            .all(|o| o.result.status == TestStatus::Success));
    }
}
