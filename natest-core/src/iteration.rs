// Copyright 2021-Present natest authors
// SPDX-License-Identifier: Apache-2.0

//! Iteration policy and the in-process/fork mode choice (§4.I).
//!
//! The original had exactly two standalone entry points into a harness:
//! `unixharness_dispatch` (fork, isolate, time out) and `unixharness_debug`
//! (fork once, then block in `select(0, NULL, NULL, NULL, NULL)` so a
//! debugger had time to attach before the test ran). SPEC_FULL.md §4.I
//! folds both into one policy object so a caller configures "how many
//! times" and "isolated or not" independently rather than picking between
//! two hardcoded functions.

use crate::config::EngineConfig;
use crate::descriptor::Test;
use crate::dispatcher;
use crate::result::{Logger, TestResult, TestStatus};

/// Outcome of running a test for as many iterations as the policy calls
/// for (§4.I "iterate until failure or count reached").
#[derive(Debug, Clone)]
pub struct IterationOutcome {
    /// The result of the last iteration run (the one that stopped the
    /// loop, whether by failing or by being the final requested
    /// iteration).
    pub result: TestResult,
    /// How many iterations actually ran before stopping.
    pub ran: u32,
}

/// Runs `test` up to `config.iterations` times, stopping early at the
/// first non-`Success` result. Mirrors no single function in the original
/// (it had no iteration concept at all) but composes directly on top of
/// [`dispatcher::dispatch`], which already picks fork vs. in-process mode
/// from `config.debug_mode`.
pub fn run_iterations(
    test: &Test,
    config: &EngineConfig,
    logger: &mut dyn Logger,
) -> Result<IterationOutcome, crate::error::DispatchError> {
    let total = config.iterations.max(1);
    let mut last = None;
    let mut ran = 0;

    for index in 1..=total {
        let result = dispatcher::dispatch(test, config, logger)?;
        ran = index;
        // §4.G / §8 "iteration until failure": stop as soon as a run's
        // status no longer matches what it declared itself to expect (a
        // plain pass is just the `Success == Success` case of this), or the
        // run reported itself skipped outright.
        let stop = result.status != result.expected
            || result.status == TestStatus::Skipped
            || index == total;
        last = Some(result);
        if stop {
            break;
        }
    }

    Ok(IterationOutcome {
        result: last.expect("loop runs at least once since `total >= 1`"),
        ran,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::TestDescriptor;
    use crate::result::NullLogger;
    use crate::token::Token;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn descriptor(name: &str) -> TestDescriptor {
        TestDescriptor {
            suite: "iteration".to_string(),
            name: name.to_string(),
            file: "iteration.rs".to_string(),
            line: 0,
        }
    }

    #[test]
    fn stops_at_first_failure_in_debug_mode() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_for_closure = calls.clone();
        let test = Test {
            descriptor: descriptor("flaky"),
            setup: None,
            run: Arc::new(move |token: &mut dyn Token| {
                let n = calls_for_closure.fetch_add(1, Ordering::SeqCst);
                if n >= 2 {
                    token.fail("f.rs", 1, format_args!("boom on iteration {n}"));
                } else {
                    token.success();
                }
            }),
            teardown: None,
        };

        let config = EngineConfig {
            debug_mode: true,
            iterations: 10,
            ..EngineConfig::default()
        };
        let mut logger = NullLogger;
        let outcome = run_iterations(&test, &config, &mut logger).unwrap();
        assert_eq!(outcome.ran, 3);
        assert_eq!(outcome.result.status, TestStatus::Failure);
    }

    #[test]
    fn runs_exactly_once_by_default() {
        let test = Test {
            descriptor: descriptor("plain"),
            setup: None,
            run: Arc::new(|token: &mut dyn Token| token.success()),
            teardown: None,
        };
        let config = EngineConfig {
            debug_mode: true,
            ..EngineConfig::default()
        };
        let mut logger = NullLogger;
        let outcome = run_iterations(&test, &config, &mut logger).unwrap();
        assert_eq!(outcome.ran, 1);
        assert_eq!(outcome.result.status, TestStatus::Success);
    }
}
