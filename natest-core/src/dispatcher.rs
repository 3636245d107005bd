// Copyright 2021-Present natest authors
// SPDX-License-Identifier: Apache-2.0

//! The dispatcher (§4.G): forks a child, wires up its [`ForkToken`], runs a
//! test's fixture setup/body/fixture teardown, and supervises the child
//! from the parent side until a result arrives, the deadline elapses, or
//! the child vanishes. Library-level setup/teardown bracket the whole run
//! rather than one dispatch and live in [`crate::runner`] instead. Mirrors
//! `unixharness_dispatch` end to end, plus an in-process path
//! (`unixharness_debug`'s role, generalized per §4.F/§4.I) for
//! `EngineConfig::debug_mode`.

use crate::config::EngineConfig;
use crate::descriptor::Test;
use crate::error::{DispatchError, SpawnError};
use crate::result::{self, Logger, LogLevel, TestResult};
use crate::signals::{self, ChildOutcome};
use crate::token::{self, ForkToken, InProcessToken, Token};
use natest_ipc::error::TransportError;
use natest_ipc::marshal::SegmentLayout;
use natest_ipc::message::PayloadKind;
use natest_ipc::protocol::{EventPayload, ResultPayload, Stage};
use natest_ipc::{Channel, Deadline};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::sys::wait::WaitStatus;
use nix::unistd::{fork, ForkResult, Pid};
use std::io::Write;
use std::os::unix::net::UnixStream;

/// Runs one test, choosing fork isolation or in-process execution per
/// `config.debug_mode` (§4.I).
pub fn dispatch(
    test: &Test,
    config: &EngineConfig,
    logger: &mut dyn Logger,
) -> Result<TestResult, DispatchError> {
    if config.debug_mode {
        Ok(run_in_process(test, config, logger))
    } else {
        run_forked(test, config, logger)
    }
}

/// The public, caller-facing entry point for running a single test (§4.J):
/// same behavior as [`dispatch`], wrapped in `anyhow::Result` because a
/// caller at this altitude wants a formatted error chain to report, not a
/// variant to match on. Code that does need to match a specific failure
/// (the dispatcher's own retry/timeout logic, `iteration::run_iterations`)
/// stays on [`dispatch`]'s `DispatchError`.
pub fn run_test(
    test: &Test,
    config: &EngineConfig,
    logger: &mut dyn Logger,
) -> anyhow::Result<TestResult> {
    Ok(dispatch(test, config, logger)?)
}

/// In-process execution (§4.F, §4.I): no fork, no IPC. A test's terminal
/// call unwinds back to here via `catch_unwind`, replacing the original's
/// total absence of a return path in `unixharness_debug` (which only ever
/// `exit(0)`'d from the forked debug child; there was nothing for a
/// caller to resume into). A genuine Rust panic -- a test bug, not a
/// reported result -- is classified as a plain failure rather than
/// propagated, so one bad test cannot take the whole run down.
fn run_in_process(test: &Test, config: &EngineConfig, logger: &mut dyn Logger) -> TestResult {
    let mut token = InProcessToken::with_log_level(logger.max_log_level());
    token::clear_current_expectation();

    let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        token::set_current_stage(Stage::FixtureSetup);
        if let Some(setup) = &test.setup {
            (setup)(&mut token);
        }
        token::set_current_stage(Stage::Test);
        (test.run)(&mut token);
        token::set_current_stage(Stage::FixtureTeardown);
        if let Some(teardown) = &test.teardown {
            (teardown)(&mut token);
        }
        token.success();
    }));

    let result = match caught {
        Err(payload) => match payload.downcast::<crate::token::DebugUnwind>() {
            Ok(unwind) => unwind.0,
            Err(payload) => result::TestResult {
                status: result::TestStatus::Failure,
                expected: result::TestStatus::Success,
                stage: token::current_stage(),
                reason: Some(describe_panic(payload.as_ref())),
                file: None,
                line: 0,
                backtrace: Vec::new(),
            },
        },
        // The closure's tail call is `token.success()`, which never
        // returns; the only way `catch_unwind` reaches `Ok` here is if
        // that stopped being true.
        Ok(_) => unreachable!("in-process token always unwinds"),
    };

    logger.test_enter(&test.descriptor);
    for event in token.into_events() {
        logger.test_log(&test.descriptor, &event);
    }
    logger.test_leave(&test.descriptor, &result);
    result
}

fn describe_panic(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "test panicked with a non-string payload".to_string()
    }
}

/// Fork-isolated execution (§4.E, §4.G, §4.H): mirrors
/// `unixharness_dispatch`.
fn run_forked(
    test: &Test,
    config: &EngineConfig,
    logger: &mut dyn Logger,
) -> Result<TestResult, DispatchError> {
    // Mirrors the original's `fflush(NULL)`: without this, buffered writes
    // from before the fork can be flushed a second time by the child on
    // its own exit, producing duplicated output.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    let (parent_fd, child_fd) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::empty(),
    )
    .map_err(SpawnError::SocketPair)?;

    // Read once, before the fork, so the child doesn't need a reference
    // to `logger` (the parent keeps exclusive use of its own copy).
    let max_log_level = logger.max_log_level();

    // Safety: no other threads are created by this crate, so the fork has
    // no risk of deadlocking on a lock held by a thread that didn't
    // survive into the child.
    match unsafe { fork() }.map_err(SpawnError::Fork)? {
        ForkResult::Child => {
            drop(parent_fd);
            child_main(test, config, max_log_level, UnixStream::from(child_fd));
        }
        ForkResult::Parent { child } => {
            drop(child_fd);
            log::debug!(target: "natest", "{}: forked pid {child}", test.descriptor);
            parent_main(child, test, config, UnixStream::from(parent_fd), logger)
        }
    }
}

/// Runs in the forked child; never returns.
fn child_main(
    test: &Test,
    config: &EngineConfig,
    max_log_level: LogLevel,
    socket: UnixStream,
) -> ! {
    let channel = Channel::new(socket).expect("a freshly created socketpair fd is always usable");
    let deadline = Deadline::after(config.timeout + config.timeout_grace);
    let mut tok = ForkToken::with_log_level(channel, deadline, config.segment_size, max_log_level);

    // Safety: `tok` owns its channel in a `Box`, which keeps its address
    // stable for exactly as long as `_guard` is held, and `tok` is not
    // moved again after this point.
    let _guard = unsafe { signals::install(tok.channel_ptr(), config.segment_size) };

    token::clear_current_expectation();
    token::set_current_stage(Stage::FixtureSetup);
    if let Some(setup) = &test.setup {
        (setup)(&mut tok);
    }
    token::set_current_stage(Stage::Test);
    (test.run)(&mut tok);
    token::set_current_stage(Stage::FixtureTeardown);
    if let Some(teardown) = &test.teardown {
        (teardown)(&mut tok);
    }
    // Mirrors the original's unconditional trailing `test->methods->success(test)`:
    // a test (or fixture) that never called a terminal token method is
    // simply a pass.
    tok.success();
}

/// Runs on the parent side of the fork; supervises the child until a
/// result arrives, the deadline elapses, or the channel closes.
fn parent_main(
    pid: Pid,
    test: &Test,
    config: &EngineConfig,
    socket: UnixStream,
    logger: &mut dyn Logger,
) -> Result<TestResult, DispatchError> {
    let mut channel = Channel::new(socket)
        .map_err(|e| DispatchError::Transport(TransportError::Io(e.to_string())))?;
    let mut deadline = Deadline::after(config.timeout);

    logger.test_enter(&test.descriptor);

    let mut received_result = None;
    let mut timed_out = false;
    let mut sent_term = false;

    loop {
        match channel.wait_recv(deadline) {
            Ok(message) => match message.kind {
                PayloadKind::Event => {
                    let event = EventPayload::unmarshal(&message.segment, message.payload)?;
                    logger.test_log(&test.descriptor, &event);
                }
                PayloadKind::Expect => {
                    // Informational: the child has already applied the
                    // expectation to the result it will eventually send.
                    // Nothing for the parent to do before that arrives.
                }
                PayloadKind::Timeout => {
                    // The test overrode its own budget via
                    // `Token::set_timeout` (§4.I); move the supervising
                    // deadline to match so the parent does not kill a
                    // child the test itself asked for more time for.
                    let payload =
                        natest_ipc::protocol::TimeoutPayload::unmarshal(&message.segment, message.payload)?;
                    deadline = Deadline::after(std::time::Duration::from_millis(u64::from(
                        payload.millis,
                    )));
                }
                PayloadKind::Iterations => {
                    // Informational only on this side: iteration looping
                    // is driven by `crate::iteration::run_iterations`, one
                    // dispatch at a time, not by anything the parent does
                    // mid-dispatch.
                }
                PayloadKind::Result => {
                    received_result =
                        Some(ResultPayload::unmarshal(&message.segment, message.payload)?);
                    break;
                }
            },
            Err(TransportError::Eof) => break,
            Err(TransportError::Timeout) => {
                timed_out = true;
                log::warn!(target: "natest", "{}: deadline expired", test.descriptor);
                // First timeout (§4.G step 5): ask the child to shut down
                // cooperatively and give it one more short window to send a
                // result before this escalates to SIGKILL below. A second
                // timeout after that grace window is final.
                if !sent_term {
                    sent_term = true;
                    signals::terminate(pid);
                    deadline = Deadline::after(config.timeout_grace);
                    continue;
                }
                break;
            }
            Err(other) => return Err(other.into()),
        }
    }

    // Best-effort: let a just-sent result's ack go out even if we're
    // about to report a timeout, so the child can exit cleanly instead of
    // blocking on `wait_done` itself.
    let _ = channel.wait_done(Deadline::after(config.timeout_grace));

    let reap = |e: nix::Error| DispatchError::Reap {
        pid: pid.as_raw(),
        source: e,
    };
    let wait_status = if timed_out {
        Some(signals::kill_and_reap(pid, config).map_err(reap)?)
    } else {
        match signals::wait_for_child(pid, Deadline::after(config.timeout_grace)).map_err(reap)? {
            ChildOutcome::Exited(status) => Some(status),
            ChildOutcome::TimedOut => Some(signals::kill_and_reap(pid, config).map_err(reap)?),
        }
    };

    // §4.G step 5: once the deadline has lapsed, the outcome is `Timeout`
    // even if the child's own `SIGTERM` handler raced to send a result in
    // the grace window (it would report `Crash`, not the budget the test
    // actually blew) -- a synthesized timeout always wins over whatever the
    // child managed to say for itself.
    let outcome = if timed_out {
        result::timed_out(config.timeout)
    } else {
        match received_result {
            Some(result) => result,
            None => classify_missing_result(wait_status),
        }
    };

    logger.test_leave(&test.descriptor, &outcome);
    Ok(outcome)
}

/// Builds a result when the child never sent one and we didn't time out
/// either -- it must have died some other way. Mirrors the final `else`
/// branch of `unixharness_dispatch`.
fn classify_missing_result(wait_status: Option<WaitStatus>) -> TestResult {
    match wait_status {
        Some(WaitStatus::Signaled(_, signal, _)) => {
            log::debug!(target: "natest", "child exited without a result, killed by {signal}");
            result::killed_by_signal(&signal.to_string())
        }
        other => {
            log::debug!(target: "natest", "child exited without a result: {other:?}");
            result::unexpected_termination()
        }
    }
}
