// Copyright 2021-Present natest authors
// SPDX-License-Identifier: Apache-2.0

//! Crash detection (§4.H). The child side installs handlers for the
//! signals a misbehaving test is likely to raise (mirrors
//! `unixharness_dispatch`'s `signal(SIGSEGV, ...)` /`SIGPIPE`/`SIGFPE`/
//! `SIGABRT` registrations, extended per SPEC_FULL.md §4.H with `SIGBUS`,
//! `SIGILL` and `SIGTERM`); the parent side waits for the child to exit
//! without racing a `SIGCHLD` handler, adapted from
//! `ddcommon::unix_utils::process::{reap_child_non_blocking,
//! wait_for_pollhup}`.
//!
//! Global, signal-safe state follows
//! `crashtracker::collector::crash_handler`'s `AtomicPtr`-boxing pattern:
//! a signal handler cannot take a lock or allocate through a closure
//! environment, so the channel it reports through is reached via a plain
//! atomic pointer rather than captured state.

use crate::config::EngineConfig;
use crate::result::{self, TestResult, TestStatus};
use crate::token::current_stage;
use natest_ipc::message::PayloadKind;
use natest_ipc::protocol::Frame;
use natest_ipc::{Channel, Deadline};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::os::fd::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicPtr, AtomicUsize, Ordering};
use std::time::Duration;

const SIGNALS: &[Signal] = &[
    Signal::SIGSEGV,
    Signal::SIGBUS,
    Signal::SIGILL,
    Signal::SIGFPE,
    Signal::SIGABRT,
    Signal::SIGPIPE,
    Signal::SIGTERM,
];

static CRASH_CHANNEL: AtomicPtr<Channel> = AtomicPtr::new(ptr::null_mut());
static SEGMENT_SIZE: AtomicUsize = AtomicUsize::new(2048);
/// pid of the process `install` was called in -- the one dispatch actually
/// forked and is waiting on a `Result` from. A handled signal can also land
/// in a grandchild the test itself forked (handler dispositions survive
/// `fork`); `0` means no handler is currently installed.
static DESIGNATED_PID: AtomicI32 = AtomicI32::new(0);

/// Installs crash handlers for the child side of a dispatch. `channel`
/// must outlive the guard returned; dropping the guard restores each
/// signal's previous disposition and clears the global pointer (mirrors
/// nothing in the original, which never uninstalled its handlers -- they
/// lived for the rest of the forked child's short life. The guard exists
/// here because `natest-core`, unlike the original forked-once-per-test
/// harness, may run many tests' worth of in-process iterations in one
/// signal-handling-capable process, see `crate::iteration`).
pub struct CrashGuard {
    previous: Vec<(Signal, SigAction)>,
}

/// # Safety
/// `channel` must point to a live, stable-address [`Channel`] (e.g. one
/// owned via `Box`) for as long as the returned guard is alive: the signal
/// handler dereferences the raw pointer stored in `CRASH_CHANNEL` without
/// synchronization other than the atomic itself.
pub unsafe fn install(channel: *mut Channel, segment_size: usize) -> CrashGuard {
    CRASH_CHANNEL.store(channel, Ordering::SeqCst);
    SEGMENT_SIZE.store(segment_size, Ordering::SeqCst);
    DESIGNATED_PID.store(std::process::id() as i32, Ordering::SeqCst);

    let action = SigAction::new(
        SigHandler::Handler(handle_crash_signal),
        SaFlags::SA_NODEFER,
        SigSet::empty(),
    );

    let mut previous = Vec::with_capacity(SIGNALS.len());
    for &sig in SIGNALS {
        // Safety: `action` has no context-sensitive state; installing a
        // handler for a listed signal is always valid.
        let old = signal::sigaction(sig, &action).expect("sigaction must succeed for a valid signal");
        previous.push((sig, old));
    }
    log::debug!(target: "natest", "crash handlers installed for {} signals", SIGNALS.len());
    CrashGuard { previous }
}

impl Drop for CrashGuard {
    fn drop(&mut self) {
        for (sig, old) in &self.previous {
            // Safety: `old` was returned by a prior `sigaction` call for
            // the same signal.
            unsafe {
                let _ = signal::sigaction(*sig, old);
            }
        }
        CRASH_CHANNEL.store(ptr::null_mut(), Ordering::SeqCst);
        DESIGNATED_PID.store(0, Ordering::SeqCst);
        log::debug!(target: "natest", "crash handlers restored");
    }
}

extern "C" fn handle_crash_signal(signum: libc::c_int) {
    // A signal disposition survives `fork`: if the test itself forked a
    // grandchild, that grandchild inherited this same handler. Only the
    // designated child -- the one `parent_main` is actually waiting on a
    // `Result` from -- gets to synthesize one; anything else reinstalls the
    // default disposition and re-raises, so the signal still kills the
    // grandchild the way it would have with no handler installed at all.
    let designated = DESIGNATED_PID.load(Ordering::SeqCst);
    if designated != 0 && unsafe { libc::getpid() } != designated {
        unsafe {
            libc::signal(signum, libc::SIG_DFL);
            libc::raise(signum);
        }
        return;
    }

    let reason = signal_description(signum);
    let result = TestResult {
        status: TestStatus::Crash,
        expected: TestStatus::Success,
        stage: current_stage(),
        reason: Some(reason),
        file: None,
        line: 0,
        backtrace: capture_backtrace(),
    };
    let classified = result::apply_expectation(result, crate::token::current_expectation());

    let channel_ptr = CRASH_CHANNEL.load(Ordering::SeqCst);
    if let Some(channel) = unsafe { channel_ptr.as_mut() } {
        let segment_size = SEGMENT_SIZE.load(Ordering::SeqCst);
        let deadline = Deadline::after(Duration::from_millis(500));
        if channel
            .queue_send(PayloadKind::Result, &classified, segment_size)
            .is_ok()
        {
            let _ = channel.wait_done(deadline);
        }
    }

    // Mirrors `terminate()` in `ddcommon::unix_utils::process`: exit
    // without running destructors or atexit handlers, which may be in an
    // inconsistent state after whatever just faulted.
    unsafe { libc::_exit(1) };
}

/// Stack frames beyond this are truncated; a runaway recursive crash should
/// not grow the result payload without bound.
const MAX_BACKTRACE_FRAMES: usize = 128;

/// Walks the stack at the point of the fault (§4.H, §8 "Crash"). Not
/// guaranteed async-signal-safe -- `backtrace` may allocate while resolving
/// symbols -- but a best-effort backtrace beats none, and there is only one
/// `Result` this handler will ever try to send.
fn capture_backtrace() -> Vec<Frame> {
    let mut frames = Vec::new();
    unsafe {
        backtrace::trace_unsynchronized(|frame| {
            let mut symbol = None;
            backtrace::resolve_frame_unsynchronized(frame, |sym| {
                if symbol.is_none() {
                    symbol = sym.name().map(|name| name.to_string());
                }
            });
            frames.push(Frame {
                symbol,
                address: frame.ip() as u64,
            });
            frames.len() < MAX_BACKTRACE_FRAMES
        });
    }
    frames
}

fn signal_description(signum: libc::c_int) -> String {
    // Safety: `strsignal` is documented async-signal-safe on Linux and
    // returns a pointer to a static string table; no allocation occurs
    // reading it.
    unsafe {
        let ptr = libc::strsignal(signum);
        if ptr.is_null() {
            format!("signal {signum}")
        } else {
            std::ffi::CStr::from_ptr(ptr)
                .to_string_lossy()
                .into_owned()
        }
    }
}

/// Outcome of waiting for a forked child to finish (§4.H, §4.G).
pub enum ChildOutcome {
    Exited(WaitStatus),
    TimedOut,
}

/// Waits for `pid` to exit or `deadline` to elapse, using a non-blocking
/// `waitpid(WNOHANG)` poll loop rather than a `SIGCHLD` handler: a
/// dispatcher running many tests in sequence must not let one test's
/// `SIGCHLD` registration race another's, and `WNOHANG` sidesteps that
/// entirely by never arming a handler in the first place. Adapted from
/// `ddcommon::unix_utils::process::reap_child_non_blocking`, generalized
/// from a hard error on timeout to a distinguishable outcome so callers
/// can still escalate to `SIGKILL` before giving up (§4.H, §4.L
/// `timeout_grace`).
pub fn wait_for_child(pid: Pid, deadline: Deadline) -> Result<ChildOutcome, nix::Error> {
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                if deadline.has_passed() {
                    return Ok(ChildOutcome::TimedOut);
                }
                // Mirrors `reap_child_non_blocking`'s own short sleep
                // between polls: without it this loop would spin at 100%
                // CPU for the full remaining deadline instead of yielding.
                std::thread::sleep(Duration::from_millis(2));
            }
            Ok(status) => return Ok(ChildOutcome::Exited(status)),
            Err(nix::Error::ECHILD) => {
                return Ok(ChildOutcome::Exited(WaitStatus::Exited(pid, 0)));
            }
            Err(e) => return Err(e),
        }
    }
}

/// Sends `SIGTERM` without waiting, per §4.G step 5: on a test's first
/// timeout the parent asks the child to shut down cooperatively (and gets a
/// chance to still receive a `Result` it was about to send) before ever
/// escalating to `SIGKILL`.
pub fn terminate(pid: Pid) {
    log::warn!(target: "natest", "pid {pid}: deadline expired, sending SIGTERM");
    let _ = signal::kill(pid, Signal::SIGTERM);
}

/// Escalates to `SIGKILL` and blocks (briefly, with its own short
/// deadline) for the child to actually die, per `EngineConfig::timeout_grace`
/// (§4.L). Mirrors `unixharness_dispatch`'s `kill(pid, SIGKILL)` followed
/// unconditionally by a blocking `waitpid`.
pub fn kill_and_reap(pid: Pid, config: &EngineConfig) -> Result<WaitStatus, nix::Error> {
    log::warn!(target: "natest", "pid {pid}: still alive past the grace window, sending SIGKILL");
    let _ = signal::kill(pid, Signal::SIGKILL);
    let grace_deadline = Deadline::after(config.timeout_grace);
    loop {
        match wait_for_child(pid, grace_deadline)? {
            ChildOutcome::Exited(status) => return Ok(status),
            ChildOutcome::TimedOut => {
                // A SIGKILL'd process cannot ignore the signal; if
                // waitpid still hasn't observed it, keep polling past the
                // grace window rather than giving up on the reap.
                if grace_deadline.has_passed() {
                    continue;
                }
            }
        }
    }
}

/// Waits, with `deadline`, for `fd` to report a hangup -- the socket half
/// closing is the signal that the peer process has exited or crashed
/// (adapted from `wait_for_pollhup`). Not currently used by the fork
/// dispatcher (which instead waits on the message channel itself, since a
/// result or lack of one is more informative than a bare hangup), kept
/// for a debug/attach workflow that only has the raw fd.
pub fn wait_for_pollhup(fd: RawFd, deadline: Deadline) -> Result<bool, nix::Error> {
    let mut fds = [libc::pollfd {
        fd,
        events: libc::POLLHUP,
        revents: 0,
    }];
    loop {
        let timeout_ms = deadline.remaining_millis_i32();
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        match rc {
            -1 => match nix::Error::last_raw() {
                libc::EAGAIN | libc::EINTR => continue,
                errno => return Err(nix::Error::from_i32(errno)),
            },
            0 => return Ok(false),
            _ => return Ok(fds[0].revents & libc::POLLHUP != 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_for_child_times_out_for_a_sleeping_child() {
        // pid 1 (init) never exits and this process cannot wait on it in
        // the usual sense, but waitpid on a pid we don't own returns
        // ECHILD immediately, which `wait_for_child` treats as "exited" --
        // exercised here just to confirm the ECHILD branch doesn't loop
        // forever.
        let deadline = Deadline::after(Duration::from_millis(50));
        let outcome = wait_for_child(Pid::from_raw(1), deadline).unwrap();
        assert!(matches!(outcome, ChildOutcome::Exited(_)));
    }
}
