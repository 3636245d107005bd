// Copyright 2021-Present natest authors
// SPDX-License-Identifier: Apache-2.0

//! Absolute-deadline arithmetic on top of a monotonic clock.
//!
//! Every blocking operation in this crate (readiness waits, the shared-memory
//! message queues, the dispatcher's bounded child-wait) takes a [`Deadline`]
//! rather than a `Duration`. A duration counts down from whenever the caller
//! happens to look at it; restarting a duration-based wait after `EINTR`
//! silently re-extends the total budget. A deadline is a fixed point in time,
//! so resuming a wait after a spurious wakeup never grants extra time.

use std::time::{Duration, Instant};

/// An absolute point in time, after which a wait should give up and report
/// [`Deadline::remaining`] as zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Deadline(Instant);

impl Deadline {
    /// A deadline `budget` from now.
    pub fn after(budget: Duration) -> Self {
        Deadline(Instant::now() + budget)
    }

    /// A deadline that has already passed; any wait against it returns
    /// immediately with zero time remaining.
    pub fn expired() -> Self {
        Deadline(Instant::now())
    }

    /// Push this deadline further into the future by `extra`.
    pub fn extend(&mut self, extra: Duration) {
        self.0 += extra;
    }

    /// Time left until this deadline, saturating at zero. Never panics and
    /// never returns a negative duration.
    pub fn remaining(&self) -> Duration {
        self.0.saturating_duration_since(Instant::now())
    }

    /// True once [`Deadline::remaining`] would report zero.
    pub fn has_passed(&self) -> bool {
        Instant::now() >= self.0
    }

    /// Remaining time in whole milliseconds, clamped to fit `i32`, for APIs
    /// like `poll(2)` that take a millisecond timeout.
    pub fn remaining_millis_i32(&self) -> i32 {
        self.remaining()
            .as_millis()
            .min(i32::MAX as u128)
            .try_into()
            .unwrap_or(i32::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_counts_down() {
        let d = Deadline::after(Duration::from_millis(50));
        let first = d.remaining();
        std::thread::sleep(Duration::from_millis(5));
        let second = d.remaining();
        assert!(second <= first, "deadline must not rewind: {second:?} > {first:?}");
    }

    #[test]
    fn expired_has_zero_remaining() {
        let d = Deadline::expired();
        assert!(d.has_passed());
        assert_eq!(d.remaining(), Duration::ZERO);
    }

    #[test]
    fn extend_pushes_the_deadline_out() {
        let mut d = Deadline::after(Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(15));
        assert!(d.has_passed());
        d.extend(Duration::from_millis(100));
        assert!(!d.has_passed());
    }

    #[test]
    fn saturates_rather_than_underflows() {
        let d = Deadline::after(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(d.remaining(), Duration::ZERO);
    }
}
