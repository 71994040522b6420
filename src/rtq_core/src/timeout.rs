//! Timeout accounting for blocking operations
use crate::{PortTimer, UTicks};

/// Passing this as a number of ticks to wait makes an operation wait
/// indefinitely.
pub const MAX_DELAY: UTicks = UTicks::MAX;

/// The point of time from which a blocking operation measures its remaining
/// ticks.
///
/// The tick counter wraps around, so the overflow count is recorded along
/// with the tick count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct TimeOut {
    overflow_count: UTicks,
    entered_at: UTicks,
}

impl TimeOut {
    /// Take a snapshot of the tick counter. CPU Lock should be active so that
    /// both counters are read consistently.
    pub(super) fn now<Traits: PortTimer>() -> Self {
        Self {
            overflow_count: Traits::tick_overflow_count(),
            entered_at: Traits::tick_count(),
        }
    }

    /// Check whether `*ticks_to_wait` ticks have elapsed since `self`.
    ///
    /// If they haven't, `*ticks_to_wait` is reduced by the elapsed ticks and
    /// `self` is moved to the current tick, so the pair describes the
    /// remaining wait.
    pub(super) fn check<Traits: PortTimer>(&mut self, ticks_to_wait: &mut UTicks) -> bool {
        self.check_at(
            Traits::tick_overflow_count(),
            Traits::tick_count(),
            ticks_to_wait,
        )
    }

    fn check_at(
        &mut self,
        overflow_count: UTicks,
        now: UTicks,
        ticks_to_wait: &mut UTicks,
    ) -> bool {
        if *ticks_to_wait == MAX_DELAY {
            return false;
        }

        if overflow_count != self.overflow_count && now >= self.entered_at {
            // The counter has wrapped and passed `entered_at` again, so a
            // whole counter period has elapsed.
            return true;
        }

        let elapsed = now.wrapping_sub(self.entered_at);
        if elapsed < *ticks_to_wait {
            *ticks_to_wait -= elapsed;
            *self = Self {
                overflow_count,
                entered_at: now,
            };
            false
        } else {
            true
        }
    }
}
