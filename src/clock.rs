//! Turn clock arithmetic and time sources
//!
//! The functions in this module are pure: they compute elapsed and remaining
//! turn time from timestamps and never read the clock themselves. Pausing is
//! handled in exactly one place, [`adjust_turn_start_for_pause`], which moves
//! the start of a turn forward so paused wall-clock time is never counted.
//!
//! Code that needs the current time receives it from a [`Clock`], so the
//! authoritative side and the client projection can run against a
//! [`ManualClock`] in tests and simulations.

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use web_time::SystemTime;

/// Wall-clock time elapsed between `since` and `now`
///
/// Returns zero when `since` lies in the future, which happens when two
/// machines disagree slightly about the current time.
pub fn elapsed(now: SystemTime, since: SystemTime) -> Duration {
    now.duration_since(since).unwrap_or_default()
}

/// Whole seconds elapsed since the turn started, never negative
///
/// # Arguments
///
/// * `now` - The instant to measure at
/// * `turn_started_at` - The (pause adjusted) start of the turn
pub fn elapsed_since_turn_start(now: SystemTime, turn_started_at: SystemTime) -> u64 {
    elapsed(now, turn_started_at).as_secs()
}

/// Shifts the start of a turn forward by the length of a pause
///
/// After the shift, [`elapsed_since_turn_start`] automatically excludes the
/// paused interval. No other code path subtracts pause time.
pub fn adjust_turn_start_for_pause(turn_started_at: SystemTime, pause: Duration) -> SystemTime {
    turn_started_at.checked_add(pause).unwrap_or(turn_started_at)
}

/// Seconds left on a countdown after `elapsed_seconds` have passed
///
/// Saturates at zero, which is the terminal condition of a count-down turn.
pub fn countdown_remaining(countdown_seconds: u64, elapsed_seconds: u64) -> u64 {
    countdown_seconds.saturating_sub(elapsed_seconds)
}

/// A source of wall-clock time
pub trait Clock: Send + Sync {
    /// Returns the current wall-clock time
    fn now(&self) -> SystemTime;
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> SystemTime {
        (**self).now()
    }
}

/// The real clock of the machine
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A clock that only moves when told to
///
/// Clones share the same underlying time, so a single `ManualClock` can be
/// handed to both the authoritative controller and any number of clients.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<SystemTime>>,
}

impl ManualClock {
    /// Creates a clock frozen at `start`
    pub fn new(start: SystemTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Moves the clock forward by `by`
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now = now.checked_add(by).unwrap_or(*now);
    }

    /// Moves the clock to an arbitrary instant, possibly backwards
    pub fn set(&self, to: SystemTime) {
        *self.now.lock() = to;
    }
}

impl Default for ManualClock {
    /// A clock frozen at the Unix epoch
    fn default() -> Self {
        Self::new(SystemTime::UNIX_EPOCH)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock()
    }
}
