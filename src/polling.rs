//! Idle-time keepalive scheduling.
//!
//! The poller decides *when* an idle client should poll; the client loop
//! owns the *how* (a built-in `time` call whose reply is discarded). An
//! [`IntervalSource`] supplies the succession of intervals; the poller
//! holds the current one and advances after each keepalive.

use std::time::Duration;

/// Supplies the next polling interval each time it is consulted.
pub trait IntervalSource: Send {
    /// The next interval in the series. Advancing is the only side
    /// effect an implementation may have.
    fn next_interval(&mut self) -> Duration;
}

/// The default source: the same interval forever.
#[derive(Debug, Clone, Copy)]
pub struct ConstantInterval {
    interval: Duration,
}

impl ConstantInterval {
    /// Create a source that always yields `interval`.
    #[must_use]
    pub const fn new(interval: Duration) -> Self { Self { interval } }
}

impl IntervalSource for ConstantInterval {
    fn next_interval(&mut self) -> Duration { self.interval }
}

/// Tracks the current polling interval against observed idle time.
pub struct Poller {
    source: Box<dyn IntervalSource>,
    current: Duration,
}

impl Poller {
    /// Build a poller over an interval source; the first interval is
    /// drawn immediately.
    #[must_use]
    pub fn new(mut source: Box<dyn IntervalSource>) -> Self {
        let current = source.next_interval();
        Self { source, current }
    }

    /// Convenience for the constant-interval default.
    #[must_use]
    pub fn constant(interval: Duration) -> Self {
        Self::new(Box::new(ConstantInterval::new(interval)))
    }

    /// The interval currently in force.
    #[must_use]
    pub const fn current_interval(&self) -> Duration { self.current }

    /// Whether `idle` has met the current interval, together with the
    /// signed distance in seconds (`idle - interval`; negative while the
    /// interval is still ahead).
    #[must_use]
    pub fn is_interval_reached(&self, idle: Duration) -> (bool, f64) {
        let delta = idle.as_secs_f64() - self.current.as_secs_f64();
        (idle >= self.current, delta)
    }

    /// Install the next interval. Call after acting on a reached match.
    pub fn advance(&mut self) { self.current = self.source.next_interval(); }
}
