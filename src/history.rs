//! Time-bucketed sample histories
//!
//! Throughput and block-size samples are keyed by a millisecond
//! timestamp and queried per half-open time interval.

use std::collections::VecDeque;
use std::time::Duration;

/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

/// Current wall-clock time as a [`Timestamp`].
#[must_use]
pub fn now() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

/// Half-open interval `[from, to)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeInterval {
    pub from: Timestamp,
    pub to: Timestamp,
}

impl TimeInterval {
    #[must_use]
    pub const fn new(from: Timestamp, to: Timestamp) -> Self {
        Self { from, to }
    }

    #[must_use]
    pub const fn contains(&self, at: Timestamp) -> bool {
        at >= self.from && at < self.to
    }
}

/// Samples ordered by timestamp, retained for a fixed time-to-live.
#[derive(Debug, Clone)]
pub struct SampleHistory<T> {
    samples: VecDeque<(Timestamp, T)>,
    ttl_ms: i64,
}

impl<T: Copy> SampleHistory<T> {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            ttl_ms: i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX),
        }
    }

    /// Record a sample. Samples older than the time-to-live, measured
    /// from this one, are dropped.
    pub fn record(&mut self, at: Timestamp, value: T) {
        let at = self.samples.back().map_or(at, |(last, _)| at.max(*last));
        self.samples.push_back((at, value));
        let horizon = at.saturating_sub(self.ttl_ms);
        while self.samples.front().is_some_and(|(t, _)| *t < horizon) {
            self.samples.pop_front();
        }
    }

    fn in_interval(&self, interval: TimeInterval) -> impl Iterator<Item = T> + '_ {
        self.samples
            .iter()
            .filter(move |(t, _)| interval.contains(*t))
            .map(|(_, v)| *v)
    }

    /// The newest sample inside `interval`.
    #[must_use]
    pub fn last_in(&self, interval: TimeInterval) -> Option<T> {
        self.in_interval(interval).last()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl<T: Copy + Into<f64>> SampleHistory<T> {
    /// Mean of the samples inside `interval`, 0 when there are none.
    #[must_use]
    pub fn average_in(&self, interval: TimeInterval) -> f64 {
        let (sum, count) = self
            .in_interval(interval)
            .fold((0.0, 0_u32), |(sum, n), v| (sum + v.into(), n + 1));
        if count == 0 { 0.0 } else { sum / f64::from(count) }
    }
}
