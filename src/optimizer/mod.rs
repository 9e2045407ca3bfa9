//! Adaptive optimizers
//!
//! Both optimizers compare the average throughput of the interval since
//! their last decision with the interval before it and move their knob
//! (process count, block size) accordingly.

mod block_size;
mod processes;

pub use block_size::{BlockSizeController, BlockSizeOptimizer};
pub use processes::{
    ParallelProcessesOptimizer, ProcessCommand, ProcessId, ProcessPool, ProcessesOptimizer,
    SingleProcessOptimizer, processes_optimizer,
};

use crate::history::{TimeInterval, Timestamp};
use std::time::Duration;

/// Decision taken by an optimizer run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateAction {
    NoUpdate,
    Increase,
    Decrease,
}

/// When an optimizer last ran, which delimits its measurement intervals.
#[derive(Debug, Clone, Copy)]
pub struct UpdateHistory {
    period_ms: i64,
    previous: Option<Timestamp>,
    last: Timestamp,
}

impl UpdateHistory {
    #[must_use]
    pub fn new(started_at: Timestamp, period: Duration) -> Self {
        Self {
            period_ms: i64::try_from(period.as_millis()).unwrap_or(i64::MAX),
            previous: None,
            last: started_at,
        }
    }

    /// `[last run, now)`.
    #[must_use]
    pub const fn current_interval(&self, now: Timestamp) -> TimeInterval {
        TimeInterval::new(self.last, now)
    }

    /// The interval before the current one. Before the second run it is
    /// the period preceding the start.
    #[must_use]
    pub fn last_interval(&self) -> TimeInterval {
        let from = self
            .previous
            .unwrap_or_else(|| self.last.saturating_sub(self.period_ms));
        TimeInterval::new(from, self.last)
    }

    pub fn record(&mut self, at: Timestamp) {
        let at = at.max(self.last);
        self.previous = Some(self.last);
        self.last = at;
    }
}
