//! Block-Size Optimizer

use super::UpdateHistory;
use crate::history::{Timestamp, now};
use crate::session_mailbox::SharedMailbox;
use crate::timer::PeriodicTask;
use std::time::Duration;
use tracing::debug;

/// The decision logic of the block-size optimizer, without a timer.
#[derive(Debug)]
pub struct BlockSizeController {
    mailbox: SharedMailbox,
    step: u32,
    threshold: f64,
    history: UpdateHistory,
}

impl BlockSizeController {
    #[must_use]
    pub fn new(
        mailbox: SharedMailbox,
        step: u32,
        threshold: f64,
        started_at: Timestamp,
        period: Duration,
    ) -> Self {
        Self {
            mailbox,
            step,
            threshold,
            history: UpdateHistory::new(started_at, period),
        }
    }

    /// Compare the current interval with the last one and adjust the
    /// mailbox's block size. Returns the block size now in effect.
    pub fn optimize(&mut self, now: Timestamp) -> u32 {
        let current = self.history.current_interval(now);
        let last = self.history.last_interval();

        let mut mailbox = self.mailbox.lock();
        let throughput_current = mailbox.average_throughput_in(current);
        let throughput_last = mailbox.average_throughput_in(last);
        let size_current = mailbox.block_size_in(current);
        let size_last = mailbox.block_size_in(last);
        let did_increase = size_current >= size_last;

        let block_size = mailbox.download_block_size;
        let can_shrink = block_size > self.step;
        mailbox.download_block_size = if throughput_current + self.threshold >= throughput_last {
            if did_increase {
                block_size.saturating_add(self.step)
            } else if can_shrink {
                block_size - self.step
            } else {
                block_size
            }
        } else if did_increase && can_shrink {
            block_size - self.step
        } else {
            block_size
        };

        debug!(
            "{}: throughput {:.3} -> {:.3} bytes/ms, block size {} -> {}",
            mailbox.path(),
            throughput_last,
            throughput_current,
            block_size,
            mailbox.download_block_size
        );
        let result = mailbox.download_block_size;
        drop(mailbox);

        self.history.record(now);
        result
    }
}

/// Runs a [`BlockSizeController`] on its own interval while the owning
/// process is running.
#[derive(Debug)]
pub struct BlockSizeOptimizer {
    controller: Option<BlockSizeController>,
    period: Duration,
    task: Option<PeriodicTask>,
}

impl BlockSizeOptimizer {
    #[must_use]
    pub fn new(mailbox: SharedMailbox, step: u32, threshold: f64, period: Duration) -> Self {
        Self {
            controller: Some(BlockSizeController::new(mailbox, step, threshold, now(), period)),
            period,
            task: None,
        }
    }

    /// Start the periodic adjustments. Has no effect once started.
    pub fn start(&mut self) {
        let Some(mut controller) = self.controller.take() else {
            return;
        };
        controller.history = UpdateHistory::new(now(), self.period);
        self.task = Some(PeriodicTask::spawn(self.period, move || {
            controller.optimize(now());
            std::future::ready(true)
        }));
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.stop();
        }
    }

    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.task.is_some()
    }
}
