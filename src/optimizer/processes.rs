//! Processes optimizers
//!
//! Decide which mailboxes are synced by how many concurrent processes.
//! They are plain state machines: every entry point returns the
//! [`ProcessCommand`]s the session has to carry out, which keeps them
//! free of I/O and clocks.

use super::{UpdateAction, UpdateHistory};
use crate::config::{RetryPolicy, SyncConfig};
use crate::history::{TimeInterval, Timestamp};
use crate::session_mailbox::SharedMailbox;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Identifies one sync process within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub(crate) u64);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Work the session performs on behalf of an optimizer.
#[derive(Debug, Clone)]
pub enum ProcessCommand {
    /// Spawn a sync process for `mailbox`.
    Start {
        process_id: ProcessId,
        mailbox: SharedMailbox,
    },
    /// Stop a running process and hand its mailbox back via
    /// [`ProcessesOptimizer::release`].
    Stop { process_id: ProcessId },
    /// The mailbox failed to connect too often and is given up on.
    Abandon { path: String },
}

#[derive(Debug)]
struct IdleMailbox {
    mailbox: SharedMailbox,
    failures: u32,
    not_before: Timestamp,
}

#[derive(Debug)]
struct RunningMailbox {
    mailbox: SharedMailbox,
    failures: u32,
}

/// Mailboxes waiting to be synced and the processes syncing the others.
#[derive(Debug)]
pub struct ProcessPool {
    idle: Vec<IdleMailbox>,
    running: BTreeMap<ProcessId, RunningMailbox>,
    next_id: u64,
    retry: RetryPolicy,
}

impl ProcessPool {
    #[must_use]
    pub fn new(mailboxes: Vec<SharedMailbox>, retry: RetryPolicy) -> Self {
        Self {
            idle: mailboxes
                .into_iter()
                .map(|mailbox| IdleMailbox {
                    mailbox,
                    failures: 0,
                    not_before: Timestamp::MIN,
                })
                .collect(),
            running: BTreeMap::new(),
            next_id: 1,
            retry,
        }
    }

    #[must_use]
    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.running.is_empty() && self.idle.is_empty()
    }

    /// Mean over running processes of their mailbox's average
    /// throughput in `interval`.
    #[must_use]
    pub fn combined_throughput_in(&self, interval: TimeInterval) -> f64 {
        if self.running.is_empty() {
            return 0.0;
        }
        let sum: f64 = self
            .running
            .values()
            .map(|r| r.mailbox.lock().average_throughput_in(interval))
            .sum();
        #[allow(clippy::cast_precision_loss)]
        let count = self.running.len() as f64;
        sum / count
    }

    /// Start a process for the eligible idle mailbox with the highest
    /// score. Ties go to the mailbox queued first.
    fn start_best<F>(&mut self, now: Timestamp, score: F) -> Option<ProcessCommand>
    where
        F: Fn(&SharedMailbox) -> f64,
    {
        let mut best: Option<(usize, f64)> = None;
        for (idx, idle) in self.idle.iter().enumerate() {
            if idle.not_before > now {
                continue;
            }
            let value = score(&idle.mailbox);
            if best.is_none_or(|(_, top)| value > top) {
                best = Some((idx, value));
            }
        }

        let (idx, _) = best?;
        let idle = self.idle.remove(idx);
        let process_id = ProcessId(self.next_id);
        self.next_id += 1;
        debug!("Starting process {} for {}", process_id, idle.mailbox.path());
        self.running.insert(
            process_id,
            RunningMailbox {
                mailbox: idle.mailbox.clone(),
                failures: idle.failures,
            },
        );
        Some(ProcessCommand::Start {
            process_id,
            mailbox: idle.mailbox,
        })
    }

    /// Stop the running process with the lowest efficiency score. Ties
    /// go to the newest process.
    fn stop_worst(&mut self, interval: TimeInterval) -> Option<ProcessCommand> {
        let (&process_id, _) = self
            .running
            .iter()
            .map(|(id, r)| (id, r.mailbox.lock().efficiency_score_in(interval)))
            .reduce(|worst, candidate| if candidate.1 <= worst.1 { candidate } else { worst })?;
        self.running.remove(&process_id);
        debug!("Stopping process {}", process_id);
        Some(ProcessCommand::Stop { process_id })
    }

    fn finished(&mut self, process_id: ProcessId) -> bool {
        self.running.remove(&process_id).is_some()
    }

    fn failed(&mut self, process_id: ProcessId, now: Timestamp) -> Option<ProcessCommand> {
        let running = self.running.remove(&process_id)?;
        let failures = running.failures + 1;
        let path = running.mailbox.path();

        if failures > self.retry.max_retries {
            warn!("Giving up on {} after {} connection failures", path, failures);
            return Some(ProcessCommand::Abandon { path });
        }

        let backoff = self.retry.backoff(failures);
        info!("Retrying {} in {:?} (failure {})", path, backoff, failures);
        self.idle.push(IdleMailbox {
            mailbox: running.mailbox,
            failures,
            not_before: now.saturating_add(i64::try_from(backoff.as_millis()).unwrap_or(i64::MAX)),
        });
        None
    }

    fn release(&mut self, mailbox: SharedMailbox) {
        self.idle.push(IdleMailbox {
            mailbox,
            failures: 0,
            not_before: Timestamp::MIN,
        });
    }
}

/// Scheduling policy of a session.
pub trait ProcessesOptimizer: Send {
    fn pool(&self) -> &ProcessPool;

    fn pool_mut(&mut self) -> &mut ProcessPool;

    /// How often [`ProcessesOptimizer::optimize`] should run.
    fn interval(&self) -> Duration;

    /// Called once when the session starts.
    fn start(&mut self, now: Timestamp) -> Vec<ProcessCommand>;

    /// Periodic re-evaluation.
    fn optimize(&mut self, now: Timestamp) -> Vec<ProcessCommand>;

    /// A process synced its mailbox to the end. The mailbox leaves the
    /// pool and the slot is refilled.
    fn mailbox_finished(&mut self, process_id: ProcessId, now: Timestamp) -> Vec<ProcessCommand>;

    /// A process could not connect. Its mailbox is retried on a later
    /// tick or abandoned.
    fn connection_failed(&mut self, process_id: ProcessId, now: Timestamp) -> Vec<ProcessCommand> {
        self.pool_mut().failed(process_id, now).into_iter().collect()
    }

    /// Take back the mailbox of a stopped process.
    fn release(&mut self, mailbox: SharedMailbox) {
        self.pool_mut().release(mailbox);
    }

    fn running_count(&self) -> usize {
        self.pool().running_count()
    }

    /// No mailbox is running or waiting anymore.
    fn is_exhausted(&self) -> bool {
        self.pool().is_exhausted()
    }
}

/// Adjusts the number of concurrent processes to the combined
/// throughput trend.
#[derive(Debug)]
pub struct ParallelProcessesOptimizer {
    pool: ProcessPool,
    step: usize,
    threshold: f64,
    period: Duration,
    history: UpdateHistory,
    last_action: UpdateAction,
}

impl ParallelProcessesOptimizer {
    #[must_use]
    pub fn new(pool: ProcessPool, step: usize, threshold: f64, period: Duration) -> Self {
        Self {
            pool,
            step: step.max(1),
            threshold,
            period,
            history: UpdateHistory::new(0, period),
            last_action: UpdateAction::NoUpdate,
        }
    }

    #[must_use]
    pub const fn last_action(&self) -> UpdateAction {
        self.last_action
    }

    fn start_best(&mut self, now: Timestamp, interval: TimeInterval) -> Option<ProcessCommand> {
        self.pool
            .start_best(now, |mailbox| mailbox.lock().efficiency_score_in(interval))
    }

    fn keep_one_running(&mut self, now: Timestamp, interval: TimeInterval) -> Option<ProcessCommand> {
        if self.pool.running_count() == 0 {
            self.start_best(now, interval)
        } else {
            None
        }
    }
}

impl ProcessesOptimizer for ParallelProcessesOptimizer {
    fn pool(&self) -> &ProcessPool {
        &self.pool
    }

    fn pool_mut(&mut self) -> &mut ProcessPool {
        &mut self.pool
    }

    fn interval(&self) -> Duration {
        self.period
    }

    fn start(&mut self, now: Timestamp) -> Vec<ProcessCommand> {
        self.history = UpdateHistory::new(now, self.period);
        self.last_action = UpdateAction::NoUpdate;
        self.optimize(now)
    }

    fn optimize(&mut self, now: Timestamp) -> Vec<ProcessCommand> {
        let current = self.history.current_interval(now);
        let last = self.history.last_interval();
        let throughput_current = self.pool.combined_throughput_in(current);
        let throughput_last = self.pool.combined_throughput_in(last);
        debug!(
            "Combined throughput {:.3} -> {:.3} bytes/ms with {} processes",
            throughput_last,
            throughput_current,
            self.pool.running_count()
        );

        let mut commands = Vec::new();
        if throughput_current + self.threshold >= throughput_last {
            if self.last_action == UpdateAction::Decrease {
                if self.pool.running_count() > 1 {
                    commands.extend(self.pool.stop_worst(current));
                    self.last_action = UpdateAction::Decrease;
                }
            } else {
                for _ in 0..self.step {
                    match self.start_best(now, current) {
                        Some(command) => commands.push(command),
                        None => break,
                    }
                }
                self.last_action = UpdateAction::Increase;
            }
        } else if self.last_action == UpdateAction::Increase && self.pool.running_count() > 1 {
            commands.extend(self.pool.stop_worst(current));
            self.last_action = UpdateAction::Decrease;
        }
        commands.extend(self.keep_one_running(now, current));

        self.history.record(now);
        commands
    }

    fn mailbox_finished(&mut self, process_id: ProcessId, now: Timestamp) -> Vec<ProcessCommand> {
        if !self.pool.finished(process_id) {
            return Vec::new();
        }
        let interval = self.history.current_interval(now);
        self.start_best(now, interval).into_iter().collect()
    }
}

/// Syncs one mailbox at a time, most important first.
#[derive(Debug)]
pub struct SingleProcessOptimizer {
    pool: ProcessPool,
    period: Duration,
}

impl SingleProcessOptimizer {
    #[must_use]
    pub const fn new(pool: ProcessPool, period: Duration) -> Self {
        Self { pool, period }
    }

    fn fill_slot(&mut self, now: Timestamp) -> Vec<ProcessCommand> {
        if self.pool.running_count() > 0 {
            return Vec::new();
        }
        self.pool
            .start_best(now, |mailbox| mailbox.lock().importance().weight())
            .into_iter()
            .collect()
    }
}

impl ProcessesOptimizer for SingleProcessOptimizer {
    fn pool(&self) -> &ProcessPool {
        &self.pool
    }

    fn pool_mut(&mut self) -> &mut ProcessPool {
        &mut self.pool
    }

    fn interval(&self) -> Duration {
        self.period
    }

    fn start(&mut self, now: Timestamp) -> Vec<ProcessCommand> {
        self.fill_slot(now)
    }

    fn optimize(&mut self, now: Timestamp) -> Vec<ProcessCommand> {
        self.fill_slot(now)
    }

    fn mailbox_finished(&mut self, process_id: ProcessId, now: Timestamp) -> Vec<ProcessCommand> {
        if self.pool.finished(process_id) {
            self.fill_slot(now)
        } else {
            Vec::new()
        }
    }
}

/// The optimizer `config` asks for, over `mailboxes`.
#[must_use]
pub fn processes_optimizer(
    config: &SyncConfig,
    mailboxes: Vec<SharedMailbox>,
) -> Box<dyn ProcessesOptimizer> {
    let pool = ProcessPool::new(mailboxes, config.retry);
    if config.parallel_processes_optimizer {
        Box::new(ParallelProcessesOptimizer::new(
            pool,
            config.parallel_processes_step,
            config.throughput_threshold,
            config.processes_optimizer_interval,
        ))
    } else {
        Box::new(SingleProcessOptimizer::new(
            pool,
            config.processes_optimizer_interval,
        ))
    }
}
