//! Per-session scheduling view of a mailbox

use crate::config::SyncConfig;
use crate::history::{SampleHistory, TimeInterval, Timestamp};
use crate::mailbox::{MailboxInfo, SpecialUse};
use crate::state::MailboxState;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Scheduling priority class, derived from the special-use role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Importance {
    /// Never synchronized (Junk).
    NoSync,
    Low,
    Medium,
    High,
}

impl Importance {
    /// Multiplier applied to throughput in efficiency scores.
    #[must_use]
    pub const fn weight(self) -> f64 {
        match self {
            Self::NoSync => 0.0,
            Self::Low => 1.0,
            Self::Medium => 2.0,
            Self::High => 3.0,
        }
    }
}

impl From<Option<SpecialUse>> for Importance {
    fn from(special_use: Option<SpecialUse>) -> Self {
        match special_use {
            Some(SpecialUse::Inbox) => Self::High,
            Some(SpecialUse::Trash | SpecialUse::Archive | SpecialUse::All | SpecialUse::Sent) => {
                Self::Low
            }
            Some(SpecialUse::Junk) => Self::NoSync,
            Some(SpecialUse::Drafts | SpecialUse::Flagged) | None => Self::Medium,
        }
    }
}

/// A [`MailboxState`] plus the ephemeral metadata one session needs to
/// schedule and tune it.
#[derive(Debug, Clone)]
pub struct SyncSessionMailbox {
    state: MailboxState,
    /// Message count from the last STATUS; `None` means unknown.
    pub mail_count: Option<u32>,
    /// Retention window of both histories.
    pub time_to_live: Duration,
    pub download_block_size: u32,
    importance: Importance,
    special_use: Option<SpecialUse>,
    throughput_history: SampleHistory<f64>,
    block_size_history: SampleHistory<u32>,
}

impl SyncSessionMailbox {
    #[must_use]
    pub fn new(state: MailboxState, config: &SyncConfig) -> Self {
        let ttl = config.mailbox_history_ttl;
        Self {
            state,
            mail_count: None,
            time_to_live: ttl,
            download_block_size: config.initial_block_size.max(1),
            importance: Importance::Medium,
            special_use: None,
            throughput_history: SampleHistory::new(ttl),
            block_size_history: SampleHistory::new(ttl),
        }
    }

    /// Fresh mailbox for a node seen on the server for the first time.
    #[must_use]
    pub fn from_node(info: &MailboxInfo, config: &SyncConfig) -> Self {
        let mut mailbox = Self::new(MailboxState::new(info.path.clone()), config);
        mailbox.set_special_use(info.special_use);
        mailbox
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.state.path
    }

    #[must_use]
    pub const fn mailbox_state(&self) -> &MailboxState {
        &self.state
    }

    pub const fn mailbox_state_mut(&mut self) -> &mut MailboxState {
        &mut self.state
    }

    #[must_use]
    pub const fn importance(&self) -> Importance {
        self.importance
    }

    #[must_use]
    pub const fn special_use(&self) -> Option<SpecialUse> {
        self.special_use
    }

    /// Update the role; importance follows it.
    pub fn set_special_use(&mut self, special_use: Option<SpecialUse>) {
        self.special_use = special_use;
        self.importance = Importance::from(special_use);
    }

    pub const fn init_session_mailbox(&mut self, mail_count: Option<u32>) {
        self.mail_count = mail_count;
    }

    pub fn report_throughput(&mut self, at: Timestamp, throughput: f64) {
        self.throughput_history.record(at, throughput);
    }

    pub fn report_block_size_usage(&mut self, at: Timestamp, block_size: u32) {
        self.block_size_history.record(at, block_size);
    }

    /// Mean throughput (bytes/ms) observed in `interval`.
    #[must_use]
    pub fn average_throughput_in(&self, interval: TimeInterval) -> f64 {
        self.throughput_history.average_in(interval)
    }

    /// Importance-weighted mean throughput in `interval`.
    #[must_use]
    pub fn efficiency_score_in(&self, interval: TimeInterval) -> f64 {
        self.importance.weight() * self.average_throughput_in(interval)
    }

    /// Block size in use during `interval`: the last one reported, or
    /// the current one if none was.
    #[must_use]
    pub fn block_size_in(&self, interval: TimeInterval) -> u32 {
        self.block_size_history
            .last_in(interval)
            .unwrap_or(self.download_block_size)
    }
}

/// A [`SyncSessionMailbox`] shared between the optimizers and the
/// process currently syncing it. The lock is never held across an
/// await point.
#[derive(Debug, Clone)]
pub struct SharedMailbox(Arc<Mutex<SyncSessionMailbox>>);

impl SharedMailbox {
    #[must_use]
    pub fn new(mailbox: SyncSessionMailbox) -> Self {
        Self(Arc::new(Mutex::new(mailbox)))
    }

    pub fn lock(&self) -> MutexGuard<'_, SyncSessionMailbox> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn path(&self) -> String {
        self.lock().path().to_string()
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
