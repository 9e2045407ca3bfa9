//! Adaptive IMAP synchronization engine
//!
//! Downloads every syncable mailbox of an IMAP account while tuning
//! itself to the server: the number of concurrent connections and the
//! size of each UID FETCH window follow the measured throughput. Runs
//! resume from a serializable [`SyncState`], use CONDSTORE/QRESYNC
//! mod-sequences when the server has them, and postpone themselves
//! before a download quota runs out.
//!
//! Results are delivered as [`SyncEvent`]s to a [`SyncEventListener`].

mod config;
mod connection;
mod error;
mod event;
mod flag;
mod history;
mod imap;
mod lock;
mod mailbox;
mod optimizer;
mod process;
mod range;
mod session;
mod session_mailbox;
mod state;
mod timer;

#[cfg(test)]
mod testing;

pub use config::{Account, RetryPolicy, Security, SyncConfig};
pub use connection::{ImapConnection, ImapConnector};
pub use error::{Error, Result};
pub use event::{EventKind, SyncError, SyncErrorKind, SyncEvent, SyncEventListener};
pub use flag::Flag;
pub use history::{SampleHistory, TimeInterval, Timestamp};
pub use imap::{Connector, ImapMessage, MailboxConnection, MessagePosition, SequenceResolver};
pub use lock::{MailboxLockGuard, MailboxLocks};
pub use mailbox::{ListedMailbox, MailboxInfo, MailboxNode, SpecialUse, build_tree};
pub use optimizer::{
    BlockSizeController, BlockSizeOptimizer, ParallelProcessesOptimizer, ProcessCommand, ProcessId,
    ProcessPool, ProcessesOptimizer, SingleProcessOptimizer, UpdateAction, UpdateHistory,
    processes_optimizer,
};
pub use process::{ProcessState, SyncProcess};
pub use range::{RangeStart, UidBound, UidRange, UidRangePlanner};
pub use session::{SessionMetrics, SyncSession, SyncSessionState, reconcile};
pub use session_mailbox::{Importance, SharedMailbox, SyncSessionMailbox};
pub use state::{ImportedIds, MailboxState, MailboxStatus, SyncState};
pub use timer::PeriodicTask;
