//! Outbound events
//!
//! Everything the engine learns leaves it as a [`SyncEvent`] delivered
//! to a [`SyncEventListener`]. Events are ordered per mailbox and may
//! interleave across mailboxes.

use crate::imap::ImapMessage;
use crate::mailbox::MailboxInfo;
use crate::state::MailboxStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncErrorKind {
    /// A connection could not be established or was lost.
    Connection,
    /// A fetched message came without its source.
    MissingSource,
    /// The server rejected a command or sent something unparseable.
    Protocol,
    /// A mailbox was given up on after repeated connection failures.
    Abandoned,
    /// The mailbox tree could not be listed.
    Discovery,
}

/// Details of a non-fatal failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncError {
    pub kind: SyncErrorKind,
    pub mailbox: Option<String>,
    pub uid: Option<u32>,
    pub detail: String,
}

impl SyncError {
    #[must_use]
    pub fn new(kind: SyncErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            mailbox: None,
            uid: None,
            detail: detail.into(),
        }
    }

    #[must_use]
    pub fn in_mailbox(mut self, path: impl Into<String>) -> Self {
        self.mailbox = Some(path.into());
        self
    }

    #[must_use]
    pub const fn for_uid(mut self, uid: u32) -> Self {
        self.uid = Some(uid);
        self
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(mailbox) = &self.mailbox {
            write!(f, " in {mailbox}")?;
        }
        if let Some(uid) = self.uid {
            write!(f, " (uid {uid})")?;
        }
        write!(f, ": {}", self.detail)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    Mailbox {
        kind: EventKind,
        mailbox: MailboxInfo,
    },
    MailboxStatus(MailboxStatus),
    Message {
        kind: EventKind,
        message: ImapMessage,
    },
    /// The download quota is nearly used up; the run resumes later.
    Postponed { resume_at: DateTime<Utc> },
    /// Every scheduled mailbox has been synchronized.
    Finished { downloaded_bytes: u64 },
    Error(SyncError),
}

/// Receiver of engine events. Called from engine tasks, so it must not
/// block.
pub trait SyncEventListener: Send + Sync {
    fn on_event(&self, event: SyncEvent);
}

impl SyncEventListener for mpsc::UnboundedSender<SyncEvent> {
    fn on_event(&self, event: SyncEvent) {
        // The receiving side going away only means nobody listens anymore.
        let _ = self.send(event);
    }
}
