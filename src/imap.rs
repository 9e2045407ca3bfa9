//! Transport seam
//!
//! The engine talks to IMAP only through these traits. The production
//! implementation lives in [`crate::connection`]; tests plug in
//! in-memory servers.

use crate::config::Account;
use crate::error::Result;
use crate::flag::Flag;
use crate::mailbox::ListedMailbox;
use crate::range::UidRange;
use crate::state::MailboxStatus;
use chrono::{DateTime, FixedOffset};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// A message's sequence number and UID in the examined mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessagePosition {
    pub seq: u32,
    pub uid: u32,
}

/// One fetched message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImapMessage {
    pub mailbox: String,
    pub uid: u32,
    pub mod_seq: Option<u64>,
    pub flags: Vec<Flag>,
    /// RFC822.SIZE as reported by the server.
    pub size: Option<u32>,
    pub internal_date: Option<DateTime<FixedOffset>>,
    /// Raw RFC822 source. Serialized only by callers that want it.
    #[serde(default, skip_serializing)]
    pub source: Option<Vec<u8>>,
}

impl ImapMessage {
    /// Bytes this message counts for in throughput and quota.
    #[must_use]
    pub fn payload_len(&self) -> u64 {
        self.source.as_ref().map_or_else(
            || u64::from(self.size.unwrap_or(0)),
            |source| source.len() as u64,
        )
    }
}

/// Opens authenticated IMAP connections.
pub trait Connector: Send + Sync {
    fn connect<'a>(&'a self, account: &'a Account)
    -> BoxFuture<'a, Result<Box<dyn MailboxConnection>>>;
}

/// Translates between sequence numbers and UIDs of the examined mailbox.
pub trait SequenceResolver: Send {
    /// Position of the message with sequence number `seq`.
    fn resolve_sequence(&mut self, seq: u32) -> BoxFuture<'_, Result<Option<MessagePosition>>>;

    /// Position of the first message whose UID is at least `uid`.
    fn resolve_uid(&mut self, uid: u32) -> BoxFuture<'_, Result<Option<MessagePosition>>>;
}

/// One authenticated IMAP connection.
pub trait MailboxConnection: SequenceResolver {
    /// Whether the server keeps persistent mod-sequences (CONDSTORE or
    /// QRESYNC).
    fn supports_mod_seq(&self) -> bool;

    fn list(&mut self) -> BoxFuture<'_, Result<Vec<ListedMailbox>>>;

    fn status<'a>(&'a mut self, path: &'a str) -> BoxFuture<'a, Result<MailboxStatus>>;

    /// Open `path` read-only.
    fn examine<'a>(&'a mut self, path: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Fetch flags, size, internal date and source of every message in
    /// `range`, optionally only those changed since `changed_since`.
    fn fetch<'a>(
        &'a mut self,
        range: &'a UidRange,
        changed_since: Option<u64>,
    ) -> BoxFuture<'a, Result<BoxStream<'a, Result<ImapMessage>>>>;

    fn logout(&mut self) -> BoxFuture<'_, Result<()>>;
}
