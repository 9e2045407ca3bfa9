//! Sync state model
//!
//! The durable-shaped snapshot that seeds a session and that the storage
//! collaborator persists between runs. It round-trips through JSON.

use crate::config::Account;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Link between a server UID and the message it was imported as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportedIds {
    pub uid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mod_seq: Option<u64>,
    /// Identifier assigned by the storage layer, opaque to the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
}

impl ImportedIds {
    #[must_use]
    pub const fn new(uid: u32) -> Self {
        Self {
            uid,
            mod_seq: None,
            external_id: None,
        }
    }
}

/// Result of a STATUS request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxStatus {
    pub path: String,
    pub message_count: Option<u32>,
    pub uid_next: u32,
    pub uid_validity: u32,
    /// `None` when the server lacks persistent mod-sequences.
    pub highest_mod_seq: Option<u64>,
}

/// Per-mailbox bookmarks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxState {
    pub path: String,
    #[serde(default)]
    pub uid_validity: Option<u32>,
    #[serde(default)]
    pub uid_next: Option<u32>,
    #[serde(default)]
    pub highest_mod_seq: Option<u64>,
    #[serde(default)]
    pub imported: BTreeMap<u32, ImportedIds>,
}

impl MailboxState {
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            uid_validity: None,
            uid_next: None,
            highest_mod_seq: None,
            imported: BTreeMap::new(),
        }
    }

    /// Take over the bookmarks of a fresh STATUS response.
    ///
    /// Returns `true` when the UIDVALIDITY epoch changed, in which case
    /// every cached UID has been dropped.
    pub fn apply_status(&mut self, status: &MailboxStatus) -> bool {
        let epoch_changed = self
            .uid_validity
            .is_some_and(|known| known != status.uid_validity);
        if epoch_changed {
            self.imported.clear();
        }
        self.uid_validity = Some(status.uid_validity);
        self.uid_next = Some(status.uid_next);
        self.highest_mod_seq = status.highest_mod_seq;
        epoch_changed
    }

    #[must_use]
    pub fn max_imported_uid(&self) -> Option<u32> {
        self.imported.keys().next_back().copied()
    }

    #[must_use]
    pub fn max_imported_mod_seq(&self) -> Option<u64> {
        self.imported.values().filter_map(|ids| ids.mod_seq).max()
    }

    /// Record a fetched message. Returns `true` if the UID was not
    /// imported before.
    pub fn record_fetched(&mut self, uid: u32, mod_seq: Option<u64>) -> bool {
        match self.imported.get_mut(&uid) {
            Some(ids) => {
                if mod_seq.is_some() {
                    ids.mod_seq = mod_seq;
                }
                false
            }
            None => {
                self.imported.insert(
                    uid,
                    ImportedIds {
                        mod_seq,
                        ..ImportedIds::new(uid)
                    },
                );
                true
            }
        }
    }
}

/// Everything a session needs to resume synchronization of an account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub account: Account,
    /// Bytes the run may download before it is postponed.
    pub max_quota: u64,
    #[serde(default)]
    pub mailboxes: Vec<MailboxState>,
    #[serde(default)]
    pub imported_attachment_hashes: Vec<String>,
}

impl SyncState {
    #[must_use]
    pub const fn new(account: Account, max_quota: u64) -> Self {
        Self {
            account,
            max_quota,
            mailboxes: Vec::new(),
            imported_attachment_hashes: Vec::new(),
        }
    }

    #[must_use]
    pub fn mailbox(&self, path: &str) -> Option<&MailboxState> {
        self.mailboxes.iter().find(|m| m.path == path)
    }

    /// Parse a state previously written by [`SyncState::to_json`].
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
