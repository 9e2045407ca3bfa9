//! Per-mailbox exclusive locks

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

/// Registry of one async mutex per mailbox path. Cloning shares the
/// registry.
#[derive(Debug, Clone, Default)]
pub struct MailboxLocks {
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

/// Held while a process works on a mailbox; released on drop.
#[derive(Debug)]
pub struct MailboxLockGuard {
    path: String,
    _guard: OwnedMutexGuard<()>,
}

impl MailboxLockGuard {
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl MailboxLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no one else holds the lock for `path`, then take it.
    pub async fn acquire(&self, path: &str) -> MailboxLockGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(path.to_string()).or_default().clone()
        };
        debug!("Waiting for lock on {}", path);
        let guard = lock.lock_owned().await;
        MailboxLockGuard {
            path: path.to_string(),
            _guard: guard,
        }
    }

    /// Whether some process currently holds the lock for `path`.
    #[must_use]
    pub fn is_locked(&self, path: &str) -> bool {
        let locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.get(path).is_some_and(|lock| lock.try_lock().is_err())
    }
}
