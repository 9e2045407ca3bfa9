//! Sync Process
//!
//! One IMAP connection syncing one mailbox window by window. Processes
//! report downloads and completion to the session control loop and
//! tune their own block size while running.

use crate::config::{Account, SyncConfig};
use crate::error::Result;
use crate::event::{EventKind, SyncError, SyncErrorKind, SyncEvent, SyncEventListener};
use crate::history::now;
use crate::imap::{Connector, ImapMessage, MailboxConnection};
use crate::lock::MailboxLocks;
use crate::mailbox::MailboxInfo;
use crate::optimizer::{BlockSizeOptimizer, ProcessId};
use crate::range::{RangeStart, UidBound, UidRange, UidRangePlanner};
use crate::session::ControlMessage;
use crate::session_mailbox::SharedMailbox;
use futures::StreamExt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Running,
    Stopped,
    /// Terminal: the connection could not be established.
    ConnectionFailed,
}

/// What every process of a session shares.
#[derive(Clone)]
pub(crate) struct ProcessContext {
    pub account: Arc<Account>,
    pub config: Arc<SyncConfig>,
    pub connector: Arc<dyn Connector>,
    pub listener: Arc<dyn SyncEventListener>,
    pub locks: MailboxLocks,
    pub control: UnboundedSender<ControlMessage>,
}

struct Inner {
    id: ProcessId,
    mailbox: SharedMailbox,
    token: CancellationToken,
    state: Mutex<ProcessState>,
    block_size: Mutex<BlockSizeOptimizer>,
    ctx: ProcessContext,
}

/// Handle to a sync process. Clones refer to the same process.
#[derive(Clone)]
pub struct SyncProcess {
    inner: Arc<Inner>,
}

impl SyncProcess {
    pub(crate) fn new(id: ProcessId, mailbox: SharedMailbox, ctx: ProcessContext) -> Self {
        let block_size = BlockSizeOptimizer::new(
            mailbox.clone(),
            ctx.config.block_size_step,
            ctx.config.throughput_threshold,
            ctx.config.block_size_optimizer_interval,
        );
        Self {
            inner: Arc::new(Inner {
                id,
                mailbox,
                token: CancellationToken::new(),
                state: Mutex::new(ProcessState::NotStarted),
                block_size: Mutex::new(block_size),
                ctx,
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> ProcessId {
        self.inner.id
    }

    #[must_use]
    pub fn state(&self) -> ProcessState {
        *self.lock_state()
    }

    fn lock_state(&self) -> MutexGuard<'_, ProcessState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_block_size(&self) -> MutexGuard<'_, BlockSizeOptimizer> {
        self.inner
            .block_size
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SyncEvent) {
        self.inner.ctx.listener.on_event(event);
    }

    fn report(&self, message: ControlMessage) {
        // The control loop is gone once the session shut down.
        let _ = self.inner.ctx.control.send(message);
    }

    /// Connect and, on success, spawn the fetch loop.
    ///
    /// Returns [`ProcessState::Running`] or
    /// [`ProcessState::ConnectionFailed`]; a failure is also reported to
    /// the control loop. If the process was stopped while connecting,
    /// the fresh connection is closed and the loop never starts.
    pub async fn start(&self) -> ProcessState {
        let path = self.inner.mailbox.path();
        let connection = self.inner.ctx.connector.connect(&self.inner.ctx.account).await;

        let mut connection = match connection {
            Ok(connection) => connection,
            Err(e) => {
                warn!("Process {} could not connect for {}: {}", self.id(), path, e);
                {
                    let mut state = self.lock_state();
                    if *state == ProcessState::NotStarted {
                        *state = ProcessState::ConnectionFailed;
                    }
                }
                self.emit(SyncEvent::Error(
                    SyncError::new(SyncErrorKind::Connection, e.to_string()).in_mailbox(&path),
                ));
                self.report(ControlMessage::ConnectionFailed {
                    process_id: self.id(),
                });
                return self.state();
            }
        };

        let current = {
            let mut state = self.lock_state();
            if *state == ProcessState::NotStarted {
                *state = ProcessState::Running;
            }
            *state
        };
        if current != ProcessState::Running {
            debug!("Process {} stopped while connecting", self.id());
            connection.logout().await.ok();
            return current;
        }

        if self.inner.ctx.config.block_size_optimizer {
            self.lock_block_size().start();
        }
        info!("Process {} syncing {}", self.id(), path);
        let this = self.clone();
        tokio::spawn(async move { this.run(connection).await });
        ProcessState::Running
    }

    /// Mark the process stopped and hand back its mailbox. The fetch
    /// loop notices between messages and winds down on its own.
    pub fn stop(&self) -> SharedMailbox {
        {
            let mut state = self.lock_state();
            if *state != ProcessState::ConnectionFailed {
                *state = ProcessState::Stopped;
            }
        }
        self.inner.token.cancel();
        self.lock_block_size().stop();
        self.inner.mailbox.clone()
    }

    fn is_stopped(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    async fn run(self, mut connection: Box<dyn MailboxConnection>) {
        let path = self.inner.mailbox.path();

        if let Err(e) = self.sync_mailbox(connection.as_mut(), &path).await {
            warn!("Sync of {} failed: {}", path, e);
            self.emit(SyncEvent::Error(
                SyncError::new(SyncErrorKind::Protocol, e.to_string()).in_mailbox(&path),
            ));
        }

        if let Err(e) = connection.logout().await {
            debug!("Logout after syncing {} failed: {}", path, e);
        }
        self.lock_block_size().stop();
        debug!("Process {} done with {}", self.id(), path);
        self.report(ControlMessage::MailboxFinished {
            process_id: self.id(),
        });
    }

    async fn sync_mailbox(&self, connection: &mut dyn MailboxConnection, path: &str) -> Result<()> {
        let status = connection.status(path).await?;
        let (epoch_changed, special_use) = {
            let mut mailbox = self.inner.mailbox.lock();
            let changed = mailbox.mailbox_state_mut().apply_status(&status);
            mailbox.init_session_mailbox(status.message_count);
            (changed, mailbox.special_use())
        };
        if epoch_changed {
            info!("UIDVALIDITY of {} changed, resyncing from scratch", path);
            self.emit(SyncEvent::Mailbox {
                kind: EventKind::Update,
                mailbox: MailboxInfo {
                    special_use,
                    ..MailboxInfo::from_path(path)
                },
            });
        }
        self.emit(SyncEvent::MailboxStatus(status.clone()));

        let _lock = tokio::select! {
            guard = self.inner.ctx.locks.acquire(path) => guard,
            () = self.inner.token.cancelled() => return Ok(()),
        };
        connection.examine(path).await?;

        let (resume_uid, known_mod_seq, mail_count, block_size) = {
            let mailbox = self.inner.mailbox.lock();
            let state = mailbox.mailbox_state();
            (
                state.max_imported_uid(),
                state.max_imported_mod_seq(),
                mailbox.mail_count,
                mailbox.download_block_size,
            )
        };

        let changed_since = known_mod_seq.filter(|_| {
            self.inner.ctx.config.qresync
                && status.highest_mod_seq.is_some()
                && connection.supports_mod_seq()
        });
        // Mod-sequences are not ordered by UID, so CHANGEDSINCE only
        // covers what was already imported. The tail is always planned.
        if let Some((since, max_uid)) = changed_since.zip(resume_uid) {
            let imported = UidRange {
                from_uid: 1,
                to: UidBound::Uid(max_uid),
                block_size,
            };
            debug!("Fetching changes to {} in {} since {}", path, imported, since);
            if !self.fetch_window(connection, &imported, Some(since)).await? {
                return Ok(());
            }
        }

        let start = resume_uid.map_or(RangeStart::Sequence(1), |uid| {
            RangeStart::Uid(uid.saturating_add(1))
        });
        let mut planner = UidRangePlanner::new(mail_count);
        debug!("Planning {} from {:?} (count {:?})", path, start, mail_count);

        planner.init(&mut *connection, start, block_size).await?;
        while let Some(window) = planner.window().copied() {
            if self.is_stopped() {
                break;
            }
            self.inner
                .mailbox
                .lock()
                .report_block_size_usage(now(), window.block_size);

            if !self.fetch_window(connection, &window, None).await? {
                break;
            }
            let block_size = self.inner.mailbox.lock().download_block_size;
            planner.advance(&mut *connection, block_size).await?;
        }
        Ok(())
    }

    /// Fetch one window. Returns `false` if the process was stopped
    /// midway.
    async fn fetch_window(
        &self,
        connection: &mut dyn MailboxConnection,
        window: &UidRange,
        changed_since: Option<u64>,
    ) -> Result<bool> {
        debug!("Fetching {} (block size {})", window, window.block_size);
        let started = Instant::now();
        let mut messages = connection.fetch(window, changed_since).await?;

        while let Some(message) = messages.next().await {
            if self.is_stopped() {
                return Ok(false);
            }
            self.handle_message(message?, started);
        }
        Ok(!self.is_stopped())
    }

    fn handle_message(&self, message: ImapMessage, window_started: Instant) {
        if message.source.is_some() {
            let bytes = message.payload_len();
            let elapsed_ms = window_started.elapsed().as_millis().max(1);
            #[allow(clippy::cast_precision_loss)]
            let throughput = bytes as f64 / elapsed_ms as f64;
            self.inner
                .mailbox
                .lock()
                .report_throughput(now(), throughput);
            self.report(ControlMessage::Download {
                process_id: self.id(),
                bytes,
            });
        } else {
            self.emit(SyncEvent::Error(
                SyncError::new(SyncErrorKind::MissingSource, "message fetched without source")
                    .in_mailbox(&message.mailbox)
                    .for_uid(message.uid),
            ));
        }

        let created = self
            .inner
            .mailbox
            .lock()
            .mailbox_state_mut()
            .record_fetched(message.uid, message.mod_seq);
        let kind = if created {
            EventKind::Create
        } else {
            EventKind::Update
        };
        self.emit(SyncEvent::Message { kind, message });
    }
}
