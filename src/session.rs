//! Sync Session
//!
//! Orchestrates one run over an account: discovers the mailbox tree,
//! reconciles it with the known state, and drives a processes
//! optimizer from a single control loop until every mailbox is synced,
//! the download quota is nearly used up, or the session is stopped.

use crate::config::{Account, SyncConfig};
use crate::connection::ImapConnector;
use crate::error::{Error, Result};
use crate::event::{EventKind, SyncError, SyncErrorKind, SyncEvent, SyncEventListener};
use crate::history::now;
use crate::imap::Connector;
use crate::lock::MailboxLocks;
use crate::mailbox::{MailboxInfo, MailboxNode, build_tree};
use crate::optimizer::{ProcessCommand, ProcessId, ProcessesOptimizer, processes_optimizer};
use crate::process::{ProcessContext, SyncProcess};
use crate::session_mailbox::{Importance, SharedMailbox, SyncSessionMailbox};
use crate::state::{MailboxState, SyncState};
use crate::timer::PeriodicTask;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle of a [`SyncSession`].
///
/// A run leaves `Running` for `Postponed` or `Finished` and stays there so
/// the outcome can be read back; [`SyncSession::stop`] then returns the
/// session to `Paused`, and [`SyncSession::start`] may begin the next run
/// from any of the three.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncSessionState {
    Paused,
    Running,
    /// The download quota is nearly used up; see the postponed event.
    Postponed,
    Finished,
}

/// Reports processed by the session control loop.
#[derive(Debug)]
pub(crate) enum ControlMessage {
    /// The processes optimizer is due.
    Tick,
    /// A process downloaded one message of `bytes`.
    Download { process_id: ProcessId, bytes: u64 },
    /// A process reached the end of its mailbox, failed, or was stopped.
    MailboxFinished { process_id: ProcessId },
    ConnectionFailed { process_id: ProcessId },
}

/// Counters of one run, logged when it shuts down.
#[derive(Debug, Clone)]
pub struct SessionMetrics {
    pub started_at: DateTime<Utc>,
    pub downloaded_bytes: u64,
    pub downloaded_messages: u64,
    pub processes_started: u64,
}

impl SessionMetrics {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            downloaded_bytes: 0,
            downloaded_messages: 0,
            processes_started: 0,
        }
    }
}

/// Sort the discovered tree into mailboxes to sync and mailboxes to
/// keep untouched, emitting CREATE and DELETE events for differences
/// with `known`.
pub fn reconcile(
    known: Vec<MailboxState>,
    roots: &[MailboxNode],
    config: &SyncConfig,
    listener: &dyn SyncEventListener,
) -> (Vec<SyncSessionMailbox>, Vec<MailboxState>) {
    let mut known: Vec<Option<MailboxState>> = known.into_iter().map(Some).collect();
    let mut active = Vec::new();
    let mut retained = Vec::new();

    for node in roots.iter().flat_map(MailboxNode::walk) {
        let existing = known
            .iter_mut()
            .find(|slot| slot.as_ref().is_some_and(|s| s.path == node.info.path))
            .and_then(Option::take);

        let mut mailbox = match existing {
            Some(state) => SyncSessionMailbox::new(state, config),
            None => {
                listener.on_event(SyncEvent::Mailbox {
                    kind: EventKind::Create,
                    mailbox: node.info.clone(),
                });
                SyncSessionMailbox::from_node(&node.info, config)
            }
        };
        mailbox.set_special_use(node.info.special_use);

        if mailbox.importance() == Importance::NoSync || node.info.disabled {
            debug!("Not syncing {}", node.info.path);
            retained.push(mailbox.mailbox_state().clone());
        } else {
            active.push(mailbox);
        }
    }

    for gone in known.into_iter().flatten() {
        info!("Mailbox {} disappeared from the server", gone.path);
        listener.on_event(SyncEvent::Mailbox {
            kind: EventKind::Delete,
            mailbox: MailboxInfo::from_path(&gone.path),
        });
    }

    (active, retained)
}

/// Connect once and list the mailbox tree.
async fn discover(connector: &dyn Connector, account: &Account) -> Result<Vec<MailboxNode>> {
    let mut connection = connector.connect(account).await?;
    let listed = connection.list().await;
    if let Err(e) = connection.logout().await {
        debug!("Logout after discovery failed: {}", e);
    }
    let listed = listed?;
    info!("Discovered {} mailboxes", listed.len());
    Ok(build_tree(listed))
}

/// State of the session control loop.
pub(crate) struct SessionControl {
    optimizer: Box<dyn ProcessesOptimizer>,
    processes: HashMap<ProcessId, SyncProcess>,
    timer: Option<PeriodicTask>,
    ctx: ProcessContext,
    max_quota: u64,
    metrics: SessionMetrics,
    finished: bool,
    done: bool,
    state_tx: watch::Sender<SyncSessionState>,
}

impl SessionControl {
    pub(crate) fn new(
        optimizer: Box<dyn ProcessesOptimizer>,
        ctx: ProcessContext,
        max_quota: u64,
        state_tx: watch::Sender<SyncSessionState>,
    ) -> Self {
        Self {
            optimizer,
            processes: HashMap::new(),
            timer: None,
            ctx,
            max_quota,
            metrics: SessionMetrics::new(),
            finished: false,
            done: false,
            state_tx,
        }
    }

    fn emit(&self, event: SyncEvent) {
        self.ctx.listener.on_event(event);
    }

    /// Start the optimizer timer and the first processes.
    pub(crate) fn begin(&mut self) {
        let control = self.ctx.control.clone();
        self.timer = Some(PeriodicTask::spawn(self.optimizer.interval(), move || {
            std::future::ready(control.send(ControlMessage::Tick).is_ok())
        }));
        let commands = self.optimizer.start(now());
        self.apply(commands);
        self.check_exhausted();
    }

    pub(crate) fn handle(&mut self, message: ControlMessage) {
        match message {
            ControlMessage::Tick => {
                let commands = self.optimizer.optimize(now());
                self.apply(commands);
            }
            ControlMessage::Download { bytes, .. } => self.on_download(bytes),
            ControlMessage::MailboxFinished { process_id } => {
                self.processes.remove(&process_id);
                let commands = self.optimizer.mailbox_finished(process_id, now());
                self.apply(commands);
            }
            ControlMessage::ConnectionFailed { process_id } => {
                self.processes.remove(&process_id);
                let commands = self.optimizer.connection_failed(process_id, now());
                self.apply(commands);
            }
        }
        self.check_exhausted();
    }

    fn apply(&mut self, commands: Vec<ProcessCommand>) {
        for command in commands {
            if self.done {
                return;
            }
            match command {
                ProcessCommand::Start {
                    process_id,
                    mailbox,
                } => self.start_process(process_id, mailbox),
                ProcessCommand::Stop { process_id } => {
                    if let Some(process) = self.processes.remove(&process_id) {
                        let mailbox = process.stop();
                        self.optimizer.release(mailbox);
                    }
                }
                ProcessCommand::Abandon { path } => {
                    self.emit(SyncEvent::Error(
                        SyncError::new(
                            SyncErrorKind::Abandoned,
                            "too many connection failures, skipped for this run",
                        )
                        .in_mailbox(path),
                    ));
                }
            }
        }
    }

    fn start_process(&mut self, process_id: ProcessId, mailbox: SharedMailbox) {
        let process = SyncProcess::new(process_id, mailbox, self.ctx.clone());
        self.processes.insert(process_id, process.clone());
        self.metrics.processes_started += 1;
        tokio::spawn(async move {
            process.start().await;
        });
    }

    fn check_exhausted(&mut self) {
        if !self.done && self.optimizer.is_exhausted() {
            self.on_all_mailboxes_finished();
        }
    }

    pub(crate) fn on_download(&mut self, bytes: u64) {
        self.metrics.downloaded_bytes += bytes;
        self.metrics.downloaded_messages += 1;

        let limit = self
            .max_quota
            .saturating_sub(self.ctx.config.quota_safety_threshold);
        if !self.done && self.metrics.downloaded_bytes > limit {
            warn!(
                "Downloaded {} of {} bytes quota, postponing",
                self.metrics.downloaded_bytes, self.max_quota
            );
            self.postpone();
        }
    }

    fn postpone(&mut self) {
        self.shutdown();
        let resume_at = Utc::now()
            + chrono::Duration::from_std(self.ctx.config.postpone_duration)
                .unwrap_or_else(|_| chrono::Duration::days(1));
        self.state_tx.send_replace(SyncSessionState::Postponed);
        self.emit(SyncEvent::Postponed { resume_at });
    }

    /// Idempotent: only the first call shuts down and reports.
    pub(crate) fn on_all_mailboxes_finished(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.shutdown();
        self.state_tx.send_replace(SyncSessionState::Finished);
        self.emit(SyncEvent::Finished {
            downloaded_bytes: self.metrics.downloaded_bytes,
        });
    }

    /// Stop the optimizer timer, then every process, then forget them.
    pub(crate) fn shutdown(&mut self) {
        self.done = true;
        if let Some(timer) = self.timer.take() {
            timer.stop();
        }
        for process in self.processes.values() {
            process.stop();
        }
        self.processes.clear();

        let elapsed = Utc::now() - self.metrics.started_at;
        info!(
            "Session shut down after {}s: {} messages, {} bytes, {} processes",
            elapsed.num_seconds(),
            self.metrics.downloaded_messages,
            self.metrics.downloaded_bytes,
            self.metrics.processes_started
        );
    }

    pub(crate) async fn run(
        mut self,
        mut reports: mpsc::UnboundedReceiver<ControlMessage>,
        token: CancellationToken,
    ) -> SyncSessionState {
        self.begin();
        while !self.done {
            tokio::select! {
                () = token.cancelled() => {
                    self.shutdown();
                    self.state_tx.send_replace(SyncSessionState::Paused);
                }
                report = reports.recv() => match report {
                    Some(report) => self.handle(report),
                    None => break,
                },
            }
        }
        *self.state_tx.borrow()
    }
}

#[derive(Debug)]
struct Tracked {
    base: SyncState,
    active: Vec<SharedMailbox>,
    retained: Vec<MailboxState>,
    discovered: bool,
}

struct ActiveRun {
    token: CancellationToken,
    handle: JoinHandle<Result<SyncSessionState>>,
}

/// An adaptive sync run over one account.
///
/// ```no_run
/// use imap_adsync::{Account, SyncConfig, SyncSession, SyncState};
/// use tokio::sync::mpsc;
///
/// # async fn demo() -> imap_adsync::Result<()> {
/// let (events, mut rx) = mpsc::unbounded_channel();
/// let mut session = SyncSession::new(events, SyncConfig::default());
/// let account = Account::new("imap.example.com", 993, "alice").with_password("secret");
/// session.start(SyncState::new(account, 1_000_000_000))?;
/// while let Some(event) = rx.recv().await {
///     println!("{event:?}");
/// }
/// # Ok(())
/// # }
/// ```
pub struct SyncSession {
    config: Arc<SyncConfig>,
    connector: Arc<dyn Connector>,
    listener: Arc<dyn SyncEventListener>,
    locks: MailboxLocks,
    state_tx: watch::Sender<SyncSessionState>,
    tracked: Arc<Mutex<Option<Tracked>>>,
    run: Option<ActiveRun>,
}

impl SyncSession {
    /// Session over real IMAP connections.
    pub fn new(listener: impl SyncEventListener + 'static, config: SyncConfig) -> Self {
        Self::with_connector(listener, config, Arc::new(ImapConnector::new()))
    }

    pub fn with_connector(
        listener: impl SyncEventListener + 'static,
        config: SyncConfig,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SyncSessionState::Paused);
        Self {
            config: Arc::new(config),
            connector,
            listener: Arc::new(listener),
            locks: MailboxLocks::new(),
            state_tx,
            tracked: Arc::new(Mutex::new(None)),
            run: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> SyncSessionState {
        *self.state_tx.borrow()
    }

    /// Receiver notified on every state change.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SyncSessionState> {
        self.state_tx.subscribe()
    }

    fn lock_tracked(&self) -> MutexGuard<'_, Option<Tracked>> {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Begin a run from `state`. Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Invariant`] if a run is already in progress.
    pub fn start(&mut self, state: SyncState) -> Result<()> {
        if self.state() == SyncSessionState::Running {
            return Err(Error::Invariant("sync session is already running".into()));
        }
        if let Some(previous) = self.run.take() {
            previous.token.cancel();
        }

        info!(
            "Starting sync session for {}@{}",
            state.account.username, state.account.host
        );
        self.state_tx.send_replace(SyncSessionState::Running);
        *self.lock_tracked() = Some(Tracked {
            base: state.clone(),
            active: Vec::new(),
            retained: Vec::new(),
            discovered: false,
        });

        let (control, reports) = mpsc::unbounded_channel();
        let ctx = ProcessContext {
            account: Arc::new(state.account.clone()),
            config: self.config.clone(),
            connector: self.connector.clone(),
            listener: self.listener.clone(),
            locks: self.locks.clone(),
            control,
        };
        let token = CancellationToken::new();
        let handle = tokio::spawn(run_session(
            ctx,
            state,
            self.tracked.clone(),
            self.state_tx.clone(),
            reports,
            token.clone(),
        ));
        self.run = Some(ActiveRun { token, handle });
        Ok(())
    }

    /// Gracefully pause: stop the optimizer and every process, then
    /// wait for the run to wind down.
    pub async fn stop(&mut self) {
        if let Some(run) = self.run.take() {
            run.token.cancel();
            if let Err(e) = run.handle.await {
                warn!("Session task ended abnormally: {}", e);
            }
        }
        self.state_tx.send_replace(SyncSessionState::Paused);
    }

    /// Wait for the current run to end.
    ///
    /// # Errors
    ///
    /// Returns the discovery error if the mailbox tree could not be
    /// listed.
    pub async fn join(&mut self) -> Result<SyncSessionState> {
        let Some(run) = self.run.take() else {
            return Ok(self.state());
        };
        run.handle
            .await
            .map_err(|e| Error::Invariant(format!("sync session task failed: {e}")))?
    }

    /// The state handed to [`SyncSession::start`] with current
    /// bookmarks. Mailboxes deleted on the server are left out.
    #[must_use]
    pub fn sync_state(&self) -> Option<SyncState> {
        let tracked = self.lock_tracked();
        let tracked = tracked.as_ref()?;
        let mut state = tracked.base.clone();
        if tracked.discovered {
            state.mailboxes = tracked
                .active
                .iter()
                .map(|m| m.lock().mailbox_state().clone())
                .chain(tracked.retained.iter().cloned())
                .collect();
        }
        Some(state)
    }

    /// Attachment hashes already imported, when de-duplication is on.
    #[must_use]
    pub fn attachment_ledger(&self) -> Vec<String> {
        if !self.config.attachment_deduplication {
            return Vec::new();
        }
        self.lock_tracked()
            .as_ref()
            .map(|t| t.base.imported_attachment_hashes.clone())
            .unwrap_or_default()
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        if let Some(run) = self.run.take() {
            run.token.cancel();
        }
    }
}

async fn run_session(
    ctx: ProcessContext,
    state: SyncState,
    tracked: Arc<Mutex<Option<Tracked>>>,
    state_tx: watch::Sender<SyncSessionState>,
    reports: mpsc::UnboundedReceiver<ControlMessage>,
    token: CancellationToken,
) -> Result<SyncSessionState> {
    let discovered = tokio::select! {
        result = discover(ctx.connector.as_ref(), &ctx.account) => result,
        () = token.cancelled() => {
            state_tx.send_replace(SyncSessionState::Paused);
            return Ok(SyncSessionState::Paused);
        }
    };
    let roots = match discovered {
        Ok(roots) => roots,
        Err(e) => {
            warn!("Mailbox discovery failed: {}", e);
            ctx.listener.on_event(SyncEvent::Error(SyncError::new(
                SyncErrorKind::Discovery,
                e.to_string(),
            )));
            state_tx.send_replace(SyncSessionState::Paused);
            return Err(e);
        }
    };

    let (active, retained) = reconcile(
        state.mailboxes.clone(),
        &roots,
        &ctx.config,
        ctx.listener.as_ref(),
    );
    let active: Vec<SharedMailbox> = active.into_iter().map(SharedMailbox::new).collect();
    info!("Syncing {} mailboxes", active.len());
    {
        let mut tracked = tracked.lock().unwrap_or_else(PoisonError::into_inner);
        *tracked = Some(Tracked {
            base: state.clone(),
            active: active.clone(),
            retained,
            discovered: true,
        });
    }

    let optimizer = processes_optimizer(&ctx.config, active);
    let control = SessionControl::new(optimizer, ctx, state.max_quota, state_tx);
    Ok(control.run(reports, token).await)
}
