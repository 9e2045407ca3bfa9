//! In-memory transport for unit tests

use crate::config::Account;
use crate::error::{Error, Result};
use crate::flag::Flag;
use crate::imap::{Connector, ImapMessage, MailboxConnection, MessagePosition, SequenceResolver};
use crate::mailbox::ListedMailbox;
use crate::range::{UidBound, UidRange};
use crate::state::MailboxStatus;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone)]
pub struct FakeMessage {
    pub uid: u32,
    pub mod_seq: u64,
    pub source: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct FakeMailbox {
    pub path: String,
    pub uid_validity: u32,
    pub attributes: Vec<String>,
    pub messages: Vec<FakeMessage>,
}

impl FakeMailbox {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            uid_validity: 1,
            attributes: Vec::new(),
            messages: Vec::new(),
        }
    }

    /// `count` messages with UIDs and mod-sequences `1..=count`.
    pub fn with_messages(path: &str, uid_validity: u32, count: u32) -> Self {
        Self {
            uid_validity,
            messages: (1..=count)
                .map(|uid| FakeMessage {
                    uid,
                    mod_seq: u64::from(uid),
                    source: Some(format!("Subject: message {uid}\r\n\r\nbody {uid}\r\n").into_bytes()),
                })
                .collect(),
            ..Self::new(path)
        }
    }

    pub fn with_attribute(mut self, attribute: &str) -> Self {
        self.attributes.push(attribute.to_string());
        self
    }

    pub fn set_mod_seq(&mut self, uid: u32, mod_seq: u64) {
        if let Some(message) = self.messages.iter_mut().find(|m| m.uid == uid) {
            message.mod_seq = mod_seq;
        }
    }

    pub fn drop_source(&mut self, uid: u32) {
        if let Some(message) = self.messages.iter_mut().find(|m| m.uid == uid) {
            message.source = None;
        }
    }
}

#[derive(Debug, Default)]
struct FakeServer {
    mailboxes: Vec<FakeMailbox>,
    mod_seq: bool,
    failing_connections: u32,
    connects: usize,
    logouts: usize,
    fetched: Vec<String>,
}

/// Connector over a shared in-memory server. Clones share the server.
#[derive(Debug, Clone, Default)]
pub struct FakeConnector {
    server: Arc<Mutex<FakeServer>>,
}

impl FakeConnector {
    pub fn new(mailboxes: Vec<FakeMailbox>) -> Self {
        Self {
            server: Arc::new(Mutex::new(FakeServer {
                mailboxes,
                ..FakeServer::default()
            })),
        }
    }

    /// Advertise CONDSTORE and report mod-sequences.
    pub fn with_mod_seq_support(self) -> Self {
        self.lock().mod_seq = true;
        self
    }

    fn lock(&self) -> MutexGuard<'_, FakeServer> {
        self.server.lock().unwrap()
    }

    /// Make the next `count` connection attempts fail.
    pub fn fail_connections(&self, count: u32) {
        self.lock().failing_connections = count;
    }

    pub fn fetched_ranges(&self) -> Vec<String> {
        self.lock().fetched.clone()
    }

    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    pub fn logouts(&self) -> usize {
        self.lock().logouts
    }
}

impl Connector for FakeConnector {
    fn connect<'a>(&'a self, _account: &'a Account) -> BoxFuture<'a, Result<Box<dyn MailboxConnection>>> {
        async move {
            let mut server = self.lock();
            server.connects += 1;
            if server.failing_connections > 0 {
                server.failing_connections -= 1;
                return Err(Error::Connection("connection refused".into()));
            }
            drop(server);
            Ok(Box::new(FakeConnection {
                server: self.server.clone(),
                selected: None,
            }) as Box<dyn MailboxConnection>)
        }
        .boxed()
    }
}

struct FakeConnection {
    server: Arc<Mutex<FakeServer>>,
    selected: Option<String>,
}

impl FakeConnection {
    fn selected_messages(&self) -> Result<Vec<FakeMessage>> {
        let path = self
            .selected
            .as_ref()
            .ok_or_else(|| Error::Imap("No mailbox selected".into()))?;
        let server = self.server.lock().unwrap();
        let mailbox = server
            .mailboxes
            .iter()
            .find(|m| &m.path == path)
            .ok_or_else(|| Error::Imap(format!("No such mailbox: {path}")))?;
        let mut messages = mailbox.messages.clone();
        messages.sort_by_key(|m| m.uid);
        Ok(messages)
    }
}

fn position(messages: &[FakeMessage], idx: usize) -> MessagePosition {
    MessagePosition {
        seq: u32::try_from(idx).unwrap() + 1,
        uid: messages[idx].uid,
    }
}

impl SequenceResolver for FakeConnection {
    fn resolve_sequence(&mut self, seq: u32) -> BoxFuture<'_, Result<Option<MessagePosition>>> {
        let result = self.selected_messages().map(|messages| {
            let idx = usize::try_from(seq).ok()?.checked_sub(1)?;
            (idx < messages.len()).then(|| position(&messages, idx))
        });
        async move { result }.boxed()
    }

    fn resolve_uid(&mut self, uid: u32) -> BoxFuture<'_, Result<Option<MessagePosition>>> {
        let result = self.selected_messages().map(|messages| {
            messages
                .iter()
                .position(|m| m.uid >= uid)
                .map(|idx| position(&messages, idx))
        });
        async move { result }.boxed()
    }
}

impl MailboxConnection for FakeConnection {
    fn supports_mod_seq(&self) -> bool {
        self.server.lock().unwrap().mod_seq
    }

    fn list(&mut self) -> BoxFuture<'_, Result<Vec<ListedMailbox>>> {
        let listed = self
            .server
            .lock()
            .unwrap()
            .mailboxes
            .iter()
            .map(|m| ListedMailbox {
                path: m.path.clone(),
                delimiter: Some("/".to_string()),
                attributes: m.attributes.clone(),
            })
            .collect();
        async move { Ok(listed) }.boxed()
    }

    fn status<'a>(&'a mut self, path: &'a str) -> BoxFuture<'a, Result<MailboxStatus>> {
        let server = self.server.lock().unwrap();
        let result = server
            .mailboxes
            .iter()
            .find(|m| m.path == path)
            .map(|m| MailboxStatus {
                path: path.to_string(),
                message_count: Some(u32::try_from(m.messages.len()).unwrap()),
                uid_next: m.messages.iter().map(|m| m.uid).max().unwrap_or(0) + 1,
                uid_validity: m.uid_validity,
                highest_mod_seq: server
                    .mod_seq
                    .then(|| m.messages.iter().map(|m| m.mod_seq).max().unwrap_or(0)),
            })
            .ok_or_else(|| Error::Imap(format!("STATUS {path} failed: no such mailbox")));
        drop(server);
        async move { result }.boxed()
    }

    fn examine<'a>(&'a mut self, path: &'a str) -> BoxFuture<'a, Result<()>> {
        self.selected = Some(path.to_string());
        async move { self.selected_messages().map(|_| ()) }.boxed()
    }

    fn fetch<'a>(
        &'a mut self,
        range: &'a UidRange,
        changed_since: Option<u64>,
    ) -> BoxFuture<'a, Result<BoxStream<'a, Result<ImapMessage>>>> {
        async move {
            let messages = self.selected_messages()?;
            let mut server = self.server.lock().unwrap();
            server.fetched.push(range.to_string());
            let with_mod_seq = server.mod_seq;
            drop(server);

            let path = self.selected.clone().unwrap_or_default();
            let to = match range.to {
                UidBound::Uid(uid) => uid,
                UidBound::Open => u32::MAX,
            };
            let fetched: Vec<Result<ImapMessage>> = messages
                .into_iter()
                .filter(|m| m.uid >= range.from_uid && m.uid <= to)
                .filter(|m| changed_since.is_none_or(|since| m.mod_seq > since))
                .map(|m| {
                    Ok(ImapMessage {
                        mailbox: path.clone(),
                        uid: m.uid,
                        mod_seq: with_mod_seq.then_some(m.mod_seq),
                        flags: vec![Flag::Seen],
                        size: m.source.as_ref().map(|s| u32::try_from(s.len()).unwrap()),
                        internal_date: None,
                        source: m.source,
                    })
                })
                .collect();
            Ok(stream::iter(fetched).boxed())
        }
        .boxed()
    }

    fn logout(&mut self) -> BoxFuture<'_, Result<()>> {
        self.server.lock().unwrap().logouts += 1;
        async { Ok(()) }.boxed()
    }
}
