//! In-process fake IMAP server for integration testing
//!
//! # How IMAP works (educational overview)
//!
//! IMAP (Internet Message Access Protocol, RFC 3501) is a text-based
//! protocol for accessing email on a remote server. A sync client
//! walks the folder tree, asks each folder for its counters and then
//! downloads messages in UID windows.
//!
//! ## Connection lifecycle
//!
//! ```text
//!   Client connects via TCP (and TLS right away on port 993)
//!       |
//!   Server sends greeting: "* OK IMAP4rev1 ready\r\n"
//!       |
//!   On port 143 the client sends STARTTLS and upgrades the connection
//!       |
//!   Client sends LOGIN with username and password
//!       |
//!   Client issues commands: LIST, STATUS, EXAMINE, FETCH, ...
//!       |
//!   Client sends LOGOUT
//! ```
//!
//! ## Command format
//!
//! Every client command starts with a **tag** -- an arbitrary string
//! the client chooses (async-imap uses `A0001`, `A0002`, etc.). The
//! server echoes this tag in its completion response so the client can
//! match responses to commands:
//!
//! ```text
//!   Client:  A0001 LOGIN user pass
//!   Server:  A0001 OK LOGIN completed
//! ```
//!
//! Lines prefixed with `*` are **untagged** responses -- data the
//! server sends before the final tagged OK/NO/BAD:
//!
//! ```text
//!   Client:  A0003 STATUS "INBOX" (MESSAGES UIDNEXT UIDVALIDITY)
//!   Server:  * STATUS "INBOX" (MESSAGES 2 UIDNEXT 3 UIDVALIDITY 1)
//!   Server:  A0003 OK STATUS completed
//! ```
//!
//! ## Sequence numbers and UIDs
//!
//! Messages are addressed either by sequence number (their 1-based
//! position in the folder) or by UID. `FETCH 5 (UID)` maps a position
//! to a UID; `UID FETCH 100:* (UID)` finds the first position at or
//! after a UID. Sync clients combine both to plan download windows.

use super::handlers::{
    FetchItems, handle_capability, handle_examine, handle_fetch, handle_list, handle_login,
    handle_logout, handle_status,
};
use super::io::write_line;
use super::mailbox::Mailbox;
use imap_codec::CommandCodec;
use imap_codec::decode::Decoder;
use imap_codec::imap_types::command::CommandBody;
use imap_codec::imap_types::mailbox::Mailbox as ImapMailbox;
use rcgen::generate_simple_self_signed;
use rustls::pki_types::PrivatePkcs8KeyDer;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

/// How clients secure their connection to the fake server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Greeting on plain TCP, then STARTTLS (port 143 style).
    StartTls,
    /// TLS handshake first, greeting inside TLS (port 993 style).
    ImplicitTls,
}

/// A fake IMAP server that runs on localhost with an OS-assigned port.
///
/// The server generates a self-signed TLS certificate at startup using
/// `rcgen`, so no cert files are needed. It speaks enough of the IMAP
/// protocol to run a full sync session against it: greeting -> TLS ->
/// LOGIN -> LIST/STATUS/EXAMINE/FETCH -> LOGOUT.
pub struct FakeImapServer {
    port: u16,
    connections: Arc<AtomicUsize>,
    /// Handle to the background task so it lives as long as the server.
    _handle: tokio::task::JoinHandle<()>,
}

impl FakeImapServer {
    /// Start a STARTTLS server with the given mailbox state.
    pub async fn start(mailbox: Mailbox) -> Self {
        Self::start_with(mailbox, Transport::StartTls).await
    }

    /// Start a new fake IMAP server with the given mailbox state.
    ///
    /// 1. Binds to `127.0.0.1:0` -- the OS picks a free port.
    /// 2. Generates a self-signed TLS certificate via `rcgen`.
    /// 3. Spawns a tokio task that accepts connections and speaks
    ///    IMAP.
    ///
    /// The accept loop keeps running until the test runtime shuts
    /// down.
    pub async fn start_with(mailbox: Mailbox, transport: Transport) -> Self {
        // Ensure the ring crypto provider is installed
        // process-wide. Multiple tests may race to install it, so
        // we ignore the error if it's already set.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind to ephemeral port");
        let port = listener.local_addr().unwrap().port();

        // "127.0.0.1" as the subject alt name since that's what the
        // client connects to.
        let cert = generate_simple_self_signed(vec!["127.0.0.1".to_string()])
            .expect("generate self-signed cert");

        let cert_der = cert.cert.der().clone();
        let key_der = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());

        let tls_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der.into())
            .expect("build server TLS config");

        let acceptor = TlsAcceptor::from(Arc::new(tls_config));
        let mailbox = Arc::new(Mutex::new(mailbox));
        let connections = Arc::new(AtomicUsize::new(0));

        // Each incoming connection gets its own task that runs the
        // IMAP state machine.
        let counter = connections.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _addr)) = listener.accept().await else {
                    break;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let acceptor = acceptor.clone();
                let mailbox = mailbox.clone();
                tokio::spawn(async move {
                    match transport {
                        Transport::StartTls => {
                            handle_starttls_connection(stream, acceptor, &mailbox).await;
                        }
                        Transport::ImplicitTls => {
                            handle_tls_connection(stream, acceptor, &mailbox).await;
                        }
                    }
                });
            }
        });

        Self {
            port,
            connections,
            _handle: handle,
        }
    }

    /// The port the server is listening on.
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// How many TCP connections were accepted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

const GREETING: &str = "* OK IMAP4rev1 Fake server ready\r\n";

/// Handle a client that upgrades with STARTTLS.
///
/// 1. Send the server greeting (pre-TLS, on the raw TCP stream)
/// 2. Wait for the STARTTLS command and upgrade to TLS
/// 3. Process authenticated commands (LOGIN, LIST, EXAMINE, etc.)
async fn handle_starttls_connection(
    stream: tokio::net::TcpStream,
    acceptor: TlsAcceptor,
    mailbox: &Mutex<Mailbox>,
) {
    let mut reader = BufReader::new(stream);

    // RFC 3501 Section 7.1.1: Server greeting
    if write_line(&mut reader, GREETING).await.is_err() {
        return;
    }

    let mut line = String::new();
    if reader.read_line(&mut line).await.is_err() {
        return;
    }

    let parts: Vec<&str> = line.trim().splitn(2, ' ').collect();
    if parts.len() < 2 {
        return;
    }
    let tag = parts[0];
    let command = parts[1].to_uppercase();

    if command != "STARTTLS" {
        let resp = format!("{tag} BAD Expected STARTTLS\r\n");
        let _ = write_line(&mut reader, &resp).await;
        return;
    }

    let resp = format!("{tag} OK Begin TLS negotiation now\r\n");
    if write_line(&mut reader, &resp).await.is_err() {
        return;
    }

    let tcp = reader.into_inner();
    let Ok(tls_stream) = acceptor.accept(tcp).await else {
        return;
    };
    handle_imap_session(tls_stream, mailbox).await;
}

/// Handle a client that speaks TLS from the first byte. The greeting
/// is sent inside the encrypted stream.
async fn handle_tls_connection(
    stream: tokio::net::TcpStream,
    acceptor: TlsAcceptor,
    mailbox: &Mutex<Mailbox>,
) {
    let Ok(tls_stream) = acceptor.accept(stream).await else {
        return;
    };
    let mut reader = BufReader::new(tls_stream);
    if write_line(&mut reader, GREETING).await.is_err() {
        return;
    }
    handle_imap_session(reader.into_inner(), mailbox).await;
}

/// Extract the folder name from a parsed `imap_types::Mailbox`.
fn mailbox_name(mb: &ImapMailbox<'_>) -> String {
    match mb {
        ImapMailbox::Inbox => "INBOX".to_string(),
        ImapMailbox::Other(other) => {
            let bytes: &[u8] = other.as_ref();
            String::from_utf8_lossy(bytes).into_owned()
        }
    }
}

/// Run the authenticated IMAP command loop over an established
/// stream.
///
/// Uses `imap-codec`'s `CommandCodec` to parse each client command
/// into a strongly-typed `Command`, then dispatches to the
/// appropriate handler based on the `CommandBody` variant. Handlers
/// receive a snapshot (`Mailbox` clone) taken under lock.
async fn handle_imap_session<S: AsyncRead + AsyncWrite + Unpin>(
    stream: S,
    mailbox: &Mutex<Mailbox>,
) {
    let mut reader = BufReader::new(stream);
    let mut selected_folder: Option<String> = None;
    let codec = CommandCodec::default();

    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let Ok((_, command)) = codec.decode(line.as_bytes()) else {
            let tag = trimmed.split_whitespace().next().unwrap_or("*");
            let resp = format!("{tag} BAD Parse error\r\n");
            if write_line(&mut reader, &resp).await.is_err() {
                break;
            }
            continue;
        };

        let tag = command.tag.inner();
        let snap = mailbox.lock().unwrap().clone();

        match command.body {
            CommandBody::Capability => {
                handle_capability(tag, &mut reader).await;
            }
            CommandBody::Login { .. } => {
                if !handle_login(tag, &mut reader).await {
                    break;
                }
            }
            CommandBody::List { .. } => {
                handle_list(tag, &snap, &mut reader).await;
            }
            CommandBody::Status { mailbox: mb, .. } => {
                handle_status(tag, &mailbox_name(&mb), &snap, &mut reader).await;
            }
            CommandBody::Examine { mailbox: mb, .. } | CommandBody::Select { mailbox: mb, .. } => {
                let name = mailbox_name(&mb);
                selected_folder = handle_examine(tag, &name, &snap, &mut reader).await;
            }
            CommandBody::Fetch {
                ref sequence_set,
                uid,
                ..
            } => {
                handle_fetch(
                    tag,
                    sequence_set,
                    uid,
                    FetchItems::from_command(trimmed),
                    &snap,
                    selected_folder.as_deref(),
                    &mut reader,
                )
                .await;
            }
            CommandBody::Logout => {
                handle_logout(tag, &mut reader).await;
                break;
            }
            _ => {
                let resp = format!("{tag} BAD Unknown command\r\n");
                if write_line(&mut reader, &resp).await.is_err() {
                    break;
                }
            }
        }
    }
}
