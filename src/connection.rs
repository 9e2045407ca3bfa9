//! IMAP connections over TLS
//!
//! [`ImapConnector`] opens a TLS-wrapped `async-imap` session, either
//! directly or through STARTTLS, authenticates it and exposes it as a
//! [`MailboxConnection`].

use crate::config::{Account, Security};
use crate::error::{Error, Result};
use crate::flag::Flag;
use crate::imap::{Connector, ImapMessage, MailboxConnection, MessagePosition, SequenceResolver};
use crate::mailbox::ListedMailbox;
use crate::range::UidRange;
use crate::state::MailboxStatus;
use async_imap::Session;
use async_imap::types::{Fetch, NameAttribute};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use rustls::pki_types::ServerName;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{debug, info};

/// A TLS-wrapped IMAP session.
pub type ImapSession = Session<Compat<tokio_rustls::client::TlsStream<TcpStream>>>;

const FETCH_ITEMS: &str = "UID FLAGS RFC822.SIZE INTERNALDATE BODY.PEEK[]";

/// Build a TLS connector that accepts all certificates.
///
/// Local bridges and test servers present self-signed certificates, so
/// verification is skipped.
fn tls_connector() -> Result<TlsConnector> {
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::Tls(e.to_string()))?
    .dangerous()
    .with_custom_certificate_verifier(Arc::new(DangerousVerifier))
    .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// SASL XOAUTH2 initial response.
struct OAuth2 {
    user: String,
    access_token: String,
}

impl async_imap::Authenticator for OAuth2 {
    type Response = String;

    fn process(&mut self, _data: &[u8]) -> Self::Response {
        format!(
            "user={}\x01auth=Bearer {}\x01\x01",
            self.user, self.access_token
        )
    }
}

/// Opens real IMAP connections for a sync session.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImapConnector;

impl ImapConnector {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    async fn tls_stream(
        account: &Account,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
        let addr = format!("{}:{}", account.host, account.port);
        debug!("Connecting to IMAP server at {}", addr);
        let tcp_stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| Error::Connection(format!("{addr}: {e}")))?;

        let tcp_stream = match account.security {
            Security::Tls => tcp_stream,
            Security::StartTls => {
                let mut client = async_imap::Client::new(tcp_stream.compat());
                client
                    .run_command_and_check_ok("STARTTLS", None)
                    .await
                    .map_err(|e| Error::Tls(format!("STARTTLS failed: {e}")))?;
                client.into_inner().into_inner()
            }
        };

        let server_name = ServerName::try_from(account.host.clone())
            .map_err(|e| Error::Tls(format!("Invalid server name: {e}")))?;
        tls_connector()?
            .connect(server_name, tcp_stream)
            .await
            .map_err(|e| Error::Tls(e.to_string()))
    }

    async fn open(account: &Account) -> Result<ImapConnection> {
        let tls_stream = Self::tls_stream(account).await?;
        let client = async_imap::Client::new(tls_stream.compat());

        let login = if let Some(token) = &account.access_token {
            debug!("Authenticating {} with XOAUTH2", account.username);
            let auth = OAuth2 {
                user: account.username.clone(),
                access_token: token.clone(),
            };
            client.authenticate("XOAUTH2", auth).await
        } else {
            let password = account.password.as_deref().ok_or_else(|| {
                Error::Config(format!("No credentials for {}", account.username))
            })?;
            client.login(&account.username, password).await
        };
        let mut session = login.map_err(|(e, _)| Error::Imap(format!("Login failed: {e}")))?;

        let capabilities = session
            .capabilities()
            .await
            .map_err(|e| Error::Imap(format!("CAPABILITY failed: {e}")))?;
        let mod_seq = capabilities.has_str("CONDSTORE") || capabilities.has_str("QRESYNC");

        info!("Connected to IMAP server (mod-sequences: {})", mod_seq);
        Ok(ImapConnection {
            session,
            mod_seq,
            selected: None,
        })
    }
}

impl Connector for ImapConnector {
    fn connect<'a>(&'a self, account: &'a Account) -> BoxFuture<'a, Result<Box<dyn MailboxConnection>>> {
        async move {
            let connection = Self::open(account).await?;
            Ok(Box::new(connection) as Box<dyn MailboxConnection>)
        }
        .boxed()
    }
}

/// An authenticated session, optionally with a mailbox examined.
pub struct ImapConnection {
    session: ImapSession,
    mod_seq: bool,
    selected: Option<String>,
}

fn imap_error(context: &str) -> impl Fn(async_imap::error::Error) -> Error + '_ {
    move |e| Error::Imap(format!("{context}: {e}"))
}

fn attribute_name(attribute: &NameAttribute<'_>) -> Option<String> {
    let name = match attribute {
        NameAttribute::NoInferiors => "\\Noinferiors",
        NameAttribute::NoSelect => "\\Noselect",
        NameAttribute::Marked => "\\Marked",
        NameAttribute::Unmarked => "\\Unmarked",
        NameAttribute::All => "\\All",
        NameAttribute::Archive => "\\Archive",
        NameAttribute::Drafts => "\\Drafts",
        NameAttribute::Flagged => "\\Flagged",
        NameAttribute::Junk => "\\Junk",
        NameAttribute::Sent => "\\Sent",
        NameAttribute::Trash => "\\Trash",
        NameAttribute::Extension(name) => return Some(name.to_string()),
        _ => return None,
    };
    Some(name.to_string())
}

fn to_message(mailbox: &str, fetch: &Fetch) -> Result<ImapMessage> {
    let uid = fetch
        .uid
        .ok_or_else(|| Error::Imap(format!("FETCH response without UID in {mailbox}")))?;
    Ok(ImapMessage {
        mailbox: mailbox.to_string(),
        uid,
        mod_seq: fetch.modseq,
        flags: fetch.flags().map(Flag::from).collect(),
        size: fetch.size,
        internal_date: fetch.internal_date(),
        source: fetch.body().map(<[u8]>::to_vec),
    })
}

impl SequenceResolver for ImapConnection {
    fn resolve_sequence(&mut self, seq: u32) -> BoxFuture<'_, Result<Option<MessagePosition>>> {
        async move {
            let fetches: Vec<Fetch> = self
                .session
                .fetch(seq.to_string(), "(UID)")
                .await
                .map_err(imap_error("FETCH (UID) failed"))?
                .try_collect()
                .await
                .map_err(imap_error("FETCH (UID) failed"))?;
            Ok(fetches
                .iter()
                .filter(|f| f.message == seq)
                .find_map(|f| f.uid.map(|uid| MessagePosition { seq, uid })))
        }
        .boxed()
    }

    fn resolve_uid(&mut self, uid: u32) -> BoxFuture<'_, Result<Option<MessagePosition>>> {
        async move {
            // `uid:*` always matches the last message, even below `uid`.
            let fetches: Vec<Fetch> = self
                .session
                .uid_fetch(format!("{uid}:*"), "(UID)")
                .await
                .map_err(imap_error("UID FETCH (UID) failed"))?
                .try_collect()
                .await
                .map_err(imap_error("UID FETCH (UID) failed"))?;
            Ok(fetches
                .iter()
                .filter_map(|f| {
                    f.uid
                        .filter(|found| *found >= uid)
                        .map(|found| MessagePosition {
                            seq: f.message,
                            uid: found,
                        })
                })
                .min_by_key(|p| p.seq))
        }
        .boxed()
    }
}

impl MailboxConnection for ImapConnection {
    fn supports_mod_seq(&self) -> bool {
        self.mod_seq
    }

    fn list(&mut self) -> BoxFuture<'_, Result<Vec<ListedMailbox>>> {
        async move {
            let names: Vec<_> = self
                .session
                .list(Some(""), Some("*"))
                .await
                .map_err(imap_error("LIST failed"))?
                .try_collect()
                .await
                .map_err(imap_error("LIST failed"))?;
            Ok(names
                .iter()
                .map(|name| ListedMailbox {
                    path: name.name().to_string(),
                    delimiter: name.delimiter().map(str::to_string),
                    attributes: name.attributes().iter().filter_map(attribute_name).collect(),
                })
                .collect())
        }
        .boxed()
    }

    fn status<'a>(&'a mut self, path: &'a str) -> BoxFuture<'a, Result<MailboxStatus>> {
        async move {
            let items = if self.mod_seq {
                "(MESSAGES UIDNEXT UIDVALIDITY HIGHESTMODSEQ)"
            } else {
                "(MESSAGES UIDNEXT UIDVALIDITY)"
            };
            let mailbox = self
                .session
                .status(path, items)
                .await
                .map_err(|e| Error::Imap(format!("STATUS {path} failed: {e}")))?;
            let uid_validity = mailbox
                .uid_validity
                .ok_or_else(|| Error::Imap(format!("STATUS {path} returned no UIDVALIDITY")))?;
            Ok(MailboxStatus {
                path: path.to_string(),
                message_count: Some(mailbox.exists),
                uid_next: mailbox.uid_next.unwrap_or(0),
                uid_validity,
                highest_mod_seq: mailbox.highest_modseq,
            })
        }
        .boxed()
    }

    fn examine<'a>(&'a mut self, path: &'a str) -> BoxFuture<'a, Result<()>> {
        async move {
            self.session
                .examine(path)
                .await
                .map_err(|e| Error::Imap(format!("Failed to examine {path}: {e}")))?;
            self.selected = Some(path.to_string());
            Ok(())
        }
        .boxed()
    }

    fn fetch<'a>(
        &'a mut self,
        range: &'a UidRange,
        changed_since: Option<u64>,
    ) -> BoxFuture<'a, Result<BoxStream<'a, Result<ImapMessage>>>> {
        async move {
            let path = self
                .selected
                .clone()
                .ok_or_else(|| Error::Imap("No mailbox examined".into()))?;
            let mut query = if self.mod_seq {
                format!("({FETCH_ITEMS} MODSEQ)")
            } else {
                format!("({FETCH_ITEMS})")
            };
            if let Some(mod_seq) = changed_since {
                query.push_str(&format!(" (CHANGEDSINCE {mod_seq})"));
            }
            debug!("UID FETCH {} in {}", range, path);

            let fetches = self
                .session
                .uid_fetch(range.to_string(), query)
                .await
                .map_err(|e| Error::Imap(format!("UID FETCH {range} failed: {e}")))?;
            Ok(fetches
                .map(move |fetch| {
                    fetch
                        .map_err(imap_error("UID FETCH failed"))
                        .and_then(|fetch| to_message(&path, &fetch))
                })
                .boxed())
        }
        .boxed()
    }

    fn logout(&mut self) -> BoxFuture<'_, Result<()>> {
        async move {
            self.session
                .logout()
                .await
                .map_err(imap_error("LOGOUT failed"))
        }
        .boxed()
    }
}

/// Certificate verifier that accepts all certificates.
#[derive(Debug)]
struct DangerousVerifier;

impl rustls::client::danger::ServerCertVerifier for DangerousVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
