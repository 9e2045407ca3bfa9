//! Fake IMAP server for integration testing
//!
//! This module provides an in-process IMAP server that speaks enough
//! of the protocol to run a sync session end-to-end:
//!
//! TCP -> (STARTTLS) -> TLS -> LOGIN -> LIST/STATUS/EXAMINE/FETCH -> LOGOUT
//!
//! ## Module layout
//!
//! - `server` -- TCP listener, TLS setup, and connection dispatch
//! - `handlers/` -- one file per IMAP command (LIST, STATUS, FETCH, etc.)
//! - `mailbox` -- test data model (folders, emails, builder)
//! - `io` -- shared write helpers

#![allow(dead_code)]

mod handlers;
mod io;
mod server;

pub use mailbox::MailboxBuilder;
pub use server::{FakeImapServer, Transport};
