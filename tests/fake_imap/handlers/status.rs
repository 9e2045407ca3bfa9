//! STATUS command handler.
//!
//! Reports folder counters without selecting it (RFC 3501 Section
//! 6.3.10). The sync engine asks for MESSAGES, UIDNEXT and
//! UIDVALIDITY; the fake server always answers with all three:
//!
//! ```text
//! * STATUS "INBOX" (MESSAGES 2 UIDNEXT 3 UIDVALIDITY 1)
//! A0003 OK STATUS completed
//! ```

use crate::fake_imap::io::write_line;
use crate::fake_imap::mailbox::Mailbox;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};

/// Handle the STATUS command.
pub async fn handle_status<S: AsyncRead + AsyncWrite + Unpin>(
    tag: &str,
    folder_name: &str,
    mailbox: &Mailbox,
    stream: &mut BufReader<S>,
) {
    let Some(folder) = mailbox.get_folder(folder_name) else {
        let resp = format!("{tag} NO Folder not found\r\n");
        let _ = write_line(stream, &resp).await;
        return;
    };

    let line = format!(
        "* STATUS \"{}\" (MESSAGES {} UIDNEXT {} UIDVALIDITY {})\r\n",
        folder.name,
        folder.emails.len(),
        folder.uid_next(),
        folder.uid_validity
    );
    if write_line(stream, &line).await.is_err() {
        return;
    }
    let resp = format!("{tag} OK STATUS completed\r\n");
    let _ = write_line(stream, &resp).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_imap::mailbox::MailboxBuilder;
    use tokio::io::BufReader;

    async fn run(tag: &str, folder_name: &str, mailbox: &Mailbox) -> String {
        let (client, server) = tokio::io::duplex(4096);
        let mut stream = BufReader::new(server);

        handle_status(tag, folder_name, mailbox, &mut stream).await;
        drop(stream);

        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut BufReader::new(client), &mut buf)
            .await
            .unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[tokio::test]
    async fn reports_counters() {
        let mailbox = MailboxBuilder::new()
            .folder("INBOX")
            .uid_validity(7)
            .email(3, false, b"a")
            .email(9, true, b"b")
            .build();

        let output = run("A1", "INBOX", &mailbox).await;

        assert!(output.contains("* STATUS \"INBOX\" (MESSAGES 2 UIDNEXT 10 UIDVALIDITY 7)"));
        assert!(output.ends_with("A1 OK STATUS completed\r\n"));
    }

    #[tokio::test]
    async fn missing_folder_is_no() {
        let mailbox = MailboxBuilder::new().folder("INBOX").build();
        let output = run("A2", "Gone", &mailbox).await;
        assert_eq!(output, "A2 NO Folder not found\r\n");
    }
}
