//! POP3 client implementation.
//!
//! POP3 (RFC 1939) has a single mailbox and no durable message numbering.
//! Each sync lists the full `UIDL` map and diffs it against the set of UIDLs
//! already seen; session message numbers are used for `TOP`/`RETR` only.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read, Write};

use super::transport::{Dialer, TcpDialer};
use super::{Credentials, FolderState, MailClient, ProtocolError, RemoteId, Result};
use crate::domain::{Envelope, Protocol, SyncCheckpoint};
use crate::mime;

/// The only folder a POP3 server exposes.
pub const POP3_FOLDER: &str = "INBOX";

/// A POP3 session over any byte stream.
pub struct Pop3Session<S: Read + Write> {
    reader: BufReader<S>,
}

impl<S: Read + Write> Pop3Session<S> {
    /// Reads the `+OK` greeting.
    pub fn open(stream: S) -> Result<Self> {
        let mut session = Self {
            reader: BufReader::new(stream),
        };
        let greeting = session.read_line()?;
        if greeting.starts_with("+OK") {
            Ok(session)
        } else {
            Err(ProtocolError::Connection(format!(
                "unexpected greeting: {}",
                greeting
            )))
        }
    }

    /// `USER` then `PASS`. A rejection of either is an authentication error.
    pub fn login(&mut self, credentials: &Credentials) -> Result<()> {
        self.command(&format!("USER {}", credentials.username))
            .map_err(into_auth)?;
        self.command(&format!("PASS {}", credentials.password))
            .map_err(into_auth)?;
        Ok(())
    }

    /// Session message number to UIDL.
    pub fn uidl(&mut self) -> Result<BTreeMap<u32, String>> {
        self.command("UIDL")?;
        let listing = self.read_multiline()?;
        let text = String::from_utf8_lossy(&listing);

        let mut map = BTreeMap::new();
        for line in text.lines() {
            let mut parts = line.split_ascii_whitespace();
            match (parts.next().and_then(|n| n.parse().ok()), parts.next()) {
                (Some(number), Some(uid)) => {
                    map.insert(number, uid.to_string());
                }
                _ => tracing::debug!(line = %line, "skipping malformed UIDL line"),
            }
        }
        Ok(map)
    }

    /// Header block of one message.
    pub fn top(&mut self, number: u32) -> Result<Vec<u8>> {
        self.command(&format!("TOP {} 0", number))?;
        self.read_multiline()
    }

    /// Complete raw message.
    pub fn retr(&mut self, number: u32) -> Result<Vec<u8>> {
        self.command(&format!("RETR {}", number))?;
        self.read_multiline()
    }

    pub fn quit(&mut self) -> Result<()> {
        self.command("QUIT").map(|_| ())
    }

    /// Sends a command and returns the text after `+OK`.
    fn command(&mut self, command: &str) -> Result<String> {
        let verb = command.split(' ').next().unwrap_or(command);
        tracing::trace!(command = verb, "pop3 send");

        let stream = self.reader.get_mut();
        stream.write_all(format!("{}\r\n", command).as_bytes())?;
        stream.flush()?;

        let line = self.read_line()?;
        if let Some(rest) = line.strip_prefix("+OK") {
            Ok(rest.trim().to_string())
        } else if let Some(rest) = line.strip_prefix("-ERR") {
            Err(ProtocolError::Protocol(format!(
                "{} rejected: {}",
                verb,
                rest.trim()
            )))
        } else {
            Err(ProtocolError::Protocol(format!(
                "unexpected reply to {}: {}",
                verb, line
            )))
        }
    }

    /// Reads a dot-terminated block, undoing byte-stuffing.
    fn read_multiline(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let mut line = Vec::new();
            if self.reader.read_until(b'\n', &mut line)? == 0 {
                return Err(ProtocolError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed mid-response",
                )));
            }
            if line == b".\r\n" || line == b".\n" {
                return Ok(out);
            }
            let content = if line.starts_with(b"..") {
                &line[1..]
            } else {
                &line[..]
            };
            out.extend_from_slice(content);
        }
    }

    fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Err(ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed",
            )));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }
}

fn into_auth(e: ProtocolError) -> ProtocolError {
    match e {
        ProtocolError::Protocol(msg) => ProtocolError::Authentication(msg),
        other => other,
    }
}

/// POP3 implementation of [`MailClient`].
pub struct Pop3Client<D: Dialer = TcpDialer> {
    dialer: D,
    credentials: Credentials,
    session: Option<Pop3Session<D::Stream>>,
}

impl<D: Dialer> Pop3Client<D> {
    pub fn new(dialer: D, credentials: Credentials) -> Self {
        Self {
            dialer,
            credentials,
            session: None,
        }
    }

    /// Runs `op` on the open session. After an I/O failure the stream
    /// position is unknown, so the session is dropped.
    fn with_session<T>(
        &mut self,
        op: impl FnOnce(&mut Pop3Session<D::Stream>) -> Result<T>,
    ) -> Result<T> {
        let session = self.session.as_mut().ok_or(ProtocolError::NotConnected)?;
        let result = op(session);
        if let Err(ProtocolError::Io(e)) = &result {
            tracing::warn!(error = %e, "POP3 session lost");
            self.session = None;
        }
        result
    }
}

fn expect_number(id: &RemoteId) -> Result<(u32, &str)> {
    match id {
        RemoteId::Pop3 { number, uidl } => Ok((*number, uidl.as_str())),
        other => Err(ProtocolError::Protocol(format!(
            "POP3 client cannot fetch {}",
            other
        ))),
    }
}

impl<D: Dialer> MailClient for Pop3Client<D> {
    fn protocol(&self) -> Protocol {
        Protocol::Pop3
    }

    fn connect(&mut self) -> Result<()> {
        let stream = self.dialer.dial()?;
        let mut session = Pop3Session::open(stream)?;
        session.login(&self.credentials)?;
        self.session = Some(session);

        tracing::info!(username = %self.credentials.username, "POP3 session authenticated");
        Ok(())
    }

    fn list_folders(&mut self) -> Result<Vec<String>> {
        self.with_session(|_| Ok(vec![POP3_FOLDER.to_string()]))
    }

    fn select_folder(&mut self, name: &str) -> Result<FolderState> {
        self.with_session(|_| Ok(()))?;
        if name.eq_ignore_ascii_case(POP3_FOLDER) {
            Ok(FolderState::default())
        } else {
            Err(ProtocolError::Protocol(format!(
                "POP3 has no folder named {}",
                name
            )))
        }
    }

    fn new_identifiers(&mut self, checkpoint: &SyncCheckpoint) -> Result<Vec<RemoteId>> {
        let SyncCheckpoint::Pop3 { seen } = checkpoint else {
            return Err(ProtocolError::Protocol(
                "POP3 client given an IMAP checkpoint".to_string(),
            ));
        };

        let listing = self.with_session(|s| s.uidl())?;
        tracing::debug!(on_server = listing.len(), seen = seen.len(), "POP3 UIDL listing");

        Ok(listing
            .into_iter()
            .filter(|(_, uidl)| !seen.contains(uidl))
            .map(|(number, uidl)| RemoteId::Pop3 { number, uidl })
            .collect())
    }

    fn fetch_headers(&mut self, id: &RemoteId) -> Result<Envelope> {
        let (number, uidl) = expect_number(id)?;
        let uidl = uidl.to_string();
        let raw = self.with_session(|s| s.top(number))?;
        mime::parse_envelope(&raw, &uidl).map_err(|e| ProtocolError::Parse(e.to_string()))
    }

    fn fetch_body(&mut self, id: &RemoteId) -> Result<Vec<u8>> {
        let (number, _) = expect_number(id)?;
        self.with_session(|s| s.retr(number))
    }

    fn disconnect(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.quit() {
                tracing::debug!(error = %e, "POP3 QUIT failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::script::{sent, ScriptDialer};
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;

    const LOGIN: &str = "+OK POP3 ready\r\n+OK user accepted\r\n+OK logged in\r\n";

    fn creds() -> Credentials {
        Credentials::new("me@example.com", "secret")
    }

    fn connected(script: &str) -> (Pop3Client<ScriptDialer>, std::sync::Arc<std::sync::Mutex<Vec<u8>>>) {
        let dialer = ScriptDialer::single(format!("{}{}", LOGIN, script));
        let written = dialer.written();
        let mut client = Pop3Client::new(dialer, creds());
        client.connect().unwrap();
        (client, written)
    }

    #[test]
    fn login_sends_user_and_pass() {
        let (_, written) = connected("");
        assert_eq!(sent(&written), "USER me@example.com\r\nPASS secret\r\n");
    }

    #[test]
    fn bad_password_is_authentication_error() {
        let dialer = ScriptDialer::single("+OK ready\r\n+OK\r\n-ERR invalid password\r\n");
        let mut client = Pop3Client::new(dialer, creds());
        assert!(matches!(
            client.connect().unwrap_err(),
            ProtocolError::Authentication(_)
        ));
    }

    #[test]
    fn new_identifiers_diffs_against_seen_set() {
        let (mut client, _) = connected("+OK\r\n1 aaa\r\n2 bbb\r\n3 ccc\r\n.\r\n");
        let seen: BTreeSet<String> = ["bbb".to_string()].into();

        let ids = client
            .new_identifiers(&SyncCheckpoint::Pop3 { seen })
            .unwrap();

        assert_eq!(
            ids,
            vec![
                RemoteId::Pop3 {
                    number: 1,
                    uidl: "aaa".into()
                },
                RemoteId::Pop3 {
                    number: 3,
                    uidl: "ccc".into()
                },
            ]
        );
    }

    #[test]
    fn renumbered_messages_are_not_refetched() {
        // "old" was message 1 last session and is message 4 now.
        let (mut client, _) = connected("+OK\r\n4 old\r\n5 new\r\n.\r\n");
        let seen: BTreeSet<String> = ["old".to_string()].into();

        let ids = client
            .new_identifiers(&SyncCheckpoint::Pop3 { seen })
            .unwrap();

        assert_eq!(
            ids,
            vec![RemoteId::Pop3 {
                number: 5,
                uidl: "new".into()
            }]
        );
    }

    #[test]
    fn retr_unstuffs_dots() {
        let (mut client, written) =
            connected("+OK 40 octets\r\nSubject: x\r\n\r\n..leading dot\r\nend\r\n.\r\n");
        let id = RemoteId::Pop3 {
            number: 2,
            uidl: "u2".into(),
        };

        let body = client.fetch_body(&id).unwrap();

        assert_eq!(body, b"Subject: x\r\n\r\n.leading dot\r\nend\r\n".to_vec());
        assert!(sent(&written).ends_with("RETR 2\r\n"));
    }

    #[test]
    fn top_parses_envelope_with_uidl_fallback_id() {
        let (mut client, written) = connected("+OK\r\nFrom: a@example.com\r\nSubject: Hello\r\n\r\n.\r\n");
        let id = RemoteId::Pop3 {
            number: 1,
            uidl: "xyz".into(),
        };

        let envelope = client.fetch_headers(&id).unwrap();

        assert_eq!(envelope.subject.as_deref(), Some("Hello"));
        assert_eq!(envelope.message_id, "<generated-xyz@local>");
        assert!(sent(&written).ends_with("TOP 1 0\r\n"));
    }

    #[test]
    fn only_inbox_exists() {
        let (mut client, _) = connected("");
        assert_eq!(client.list_folders().unwrap(), vec!["INBOX"]);
        assert!(client.select_folder("inbox").is_ok());
        assert!(client.select_folder("Archive").is_err());
    }

    #[test]
    fn err_reply_on_retr_is_message_level() {
        let (mut client, _) = connected("-ERR no such message\r\n");
        let err = client
            .fetch_body(&RemoteId::Pop3 {
                number: 9,
                uidl: "gone".into(),
            })
            .unwrap_err();
        assert!(!err.is_account_level());
    }

    #[test]
    fn eof_mid_retr_drops_session() {
        let (mut client, _) = connected("+OK 40 octets\r\nSubject: x\r\n\r\npartial");
        let id = RemoteId::Pop3 {
            number: 1,
            uidl: "u1".into(),
        };

        let err = client.fetch_body(&id).unwrap_err();
        assert!(matches!(&err, ProtocolError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof));
        assert!(err.is_account_level());
        assert!(matches!(
            client.fetch_body(&id).unwrap_err(),
            ProtocolError::NotConnected
        ));
    }

    #[test]
    fn imap_ids_are_rejected() {
        let (mut client, _) = connected("");
        assert!(client.fetch_body(&RemoteId::Uid(1)).is_err());
    }
}
