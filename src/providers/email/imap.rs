//! IMAP client implementation.
//!
//! Protocol framing is handled by the `imap` crate; this module adds the
//! dialer, error mapping and the incremental retrieval rules.
//!
//! # Incremental discovery
//!
//! New messages are found with `UID SEARCH UID n:*` where `n` is one past the
//! checkpoint. Servers answer `n:*` with the highest existing UID even when it
//! is below `n`, so results are filtered against the checkpoint again.
//!
//! # Session loss
//!
//! After an I/O or parse failure the stream may still hold the answer to the
//! failed command, and the next command would read it as its own. The
//! session is dropped instead, and every FETCH answer is checked against the
//! requested UID.

use imap::types::{Fetch, NameAttribute};

use super::transport::{Dialer, TcpDialer};
use super::{Credentials, FolderState, MailClient, ProtocolError, RemoteId, Result};
use crate::domain::{Envelope, Protocol, SyncCheckpoint};
use crate::mime;

const HEADER_QUERY: &str = "BODY.PEEK[HEADER]";
const MESSAGE_QUERY: &str = "BODY.PEEK[]";

type Section = for<'a> fn(&'a Fetch) -> Option<&'a [u8]>;

fn map_error(e: imap::Error) -> ProtocolError {
    match e {
        imap::Error::No(msg) | imap::Error::Bad(msg) => ProtocolError::Protocol(msg),
        imap::Error::Io(e) => ProtocolError::Io(e),
        imap::Error::ConnectionLost => {
            ProtocolError::Connection("server closed the connection".to_string())
        }
        imap::Error::Parse(e) => {
            ProtocolError::Connection(format!("unreadable server response: {}", e))
        }
        other => ProtocolError::Protocol(other.to_string()),
    }
}

fn check_greeting(greeting: &[u8]) -> Result<()> {
    let text = String::from_utf8_lossy(greeting);
    let text = text.trim_end();
    let upper = text.to_ascii_uppercase();
    if upper.starts_with("* OK") {
        Ok(())
    } else if upper.starts_with("* BYE") {
        Err(ProtocolError::Connection(format!(
            "server refused session: {}",
            text
        )))
    } else {
        Err(ProtocolError::Protocol(format!(
            "unexpected greeting: {}",
            text
        )))
    }
}

/// IMAP implementation of [`MailClient`].
pub struct ImapClient<D: Dialer = TcpDialer> {
    dialer: D,
    credentials: Credentials,
    session: Option<imap::Session<D::Stream>>,
}

impl<D: Dialer> ImapClient<D> {
    pub fn new(dialer: D, credentials: Credentials) -> Self {
        Self {
            dialer,
            credentials,
            session: None,
        }
    }

    /// Runs `op` on the open session, dropping it on account-level failures.
    fn with_session<T>(
        &mut self,
        op: impl FnOnce(&mut imap::Session<D::Stream>) -> Result<T>,
    ) -> Result<T> {
        let session = self.session.as_mut().ok_or(ProtocolError::NotConnected)?;
        let result = op(session);
        if let Err(e) = &result {
            if e.is_account_level() {
                tracing::warn!(error = %e, "IMAP session lost");
                self.session = None;
            }
        }
        result
    }

    fn fetch_section(&mut self, uid: u32, query: &str, section: Section) -> Result<Vec<u8>> {
        self.with_session(|session| {
            let fetches = session
                .uid_fetch(uid.to_string(), query)
                .map_err(map_error)?;

            if let Some(bytes) = fetches
                .iter()
                .filter(|f| f.uid == Some(uid))
                .find_map(|f| section(f))
            {
                return Ok(bytes.to_vec());
            }

            match fetches.iter().find(|f| section(f).is_some()) {
                Some(other) => Err(ProtocolError::Connection(format!(
                    "FETCH for uid {} answered with uid {:?}",
                    uid, other.uid
                ))),
                None => Err(ProtocolError::Protocol(format!(
                    "uid {} not returned by FETCH",
                    uid
                ))),
            }
        })
    }
}

fn expect_uid(id: &RemoteId) -> Result<u32> {
    match id {
        RemoteId::Uid(uid) => Ok(*uid),
        other => Err(ProtocolError::Protocol(format!(
            "IMAP client cannot fetch {}",
            other
        ))),
    }
}

impl<D: Dialer> MailClient for ImapClient<D> {
    fn protocol(&self) -> Protocol {
        Protocol::Imap
    }

    fn connect(&mut self) -> Result<()> {
        let stream = self.dialer.dial()?;
        let mut client = imap::Client::new(stream);
        check_greeting(&client.read_greeting().map_err(map_error)?)?;

        let session = client
            .login(&self.credentials.username, &self.credentials.password)
            .map_err(|(e, _)| match e {
                imap::Error::No(msg) | imap::Error::Bad(msg) => {
                    ProtocolError::Authentication(msg)
                }
                other => map_error(other),
            })?;
        self.session = Some(session);

        tracing::info!(username = %self.credentials.username, "IMAP session authenticated");
        Ok(())
    }

    fn list_folders(&mut self) -> Result<Vec<String>> {
        self.with_session(|session| {
            let names = session.list(None, Some("*")).map_err(map_error)?;
            Ok(names
                .iter()
                .filter(|name| {
                    !name
                        .attributes()
                        .iter()
                        .any(|a| matches!(a, NameAttribute::NoSelect))
                })
                .map(|name| name.name().to_string())
                .collect())
        })
    }

    fn select_folder(&mut self, name: &str) -> Result<FolderState> {
        self.with_session(|session| {
            let mailbox = session.select(name).map_err(map_error)?;
            tracing::debug!(
                folder = name,
                exists = mailbox.exists,
                uid_validity = ?mailbox.uid_validity,
                "folder selected"
            );
            Ok(FolderState {
                uid_validity: mailbox.uid_validity,
            })
        })
    }

    fn new_identifiers(&mut self, checkpoint: &SyncCheckpoint) -> Result<Vec<RemoteId>> {
        let SyncCheckpoint::Imap { last_uid, .. } = checkpoint else {
            return Err(ProtocolError::Protocol(
                "IMAP client given a POP3 checkpoint".to_string(),
            ));
        };
        let last_uid = *last_uid;
        let query = if last_uid == 0 {
            "ALL".to_string()
        } else {
            format!("UID {}:*", last_uid.saturating_add(1))
        };

        let found = self.with_session(|session| session.uid_search(&query).map_err(map_error))?;
        let mut uids: Vec<u32> = found.into_iter().filter(|uid| *uid > last_uid).collect();
        uids.sort_unstable();
        Ok(uids.into_iter().map(RemoteId::Uid).collect())
    }

    fn fetch_headers(&mut self, id: &RemoteId) -> Result<Envelope> {
        let uid = expect_uid(id)?;
        let raw = self.fetch_section(uid, HEADER_QUERY, Fetch::header)?;
        mime::parse_envelope(&raw, &uid.to_string())
            .map_err(|e| ProtocolError::Parse(e.to_string()))
    }

    fn fetch_body(&mut self, id: &RemoteId) -> Result<Vec<u8>> {
        let uid = expect_uid(id)?;
        self.fetch_section(uid, MESSAGE_QUERY, Fetch::body)
    }

    fn disconnect(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.logout() {
                tracing::debug!(error = %e, "IMAP logout failed");
            }
        }
    }
}
