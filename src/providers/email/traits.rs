//! Mail client trait definition.
//!
//! This module defines the [`MailClient`] trait which abstracts over the
//! retrieval protocols (IMAP, POP3). Implementations perform blocking socket
//! I/O; async callers go through [`PooledClient`](super::PooledClient).

use serde::{Deserialize, Serialize};

use crate::domain::{Envelope, Protocol, SyncCheckpoint};

/// Result type alias for mail client operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors that can occur during mail client operations.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Server rejected the credentials.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Network or connection error.
    #[error("connection error: {0}")]
    Connection(String),

    /// TLS negotiation failed.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Server answered with an error or an unexpected response.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Response could not be decoded.
    #[error("parse error: {0}")]
    Parse(String),

    /// Operation needs an open session.
    #[error("not connected")]
    NotConnected,

    /// Socket I/O failed mid-session. The session is unusable afterwards.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Blocking worker could not run the operation.
    #[error("worker error: {0}")]
    Worker(String),
}

impl ProtocolError {
    /// Whether the error ends the whole account cycle rather than one message.
    pub fn is_account_level(&self) -> bool {
        matches!(
            self,
            ProtocolError::Authentication(_)
                | ProtocolError::Connection(_)
                | ProtocolError::Tls(_)
                | ProtocolError::NotConnected
                | ProtocolError::Io(_)
        )
    }
}

/// Login credentials for a mail server.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    /// Username (usually email address).
    pub username: String,
    /// Password or app-specific password.
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Identifier of a message on the server.
///
/// POP3 message numbers are only meaningful within the session that
/// produced them; only the UIDL is ever persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RemoteId {
    /// IMAP UID.
    Uid(u32),
    /// POP3 session number plus durable UIDL.
    Pop3 { number: u32, uidl: String },
}

impl RemoteId {
    /// The durable identifier stored with the message.
    pub fn protocol_uid(&self) -> String {
        match self {
            RemoteId::Uid(uid) => uid.to_string(),
            RemoteId::Pop3 { uidl, .. } => uidl.clone(),
        }
    }
}

impl std::fmt::Display for RemoteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteId::Uid(uid) => write!(f, "uid {}", uid),
            RemoteId::Pop3 { number, uidl } => write!(f, "#{} ({})", number, uidl),
        }
    }
}

/// What the server reports when a folder is opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FolderState {
    /// IMAP UIDVALIDITY. UIDs from a different value name other messages.
    pub uid_validity: Option<u32>,
}

/// Blocking client for one mailbox protocol.
///
/// Each method performs socket I/O and may block for up to the configured
/// timeout. Implementations must be driven from a blocking worker.
pub trait MailClient: Send {
    /// Protocol spoken by this client.
    fn protocol(&self) -> Protocol;

    /// Opens the connection and authenticates.
    fn connect(&mut self) -> Result<()>;

    /// Lists selectable folders.
    fn list_folders(&mut self) -> Result<Vec<String>>;

    /// Opens a folder for the following operations.
    fn select_folder(&mut self, name: &str) -> Result<FolderState>;

    /// Returns identifiers not covered by `checkpoint`, oldest first.
    fn new_identifiers(&mut self, checkpoint: &SyncCheckpoint) -> Result<Vec<RemoteId>>;

    /// Fetches and parses the header block of one message.
    fn fetch_headers(&mut self, id: &RemoteId) -> Result<Envelope>;

    /// Fetches the complete raw message.
    fn fetch_body(&mut self, id: &RemoteId) -> Result<Vec<u8>>;

    /// Politely closes the session. Errors are logged, not returned.
    fn disconnect(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_level_errors() {
        assert!(ProtocolError::Authentication("bad".into()).is_account_level());
        assert!(ProtocolError::Connection("refused".into()).is_account_level());
        assert!(!ProtocolError::Parse("bad header".into()).is_account_level());
        assert!(!ProtocolError::Protocol("NO".into()).is_account_level());
    }

    #[test]
    fn dropped_connection_is_account_level() {
        for kind in [
            std::io::ErrorKind::UnexpectedEof,
            std::io::ErrorKind::BrokenPipe,
            std::io::ErrorKind::ConnectionReset,
            std::io::ErrorKind::TimedOut,
        ] {
            let err = ProtocolError::from(std::io::Error::new(kind, "gone"));
            assert!(err.is_account_level(), "{kind:?}");
        }
    }

    #[test]
    fn remote_id_protocol_uid() {
        assert_eq!(RemoteId::Uid(101).protocol_uid(), "101");
        let pop = RemoteId::Pop3 {
            number: 3,
            uidl: "abc".to_string(),
        };
        assert_eq!(pop.protocol_uid(), "abc");
        assert_eq!(pop.to_string(), "#3 (abc)");
    }

    #[test]
    fn credentials_debug_hides_password() {
        let creds = Credentials::new("me@example.com", "hunter2");
        let debug = format!("{:?}", creds);
        assert!(debug.contains("me@example.com"));
        assert!(!debug.contains("hunter2"));
    }
}
