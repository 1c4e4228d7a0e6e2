//! Message domain types.
//!
//! Represents fetched mail, both in flight from a server and as persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AccountId, MessageId};

/// Maximum snippet length in characters.
const SNIPPET_CHARS: usize = 200;

/// An email address with optional display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    /// Email address.
    pub email: String,
    /// Display name (e.g., "John Doe").
    pub name: Option<String>,
}

impl Address {
    /// Creates a new address with just an email.
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: None,
        }
    }

    /// Creates a new address with email and display name.
    pub fn with_name(email: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: Some(name.into()),
        }
    }

    /// Lowercased domain part, if the address has one.
    pub fn domain(&self) -> Option<String> {
        self.email
            .rsplit_once('@')
            .map(|(_, domain)| domain.trim_end_matches('>').to_ascii_lowercase())
    }
}

/// Header-level summary of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Provider `Message-ID` header, the deduplication key.
    pub message_id: String,
    /// Sender.
    pub from: Address,
    /// Primary recipients.
    pub to: Vec<Address>,
    /// Carbon copy recipients.
    pub cc: Vec<Address>,
    /// Decoded subject line.
    pub subject: Option<String>,
    /// Sent date, or processing time when absent or unparseable.
    pub date: DateTime<Utc>,
}

impl Envelope {
    /// Synthetic Message-ID for servers that omit the header.
    pub fn generated_message_id(protocol_uid: &str) -> String {
        format!("<generated-{}@local>", protocol_uid)
    }
}

/// Attachment extracted from a message, payload still in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAttachment {
    /// Declared filename.
    pub filename: String,
    /// MIME type such as `application/pdf`.
    pub mime_type: String,
    /// Decoded payload.
    pub payload: Vec<u8>,
}

impl NewAttachment {
    /// Size of the decoded payload in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.payload.len() as u64
    }
}

/// A message fetched from a server, ready to be persisted.
#[derive(Debug, Clone)]
pub struct NewMessage {
    /// Owning account.
    pub account_id: AccountId,
    /// IMAP UID or POP3 UIDL as a string.
    pub protocol_uid: String,
    /// Parsed headers.
    pub envelope: Envelope,
    /// First plain-text body part.
    pub body_text: Option<String>,
    /// First HTML body part.
    pub body_html: Option<String>,
    /// Extracted attachments.
    pub attachments: Vec<NewAttachment>,
    /// Size of the raw message as received.
    pub raw_size: u64,
}

impl NewMessage {
    /// Short preview built from the plain body, falling back to the subject.
    pub fn snippet(&self) -> String {
        let source = self
            .body_text
            .as_deref()
            .filter(|b| !b.trim().is_empty())
            .or(self.envelope.subject.as_deref())
            .unwrap_or_default();
        let collapsed = source.split_whitespace().collect::<Vec<_>>().join(" ");
        collapsed.chars().take(SNIPPET_CHARS).collect()
    }
}

/// Attachment metadata as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Declared filename.
    pub filename: String,
    /// MIME type.
    pub mime_type: String,
    /// Payload size in bytes.
    pub size_bytes: u64,
    /// Where the payload was written.
    pub local_path: String,
}

/// A persisted message, as handed to classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Local row identifier.
    pub id: MessageId,
    /// Owning account.
    pub account_id: AccountId,
    /// Provider `Message-ID`.
    pub message_id: String,
    /// IMAP UID or POP3 UIDL.
    pub protocol_uid: String,
    /// Sender.
    pub from: Address,
    /// Primary recipients.
    pub to: Vec<Address>,
    /// Carbon copy recipients.
    pub cc: Vec<Address>,
    /// Subject line.
    pub subject: Option<String>,
    /// Sent date.
    pub date: DateTime<Utc>,
    /// Plain-text body.
    pub body_text: Option<String>,
    /// Short preview.
    pub snippet: String,
    /// Whether any attachment was stored.
    pub has_attachments: bool,
}
