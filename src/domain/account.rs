//! Account domain types.
//!
//! Represents remote mailboxes and the connection parameters needed to reach them.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::AccountId;

/// A mailbox the engine synchronises.
///
/// Passwords are stored in the system keychain, keyed by account ID,
/// never in this struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// Unique identifier for this account.
    pub id: AccountId,
    /// Email address for this account.
    pub email: String,
    /// Mail server hostname.
    pub host: String,
    /// Mail server port.
    pub port: u16,
    /// Which protocol to speak to the server.
    pub protocol: Protocol,
    /// Login name, usually the email address.
    pub username: String,
    /// Whether to wrap the connection in TLS.
    pub use_tls: bool,
    /// Whether to verify the server certificate.
    pub verify_tls: bool,
    /// Socket timeout for connect and reads.
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
    /// Whether new messages are classified right after sync.
    pub auto_classify: bool,
    /// Inactive accounts are skipped by the scheduler.
    pub is_active: bool,
    /// Most recent sync failure, cleared on success.
    pub last_sync_error: Option<String>,
    /// Replaces the default instructions sent to both classifier models.
    #[serde(default)]
    pub custom_classification_prompt: Option<String>,
}

impl Account {
    /// Creates an active IMAP account with TLS on the standard port.
    pub fn imap(id: impl Into<AccountId>, email: &str, host: &str) -> Self {
        Self {
            id: id.into(),
            email: email.to_string(),
            host: host.to_string(),
            port: Protocol::Imap.default_tls_port(),
            protocol: Protocol::Imap,
            username: email.to_string(),
            use_tls: true,
            verify_tls: true,
            timeout: Duration::from_secs(30),
            auto_classify: true,
            is_active: true,
            last_sync_error: None,
            custom_classification_prompt: None,
        }
    }

    /// Creates an active POP3 account with TLS on the standard port.
    pub fn pop3(id: impl Into<AccountId>, email: &str, host: &str) -> Self {
        Self {
            port: Protocol::Pop3.default_tls_port(),
            protocol: Protocol::Pop3,
            ..Self::imap(id, email, host)
        }
    }

    /// Domain part of the account address, lowercased.
    pub fn domain(&self) -> Option<String> {
        self.email
            .rsplit_once('@')
            .map(|(_, domain)| domain.to_ascii_lowercase())
    }
}

/// Mail retrieval protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// IMAP4rev1.
    Imap,
    /// POP3.
    Pop3,
}

impl Protocol {
    /// Conventional implicit-TLS port.
    pub fn default_tls_port(self) -> u16 {
        match self {
            Protocol::Imap => 993,
            Protocol::Pop3 => 995,
        }
    }

    /// Stable string form used in storage.
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Imap => "imap",
            Protocol::Pop3 => "pop3",
        }
    }

    /// Parses the storage string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "imap" => Some(Protocol::Imap),
            "pop3" => Some(Protocol::Pop3),
            _ => None,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_serialization() {
        let account = Account::imap("test-id", "test@example.com", "imap.example.com");

        let json = serde_json::to_string(&account).unwrap();
        let deserialized: Account = serde_json::from_str(&json).unwrap();

        assert_eq!(deserialized.email, "test@example.com");
        assert_eq!(deserialized.timeout, Duration::from_secs(30));
        assert_eq!(deserialized.protocol, Protocol::Imap);
        assert!(json.contains("\"imap\""));
    }

    #[test]
    fn prompt_override_defaults_to_none_when_missing() {
        let mut value = serde_json::to_value(Account::imap("a", "a@example.com", "h")).unwrap();
        value
            .as_object_mut()
            .unwrap()
            .remove("custom_classification_prompt");

        let account: Account = serde_json::from_value(value).unwrap();
        assert!(account.custom_classification_prompt.is_none());
    }

    #[test]
    fn pop3_constructor_uses_pop3_port() {
        let account = Account::pop3("p", "me@example.com", "pop.example.com");
        assert_eq!(account.port, 995);
        assert_eq!(account.protocol, Protocol::Pop3);
        assert_eq!(account.username, "me@example.com");
    }

    #[test]
    fn domain_is_lowercased() {
        let account = Account::imap("a", "Me@Example.COM", "imap.example.com");
        assert_eq!(account.domain().as_deref(), Some("example.com"));
    }

    #[test]
    fn protocol_string_roundtrip() {
        for protocol in [Protocol::Imap, Protocol::Pop3] {
            assert_eq!(Protocol::parse(protocol.as_str()), Some(protocol));
        }
        assert_eq!(Protocol::parse("smtp"), None);
    }
}
