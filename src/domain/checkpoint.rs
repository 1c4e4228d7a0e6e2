//! Per-account sync checkpoints.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::Protocol;

/// Record of which remote messages an account has already fetched.
///
/// IMAP UIDs are monotonic within a mailbox for one UIDVALIDITY, so a
/// high-water mark tagged with that value suffices. POP3 message numbers are
/// only valid for a session, so the set of seen UIDLs is kept instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SyncCheckpoint {
    Imap {
        last_uid: u32,
        #[serde(default)]
        uid_validity: Option<u32>,
    },
    Pop3 {
        seen: BTreeSet<String>,
    },
}

impl SyncCheckpoint {
    /// IMAP mark with no UIDVALIDITY recorded yet.
    pub fn imap(last_uid: u32) -> Self {
        SyncCheckpoint::Imap {
            last_uid,
            uid_validity: None,
        }
    }

    /// Empty checkpoint for a protocol.
    pub fn empty(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Imap => SyncCheckpoint::imap(0),
            Protocol::Pop3 => SyncCheckpoint::Pop3 {
                seen: BTreeSet::new(),
            },
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            SyncCheckpoint::Imap { .. } => Protocol::Imap,
            SyncCheckpoint::Pop3 { .. } => Protocol::Pop3,
        }
    }

    /// Adopts the UIDVALIDITY the server reported for the folder.
    ///
    /// When it differs from the recorded one the high-water mark no longer
    /// means anything and restarts at zero; the old value is returned. A
    /// first report is adopted without a reset, and POP3 is unaffected.
    pub fn rebase(&mut self, reported: Option<u32>) -> Option<u32> {
        let SyncCheckpoint::Imap {
            last_uid,
            uid_validity,
        } = self
        else {
            return None;
        };
        let reported = reported?;
        match *uid_validity {
            Some(previous) if previous != reported => {
                *last_uid = 0;
                *uid_validity = Some(reported);
                Some(previous)
            }
            _ => {
                *uid_validity = Some(reported);
                None
            }
        }
    }

    /// Whether a remote identifier is already covered.
    pub fn contains(&self, protocol_uid: &str) -> bool {
        match self {
            SyncCheckpoint::Imap { last_uid, .. } => protocol_uid
                .parse::<u32>()
                .map(|uid| uid <= *last_uid)
                .unwrap_or(false),
            SyncCheckpoint::Pop3 { seen } => seen.contains(protocol_uid),
        }
    }

    /// Marks an identifier as processed. IMAP never moves backwards.
    pub fn record(&mut self, protocol_uid: &str) {
        match self {
            SyncCheckpoint::Imap { last_uid, .. } => {
                if let Ok(uid) = protocol_uid.parse::<u32>() {
                    *last_uid = (*last_uid).max(uid);
                }
            }
            SyncCheckpoint::Pop3 { seen } => {
                seen.insert(protocol_uid.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn imap_record_is_monotonic() {
        let mut cp = SyncCheckpoint::imap(100);
        cp.record("105");
        cp.record("103");
        assert_eq!(cp, SyncCheckpoint::imap(105));
        assert!(cp.contains("104"));
        assert!(!cp.contains("106"));
    }

    #[test]
    fn pop3_record_adds_to_set() {
        let mut cp = SyncCheckpoint::empty(Protocol::Pop3);
        cp.record("uidl-a");
        assert!(cp.contains("uidl-a"));
        assert!(!cp.contains("uidl-b"));
        assert_eq!(cp.protocol(), Protocol::Pop3);
    }

    #[test]
    fn imap_ignores_non_numeric_ids() {
        let mut cp = SyncCheckpoint::empty(Protocol::Imap);
        cp.record("abc");
        assert_eq!(cp, SyncCheckpoint::imap(0));
        assert!(!cp.contains("abc"));
    }

    #[test]
    fn changed_uid_validity_restarts_mark() {
        let mut cp = SyncCheckpoint::imap(250);

        assert_eq!(cp.rebase(Some(7)), None);
        assert_eq!(
            cp,
            SyncCheckpoint::Imap {
                last_uid: 250,
                uid_validity: Some(7)
            }
        );

        assert_eq!(cp.rebase(Some(7)), None);
        assert_eq!(cp.rebase(None), None);
        assert!(cp.contains("250"));

        assert_eq!(cp.rebase(Some(9)), Some(7));
        assert_eq!(
            cp,
            SyncCheckpoint::Imap {
                last_uid: 0,
                uid_validity: Some(9)
            }
        );
        assert!(!cp.contains("1"));
    }

    #[test]
    fn pop3_ignores_uid_validity() {
        let mut cp = SyncCheckpoint::empty(Protocol::Pop3);
        assert_eq!(cp.rebase(Some(3)), None);
        assert_eq!(cp, SyncCheckpoint::empty(Protocol::Pop3));
    }
}
