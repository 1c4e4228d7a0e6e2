//! Database, file and credential storage.
//!
//! This module provides the storage layer for the sync engine, including:
//!
//! - SQLite database for accounts, messages, classifications and the audit log
//! - Per-account POP3 seen-UID files
//! - Attachment payload files
//! - OS keychain integration for secure credential storage
//! - Async-safe database operations via tokio::task::spawn_blocking

mod attachments;
mod database;
mod keychain;
pub mod queries;
mod schema;
mod store;
mod uid_cache;

pub use attachments::{sanitize_filename, AttachmentStore};
pub use database::{Database, DatabaseError, Result};
pub use keychain::{KeychainAccess, KeychainError};
pub use store::{MailStore, StoreError, StoreResult, UpsertOutcome};
pub use uid_cache::{UidCache, UidCacheError};

use std::path::Path;
use std::sync::Arc;

use crate::domain::{
    Account, AccountId, ClassificationResult, DecidedBy, MessageId, DELETED_LABEL,
};

/// Combined storage layer with database, files and keychain access.
///
/// This is the main entry point for storage operations.
#[derive(Debug, Clone)]
pub struct StorageLayer {
    db: Database,
    keychain: KeychainAccess,
    uid_cache: UidCache,
    attachments: AttachmentStore,
}

impl StorageLayer {
    /// Opens the database at `db_path` and keeps files under the given directories.
    pub async fn open(
        db_path: impl AsRef<Path>,
        data_dir: impl AsRef<Path>,
        attachments_dir: impl AsRef<Path>,
    ) -> Result<Self> {
        let db = Database::open(db_path).await?;

        Ok(Self {
            db,
            keychain: KeychainAccess::new(),
            uid_cache: UidCache::new(data_dir.as_ref()),
            attachments: AttachmentStore::new(attachments_dir.as_ref()),
        })
    }

    /// Creates a storage layer with an in-memory database for testing.
    ///
    /// Files still go under `data_dir`.
    pub async fn in_memory(data_dir: impl AsRef<Path>) -> Result<Self> {
        let db = Database::open_in_memory().await?;
        let data_dir = data_dir.as_ref();

        Ok(Self {
            db,
            keychain: KeychainAccess::with_service("io.mailtriage.test"),
            uid_cache: UidCache::new(data_dir),
            attachments: AttachmentStore::new(data_dir.join("attachments")),
        })
    }

    /// Returns a reference to the database.
    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Returns a reference to the keychain.
    pub fn keychain(&self) -> &KeychainAccess {
        &self.keychain
    }

    pub fn uid_cache(&self) -> &UidCache {
        &self.uid_cache
    }

    pub fn attachments(&self) -> &AttachmentStore {
        &self.attachments
    }

    /// Wraps the storage layer in an Arc for shared ownership.
    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Registers a new account.
    pub async fn add_account(&self, account: &Account) -> Result<()> {
        queries::accounts::insert(&self.db, account).await
    }

    /// Every account, active or not.
    pub async fn all_accounts(&self) -> Result<Vec<Account>> {
        queries::accounts::get_all(&self.db).await
    }

    /// Bytes of raw mail stored for the account.
    pub async fn mailbox_usage(&self, account_id: &AccountId) -> Result<u64> {
        queries::messages::mailbox_usage(&self.db, account_id).await
    }

    /// Current classification of a message, if any.
    pub async fn classification(
        &self,
        message_id: &MessageId,
    ) -> Result<Option<ClassificationResult>> {
        queries::classifications::get(&self.db, message_id).await
    }

    /// Relabels a message by hand.
    pub async fn override_classification(&self, message_id: &MessageId, label: &str) -> Result<()> {
        tracing::info!(message_id = %message_id, label, "manual relabel");
        queries::classifications::set_final(
            &self.db,
            message_id,
            label,
            "Manually relabelled",
            DecidedBy::Manual,
        )
        .await
    }

    /// Moves a message to the terminal deleted state.
    pub async fn mark_deleted(&self, message_id: &MessageId) -> Result<()> {
        tracing::info!(message_id = %message_id, "soft delete");
        queries::classifications::set_final(
            &self.db,
            message_id,
            DELETED_LABEL,
            "Deleted by user",
            DecidedBy::UserDelete,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Address, Envelope, NewMessage};

    #[tokio::test]
    async fn storage_layer_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageLayer::in_memory(dir.path()).await.unwrap();

        let count: i64 = storage
            .db()
            .with_conn(|conn| {
                let count =
                    conn.query_row("SELECT COUNT(*) FROM accounts", [], |row| row.get(0))?;
                Ok(count)
            })
            .await
            .unwrap();

        assert_eq!(count, 0);
        assert_eq!(storage.keychain().service(), "io.mailtriage.test");
        assert_eq!(storage.uid_cache().dir(), dir.path());
    }

    #[tokio::test]
    async fn relabel_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageLayer::in_memory(dir.path()).await.unwrap();
        let account = Account::imap("acc", "me@example.com", "h");
        storage.add_account(&account).await.unwrap();

        let message = NewMessage {
            account_id: account.id.clone(),
            protocol_uid: "1".into(),
            envelope: Envelope {
                message_id: "<m@x>".into(),
                from: Address::new("a@example.com"),
                to: Vec::new(),
                cc: Vec::new(),
                subject: None,
                date: chrono::Utc::now(),
            },
            body_text: None,
            body_html: None,
            attachments: Vec::new(),
            raw_size: 2048,
        };
        let UpsertOutcome::Inserted(id) = storage.upsert_message(&message).await.unwrap() else {
            panic!("expected insert");
        };

        storage.override_classification(&id, "Interesting").await.unwrap();
        let result = storage.classification(&id).await.unwrap().unwrap();
        assert_eq!(result.final_label, "Interesting");
        assert_eq!(result.decided_by, DecidedBy::Manual);

        storage.mark_deleted(&id).await.unwrap();
        let result = storage.classification(&id).await.unwrap().unwrap();
        assert_eq!(result.final_label, DELETED_LABEL);
        assert_eq!(result.decided_by, DecidedBy::UserDelete);

        assert_eq!(storage.mailbox_usage(&account.id).await.unwrap(), 2048);
        assert_eq!(storage.all_accounts().await.unwrap().len(), 1);
    }
}
