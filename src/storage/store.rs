//! The persistence contract the sync engine and classifier depend on.

use async_trait::async_trait;
use thiserror::Error;

use super::{queries, DatabaseError, StorageLayer, UidCacheError};
use crate::domain::{
    Account, AccountId, AuditEntry, ClassificationResult, MessageId, NewMessage, StoredMessage,
    SyncCheckpoint,
};

pub use super::queries::messages::UpsertOutcome;

/// Errors surfaced through [`MailStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    UidCache(#[from] UidCacheError),

    #[error("Attachment write failed: {0}")]
    Attachment(#[from] std::io::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Storage operations used by sync and classification.
#[async_trait]
pub trait MailStore: Send + Sync {
    /// Accounts the scheduler should visit.
    async fn active_accounts(&self) -> StoreResult<Vec<Account>>;

    async fn account(&self, id: &AccountId) -> StoreResult<Option<Account>>;

    /// Records (`Some`) or clears (`None`) the latest sync failure.
    async fn set_last_sync_error(&self, id: &AccountId, error: Option<&str>) -> StoreResult<()>;

    /// Persists one message and its attachments, committing immediately.
    async fn upsert_message(&self, message: &NewMessage) -> StoreResult<UpsertOutcome>;

    /// Whether the account already holds this provider Message-ID.
    async fn known_message_id(&self, account: &AccountId, message_id: &str) -> StoreResult<bool>;

    async fn read_checkpoint(&self, account: &Account) -> StoreResult<SyncCheckpoint>;

    /// Detaches stored messages from IMAP UIDs issued under `uid_validity`.
    async fn retire_remote_ids(&self, account: &AccountId, uid_validity: u32) -> StoreResult<()>;

    async fn write_checkpoint(
        &self,
        account: &AccountId,
        checkpoint: &SyncCheckpoint,
    ) -> StoreResult<()>;

    async fn messages_for_classification(
        &self,
        ids: &[MessageId],
    ) -> StoreResult<Vec<StoredMessage>>;

    /// Messages of the account that have no classification yet, oldest first.
    async fn pending_classification(
        &self,
        account: &AccountId,
        limit: u32,
    ) -> StoreResult<Vec<StoredMessage>>;

    /// Writes every result or none of them.
    async fn save_classifications(&self, results: Vec<ClassificationResult>) -> StoreResult<()>;

    async fn append_audit(&self, entry: &AuditEntry) -> StoreResult<()>;
}

#[async_trait]
impl MailStore for StorageLayer {
    async fn active_accounts(&self) -> StoreResult<Vec<Account>> {
        Ok(queries::accounts::get_active(self.db()).await?)
    }

    async fn account(&self, id: &AccountId) -> StoreResult<Option<Account>> {
        Ok(queries::accounts::get_by_id(self.db(), id).await?)
    }

    async fn set_last_sync_error(&self, id: &AccountId, error: Option<&str>) -> StoreResult<()> {
        Ok(queries::accounts::set_last_sync_error(self.db(), id, error).await?)
    }

    async fn upsert_message(&self, message: &NewMessage) -> StoreResult<UpsertOutcome> {
        let already = queries::messages::exists(
            self.db(),
            &message.account_id,
            &message.envelope.message_id,
            &message.protocol_uid,
        )
        .await?;
        if already {
            return Ok(UpsertOutcome::Duplicate);
        }

        let mut rows = Vec::with_capacity(message.attachments.len());
        for attachment in &message.attachments {
            match self.attachments().save(attachment).await {
                Ok(row) => rows.push(row),
                Err(e) => {
                    self.attachments().discard(&rows).await;
                    return Err(e.into());
                }
            }
        }

        match queries::messages::insert(self.db(), message, rows.clone()).await {
            Ok(UpsertOutcome::Duplicate) => {
                self.attachments().discard(&rows).await;
                Ok(UpsertOutcome::Duplicate)
            }
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.attachments().discard(&rows).await;
                Err(e.into())
            }
        }
    }

    async fn known_message_id(&self, account: &AccountId, message_id: &str) -> StoreResult<bool> {
        Ok(queries::messages::message_id_known(self.db(), account, message_id).await?)
    }

    async fn read_checkpoint(&self, account: &Account) -> StoreResult<SyncCheckpoint> {
        Ok(match account.protocol {
            crate::domain::Protocol::Imap => {
                queries::checkpoints::read_imap(self.db(), &account.id).await?
            }
            crate::domain::Protocol::Pop3 => SyncCheckpoint::Pop3 {
                seen: self.uid_cache().load(&account.id).await?,
            },
        })
    }

    async fn retire_remote_ids(&self, account: &AccountId, uid_validity: u32) -> StoreResult<()> {
        let renamed =
            queries::messages::retire_protocol_uids(self.db(), account, uid_validity).await?;
        tracing::info!(account_id = %account, uid_validity, renamed, "retired stale IMAP UIDs");
        Ok(())
    }

    async fn write_checkpoint(
        &self,
        account: &AccountId,
        checkpoint: &SyncCheckpoint,
    ) -> StoreResult<()> {
        match checkpoint {
            SyncCheckpoint::Imap {
                last_uid,
                uid_validity,
            } => {
                queries::checkpoints::write_imap(self.db(), account, *last_uid, *uid_validity)
                    .await?
            }
            SyncCheckpoint::Pop3 { seen } => self.uid_cache().save(account, seen).await?,
        }
        Ok(())
    }

    async fn messages_for_classification(
        &self,
        ids: &[MessageId],
    ) -> StoreResult<Vec<StoredMessage>> {
        Ok(queries::messages::get_by_ids(self.db(), ids).await?)
    }

    async fn pending_classification(
        &self,
        account: &AccountId,
        limit: u32,
    ) -> StoreResult<Vec<StoredMessage>> {
        Ok(queries::messages::unclassified(self.db(), account, limit).await?)
    }

    async fn save_classifications(&self, results: Vec<ClassificationResult>) -> StoreResult<()> {
        queries::classifications::upsert_batch(self.db(), results).await?;
        Ok(())
    }

    async fn append_audit(&self, entry: &AuditEntry) -> StoreResult<()> {
        Ok(queries::audit::append(self.db(), entry).await?)
    }
}
