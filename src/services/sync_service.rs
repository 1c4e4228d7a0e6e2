//! Incremental mailbox sync.
//!
//! The [`SyncEngine`] drives one account through
//!
//! ```text
//! connecting -> selecting_folder -> checking_new -+-> success (nothing new)
//!                                                 |
//!                                                 +-> found_messages -> downloading xN -> success
//! ```
//!
//! with any connection-level failure ending in `error`. A single message that
//! cannot be fetched, decoded or stored is skipped with a warning and the
//! batch continues. A dropped or timed-out connection is connection-level.
//!
//! When an IMAP folder reports a new UIDVALIDITY, the checkpoint restarts at
//! zero and stored messages give up their old UIDs; Message-ID matching then
//! keeps already stored mail from being stored twice.

use std::sync::Arc;

use thiserror::Error;

use crate::domain::{Account, MessageId, NewMessage, Protocol, SyncCheckpoint};
use crate::mime::{self, MimeError};
use crate::providers::email::{
    BlockingPool, MailClientFactory, PooledClient, ProtocolError, RemoteId, POP3_FOLDER,
};
use crate::storage::{MailStore, StoreError, UpsertOutcome};

use super::progress::{ProgressEvent, ProgressSink};

const DEFAULT_FOLDER: &str = "INBOX";
const DEFAULT_POP3_FLUSH_EVERY: usize = 5;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("MIME decoding failed: {0}")]
    Mime(#[from] MimeError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SyncError {
    /// Whether the error ends the account cycle rather than one message.
    pub fn is_account_level(&self) -> bool {
        match self {
            SyncError::Protocol(e) => e.is_account_level(),
            SyncError::Mime(_) | SyncError::Store(_) => false,
        }
    }
}

/// What one account sync produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Local ids of newly stored messages, in fetch order.
    pub new_message_ids: Vec<MessageId>,
    /// Remote messages already present locally.
    pub duplicates: usize,
    /// Remote messages that failed and were skipped.
    pub skipped: usize,
    /// Checkpoint after the sync.
    pub checkpoint: SyncCheckpoint,
}

impl SyncOutcome {
    fn empty(checkpoint: SyncCheckpoint) -> Self {
        Self {
            new_message_ids: Vec::new(),
            duplicates: 0,
            skipped: 0,
            checkpoint,
        }
    }

    pub fn new_messages(&self) -> usize {
        self.new_message_ids.len()
    }
}

enum Fetched {
    Stored(MessageId),
    Duplicate,
}

/// Pulls new mail for accounts into the store.
pub struct SyncEngine {
    store: Arc<dyn MailStore>,
    factory: Arc<dyn MailClientFactory>,
    pool: BlockingPool,
    folder: String,
    pop3_flush_every: usize,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn MailStore>,
        factory: Arc<dyn MailClientFactory>,
        pool: BlockingPool,
    ) -> Self {
        Self {
            store,
            factory,
            pool,
            folder: DEFAULT_FOLDER.to_string(),
            pop3_flush_every: DEFAULT_POP3_FLUSH_EVERY,
        }
    }

    /// IMAP folder to sync. POP3 always reads its single mailbox.
    pub fn with_folder(mut self, folder: impl Into<String>) -> Self {
        self.folder = folder.into();
        self
    }

    /// How many processed POP3 messages between seen-set saves.
    pub fn with_pop3_flush_every(mut self, every: usize) -> Self {
        self.pop3_flush_every = every.max(1);
        self
    }

    /// Syncs one account, reporting progress to `sink`.
    ///
    /// On failure the account's `last_sync_error` is set and an `error` event
    /// is emitted before the error is returned. On success the error is
    /// cleared.
    pub async fn sync_account(
        &self,
        account: &Account,
        sink: &ProgressSink,
    ) -> Result<SyncOutcome, SyncError> {
        tracing::info!(account_id = %account.id, protocol = %account.protocol, "sync starting");
        sink.emit(ProgressEvent::Connecting {
            account_id: account.id.clone(),
        });

        match self.run(account, sink).await {
            Ok(outcome) => {
                if let Err(e) = self.store.set_last_sync_error(&account.id, None).await {
                    tracing::warn!(account_id = %account.id, error = %e, "failed to clear sync error");
                }
                tracing::info!(
                    account_id = %account.id,
                    new_messages = outcome.new_messages(),
                    duplicates = outcome.duplicates,
                    skipped = outcome.skipped,
                    "sync finished"
                );
                sink.emit(ProgressEvent::Success {
                    new_messages: outcome.new_messages(),
                    skipped: outcome.skipped,
                });
                Ok(outcome)
            }
            Err(e) => {
                let message = e.to_string();
                tracing::error!(account_id = %account.id, error = %message, "sync failed");
                if let Err(store_err) = self
                    .store
                    .set_last_sync_error(&account.id, Some(&message))
                    .await
                {
                    tracing::warn!(account_id = %account.id, error = %store_err, "failed to record sync error");
                }
                sink.emit(ProgressEvent::Error { error: message });
                Err(e)
            }
        }
    }

    async fn run(&self, account: &Account, sink: &ProgressSink) -> Result<SyncOutcome, SyncError> {
        let client = PooledClient::new(self.factory.create(account).await?, self.pool.clone());
        client.connect().await?;
        let result = self.run_session(account, &client, sink).await;
        client.disconnect().await;
        result
    }

    async fn run_session(
        &self,
        account: &Account,
        client: &PooledClient,
        sink: &ProgressSink,
    ) -> Result<SyncOutcome, SyncError> {
        let folder = match account.protocol {
            Protocol::Imap => self.folder.as_str(),
            Protocol::Pop3 => POP3_FOLDER,
        };
        sink.emit(ProgressEvent::SelectingFolder {
            folder: folder.to_string(),
        });
        let state = client.select_folder(folder).await?;

        sink.emit(ProgressEvent::CheckingNew);
        let mut checkpoint = self.store.read_checkpoint(account).await?;
        if let Some(previous) = checkpoint.rebase(state.uid_validity) {
            tracing::warn!(
                account_id = %account.id,
                previous,
                current = ?state.uid_validity,
                "UIDVALIDITY changed, rescanning folder"
            );
            self.store.retire_remote_ids(&account.id, previous).await?;
            self.store.write_checkpoint(&account.id, &checkpoint).await?;
        }
        let ids = client.new_identifiers(&checkpoint).await?;
        if ids.is_empty() {
            tracing::debug!(account_id = %account.id, "no new messages");
            return Ok(SyncOutcome::empty(checkpoint));
        }

        let total = ids.len();
        sink.emit(ProgressEvent::FoundMessages { total });

        let mut outcome = SyncOutcome::empty(checkpoint.clone());
        for (idx, id) in ids.iter().enumerate() {
            sink.emit(ProgressEvent::Downloading {
                current: idx + 1,
                total,
            });

            match self.fetch_and_store(account, client, id).await {
                Ok(Fetched::Stored(message_id)) => {
                    outcome.new_message_ids.push(message_id);
                    checkpoint.record(&id.protocol_uid());
                }
                Ok(Fetched::Duplicate) => {
                    outcome.duplicates += 1;
                    checkpoint.record(&id.protocol_uid());
                }
                Err(e) if e.is_account_level() => {
                    // Keep what was stored before the session dropped.
                    self.store.write_checkpoint(&account.id, &checkpoint).await?;
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(account_id = %account.id, remote = %id, error = %e, "skipping message");
                    outcome.skipped += 1;
                    sink.emit(ProgressEvent::Warning {
                        message: format!("skipped {}: {}", id, e),
                    });
                }
            }

            if account.protocol == Protocol::Pop3 && (idx + 1) % self.pop3_flush_every == 0 {
                self.store.write_checkpoint(&account.id, &checkpoint).await?;
            }
        }

        self.store.write_checkpoint(&account.id, &checkpoint).await?;
        outcome.checkpoint = checkpoint;
        Ok(outcome)
    }

    async fn fetch_and_store(
        &self,
        account: &Account,
        client: &PooledClient,
        id: &RemoteId,
    ) -> Result<Fetched, SyncError> {
        let envelope = client.fetch_headers(id).await?;

        // Guards against a lost POP3 seen-set and IMAP UIDVALIDITY resets.
        if self
            .store
            .known_message_id(&account.id, &envelope.message_id)
            .await?
        {
            tracing::debug!(remote = %id, message_id = %envelope.message_id, "already stored");
            return Ok(Fetched::Duplicate);
        }

        let raw = client.fetch_body(id).await?;
        let body = mime::parse_body(&raw)?;
        let message = NewMessage {
            account_id: account.id.clone(),
            protocol_uid: id.protocol_uid(),
            envelope,
            body_text: body.text,
            body_html: body.html,
            attachments: body.attachments,
            raw_size: raw.len() as u64,
        };

        Ok(match self.store.upsert_message(&message).await? {
            UpsertOutcome::Inserted(message_id) => Fetched::Stored(message_id),
            UpsertOutcome::Duplicate => Fetched::Duplicate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Address;
    use crate::providers::email::script::{ScriptDialer, Step};
    use crate::providers::email::{
        Credentials, FolderState, ImapClient, MailClient, Result as ProtocolResult,
    };
    use crate::storage::{queries, StorageLayer};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    #[derive(Clone)]
    struct FakeMessage {
        message_id: String,
        raw: Vec<u8>,
        fail_body: bool,
    }

    /// In-memory IMAP mailbox keyed by UID.
    struct FakeImap {
        mailbox: BTreeMap<u32, FakeMessage>,
        uid_validity: Option<u32>,
        selected: Arc<Mutex<Vec<String>>>,
        refuse_login: bool,
    }

    impl MailClient for FakeImap {
        fn protocol(&self) -> Protocol {
            Protocol::Imap
        }

        fn connect(&mut self) -> ProtocolResult<()> {
            if self.refuse_login {
                return Err(ProtocolError::Authentication("bad password".into()));
            }
            Ok(())
        }

        fn list_folders(&mut self) -> ProtocolResult<Vec<String>> {
            Ok(vec!["INBOX".into()])
        }

        fn select_folder(&mut self, name: &str) -> ProtocolResult<FolderState> {
            self.selected.lock().unwrap().push(name.to_string());
            Ok(FolderState {
                uid_validity: self.uid_validity,
            })
        }

        fn new_identifiers(&mut self, checkpoint: &SyncCheckpoint) -> ProtocolResult<Vec<RemoteId>> {
            Ok(self
                .mailbox
                .keys()
                .filter(|uid| !checkpoint.contains(&uid.to_string()))
                .map(|uid| RemoteId::Uid(*uid))
                .collect())
        }

        fn fetch_headers(&mut self, id: &RemoteId) -> ProtocolResult<crate::domain::Envelope> {
            let RemoteId::Uid(uid) = id else {
                return Err(ProtocolError::Protocol("not an IMAP id".into()));
            };
            let message = &self.mailbox[uid];
            Ok(crate::domain::Envelope {
                message_id: message.message_id.clone(),
                from: Address::new("sender@example.org"),
                to: vec![],
                cc: vec![],
                subject: Some("subject".into()),
                date: chrono::Utc::now(),
            })
        }

        fn fetch_body(&mut self, id: &RemoteId) -> ProtocolResult<Vec<u8>> {
            let RemoteId::Uid(uid) = id else {
                return Err(ProtocolError::Protocol("not an IMAP id".into()));
            };
            let message = &self.mailbox[uid];
            if message.fail_body {
                return Err(ProtocolError::Protocol("FETCH failed".into()));
            }
            Ok(message.raw.clone())
        }

        fn disconnect(&mut self) {}
    }

    struct FakeFactory {
        mailbox: BTreeMap<u32, FakeMessage>,
        uid_validity: Option<u32>,
        selected: Arc<Mutex<Vec<String>>>,
        refuse_login: bool,
    }

    impl FakeFactory {
        fn new(mailbox: BTreeMap<u32, FakeMessage>, uid_validity: Option<u32>) -> Self {
            Self {
                mailbox,
                uid_validity,
                selected: Arc::new(Mutex::new(Vec::new())),
                refuse_login: false,
            }
        }
    }

    #[async_trait]
    impl MailClientFactory for FakeFactory {
        async fn create(&self, _account: &Account) -> ProtocolResult<Box<dyn MailClient>> {
            Ok(Box::new(FakeImap {
                mailbox: self.mailbox.clone(),
                uid_validity: self.uid_validity,
                selected: self.selected.clone(),
                refuse_login: self.refuse_login,
            }))
        }
    }

    /// Hands out a real IMAP client over one scripted server session.
    struct ScriptedImapFactory {
        dialer: Mutex<Option<ScriptDialer>>,
    }

    #[async_trait]
    impl MailClientFactory for ScriptedImapFactory {
        async fn create(&self, _account: &Account) -> ProtocolResult<Box<dyn MailClient>> {
            let dialer = self
                .dialer
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| ProtocolError::Connection("script used up".into()))?;
            Ok(Box::new(ImapClient::new(
                dialer,
                Credentials::new("me@example.com", "secret"),
            )))
        }
    }

    const SESSION_START: &str = concat!(
        "* OK IMAP4rev1 ready\r\n",
        "a1 OK LOGIN completed\r\n",
        "* 3 EXISTS\r\n",
        "* OK [UIDVALIDITY 1] UIDs valid\r\n",
        "a2 OK [READ-WRITE] SELECT completed\r\n",
        "* SEARCH 1 2 3\r\n",
        "a3 OK SEARCH completed\r\n",
    );

    fn headers(uid: u32) -> String {
        format!("From: sender@example.org\r\nMessage-ID: <{uid}@example.org>\r\nSubject: s{uid}\r\n\r\n")
    }

    fn fetched(tag: u32, uid: u32, item: &str, payload: &str) -> String {
        format!(
            "* {uid} FETCH (UID {uid} {item} {{{}}}\r\n{payload})\r\na{tag} OK FETCH completed\r\n",
            payload.len()
        )
    }

    /// Header and body answers for one message, starting at `tag`.
    fn message_exchange(tag: u32, uid: u32) -> String {
        let head = headers(uid);
        format!(
            "{}{}",
            fetched(tag, uid, "BODY[HEADER]", &head),
            fetched(tag + 1, uid, "BODY[]", &format!("{head}body {uid}\r\n"))
        )
    }

    async fn scripted_engine(
        dir: &std::path::Path,
        steps: Vec<Step>,
    ) -> (SyncEngine, Arc<StorageLayer>, Account) {
        let storage = StorageLayer::in_memory(dir).await.unwrap().into_arc();
        let account = Account::imap("acc", "me@example.com", "imap.example.com");
        storage.add_account(&account).await.unwrap();
        let factory = ScriptedImapFactory {
            dialer: Mutex::new(Some(ScriptDialer::with_steps(vec![steps]))),
        };
        let engine = SyncEngine::new(storage.clone(), Arc::new(factory), BlockingPool::new(1));
        (engine, storage, account)
    }

    async fn stored_uids(storage: &StorageLayer, account: &Account) -> Vec<(String, String)> {
        let mut rows: Vec<_> = queries::messages::for_account(storage.db(), &account.id, 50)
            .await
            .unwrap()
            .into_iter()
            .map(|m| (m.protocol_uid, m.message_id))
            .collect();
        rows.sort();
        rows
    }

    fn fake(uid: u32) -> FakeMessage {
        FakeMessage {
            message_id: format!("<{uid}@example.org>"),
            raw: format!("Subject: s\r\n\r\nbody {uid}\r\n").into_bytes(),
            fail_body: false,
        }
    }

    async fn engine(
        dir: &std::path::Path,
        mailbox: BTreeMap<u32, FakeMessage>,
        refuse_login: bool,
    ) -> (SyncEngine, Arc<StorageLayer>, Account, Arc<Mutex<Vec<String>>>) {
        let storage = StorageLayer::in_memory(dir).await.unwrap().into_arc();
        let account = Account::imap("acc", "me@example.com", "imap.example.com");
        storage.add_account(&account).await.unwrap();
        let factory = FakeFactory {
            refuse_login,
            ..FakeFactory::new(mailbox, None)
        };
        let selected = factory.selected.clone();
        let engine = SyncEngine::new(storage.clone(), Arc::new(factory), BlockingPool::new(2))
            .with_folder("Archive");
        (engine, storage, account, selected)
    }

    #[tokio::test]
    async fn skipped_message_does_not_stop_batch() {
        let dir = tempfile::tempdir().unwrap();
        let mut mailbox: BTreeMap<u32, FakeMessage> = (1..=3).map(|uid| (uid, fake(uid))).collect();
        mailbox.get_mut(&2).unwrap().fail_body = true;
        let (engine, storage, account, selected) = engine(dir.path(), mailbox, false).await;

        let (sink, mut stream) = ProgressSink::channel();
        let outcome = engine.sync_account(&account, &sink).await.unwrap();

        assert_eq!(outcome.new_messages(), 2);
        assert_eq!(outcome.skipped, 1);
        assert_eq!(outcome.checkpoint, SyncCheckpoint::imap(3));
        assert_eq!(*selected.lock().unwrap(), vec!["Archive".to_string()]);

        let checkpoint = storage.read_checkpoint(&account).await.unwrap();
        assert_eq!(checkpoint, SyncCheckpoint::imap(3));

        let events = stream.drain();
        assert!(events
            .iter()
            .any(|e| matches!(e, ProgressEvent::Warning { message } if message.contains("uid 2"))));
        assert_eq!(
            events.last(),
            Some(&ProgressEvent::Success {
                new_messages: 2,
                skipped: 1
            })
        );
    }

    #[tokio::test]
    async fn authentication_failure_records_error() {
        let dir = tempfile::tempdir().unwrap();
        let mailbox = (1..=2).map(|uid| (uid, fake(uid))).collect();
        let (engine, storage, account, _) = engine(dir.path(), mailbox, true).await;

        let (sink, mut stream) = ProgressSink::channel();
        let err = engine.sync_account(&account, &sink).await.unwrap_err();
        assert!(err.is_account_level());

        let stored = storage.account(&account.id).await.unwrap().unwrap();
        assert!(stored
            .last_sync_error
            .as_deref()
            .unwrap()
            .contains("authentication failed"));

        let events = stream.drain();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], ProgressEvent::Error { .. }));
        assert_eq!(storage.read_checkpoint(&account).await.unwrap(), SyncCheckpoint::imap(0));
    }

    #[tokio::test]
    async fn nothing_new_leaves_checkpoint_alone() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, storage, account, _) = engine(dir.path(), BTreeMap::new(), false).await;

        let (sink, mut stream) = ProgressSink::channel();
        let outcome = engine.sync_account(&account, &sink).await.unwrap();
        assert_eq!(outcome.new_messages(), 0);

        let statuses: Vec<_> = stream.drain().iter().map(|e| e.status()).collect();
        assert_eq!(
            statuses,
            vec!["connecting", "selecting_folder", "checking_new", "success"]
        );
        assert_eq!(storage.read_checkpoint(&account).await.unwrap(), SyncCheckpoint::imap(0));
    }

    #[tokio::test]
    async fn successful_sync_clears_previous_error() {
        let dir = tempfile::tempdir().unwrap();
        let mailbox = (1..=1).map(|uid| (uid, fake(uid))).collect();
        let (engine, storage, account, _) = engine(dir.path(), mailbox, false).await;
        storage
            .set_last_sync_error(&account.id, Some("old failure"))
            .await
            .unwrap();

        engine
            .sync_account(&account, &ProgressSink::noop())
            .await
            .unwrap();
        let stored = storage.account(&account.id).await.unwrap().unwrap();
        assert_eq!(stored.last_sync_error, None);
    }

    #[tokio::test]
    async fn connection_dropped_mid_batch_fails_the_sync() {
        let dir = tempfile::tempdir().unwrap();
        let script = format!(
            "{SESSION_START}{}* 2 FETCH (UID 2 BODY[HEADER] {{40}}\r\nFrom: trunc",
            message_exchange(4, 1)
        );
        let (engine, storage, account) = scripted_engine(dir.path(), vec![Step::text(script)]).await;

        let (sink, mut stream) = ProgressSink::channel();
        let err = engine.sync_account(&account, &sink).await.unwrap_err();
        assert!(err.is_account_level());

        let stored = storage.account(&account.id).await.unwrap().unwrap();
        assert!(stored.last_sync_error.is_some());
        assert!(matches!(
            stream.drain().last(),
            Some(ProgressEvent::Error { .. })
        ));

        assert_eq!(
            stored_uids(&storage, &account).await,
            vec![("1".to_string(), "<1@example.org>".to_string())]
        );
        assert_eq!(
            storage.read_checkpoint(&account).await.unwrap(),
            SyncCheckpoint::Imap {
                last_uid: 1,
                uid_validity: Some(1)
            }
        );
    }

    #[tokio::test]
    async fn timed_out_fetch_never_stores_under_another_uid() {
        let dir = tempfile::tempdir().unwrap();
        let steps = vec![
            Step::text(format!("{SESSION_START}{}", message_exchange(4, 1))),
            // Header fetch for uid 2 times out; its answer arrives late.
            Step::Fail(std::io::ErrorKind::TimedOut),
            Step::text(format!(
                "{}{}",
                fetched(6, 2, "BODY[HEADER]", &headers(2)),
                message_exchange(7, 3)
            )),
        ];
        let (engine, storage, account) = scripted_engine(dir.path(), steps).await;

        let err = engine
            .sync_account(&account, &ProgressSink::noop())
            .await
            .unwrap_err();
        assert!(err.is_account_level());

        assert_eq!(
            stored_uids(&storage, &account).await,
            vec![("1".to_string(), "<1@example.org>".to_string())]
        );
        let stored = storage.account(&account.id).await.unwrap().unwrap();
        assert!(stored.last_sync_error.unwrap().contains("I/O error"));
    }

    #[tokio::test]
    async fn new_uid_validity_rescans_and_keeps_reused_uids() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageLayer::in_memory(dir.path()).await.unwrap().into_arc();
        let account = Account::imap("acc", "me@example.com", "imap.example.com");
        storage.add_account(&account).await.unwrap();

        let before: BTreeMap<u32, FakeMessage> = (1..=2).map(|uid| (uid, fake(uid))).collect();
        let first = SyncEngine::new(
            storage.clone(),
            Arc::new(FakeFactory::new(before, Some(1))),
            BlockingPool::new(1),
        );
        first.sync_account(&account, &ProgressSink::noop()).await.unwrap();

        // Mailbox rebuilt: message 2 is now UID 1, and UID 2 is new mail.
        let mut after = BTreeMap::new();
        after.insert(1, fake(2));
        after.insert(
            2,
            FakeMessage {
                message_id: "<fresh@example.org>".into(),
                ..fake(9)
            },
        );
        let second = SyncEngine::new(
            storage.clone(),
            Arc::new(FakeFactory::new(after, Some(2))),
            BlockingPool::new(1),
        );
        let outcome = second
            .sync_account(&account, &ProgressSink::noop())
            .await
            .unwrap();

        assert_eq!(outcome.new_messages(), 1);
        assert_eq!(outcome.duplicates, 1);
        assert_eq!(
            outcome.checkpoint,
            SyncCheckpoint::Imap {
                last_uid: 2,
                uid_validity: Some(2)
            }
        );
        let uids = stored_uids(&storage, &account).await;
        assert!(uids.contains(&("2".to_string(), "<fresh@example.org>".to_string())));
        assert!(uids.contains(&("stale:1:1".to_string(), "<1@example.org>".to_string())));
    }
}
