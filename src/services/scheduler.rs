//! Account cycles and the cron-driven background scheduler.
//!
//! An account cycle is sync, then classification of what the sync brought
//! in, then one audit entry. The scheduler runs a cycle for every active
//! account, one account at a time, whenever its cron expression fires.

use std::sync::Arc;

use anyhow::Context;
use chrono::Local;
use croner::Cron;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::domain::{Account, AccountId, AuditEntry, AuditStatus, MessageId};
use crate::storage::MailStore;

use super::pipeline::{ClassificationPipeline, ClassifyOutcome};
use super::progress::{ProgressEvent, ProgressSink};
use super::sync_service::SyncEngine;

/// Audit action for scheduled cycles.
pub const BACKGROUND_ACTION: &str = "background_sync";
/// Audit action for cycles a user started.
pub const MANUAL_ACTION: &str = "sync";
/// Audit action for classifying messages an earlier cycle left unclassified.
pub const CLASSIFY_ACTION: &str = "classify";

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid cron expression {expr:?}: {reason}")]
    InvalidCron { expr: String, reason: String },
}

/// Result of one account cycle, mirrored in its audit entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub account_id: AccountId,
    pub status: AuditStatus,
    pub new_messages: usize,
    pub classified: usize,
    pub detail: String,
}

/// Sync, classify and audit for a single account.
pub struct AccountCycle {
    store: Arc<dyn MailStore>,
    engine: SyncEngine,
    pipeline: ClassificationPipeline,
}

impl AccountCycle {
    pub fn new(
        store: Arc<dyn MailStore>,
        engine: SyncEngine,
        pipeline: ClassificationPipeline,
    ) -> Self {
        Self {
            store,
            engine,
            pipeline,
        }
    }

    /// Runs the cycle. Never fails; the outcome lands in the audit log.
    ///
    /// New messages are classified only when `classify` is set and the
    /// account has auto-classification enabled.
    pub async fn run(
        &self,
        account: &Account,
        action: &str,
        classify: bool,
        sink: &ProgressSink,
    ) -> CycleReport {
        let mut report = CycleReport {
            account_id: account.id.clone(),
            status: AuditStatus::Success,
            new_messages: 0,
            classified: 0,
            detail: String::new(),
        };

        match self.engine.sync_account(account, sink).await {
            Err(e) => {
                report.status = AuditStatus::Failed;
                report.detail = format!("sync failed: {e}");
            }
            Ok(outcome) => {
                report.new_messages = outcome.new_messages();
                report.detail = format!(
                    "{} new, {} duplicate, {} skipped",
                    outcome.new_messages(),
                    outcome.duplicates,
                    outcome.skipped
                );

                if classify && account.auto_classify && !outcome.new_message_ids.is_empty() {
                    match self
                        .classify_new(account, &outcome.new_message_ids, sink)
                        .await
                    {
                        Ok(classified) => {
                            report.classified = classified.classified;
                            report.detail.push_str(&format!(
                                "; {} classified ({} by rule)",
                                classified.classified, classified.by_rule
                            ));
                        }
                        Err(e) => {
                            tracing::warn!(account_id = %account.id, error = %format!("{e:#}"), "classification failed");
                            report.status = AuditStatus::Partial;
                            report.detail.push_str(&format!("; {e:#}"));
                            sink.emit(ProgressEvent::Warning {
                                message: format!("{e:#}"),
                            });
                        }
                    }
                }
            }
        }

        self.finish(account, action, report, sink).await
    }

    /// Classifies up to `limit` stored messages that have no result yet.
    ///
    /// Picks up batches an unavailable backend left behind. Ignores the
    /// account's `auto_classify` flag.
    pub async fn classify_pending(
        &self,
        account: &Account,
        limit: u32,
        sink: &ProgressSink,
    ) -> CycleReport {
        let mut report = CycleReport {
            account_id: account.id.clone(),
            status: AuditStatus::Success,
            new_messages: 0,
            classified: 0,
            detail: String::new(),
        };

        let result = async {
            let messages = self
                .store
                .pending_classification(&account.id, limit)
                .await
                .context("loading pending messages")?;
            self.pipeline
                .classify(account, messages, sink)
                .await
                .context("classification failed")
        }
        .await;

        match result {
            Ok(outcome) => {
                report.classified = outcome.classified;
                report.detail = format!(
                    "{} classified ({} by rule)",
                    outcome.classified, outcome.by_rule
                );
            }
            Err(e) => {
                tracing::warn!(account_id = %account.id, error = %format!("{e:#}"), "pending classification failed");
                report.status = AuditStatus::Failed;
                report.detail = format!("{e:#}");
                sink.emit(ProgressEvent::Error {
                    error: report.detail.clone(),
                });
            }
        }

        self.finish(account, CLASSIFY_ACTION, report, sink).await
    }

    async fn finish(
        &self,
        account: &Account,
        action: &str,
        report: CycleReport,
        sink: &ProgressSink,
    ) -> CycleReport {
        let entry = AuditEntry::new(
            Some(account.id.clone()),
            action,
            report.status,
            report.detail.clone(),
        );
        if let Err(e) = self.store.append_audit(&entry).await {
            tracing::warn!(account_id = %account.id, error = %e, "failed to write audit entry");
        }

        sink.emit(ProgressEvent::Complete {
            new_messages: report.new_messages,
            classified_count: report.classified,
        });
        report
    }

    async fn classify_new(
        &self,
        account: &Account,
        ids: &[MessageId],
        sink: &ProgressSink,
    ) -> anyhow::Result<ClassifyOutcome> {
        let messages = self
            .store
            .messages_for_classification(ids)
            .await
            .context("loading new messages")?;
        let outcome = self
            .pipeline
            .classify(account, messages, sink)
            .await
            .context("classification failed")?;
        Ok(outcome)
    }
}

/// Runs account cycles on a cron schedule.
///
/// Passes never overlap: a manual [`run_once`](Scheduler::run_once) waits for
/// a scheduled pass in flight and vice versa.
pub struct Scheduler {
    cycle: Arc<AccountCycle>,
    store: Arc<dyn MailStore>,
    expr: String,
    schedule: Cron,
    pass_lock: Arc<Mutex<()>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        cycle: Arc<AccountCycle>,
        store: Arc<dyn MailStore>,
        cron: &str,
    ) -> Result<Self, SchedulerError> {
        let schedule = Cron::new(cron)
            .parse()
            .map_err(|e| SchedulerError::InvalidCron {
                expr: cron.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            cycle,
            store,
            expr: cron.to_string(),
            schedule,
            pass_lock: Arc::new(Mutex::new(())),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    /// Runs one pass over every active account now.
    pub async fn run_once(&self) -> Vec<CycleReport> {
        run_pass(&self.cycle, self.store.as_ref(), &self.pass_lock, &self.cancel).await
    }

    /// Runs a user-requested cycle for one account, serialised with passes.
    pub async fn run_account(
        &self,
        account: &Account,
        classify: bool,
        sink: &ProgressSink,
    ) -> CycleReport {
        let _guard = self.pass_lock.lock().await;
        self.cycle.run(account, MANUAL_ACTION, classify, sink).await
    }

    /// Classifies an account's leftover messages, serialised with passes.
    pub async fn classify_pending(
        &self,
        account: &Account,
        limit: u32,
        sink: &ProgressSink,
    ) -> CycleReport {
        let _guard = self.pass_lock.lock().await;
        self.cycle.classify_pending(account, limit, sink).await
    }

    /// Starts the background loop. Calling it twice is a no-op.
    pub async fn start(&self) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }

        let cycle = self.cycle.clone();
        let store = self.store.clone();
        let schedule = self.schedule.clone();
        let pass_lock = self.pass_lock.clone();
        let cancel = self.cancel.clone();

        tracing::info!(cron = %self.expr, "scheduler started");
        *task = Some(tokio::spawn(async move {
            loop {
                let now = Local::now();
                let next = match schedule.find_next_occurrence(&now, false) {
                    Ok(next) => next,
                    Err(e) => {
                        tracing::error!(error = %e, "no next run time, stopping scheduler");
                        break;
                    }
                };
                let wait = (next - now).to_std().unwrap_or_default();
                tracing::debug!(next = %next, "next scheduled pass");

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }

                let reports = run_pass(&cycle, store.as_ref(), &pass_lock, &cancel).await;
                tracing::info!(accounts = reports.len(), "scheduled pass finished");
            }
            tracing::info!("scheduler stopped");
        }));
    }

    pub async fn is_running(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stops the loop after the account cycle in flight, if any, finishes.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.task.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "scheduler task ended abnormally");
            }
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("cron", &self.expr)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

async fn run_pass(
    cycle: &AccountCycle,
    store: &dyn MailStore,
    pass_lock: &Mutex<()>,
    cancel: &CancellationToken,
) -> Vec<CycleReport> {
    let _guard = pass_lock.lock().await;

    let accounts = match store.active_accounts().await {
        Ok(accounts) => accounts,
        Err(e) => {
            tracing::error!(error = %e, "failed to load accounts");
            let entry = AuditEntry::new(
                None,
                BACKGROUND_ACTION,
                AuditStatus::Failed,
                format!("loading accounts: {e}"),
            );
            if let Err(e) = store.append_audit(&entry).await {
                tracing::warn!(error = %e, "failed to write audit entry");
            }
            return Vec::new();
        }
    };

    let mut reports = Vec::with_capacity(accounts.len());
    for account in accounts {
        if cancel.is_cancelled() {
            tracing::info!("shutdown requested, ending pass early");
            break;
        }
        let report = cycle
            .run(&account, BACKGROUND_ACTION, true, &ProgressSink::noop())
            .await;
        tracing::info!(
            account_id = %report.account_id,
            status = report.status.as_str(),
            new_messages = report.new_messages,
            classified = report.classified,
            "account cycle finished"
        );
        reports.push(report);
    }
    reports
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Category;
    use crate::providers::ai::{MockGateway, ModelGateway};
    use crate::providers::email::{BlockingPool, MockClientFactory, ProtocolError};
    use crate::services::classifier::{ConsensusClassifier, ModelSet};
    use crate::services::rules::{RuleEngine, WhitelistMatcher};
    use crate::storage::StorageLayer;
    use std::time::Duration;

    async fn scheduler(
        dir: &std::path::Path,
        factory: MockClientFactory,
        cron: &str,
    ) -> (Result<Scheduler, SchedulerError>, Arc<StorageLayer>) {
        let storage = StorageLayer::in_memory(dir).await.unwrap().into_arc();
        let store: Arc<dyn MailStore> = storage.clone();
        let gateway: Arc<dyn ModelGateway> = Arc::new(MockGateway::new());
        let pipeline = ClassificationPipeline::new(
            RuleEngine::new(WhitelistMatcher::default(), "Services", "InCopy", "example.com"),
            ConsensusClassifier::new(
                gateway.clone(),
                ModelSet::new("a", "b", "c"),
                vec![Category::new("SPAM", "x")],
                "SPAM",
            ),
            gateway,
            store.clone(),
        );
        let engine = SyncEngine::new(store.clone(), Arc::new(factory), BlockingPool::new(1));
        let cycle = Arc::new(AccountCycle::new(store.clone(), engine, pipeline));
        (Scheduler::new(cycle, store, cron), storage)
    }

    #[tokio::test]
    async fn rejects_bad_cron() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, _) = scheduler(dir.path(), MockClientFactory::new(), "whenever").await;
        let err = tokio_test::assert_err!(scheduler);
        assert!(err.to_string().contains("whenever"));
    }

    #[tokio::test]
    async fn start_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, _) = scheduler(dir.path(), MockClientFactory::new(), "0 7 * * MON-FRI").await;
        let scheduler = tokio_test::assert_ok!(scheduler);

        scheduler.start().await;
        scheduler.start().await;
        assert!(scheduler.is_running().await);

        tokio::time::timeout(Duration::from_secs(5), scheduler.shutdown())
            .await
            .unwrap();
        assert!(!scheduler.is_running().await);
    }

    #[tokio::test]
    async fn classify_pending_without_leftovers_is_audited() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, storage) = scheduler(dir.path(), MockClientFactory::new(), "0 7 * * *").await;
        let scheduler = scheduler.unwrap();
        let account = Account::imap("a", "a@example.com", "imap.example.com");
        storage.add_account(&account).await.unwrap();

        // No pending messages: the pipeline never consults the backend.
        let (sink, mut stream) = ProgressSink::channel();
        let report = scheduler.classify_pending(&account, 50, &sink).await;
        assert_eq!(report.status, AuditStatus::Success);
        assert_eq!(report.classified, 0);
        assert_eq!(
            stream.drain(),
            vec![ProgressEvent::Complete {
                new_messages: 0,
                classified_count: 0
            }]
        );

        let audit = crate::storage::queries::audit::recent(storage.db(), 10)
            .await
            .unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, CLASSIFY_ACTION);
    }

    #[tokio::test]
    async fn failed_account_is_audited_and_pass_continues() {
        let dir = tempfile::tempdir().unwrap();
        let mut factory = MockClientFactory::new();
        factory
            .expect_create()
            .times(2)
            .returning(|_| Err(ProtocolError::Connection("refused".into())));
        let (scheduler, storage) = scheduler(dir.path(), factory, "0 7 * * *").await;
        let scheduler = scheduler.unwrap();

        let mut second = Account::pop3("b", "b@example.com", "pop.example.com");
        second.auto_classify = false;
        storage
            .add_account(&Account::imap("a", "a@example.com", "imap.example.com"))
            .await
            .unwrap();
        storage.add_account(&second).await.unwrap();

        let reports = scheduler.run_once().await;
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.status == AuditStatus::Failed));

        let audit = crate::storage::queries::audit::recent(storage.db(), 10)
            .await
            .unwrap();
        assert_eq!(audit.len(), 2);
        assert!(audit.iter().all(|e| e.action == BACKGROUND_ACTION));
        assert!(audit[0].detail.contains("refused"));
    }
}
