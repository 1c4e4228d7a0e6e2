//! Application wiring and lifecycle.
//!
//! [`App`] builds every service from [`Settings`] and owns the scheduler.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::domain::{Account, AccountId};
use crate::providers::ai::{HttpGateway, ModelGateway};
use crate::providers::email::{
    BlockingPool, KeychainClientFactory, MailClientFactory, PooledClient, RetryPolicy,
};
use crate::services::{
    AccountCycle, ClassificationPipeline, ConsensusClassifier, CycleReport, ProgressSink,
    RuleEngine, Scheduler, SyncEngine,
};
use crate::storage::{queries, KeychainAccess, MailStore, StorageLayer};

/// Upper bound on messages taken by one pending-classification run.
const PENDING_BATCH: u32 = 200;

/// The assembled service graph.
pub struct App {
    settings: Settings,
    storage: Arc<StorageLayer>,
    factory: Arc<dyn MailClientFactory>,
    pool: BlockingPool,
    scheduler: Scheduler,
}

impl App {
    /// Opens storage and builds sync, classification and scheduling.
    pub async fn build(settings: Settings) -> Result<Self> {
        settings.validate().context("invalid settings")?;

        let storage = StorageLayer::open(
            settings.database_path()?,
            settings.data_dir()?,
            settings.attachments_dir()?,
        )
        .await
        .context("failed to open storage")?
        .into_arc();

        Self::with_storage(settings, storage).await
    }

    /// Builds the service graph over an existing storage layer.
    pub async fn with_storage(settings: Settings, storage: Arc<StorageLayer>) -> Result<Self> {
        let api_key = resolve_api_key(&settings, storage.keychain()).await;
        let ai = &settings.ai;
        let gateway: Arc<dyn ModelGateway> = Arc::new(
            HttpGateway::new(&ai.base_url, api_key)
                .with_paths(&ai.generate_path, &ai.health_path)
                .with_timeouts(ai.request_timeout(), ai.health_timeout()),
        );

        let store: Arc<dyn MailStore> = storage.clone();
        let retry = RetryPolicy {
            max_attempts: settings.sync.connect_attempts,
            backoff_base: settings.sync.backoff_base(),
        };
        let factory: Arc<dyn MailClientFactory> =
            Arc::new(KeychainClientFactory::new(storage.keychain().clone(), retry));
        let pool = BlockingPool::new(settings.sync.worker_pool_size);
        let engine = SyncEngine::new(store.clone(), factory.clone(), pool.clone())
            .with_folder(&settings.sync.folder)
            .with_pop3_flush_every(settings.sync.pop3_flush_every);

        let pipeline = ClassificationPipeline::new(
            RuleEngine::from_settings(&settings.classification),
            ConsensusClassifier::from_settings(gateway.clone(), ai, &settings.classification),
            gateway,
            store.clone(),
        );

        let cycle = Arc::new(AccountCycle::new(store.clone(), engine, pipeline));
        let scheduler = Scheduler::new(cycle, store, &settings.scheduler.cron)?;

        Ok(Self {
            settings,
            storage,
            factory,
            pool,
            scheduler,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn storage(&self) -> &Arc<StorageLayer> {
        &self.storage
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Syncs one account on demand.
    pub async fn sync_account(
        &self,
        account_id: &AccountId,
        classify: bool,
        sink: &ProgressSink,
    ) -> Result<CycleReport> {
        let account = self.account(account_id).await?;
        Ok(self.scheduler.run_account(&account, classify, sink).await)
    }

    /// Classifies messages of one account that still have no result.
    pub async fn classify_pending(
        &self,
        account_id: &AccountId,
        sink: &ProgressSink,
    ) -> Result<CycleReport> {
        let account = self.account(account_id).await?;
        Ok(self
            .scheduler
            .classify_pending(&account, PENDING_BATCH, sink)
            .await)
    }

    /// Lists the remote folders of an account.
    pub async fn folders(&self, account_id: &AccountId) -> Result<Vec<String>> {
        let account = self.account(account_id).await?;
        let client = PooledClient::new(self.factory.create(&account).await?, self.pool.clone());
        client.connect().await?;
        let folders = client.list_folders().await;
        client.disconnect().await;
        Ok(folders?)
    }

    /// Includes or excludes an account from scheduled passes.
    pub async fn set_active(&self, account_id: &AccountId, active: bool) -> Result<()> {
        self.account(account_id).await?;
        queries::accounts::set_active(self.storage.db(), account_id, active).await?;
        tracing::info!(account_id = %account_id, active, "account activation changed");
        Ok(())
    }

    async fn account(&self, account_id: &AccountId) -> Result<Account> {
        self.storage
            .account(account_id)
            .await?
            .with_context(|| format!("no account {account_id}"))
    }

    /// Runs the scheduler until `shutdown` is cancelled.
    pub async fn serve(&self, shutdown: CancellationToken) -> Result<()> {
        if self.settings.scheduler.enabled {
            self.scheduler.start().await;
        } else {
            tracing::info!("scheduler disabled in settings");
        }

        shutdown.cancelled().await;
        tracing::info!("shutting down");
        self.scheduler.shutdown().await;
        Ok(())
    }
}

/// API key from the configured environment variable, then the keychain.
async fn resolve_api_key(settings: &Settings, keychain: &KeychainAccess) -> Option<String> {
    if let Ok(key) = std::env::var(&settings.ai.api_key_env) {
        if !key.trim().is_empty() {
            return Some(key);
        }
    }
    match keychain.gateway_api_key().await {
        Ok(key) => key,
        Err(e) => {
            tracing::debug!(error = %e, "no gateway key in keychain");
            None
        }
    }
}
