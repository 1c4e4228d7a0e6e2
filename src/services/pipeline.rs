//! Batch classification of freshly synced messages.

use std::sync::Arc;

use thiserror::Error;

use crate::domain::{Account, ClassificationResult, DecidedBy, StoredMessage};
use crate::providers::ai::ModelGateway;
use crate::storage::{MailStore, StoreError};

use super::classifier::ConsensusClassifier;
use super::progress::{ProgressEvent, ProgressSink};
use super::rules::RuleEngine;

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("AI backend is unavailable")]
    AiBackendUnavailable,

    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// Counts for one classified batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassifyOutcome {
    pub classified: usize,
    pub by_rule: usize,
    pub by_consensus: usize,
    pub by_review: usize,
}

impl ClassifyOutcome {
    fn tally(results: &[ClassificationResult]) -> Self {
        let mut outcome = Self {
            classified: results.len(),
            ..Self::default()
        };
        for result in results {
            match result.decided_by {
                DecidedBy::Consensus => outcome.by_consensus += 1,
                DecidedBy::Review => outcome.by_review += 1,
                d if d.is_rule() => outcome.by_rule += 1,
                _ => {}
            }
        }
        outcome
    }
}

/// Rules first, models second, one write per batch.
pub struct ClassificationPipeline {
    rules: RuleEngine,
    classifier: ConsensusClassifier,
    gateway: Arc<dyn ModelGateway>,
    store: Arc<dyn MailStore>,
}

impl ClassificationPipeline {
    pub fn new(
        rules: RuleEngine,
        classifier: ConsensusClassifier,
        gateway: Arc<dyn ModelGateway>,
        store: Arc<dyn MailStore>,
    ) -> Self {
        Self {
            rules,
            classifier,
            gateway,
            store,
        }
    }

    /// Classifies `messages` and persists every result together.
    ///
    /// The gateway health check runs before anything else; when it fails no
    /// result is written for the batch.
    pub async fn classify(
        &self,
        account: &Account,
        messages: Vec<StoredMessage>,
        sink: &ProgressSink,
    ) -> Result<ClassifyOutcome, ClassifyError> {
        if messages.is_empty() {
            return Ok(ClassifyOutcome::default());
        }

        if !self.gateway.health_check().await {
            tracing::warn!(account_id = %account.id, "AI backend health check failed");
            return Err(ClassifyError::AiBackendUnavailable);
        }

        let total = messages.len();
        sink.emit(ProgressEvent::Classifying { total });

        let mut results = Vec::with_capacity(total);
        for (idx, message) in messages.iter().enumerate() {
            sink.emit(ProgressEvent::ClassifyingProgress {
                current: idx + 1,
                total,
            });

            let result = match self.rules.evaluate(message) {
                Some(result) => result,
                None => {
                    self.classifier
                        .classify(message, account.custom_classification_prompt.as_deref())
                        .await
                }
            };
            tracing::debug!(
                message_id = %message.id,
                label = %result.final_label,
                decided_by = %result.decided_by,
                "classified"
            );
            results.push(result);
        }

        let outcome = ClassifyOutcome::tally(&results);
        self.store.save_classifications(results).await?;

        tracing::info!(
            account_id = %account.id,
            classified = outcome.classified,
            by_rule = outcome.by_rule,
            by_review = outcome.by_review,
            "classification batch saved"
        );
        Ok(outcome)
    }
}
