//! Dual-model consensus classification with an arbiter.
//!
//! Two models classify each message independently and concurrently. Agreement
//! is final. Disagreement goes to a third model that sees both answers. Model
//! failures never abort a message: a failed voter degrades to the fallback
//! label with zero confidence, and a failed arbiter defers to the more
//! confident voter.

use std::fmt::Write as _;
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;

use crate::config::{AiSettings, ClassificationSettings};
use crate::domain::{Category, ClassificationResult, DecidedBy, ModelVerdict, StoredMessage};
use crate::providers::ai::{parse_json_payload, LlmError, LlmResult, ModelGateway};

const DEFAULT_PREVIEW_CHARS: usize = 500;
const DEFAULT_INSTRUCTIONS: &str = "You are an email triage assistant.";

/// Model identifiers used for one classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSet {
    pub model_a: String,
    pub model_b: String,
    pub arbiter: String,
}

impl ModelSet {
    pub fn new(
        model_a: impl Into<String>,
        model_b: impl Into<String>,
        arbiter: impl Into<String>,
    ) -> Self {
        Self {
            model_a: model_a.into(),
            model_b: model_b.into(),
            arbiter: arbiter.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawVerdict {
    label: String,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    rationale: String,
}

#[derive(Debug, Deserialize)]
struct RawReview {
    final_label: String,
    #[serde(default)]
    final_reason: String,
}

/// Classifies one message at a time through a [`ModelGateway`].
pub struct ConsensusClassifier {
    gateway: Arc<dyn ModelGateway>,
    models: ModelSet,
    categories: Vec<Category>,
    fallback_label: String,
    preview_chars: usize,
}

impl ConsensusClassifier {
    pub fn new(
        gateway: Arc<dyn ModelGateway>,
        models: ModelSet,
        categories: Vec<Category>,
        fallback_label: impl Into<String>,
    ) -> Self {
        Self {
            gateway,
            models,
            categories,
            fallback_label: fallback_label.into(),
            preview_chars: DEFAULT_PREVIEW_CHARS,
        }
    }

    pub fn from_settings(
        gateway: Arc<dyn ModelGateway>,
        ai: &AiSettings,
        classification: &ClassificationSettings,
    ) -> Self {
        Self::new(
            gateway,
            ModelSet::new(&ai.model_a, &ai.model_b, &ai.arbiter_model),
            classification.categories.clone(),
            classification.fallback_label(),
        )
        .with_preview_chars(ai.body_preview_chars)
    }

    /// Limits how much of the body the models see.
    pub fn with_preview_chars(mut self, chars: usize) -> Self {
        self.preview_chars = chars;
        self
    }

    pub fn categories(&self) -> &[Category] {
        &self.categories
    }

    /// Produces a final classification. Never fails.
    ///
    /// `instructions` replaces the opening of the voter prompt; the message,
    /// categories and reply format are always appended.
    pub async fn classify(
        &self,
        message: &StoredMessage,
        instructions: Option<&str>,
    ) -> ClassificationResult {
        let prompt = self.classification_prompt(message, instructions);
        let (verdict_a, verdict_b) = tokio::join!(
            self.ask(&self.models.model_a, &prompt),
            self.ask(&self.models.model_b, &prompt),
        );

        if verdict_a.label == verdict_b.label {
            tracing::debug!(message_id = %message.id, label = %verdict_a.label, "models agree");
            return ClassificationResult {
                message_id: message.id.clone(),
                final_label: verdict_a.label.clone(),
                final_reason: format!("Consensus: {}", verdict_a.rationale),
                model_a: Some(verdict_a),
                model_b: Some(verdict_b),
                decided_by: DecidedBy::Consensus,
                decided_at: Utc::now(),
            };
        }

        let (final_label, final_reason) = match self.review(message, &verdict_a, &verdict_b).await
        {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!(
                    message_id = %message.id,
                    error = %e,
                    "arbiter failed, keeping more confident verdict"
                );
                let (which, kept) = if verdict_b.confidence > verdict_a.confidence {
                    ("B", &verdict_b)
                } else {
                    ("A", &verdict_a)
                };
                (
                    kept.label.clone(),
                    format!(
                        "Arbiter unavailable ({e}); kept model {which}: {}",
                        kept.rationale
                    ),
                )
            }
        };

        ClassificationResult {
            message_id: message.id.clone(),
            model_a: Some(verdict_a),
            model_b: Some(verdict_b),
            final_label,
            final_reason,
            decided_by: DecidedBy::Review,
            decided_at: Utc::now(),
        }
    }

    async fn ask(&self, model: &str, prompt: &str) -> ModelVerdict {
        match self.call_voter(model, prompt).await {
            Ok(verdict) => verdict,
            Err(e) => {
                tracing::warn!(model, error = %e, "model call failed, using fallback label");
                ModelVerdict::fallback(self.fallback_label.clone(), e)
            }
        }
    }

    async fn call_voter(&self, model: &str, prompt: &str) -> LlmResult<ModelVerdict> {
        let output = self.gateway.generate(model, prompt).await?;
        let raw: RawVerdict = parse_json_payload(&output)?;
        let label = self.canonical_label(&raw.label)?;
        Ok(ModelVerdict {
            label,
            confidence: raw.confidence.clamp(0.0, 1.0),
            rationale: raw.rationale,
        })
    }

    async fn review(
        &self,
        message: &StoredMessage,
        verdict_a: &ModelVerdict,
        verdict_b: &ModelVerdict,
    ) -> LlmResult<(String, String)> {
        let prompt = self.review_prompt(message, verdict_a, verdict_b);
        let output = self.gateway.generate(&self.models.arbiter, &prompt).await?;
        let raw: RawReview = parse_json_payload(&output)?;
        let label = self.canonical_label(&raw.final_label)?;
        Ok((label, raw.final_reason))
    }

    fn canonical_label(&self, raw: &str) -> LlmResult<String> {
        let raw = raw.trim();
        self.categories
            .iter()
            .find(|c| c.key.eq_ignore_ascii_case(raw))
            .map(|c| c.key.clone())
            .ok_or_else(|| LlmError::InvalidResponse(format!("unknown label {raw:?}")))
    }

    fn classification_prompt(&self, message: &StoredMessage, instructions: Option<&str>) -> String {
        let instructions = instructions
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_INSTRUCTIONS);
        let mut prompt = format!("{instructions}\n\n");
        self.write_context(&mut prompt, message);
        self.write_categories(&mut prompt);
        let _ = write!(
            prompt,
            "\nReply with JSON only, in this exact format:\n\
             {{\"label\": \"{}\", \"confidence\": 0.85, \"rationale\": \"one sentence\"}}\n",
            self.label_choices()
        );
        prompt
    }

    fn review_prompt(
        &self,
        message: &StoredMessage,
        verdict_a: &ModelVerdict,
        verdict_b: &ModelVerdict,
    ) -> String {
        let mut prompt = String::from(
            "Two classifiers disagreed about an email. Decide the correct category.\n\n",
        );
        self.write_context(&mut prompt, message);
        self.write_categories(&mut prompt);
        for (name, verdict) in [("A", verdict_a), ("B", verdict_b)] {
            let _ = writeln!(
                prompt,
                "\nClassifier {name}: label={}, confidence={:.2}, rationale={}",
                verdict.label, verdict.confidence, verdict.rationale
            );
        }
        let _ = write!(
            prompt,
            "\nReply with JSON only, in this exact format:\n\
             {{\"final_label\": \"{}\", \"final_reason\": \"one sentence\"}}\n",
            self.label_choices()
        );
        prompt
    }

    fn write_context(&self, prompt: &mut String, message: &StoredMessage) {
        let join = |addrs: &[crate::domain::Address]| {
            addrs
                .iter()
                .map(|a| a.email.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        };
        let body = message.body_text.as_deref().unwrap_or(&message.snippet);
        let preview: String = body.chars().take(self.preview_chars).collect();

        let _ = writeln!(prompt, "Email:");
        let _ = writeln!(prompt, "From: {}", message.from.email);
        let _ = writeln!(prompt, "To: {}", join(&message.to));
        let _ = writeln!(prompt, "Cc: {}", join(&message.cc));
        let _ = writeln!(prompt, "Subject: {}", message.subject.as_deref().unwrap_or(""));
        let _ = writeln!(prompt, "Date: {}", message.date.to_rfc2822());
        let _ = writeln!(prompt, "Body preview:\n{}\n", preview.trim());
    }

    fn write_categories(&self, prompt: &mut String) {
        let _ = writeln!(prompt, "Categories:");
        for (idx, category) in self.categories.iter().enumerate() {
            let _ = writeln!(prompt, "{}. {}: {}", idx + 1, category.key, category.instruction);
        }
    }

    fn label_choices(&self) -> String {
        self.categories
            .iter()
            .map(|c| c.key.as_str())
            .collect::<Vec<_>>()
            .join("|")
    }
}
