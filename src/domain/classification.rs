//! Classification domain types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::MessageId;

/// Terminal label for soft-deleted messages.
pub const DELETED_LABEL: &str = "Deleted";

/// A classification target the models may choose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    /// Label written to the result, e.g. `"SPAM"`.
    pub key: String,
    /// Natural-language description given to the models.
    pub instruction: String,
}

impl Category {
    pub fn new(key: impl Into<String>, instruction: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            instruction: instruction.into(),
        }
    }
}

/// One model's answer for one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVerdict {
    pub label: String,
    /// Self-reported confidence in `[0, 1]`.
    pub confidence: f32,
    pub rationale: String,
}

impl ModelVerdict {
    /// Conservative verdict used when a model call fails.
    pub fn fallback(label: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Self {
            label: label.into(),
            confidence: 0.0,
            rationale: format!("Error: {}", error),
        }
    }
}

/// Who made the final call on a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecidedBy {
    /// Both models agreed.
    Consensus,
    /// The arbiter broke a disagreement.
    Review,
    /// Sender matched a whitelist pattern.
    RuleWhitelist,
    /// Several organisation addresses were copied.
    RuleMultipleRecipients,
    /// A user relabelled the message.
    Manual,
    /// A user moved the message to the deleted state.
    UserDelete,
}

impl DecidedBy {
    pub fn as_str(self) -> &'static str {
        match self {
            DecidedBy::Consensus => "consensus",
            DecidedBy::Review => "review",
            DecidedBy::RuleWhitelist => "rule_whitelist",
            DecidedBy::RuleMultipleRecipients => "rule_multiple_recipients",
            DecidedBy::Manual => "manual",
            DecidedBy::UserDelete => "user_delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "consensus" => DecidedBy::Consensus,
            "review" => DecidedBy::Review,
            "rule_whitelist" => DecidedBy::RuleWhitelist,
            "rule_multiple_recipients" => DecidedBy::RuleMultipleRecipients,
            "manual" => DecidedBy::Manual,
            "user_delete" => DecidedBy::UserDelete,
            _ => return None,
        })
    }

    /// Whether a deterministic rule produced the decision.
    pub fn is_rule(self) -> bool {
        matches!(
            self,
            DecidedBy::RuleWhitelist | DecidedBy::RuleMultipleRecipients
        )
    }
}

impl std::fmt::Display for DecidedBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final classification of one message. At most one exists per message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub message_id: MessageId,
    /// Model A output; absent when a rule decided.
    pub model_a: Option<ModelVerdict>,
    /// Model B output; absent when a rule decided.
    pub model_b: Option<ModelVerdict>,
    pub final_label: String,
    pub final_reason: String,
    pub decided_by: DecidedBy,
    pub decided_at: DateTime<Utc>,
}

impl ClassificationResult {
    /// Result produced by a rule, with no model outputs.
    pub fn from_rule(
        message_id: MessageId,
        label: impl Into<String>,
        reason: impl Into<String>,
        decided_by: DecidedBy,
    ) -> Self {
        Self {
            message_id,
            model_a: None,
            model_b: None,
            final_label: label.into(),
            final_reason: reason.into(),
            decided_by,
            decided_at: Utc::now(),
        }
    }
}
