//! Audit log entries for sync and classification cycles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::AccountId;

/// Outcome recorded for one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    /// Sync and, if requested, classification both succeeded.
    Success,
    /// Sync succeeded but classification failed.
    Partial,
    /// Sync failed.
    Failed,
}

impl AuditStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditStatus::Success => "success",
            AuditStatus::Partial => "partial",
            AuditStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(AuditStatus::Success),
            "partial" => Some(AuditStatus::Partial),
            "failed" => Some(AuditStatus::Failed),
            _ => None,
        }
    }
}

/// Immutable record of a cycle outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Account the cycle ran for, absent for process-level events.
    pub account_id: Option<AccountId>,
    /// What ran, e.g. `"background_sync"` or `"sync"`.
    pub action: String,
    pub status: AuditStatus,
    /// Human-readable outcome.
    pub detail: String,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        account_id: Option<AccountId>,
        action: impl Into<String>,
        status: AuditStatus,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            account_id,
            action: action.into(),
            status,
            detail: detail.into(),
            created_at: Utc::now(),
        }
    }
}
