//! Application settings and configuration types.
//!
//! Settings are persisted to `~/.config/mailtriage/settings.json` (or the
//! platform equivalent) and loaded at startup. A missing file yields defaults.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::Category;

/// Errors loading or validating settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid settings JSON in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("No home directory to place settings in")]
    NoHomeDir,

    #[error("Invalid settings: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Top-level application settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Where data lives on disk.
    pub storage: StorageSettings,
    /// Protocol and sync tuning.
    pub sync: SyncSettings,
    /// Model gateway configuration.
    pub ai: AiSettings,
    /// Categories and deterministic rules.
    pub classification: ClassificationSettings,
    /// Background schedule.
    pub scheduler: SchedulerSettings,
}

/// File locations. Empty paths resolve to platform directories.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// SQLite database file.
    pub database_path: Option<PathBuf>,
    /// Directory for POP3 UID caches.
    pub data_dir: Option<PathBuf>,
    /// Directory for attachment payloads.
    pub attachments_dir: Option<PathBuf>,
}

/// Sync engine tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Folder synchronised on IMAP accounts.
    pub folder: String,
    /// Connection attempts, including the first.
    pub connect_attempts: u32,
    /// Delay before the second attempt; doubles each time.
    pub backoff_base_secs: u64,
    /// POP3 seen-set flush interval in processed messages.
    pub pop3_flush_every: usize,
    /// Concurrent blocking protocol calls.
    pub worker_pool_size: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            folder: "INBOX".to_string(),
            connect_attempts: 3,
            backoff_base_secs: 1,
            pop3_flush_every: 5,
            worker_pool_size: 4,
        }
    }
}

impl SyncSettings {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_secs(self.backoff_base_secs)
    }
}

/// Model gateway configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AiSettings {
    /// Gateway root URL.
    pub base_url: String,
    /// Path of the generate endpoint.
    pub generate_path: String,
    /// Path probed by the health check.
    pub health_path: String,
    /// Environment variable holding the API key; the keychain is tried after it.
    pub api_key_env: String,
    /// First voter.
    pub model_a: String,
    /// Second voter.
    pub model_b: String,
    /// Breaks disagreements between the voters.
    pub arbiter_model: String,
    pub request_timeout_secs: u64,
    pub health_timeout_secs: u64,
    /// Characters of body text included in prompts.
    pub body_preview_chars: usize,
}

impl Default for AiSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            generate_path: "/api/generate".to_string(),
            health_path: "/api/tags".to_string(),
            api_key_env: "MAILTRIAGE_API_KEY".to_string(),
            model_a: "gpt-oss:120b-cloud".to_string(),
            model_b: "qwen3-coder:480b-cloud".to_string(),
            arbiter_model: "gpt-oss:120b-cloud".to_string(),
            request_timeout_secs: 120,
            health_timeout_secs: 5,
            body_preview_chars: 500,
        }
    }
}

impl AiSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }
}

/// Categories and rule inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationSettings {
    /// Categories offered to the models, in priority order.
    pub categories: Vec<Category>,
    /// Sender patterns, bare domains or `*` globs.
    pub whitelist_patterns: Vec<String>,
    /// Label applied by the whitelist rule.
    pub whitelist_label: String,
    /// Label applied when several organisation addresses are copied.
    pub in_copy_label: String,
    /// The organisation's own mail domain.
    pub organization_domain: String,
    /// Label used when a model call fails. Defaults to the last category.
    pub fallback_label: Option<String>,
}

impl Default for ClassificationSettings {
    fn default() -> Self {
        Self {
            categories: vec![
                Category::new(
                    "Interesting",
                    "Mail with a genuine intent to hire us: quotes, proposals, business meetings.",
                ),
                Category::new(
                    "InCopy",
                    "Mail where several colleagues are addressed in To or Cc.",
                ),
                Category::new(
                    "Services",
                    "Transactional notifications from known platforms such as banks, shops or travel sites.",
                ),
                Category::new(
                    "SPAM",
                    "Spam, phishing, unsolicited newsletters and any mail trying to sell us something.",
                ),
            ],
            whitelist_patterns: Vec::new(),
            whitelist_label: "Services".to_string(),
            in_copy_label: "InCopy".to_string(),
            organization_domain: "example.com".to_string(),
            fallback_label: None,
        }
    }
}

impl ClassificationSettings {
    /// Label used for failed model calls.
    pub fn fallback_label(&self) -> String {
        self.fallback_label
            .clone()
            .or_else(|| self.categories.last().map(|c| c.key.clone()))
            .unwrap_or_default()
    }
}

/// Background schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub enabled: bool,
    /// Five-field cron expression in local time.
    pub cron: String,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            cron: "0 7 * * MON-FRI".to_string(),
        }
    }
}

impl Settings {
    /// Default settings file location.
    pub fn default_path() -> Result<PathBuf> {
        Ok(project_dirs()?.config_dir().join("settings.json"))
    }

    /// Loads settings from `path`, or defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no settings file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Writes settings as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        let io = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io)?;
        }
        let json = serde_json::to_vec_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, json).map_err(io)
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let classification = &self.classification;
        if classification.categories.is_empty() {
            return Err(ConfigError::Invalid("at least one category is required".into()));
        }

        let mut keys = HashSet::new();
        for category in &classification.categories {
            if category.key.trim().is_empty() {
                return Err(ConfigError::Invalid("category keys must not be empty".into()));
            }
            if !keys.insert(category.key.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate category key {}",
                    category.key
                )));
            }
        }

        for (field, label) in [
            ("whitelist_label", classification.whitelist_label.as_str()),
            ("in_copy_label", classification.in_copy_label.as_str()),
        ] {
            if !keys.contains(label) {
                return Err(ConfigError::Invalid(format!(
                    "{field} {label} is not a declared category"
                )));
            }
        }
        if let Some(fallback) = &classification.fallback_label {
            if !keys.contains(fallback.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "fallback_label {fallback} is not a declared category"
                )));
            }
        }

        if self.sync.connect_attempts == 0 {
            return Err(ConfigError::Invalid("connect_attempts must be at least 1".into()));
        }
        if self.sync.pop3_flush_every == 0 {
            return Err(ConfigError::Invalid("pop3_flush_every must be at least 1".into()));
        }

        croner::Cron::new(&self.scheduler.cron)
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("cron {}: {e}", self.scheduler.cron)))?;

        Ok(())
    }

    /// Database file, resolved against platform directories when unset.
    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.storage.database_path {
            Some(path) => Ok(path.clone()),
            None => Ok(project_dirs()?.data_dir().join("mailtriage.db")),
        }
    }

    /// Directory for POP3 UID caches.
    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.storage.data_dir {
            Some(path) => Ok(path.clone()),
            None => Ok(project_dirs()?.data_dir().to_path_buf()),
        }
    }

    /// Directory for attachment payloads.
    pub fn attachments_dir(&self) -> Result<PathBuf> {
        match &self.storage.attachments_dir {
            Some(path) => Ok(path.clone()),
            None => Ok(self.data_dir()?.join("attachments")),
        }
    }
}

fn project_dirs() -> Result<directories::ProjectDirs> {
    directories::ProjectDirs::from("io", "mailtriage", "mailtriage").ok_or(ConfigError::NoHomeDir)
}
