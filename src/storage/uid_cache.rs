//! Per-account POP3 seen-UID sets.
//!
//! Each account's set lives in its own JSON file, `pop3_uids_<account>.json`,
//! under the data directory. Writes go to a `tempfile` in the same directory
//! that is then persisted over the old one, so a crash leaves either the old
//! or the new set.
//!
//! Not safe for concurrent writers on the same account. Callers must ensure
//! only one sync per account is in flight.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use thiserror::Error;

use crate::domain::AccountId;

/// Errors from the UID cache.
#[derive(Debug, Error)]
pub enum UidCacheError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt UID cache {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to spawn blocking task: {0}")]
    TaskFailed(String),
}

pub type Result<T> = std::result::Result<T, UidCacheError>;

/// Directory of seen-UID files.
#[derive(Debug, Clone)]
pub struct UidCache {
    dir: PathBuf,
}

impl UidCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding the account's set.
    pub fn path_for(&self, account_id: &AccountId) -> PathBuf {
        let safe: String = account_id
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("pop3_uids_{safe}.json"))
    }

    /// Loads the account's set. A missing file is an empty set.
    pub async fn load(&self, account_id: &AccountId) -> Result<BTreeSet<String>> {
        let path = self.path_for(account_id);
        tokio::task::spawn_blocking(move || load_blocking(&path))
            .await
            .map_err(|e| UidCacheError::TaskFailed(e.to_string()))?
    }

    /// Replaces the account's set atomically.
    pub async fn save(&self, account_id: &AccountId, seen: &BTreeSet<String>) -> Result<()> {
        let path = self.path_for(account_id);
        let seen = seen.clone();
        tokio::task::spawn_blocking(move || save_blocking(&path, &seen))
            .await
            .map_err(|e| UidCacheError::TaskFailed(e.to_string()))?
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> UidCacheError + '_ {
    move |source| UidCacheError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn load_blocking(path: &Path) -> Result<BTreeSet<String>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
        Err(e) => return Err(io_err(path)(e)),
    };
    serde_json::from_slice(&bytes).map_err(|source| UidCacheError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

fn save_blocking(path: &Path, seen: &BTreeSet<String>) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(io_err(dir))?;
    let json = serde_json::to_vec(seen).map_err(|source| UidCacheError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(io_err(dir))?;
    tmp.write_all(&json).map_err(io_err(path))?;
    tmp.as_file().sync_all().map_err(io_err(path))?;
    tmp.persist(path).map_err(|e| io_err(path)(e.error))?;
    Ok(())
}
