//! Attachment payload files.

use std::path::{Path, PathBuf};

use crate::domain::{Attachment, NewAttachment};

const MAX_NAME_CHARS: usize = 100;

/// Writes attachment payloads under one directory as `<uuid>_<name>`.
#[derive(Debug, Clone)]
pub struct AttachmentStore {
    dir: PathBuf,
}

impl AttachmentStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes the payload and returns the row to persist.
    pub async fn save(&self, attachment: &NewAttachment) -> std::io::Result<Attachment> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let file_name = format!(
            "{}_{}",
            uuid::Uuid::new_v4(),
            sanitize_filename(&attachment.filename)
        );
        let path = self.dir.join(file_name);
        tokio::fs::write(&path, &attachment.payload).await?;

        Ok(Attachment {
            filename: attachment.filename.clone(),
            mime_type: attachment.mime_type.clone(),
            size_bytes: attachment.size_bytes(),
            local_path: path.to_string_lossy().into_owned(),
        })
    }

    /// Removes files written for a message that was then not persisted.
    pub async fn discard(&self, attachments: &[Attachment]) {
        for attachment in attachments {
            if let Err(e) = tokio::fs::remove_file(&attachment.local_path).await {
                tracing::debug!(path = %attachment.local_path, error = %e, "could not remove attachment file");
            }
        }
    }
}

/// Keeps a filename safe for any filesystem.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_NAME_CHARS)
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "attachment".to_string()
    } else {
        cleaned.to_string()
    }
}
