//! Attachment storage areas.
//!
//! Two directories with different lifetimes:
//! - `media/` — durable storage for digest attachments; a file here is owned
//!   by exactly one log entry and deleted by whoever marks that entry SENT.
//! - `temp/` — scratch area for poller downloads and instant-mode copies;
//!   callers delete their own files after the delivery attempt.
//!
//! Filenames are made unique per source + timestamp, so unrelated rules never
//! collide and no locking is needed.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::warn;

/// Handle over the media/temp directories.
#[derive(Debug, Clone)]
pub struct MediaStore {
    media_dir: PathBuf,
    temp_dir: PathBuf,
}

impl MediaStore {
    pub fn new(media_dir: impl Into<PathBuf>, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            media_dir: media_dir.into(),
            temp_dir: temp_dir.into(),
        }
    }

    /// Create both directories if missing.
    pub async fn ensure_dirs(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.media_dir).await?;
        tokio::fs::create_dir_all(&self.temp_dir).await?;
        Ok(())
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Unique filename for a download: `{source}_{millis}_{original}`.
    pub fn unique_name(source: &str, original: &str) -> String {
        let stamp = Utc::now().timestamp_millis();
        format!("{}_{}_{}", sanitize(source), stamp, sanitize(original))
    }

    /// Path for a fresh temp download.
    pub fn temp_path(&self, source: &str, original: &str) -> PathBuf {
        self.temp_dir.join(Self::unique_name(source, original))
    }

    /// Copy a temp file into durable media storage. Returns the durable path
    /// the log entry should reference.
    pub async fn store_durable(&self, src: &Path, source: &str) -> std::io::Result<PathBuf> {
        let original = src
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("attachment");
        let dst = self.media_dir.join(Self::unique_name(source, original));
        tokio::fs::copy(src, &dst).await?;
        Ok(dst)
    }

    /// Delete an attachment file, logging rather than propagating failures —
    /// a missing file must not block the status transition that triggered
    /// the delete.
    pub async fn remove(&self, path: &Path) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!(path = %path.display(), "Failed to remove attachment: {e}");
        }
    }
}

/// Strip path separators and whitespace out of filename components.
fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
