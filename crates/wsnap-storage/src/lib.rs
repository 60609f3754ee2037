//! Persistence collaborators for wsnap: the partitioned snapshot store, the
//! notification sink, and the raw-response archive.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::NaiveDate;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

mod notify;
mod store;

pub use notify::{text_message_body, LogNotifier, Notifier, NotifyError, RecordingNotifier, WebhookNotifier};
pub use store::{MemorySnapshotStore, PgSnapshotStore, RestSnapshotStore, SnapshotStore, StoreError};

pub const CRATE_NAME: &str = "wsnap-storage";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

impl HttpClientConfig {
    pub fn build_client(&self) -> anyhow::Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(self.timeout);
        if let Some(user_agent) = &self.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        builder.build().context("building reqwest client")
    }
}

#[derive(Debug, Clone)]
pub struct ArchivedSnapshot {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Content-addressed archive of raw query responses, one directory per
/// partition date.
#[derive(Debug, Clone)]
pub struct SnapshotArchive {
    root: PathBuf,
}

impl SnapshotArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    pub fn relative_path_for(update_date: NaiveDate, content_hash: &str) -> PathBuf {
        PathBuf::from("raw")
            .join(update_date.format("%Y-%m-%d").to_string())
            .join(format!("{content_hash}.json"))
    }

    /// Write the payload through a temp file + rename. Identical payloads for
    /// the same date land on the same path and are not rewritten.
    pub async fn archive(&self, update_date: NaiveDate, bytes: &[u8]) -> anyhow::Result<ArchivedSnapshot> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = Self::relative_path_for(update_date, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let dir = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        let archived = |deduplicated| ArchivedSnapshot {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating archive directory {}", dir.display()))?;
        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(archived(true));
        }

        let temp_path = dir.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::File::create(&temp_path)
            .await
            .with_context(|| format!("creating {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| format!("renaming archive into {}", absolute_path.display()));
        }
        Ok(archived(false))
    }
}
