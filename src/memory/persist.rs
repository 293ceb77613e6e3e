//! File-backed history persistence.
//!
//! One JSONL file per session under `<root>/<user_id>/<session_id>.jsonl`,
//! with an adjacent `.meta.json` sidecar recording session metadata
//! (session id, user id, updated-at). Ids are sanitized into
//! filesystem-safe names before use.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

use super::HistoryPersistence;

/// Session metadata written next to the history file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub session_id: String,
    pub user_id: String,
    /// RFC 3339 timestamp of the last write.
    pub updated_at: String,
}

/// JSONL persistence rooted at a directory.
pub struct JsonlHistoryStore {
    root: PathBuf,
}

impl JsonlHistoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn session_path(&self, session_id: &str, user_id: &str) -> PathBuf {
        self.root
            .join(sanitize(user_id))
            .join(format!("{}.jsonl", sanitize(session_id)))
    }
}

/// Replace path-hostile characters so ids cannot escape the root.
fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[async_trait]
impl HistoryPersistence for JsonlHistoryStore {
    async fn read(&self, session_id: &str, user_id: &str) -> anyhow::Result<Option<String>> {
        let path = self.session_path(session_id, user_id);
        match fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
        }
    }

    async fn write(
        &self,
        session_id: &str,
        user_id: &str,
        serialized: &str,
    ) -> anyhow::Result<()> {
        let path = self.session_path(session_id, user_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create {}", parent.display()))?;
        }
        // Write-then-rename so a crashed write never leaves a torn file.
        let tmp = path.with_extension("jsonl.tmp");
        fs::write(&tmp, serialized)
            .await
            .with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("rename to {}", path.display()))?;

        let meta = SessionMeta {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            updated_at: chrono::Utc::now().to_rfc3339(),
        };
        let meta_path = path.with_extension("meta.json");
        let meta_json = serde_json::to_string(&meta).context("serialize session metadata")?;
        fs::write(&meta_path, meta_json)
            .await
            .with_context(|| format!("write {}", meta_path.display()))?;

        debug!(path = %path.display(), bytes = serialized.len(), "history written");
        Ok(())
    }
}

/// Delete the persisted file for a session, if present.
pub async fn delete_session(root: &Path, session_id: &str, user_id: &str) -> anyhow::Result<()> {
    let path = root
        .join(sanitize(user_id))
        .join(format!("{}.jsonl", sanitize(session_id)));
    let _ = fs::remove_file(path.with_extension("meta.json")).await;
    match fs::remove_file(&path).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
    }
}
