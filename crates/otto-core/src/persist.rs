//! Persistence collaborator contract
//!
//! Called at cache clear and graceful shutdown. The on-disk format is
//! out of scope for the engine; `FilePersistence` is a minimal JSON
//! implementation the CLI uses.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

use crate::agent::history::ChatEntry;
use crate::ai::types::ChatMessage;
use crate::session::SessionState;

#[async_trait]
pub trait Persistence: Send + Sync {
    async fn save_context(
        &self,
        system_prompt: &str,
        history: &[ChatEntry],
        session: &SessionState,
    ) -> Result<()>;

    async fn save_messages(&self, messages: &[ChatMessage]) -> Result<()>;

    async fn backup_history(&self) -> Result<()>;
}

/// No-op persistence for tests and ephemeral sessions.
pub struct NullPersistence;

#[async_trait]
impl Persistence for NullPersistence {
    async fn save_context(&self, _: &str, _: &[ChatEntry], _: &SessionState) -> Result<()> {
        Ok(())
    }

    async fn save_messages(&self, _: &[ChatMessage]) -> Result<()> {
        Ok(())
    }

    async fn backup_history(&self) -> Result<()> {
        Ok(())
    }
}

/// JSON files under a session directory.
pub struct FilePersistence {
    dir: PathBuf,
}

impl FilePersistence {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    async fn ensure_dir(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating session dir {}", self.dir.display()))
    }
}

#[async_trait]
impl Persistence for FilePersistence {
    async fn save_context(
        &self,
        system_prompt: &str,
        history: &[ChatEntry],
        session: &SessionState,
    ) -> Result<()> {
        self.ensure_dir().await?;
        let payload = serde_json::json!({
            "system_prompt": system_prompt,
            "history": history,
            "session": session,
        });
        let path = self.dir.join("context.json");
        tokio::fs::write(&path, serde_json::to_vec_pretty(&payload)?)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        debug!(path = %path.display(), entries = history.len(), "saved context");
        Ok(())
    }

    async fn save_messages(&self, messages: &[ChatMessage]) -> Result<()> {
        self.ensure_dir().await?;
        let path = self.dir.join("messages.json");
        tokio::fs::write(&path, serde_json::to_vec_pretty(messages)?)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    async fn backup_history(&self) -> Result<()> {
        let source = self.dir.join("context.json");
        if !source.exists() {
            return Ok(());
        }
        let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
        let target = self.dir.join(format!("context-{stamp}.json"));
        tokio::fs::copy(&source, &target)
            .await
            .with_context(|| format!("backing up {}", source.display()))?;
        debug!(target = %target.display(), "backed up history");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_persistence_writes_and_backs_up() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = FilePersistence::new(dir.path().to_path_buf());
        let session = SessionState::new("openai", "gpt-4o", "https://x", "KEY");

        persistence
            .save_context("prompt", &[], &session)
            .await
            .unwrap();
        persistence.backup_history().await.unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 2);
    }
}
