use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

use super::SessionStore;
use crate::error::StoreError;
use crate::session::{MergeSession, SessionUpdate, UpdateError};

/// Session store keeping one JSON document per session in a directory.
///
/// Writes go through a temp file and a rename so a crash never leaves a
/// half-written session behind. A single mutex serializes every
/// read-modify-write.
pub struct FileSessionStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileSessionStore {
    pub async fn new(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, session_id: &str) -> Result<PathBuf, StoreError> {
        if session_id.is_empty()
            || !session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(StoreError::NotFound(format!("session {session_id}")));
        }
        Ok(self.dir.join(format!("{session_id}.json")))
    }

    async fn read(&self, path: &Path) -> Result<Option<MergeSession>, StoreError> {
        match fs::read_to_string(path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, session: &MergeSession) -> Result<(), StoreError> {
        let path = self.path_for(&session.session_id)?;
        let content = serde_json::to_string_pretty(session)?;
        let tmp = self.dir.join(format!(".{}.tmp", session.session_id));
        fs::write(&tmp, &content).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl SessionStore for FileSessionStore {
    async fn find(&self, session_id: &str) -> Result<Option<MergeSession>, StoreError> {
        let path = match self.path_for(session_id) {
            Ok(path) => path,
            Err(_) => return Ok(None),
        };
        self.read(&path).await
    }

    async fn list(&self) -> Result<Vec<MergeSession>, StoreError> {
        let mut sessions = Vec::new();
        let mut dir = fs::read_dir(&self.dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            let filename = match path.file_name().and_then(|f| f.to_str()) {
                Some(f) => f.to_string(),
                None => continue,
            };
            // Skip temp files
            if filename.starts_with('.') || !filename.ends_with(".json") {
                continue;
            }
            match self.read(&path).await {
                Ok(Some(session)) => sessions.push(session),
                Ok(None) => {}
                Err(e) => {
                    tracing::error!("Failed to read session {}: {}", filename, e);
                }
            }
        }
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }

    async fn insert(&self, session: &MergeSession) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.write(session).await
    }

    async fn update(
        &self,
        session_id: &str,
        update: SessionUpdate,
    ) -> Result<MergeSession, UpdateError> {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(session_id)?;
        let mut session = self
            .read(&path)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("session {session_id}")))?;
        session.apply(&update)?;
        self.write(&session).await?;
        Ok(session)
    }

    async fn remove(&self, session_id: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(session_id)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(format!("session {session_id}")))
            }
            Err(e) => Err(e.into()),
        }
    }
}
