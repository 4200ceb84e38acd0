use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dl_error::{DevloopError, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::tunnel::TunnelState;

const REGISTRY_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Running,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeAssociation {
    pub source_root: PathBuf,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    pub label: String,
    /// Effective root: the worktree checkout while one is attached.
    pub project_root: PathBuf,
    pub port: u16,
    pub state: SessionState,
    #[serde(default)]
    pub tunnel: TunnelState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree: Option<WorktreeAssociation>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn is_live(&self) -> bool {
        self.state != SessionState::Stopped
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Whole-set persistence for session records. There are no partial updates:
/// callers load everything, mutate, and save everything.
#[async_trait]
pub trait SessionRegistry: Send + Sync {
    async fn load(&self) -> Result<Vec<SessionRecord>>;
    async fn save(&self, sessions: &[SessionRecord]) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct RegistryFile {
    version: u32,
    #[serde(default)]
    sessions: Vec<SessionRecord>,
}

/// JSON file registry (`<workspace>/.devloop/sessions.json`).
///
/// Writes go through a temporary file and a rename so a crash never leaves a
/// truncated registry. There is no locking between processes.
#[derive(Debug, Clone)]
pub struct FileSessionRegistry {
    path: PathBuf,
}

impl FileSessionRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SessionRegistry for FileSessionRegistry {
    async fn load(&self) -> Result<Vec<SessionRecord>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let file: RegistryFile = serde_json::from_str(&content).map_err(|e| {
            DevloopError::internal(format!(
                "Corrupt session registry {}: {e}",
                self.path.display()
            ))
        })?;
        if file.version != REGISTRY_VERSION {
            return Err(DevloopError::internal(format!(
                "Unsupported session registry version {} in {}",
                file.version,
                self.path.display()
            )));
        }
        Ok(file.sessions)
    }

    async fn save(&self, sessions: &[SessionRecord]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = RegistryFile {
            version: REGISTRY_VERSION,
            sessions: sessions.to_vec(),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| DevloopError::internal(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemorySessionRegistry {
    sessions: Mutex<Vec<SessionRecord>>,
}

impl InMemorySessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionRegistry for InMemorySessionRegistry {
    async fn load(&self) -> Result<Vec<SessionRecord>> {
        Ok(self.sessions.lock().await.clone())
    }

    async fn save(&self, sessions: &[SessionRecord]) -> Result<()> {
        *self.sessions.lock().await = sessions.to_vec();
        Ok(())
    }
}
