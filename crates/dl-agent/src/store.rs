use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use dl_config::WorkspacePaths;
use dl_error::{DevloopError, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Immutable description of an agent (`agents/<id>.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMetadata {
    pub agent_id: String,
    /// Session id on the backing runtime.
    pub session_id: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specialist_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Append-only transcript (`conversations/<id>.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationLog {
    pub id: String,
    pub metadata: AgentMetadata,
    #[serde(default)]
    pub messages: Vec<ConversationMessage>,
}

/// File-backed agent metadata and conversation logs for one workspace.
#[derive(Debug, Clone)]
pub struct AgentStore {
    paths: WorkspacePaths,
}

impl AgentStore {
    pub fn new(paths: WorkspacePaths) -> Self {
        Self { paths }
    }

    pub async fn save_metadata(&self, metadata: &AgentMetadata) -> Result<()> {
        let path = self
            .metadata_path(&metadata.agent_id)
            .ok_or_else(|| DevloopError::invalid_input("agent id must be a UUID"))?;
        write_json(&path, metadata).await
    }

    pub async fn load_metadata(&self, agent_id: &str) -> Result<Option<AgentMetadata>> {
        let Some(path) = self.metadata_path(agent_id) else {
            return Ok(None);
        };
        read_json(&path).await
    }

    pub async fn require_metadata(&self, agent_id: &str) -> Result<AgentMetadata> {
        self.load_metadata(agent_id)
            .await?
            .ok_or_else(|| DevloopError::AgentNotFound(agent_id.to_string()))
    }

    /// All agents, oldest first. Unreadable files are skipped.
    pub async fn list_metadata(&self) -> Result<Vec<AgentMetadata>> {
        let dir = self.paths.agents_dir();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut agents = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_json::<AgentMetadata>(&path).await {
                Ok(Some(metadata)) => agents.push(metadata),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(path = %path.display(), "skipping unreadable agent file: {}", err)
                }
            }
        }
        agents.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(agents)
    }

    /// Removes metadata and transcript. Returns `false` if the agent did not
    /// exist.
    pub async fn delete(&self, agent_id: &str) -> Result<bool> {
        let (Some(metadata), Some(conversation)) = (
            self.metadata_path(agent_id),
            self.conversation_path(agent_id),
        ) else {
            return Ok(false);
        };
        let existed = remove_if_exists(&metadata).await?;
        remove_if_exists(&conversation).await?;
        Ok(existed)
    }

    pub async fn load_conversation(&self, agent_id: &str) -> Result<ConversationLog> {
        let metadata = self.require_metadata(agent_id).await?;
        let path = self
            .conversation_path(agent_id)
            .ok_or_else(|| DevloopError::AgentNotFound(agent_id.to_string()))?;
        Ok(read_json(&path).await?.unwrap_or(ConversationLog {
            id: agent_id.to_string(),
            metadata,
            messages: Vec::new(),
        }))
    }

    /// Appends one completed turn: the user message and the assistant reply.
    pub async fn append_turn(
        &self,
        metadata: &AgentMetadata,
        user_text: &str,
        assistant_text: &str,
    ) -> Result<ConversationLog> {
        let path = self
            .conversation_path(&metadata.agent_id)
            .ok_or_else(|| DevloopError::AgentNotFound(metadata.agent_id.clone()))?;
        let mut log = read_json(&path).await?.unwrap_or_else(|| ConversationLog {
            id: metadata.agent_id.clone(),
            metadata: metadata.clone(),
            messages: Vec::new(),
        });
        let now = Utc::now();
        log.messages.push(ConversationMessage {
            role: MessageRole::User,
            content: user_text.to_string(),
            created_at: now,
        });
        log.messages.push(ConversationMessage {
            role: MessageRole::Assistant,
            content: assistant_text.to_string(),
            created_at: now,
        });
        write_json(&path, &log).await?;
        Ok(log)
    }

    fn metadata_path(&self, agent_id: &str) -> Option<PathBuf> {
        valid_id(agent_id).then(|| self.paths.agents_dir().join(format!("{agent_id}.json")))
    }

    fn conversation_path(&self, agent_id: &str) -> Option<PathBuf> {
        valid_id(agent_id).then(|| {
            self.paths
                .conversations_dir()
                .join(format!("{agent_id}.json"))
        })
    }
}

// Agent ids become file names.
fn valid_id(agent_id: &str) -> bool {
    Uuid::parse_str(agent_id).is_ok()
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| DevloopError::internal(format!("Corrupt file {}: {e}", path.display())))
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json =
        serde_json::to_string_pretty(value).map_err(|e| DevloopError::internal(e.to_string()))?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}
