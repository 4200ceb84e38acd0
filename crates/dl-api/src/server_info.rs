use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use dl_config::WorkspacePaths;
use dl_error::{DevloopError, Result};
use serde::{Deserialize, Serialize};

/// Discovery record for a running agent server (`.devloop/server.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub pid: u32,
    pub port: u16,
    pub url: String,
    pub workspace: PathBuf,
    pub started_at: DateTime<Utc>,
}

pub async fn write_server_info(workspace: &Path, info: &ServerInfo) -> Result<()> {
    let paths = WorkspacePaths::new(workspace);
    tokio::fs::create_dir_all(paths.state_dir()).await?;
    let json =
        serde_json::to_string_pretty(info).map_err(|e| DevloopError::internal(e.to_string()))?;
    tokio::fs::write(paths.server_info_path(), json).await?;
    Ok(())
}

pub async fn read_server_info(workspace: &Path) -> Result<Option<ServerInfo>> {
    let path = WorkspacePaths::new(workspace).server_info_path();
    match tokio::fs::read_to_string(&path).await {
        Ok(content) => Ok(serde_json::from_str(&content).ok()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

pub async fn remove_server_info(workspace: &Path) -> Result<()> {
    let path = WorkspacePaths::new(workspace).server_info_path();
    match tokio::fs::remove_file(&path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}
