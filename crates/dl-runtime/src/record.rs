use std::path::Path;

use chrono::{DateTime, Utc};
use dl_error::Result;
use serde::{Deserialize, Serialize};

/// Persisted description of a running backing runtime
/// (`<workspace>/.devloop/runtime.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeRecord {
    pub pid: u32,
    pub port: u16,
    pub url: String,
    pub started_at: DateTime<Utc>,
}

/// Missing and unreadable records both read as `None`; a corrupt record is
/// logged and treated as absent.
pub async fn read_record(path: &Path) -> Result<Option<RuntimeRecord>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    match serde_json::from_str(&content) {
        Ok(record) => Ok(Some(record)),
        Err(err) => {
            tracing::warn!(path = %path.display(), "ignoring corrupt runtime record: {}", err);
            Ok(None)
        }
    }
}

pub async fn write_record(path: &Path, record: &RuntimeRecord) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_string_pretty(record)
        .map_err(|e| dl_error::DevloopError::internal(e.to_string()))?;
    tokio::fs::write(path, json).await?;
    Ok(())
}

pub async fn remove_record(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RuntimeRecord {
        RuntimeRecord {
            pid: 4242,
            port: 40123,
            url: "http://127.0.0.1:40123".to_string(),
            started_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".devloop").join("runtime.json");
        let record = sample();
        write_record(&path, &record).await.unwrap();
        assert_eq!(read_record(&path).await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn uses_camel_case_keys() {
        let json = serde_json::to_value(sample()).unwrap();
        assert!(json.get("startedAt").is_some());
        assert!(json.get("started_at").is_none());
    }

    #[tokio::test]
    async fn missing_record_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_record(&dir.path().join("runtime.json"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn corrupt_record_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(read_record(&path).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_missing_record_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        remove_record(&dir.path().join("runtime.json")).await.unwrap();
    }
}
