use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use dl_error::{DevloopError, Result};

const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRuntime {
    pub path: PathBuf,
    pub version: Option<String>,
}

/// Locates the backing runtime executable.
#[async_trait]
pub trait RuntimeResolver: Send + Sync {
    async fn resolve(&self) -> Result<ResolvedRuntime>;
}

/// Resolves a configured binary name against `PATH`, or uses it directly when
/// it already names a path.
#[derive(Debug, Clone)]
pub struct PathResolver {
    binary: String,
}

impl PathResolver {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl RuntimeResolver for PathResolver {
    async fn resolve(&self) -> Result<ResolvedRuntime> {
        let path = locate(&self.binary)
            .ok_or_else(|| DevloopError::RuntimeNotFound(self.binary.clone()))?;
        let version = probe_version(&path).await;
        tracing::debug!(path = %path.display(), version = ?version, "resolved agent runtime");
        Ok(ResolvedRuntime { path, version })
    }
}

fn locate(binary: &str) -> Option<PathBuf> {
    if binary.contains(std::path::MAIN_SEPARATOR) {
        let path = PathBuf::from(binary);
        return path.is_file().then_some(path);
    }
    find_in_path(binary)
}

pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

async fn probe_version(path: &Path) -> Option<String> {
    let output = tokio::time::timeout(
        VERSION_PROBE_TIMEOUT,
        tokio::process::Command::new(path)
            .arg("--version")
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output(),
    )
    .await
    .ok()?
    .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
}
