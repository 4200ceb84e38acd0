use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dl_config::{RuntimeConfig, WorkspacePaths};
use dl_error::{DevloopError, Result};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};

use crate::process::{is_process_alive, terminate_child, terminate_pid};
use crate::record::{read_record, remove_record, write_record, RuntimeRecord};
use crate::resolver::RuntimeResolver;

const STOP_GRACE: Duration = Duration::from_secs(5);
const XDG_DIRS: [(&str, &str); 4] = [
    ("XDG_DATA_HOME", "data"),
    ("XDG_CONFIG_HOME", "config"),
    ("XDG_STATE_HOME", "state"),
    ("XDG_CACHE_HOME", "cache"),
];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeStatus {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<RuntimeRecord>,
}

/// Lifecycle of the backing runtime for a workspace. Implementations never
/// retry on failure.
#[async_trait]
pub trait RuntimeSupervisor: Send + Sync {
    async fn start(&self, workspace: &Path) -> Result<RuntimeRecord>;
    /// Returns `false` when there was no record to stop.
    async fn stop(&self, workspace: &Path) -> Result<bool>;
    async fn status(&self, workspace: &Path) -> Result<RuntimeStatus>;

    async fn get_or_start(&self, workspace: &Path) -> Result<RuntimeRecord> {
        match self.status(workspace).await? {
            RuntimeStatus {
                running: true,
                record: Some(record),
            } => Ok(record),
            _ => self.start(workspace).await,
        }
    }
}

pub struct ProcessSupervisor {
    resolver: Arc<dyn RuntimeResolver>,
    config: RuntimeConfig,
    /// Serializes launches so concurrent callers share one runtime.
    launch: Mutex<()>,
}

impl ProcessSupervisor {
    pub fn new(resolver: Arc<dyn RuntimeResolver>, config: RuntimeConfig) -> Self {
        Self {
            resolver,
            config,
            launch: Mutex::new(()),
        }
    }

    fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.config.startup_timeout_secs)
    }

    /// Spawns a runtime and waits for it to report its URL. Callers hold
    /// the launch lock.
    async fn launch_runtime(&self, workspace: &Path) -> Result<RuntimeRecord> {
        let runtime = self.resolver.resolve().await?;
        let port = find_available_port()?;
        let paths = WorkspacePaths::new(workspace);
        let data_dir = paths.runtime_data_dir();

        let mut command = Command::new(&runtime.path);
        command
            .arg("serve")
            .arg("--port")
            .arg(port.to_string())
            .arg("--hostname")
            .arg(&self.config.hostname)
            .current_dir(workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (var, sub) in XDG_DIRS {
            let dir = data_dir.join(sub);
            tokio::fs::create_dir_all(&dir).await?;
            command.env(var, dir);
        }

        let mut child = command.spawn().map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                DevloopError::RuntimeNotFound(runtime.path.display().to_string())
            } else {
                DevloopError::Io(err)
            }
        })?;

        tracing::info!(
            workspace = %workspace.display(),
            port,
            version = runtime.version.as_deref().unwrap_or("unknown"),
            "starting agent runtime"
        );

        let rx = subscribe_process_output(&mut child);
        let url = match tokio::time::timeout(self.startup_timeout(), wait_for_ready(&mut child, rx))
            .await
        {
            Ok(Ok(url)) => url,
            Ok(Err(err)) => {
                terminate_child(&mut child, Duration::ZERO).await;
                return Err(err);
            }
            Err(_) => {
                terminate_child(&mut child, Duration::ZERO).await;
                return Err(DevloopError::RuntimeTimeout {
                    timeout_secs: self.config.startup_timeout_secs,
                });
            }
        };

        let pid = child
            .id()
            .ok_or_else(|| DevloopError::internal("agent runtime exited after reporting ready"))?;
        let record = RuntimeRecord {
            pid,
            port,
            url,
            started_at: Utc::now(),
        };
        write_record(&paths.runtime_record_path(), &record).await?;
        tracing::info!(pid, url = %record.url, "agent runtime ready");

        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => tracing::info!(pid, %status, "agent runtime exited"),
                Err(err) => tracing::warn!(pid, "failed to wait on agent runtime: {}", err),
            }
        });

        Ok(record)
    }
}

#[async_trait]
impl RuntimeSupervisor for ProcessSupervisor {
    async fn start(&self, workspace: &Path) -> Result<RuntimeRecord> {
        let _launch = self.launch.lock().await;
        self.launch_runtime(workspace).await
    }

    async fn get_or_start(&self, workspace: &Path) -> Result<RuntimeRecord> {
        let _launch = self.launch.lock().await;
        match self.status(workspace).await? {
            RuntimeStatus {
                running: true,
                record: Some(record),
            } => Ok(record),
            _ => self.launch_runtime(workspace).await,
        }
    }

    async fn stop(&self, workspace: &Path) -> Result<bool> {
        let path = WorkspacePaths::new(workspace).runtime_record_path();
        let Some(record) = read_record(&path).await? else {
            return Ok(false);
        };
        if terminate_pid(record.pid, STOP_GRACE).await {
            tracing::info!(pid = record.pid, "agent runtime stopped");
        } else {
            tracing::debug!(pid = record.pid, "agent runtime already exited");
        }
        remove_record(&path).await?;
        Ok(true)
    }

    async fn status(&self, workspace: &Path) -> Result<RuntimeStatus> {
        let path = WorkspacePaths::new(workspace).runtime_record_path();
        let Some(record) = read_record(&path).await? else {
            return Ok(RuntimeStatus {
                running: false,
                record: None,
            });
        };
        if is_process_alive(record.pid) {
            return Ok(RuntimeStatus {
                running: true,
                record: Some(record),
            });
        }
        tracing::info!(pid = record.pid, "removing stale agent runtime record");
        remove_record(&path).await?;
        Ok(RuntimeStatus {
            running: false,
            record: None,
        })
    }
}

/// Extracts the URL from a `... listening on <url>` line.
pub fn parse_listening_url(line: &str) -> Option<String> {
    let (_, rest) = line.split_once("listening on ")?;
    let url = rest.split_whitespace().next()?;
    if url.starts_with("http://") || url.starts_with("https://") {
        Some(url.trim_end_matches('/').to_string())
    } else {
        None
    }
}

fn find_available_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

fn subscribe_process_output(child: &mut Child) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();

    if let Some(stdout) = child.stdout.take() {
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!("[agent runtime] {}", line);
                let _ = tx.send(line);
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!("[agent runtime] {}", line);
                let _ = tx.send(line);
            }
        });
    }

    rx
}

async fn wait_for_ready(
    child: &mut Child,
    mut rx: mpsc::UnboundedReceiver<String>,
) -> Result<String> {
    let mut captured = Vec::new();
    while let Some(line) = rx.recv().await {
        if let Some(url) = parse_listening_url(&line) {
            return Ok(url);
        }
        captured.push(line);
    }
    let status = child.wait().await?;
    Err(DevloopError::RuntimeExit {
        status: status.to_string(),
        output: captured.join("\n"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_listening_line() {
        assert_eq!(
            parse_listening_url("opencode server listening on http://127.0.0.1:4096"),
            Some("http://127.0.0.1:4096".to_string())
        );
    }

    #[test]
    fn strips_trailing_slash_and_suffix() {
        assert_eq!(
            parse_listening_url("listening on http://127.0.0.1:4096/ (pid 10)"),
            Some("http://127.0.0.1:4096".to_string())
        );
    }

    #[test]
    fn ignores_non_url_lines() {
        assert_eq!(parse_listening_url("listening on port 4096"), None);
        assert_eq!(parse_listening_url("starting up"), None);
    }

    #[test]
    fn available_port_is_nonzero() {
        assert_ne!(find_available_port().unwrap(), 0);
    }
}
