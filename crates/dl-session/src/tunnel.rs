use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dl_config::{TunnelConfig, TunnelMode};
use dl_error::{DevloopError, Result};
use dl_runtime::find_in_path;
use dl_runtime::process::terminate_child;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex};

const INSTALL_HINT: &str = "Install it with `brew install cloudflared` (macOS) or from \
https://developers.cloudflare.com/cloudflare-one/connections/connect-networks/downloads/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TunnelProvider {
    #[default]
    None,
    Manual,
    CloudflareQuick,
    CloudflareNamed,
}

impl TunnelProvider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Manual => "manual",
            Self::CloudflareQuick => "cloudflare-quick",
            Self::CloudflareNamed => "cloudflare-named",
        }
    }

    /// Whether a supervised process backs this tunnel.
    pub fn is_process(self) -> bool {
        matches!(self, Self::CloudflareQuick | Self::CloudflareNamed)
    }
}

/// Public exposure of a session. `url` is present iff `connected`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TunnelState {
    pub connected: bool,
    pub provider: TunnelProvider,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl TunnelState {
    pub fn disconnected() -> Self {
        Self::default()
    }

    pub fn connected(provider: TunnelProvider, url: impl Into<String>) -> Self {
        Self {
            connected: true,
            provider,
            url: Some(url.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AttachRequest {
    pub session_id: String,
    /// Local dev-server port the tunnel forwards to.
    pub port: u16,
    pub public_url: Option<String>,
    pub config: Option<TunnelConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelInfo {
    pub session_id: String,
    pub port: u16,
    pub provider: TunnelProvider,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

#[async_trait]
pub trait Tunnels: Send + Sync {
    /// Idempotent per session: an existing tunnel is returned as-is.
    async fn attach(&self, request: AttachRequest) -> Result<TunnelState>;
    async fn detach(&self, session_id: &str) -> Result<TunnelState>;
    async fn list(&self) -> Vec<TunnelInfo>;
    async fn status(&self, session_id: &str) -> Result<TunnelInfo>;
    async fn shutdown_all(&self);
}

type StopSignal = oneshot::Sender<oneshot::Sender<()>>;

struct ActiveTunnel {
    generation: u64,
    url: String,
    port: u16,
    provider: TunnelProvider,
    config: Option<TunnelConfig>,
    pid: Option<u32>,
    stop: Option<StopSignal>,
}

impl ActiveTunnel {
    fn state(&self) -> TunnelState {
        TunnelState::connected(self.provider, self.url.clone())
    }

    fn info(&self, session_id: &str) -> TunnelInfo {
        TunnelInfo {
            session_id: session_id.to_string(),
            port: self.port,
            provider: self.provider,
            url: self.url.clone(),
            pid: self.pid,
        }
    }
}

type TunnelTable = Arc<Mutex<HashMap<String, ActiveTunnel>>>;

/// Cloudflare tunnels, one `cloudflared` process per session.
///
/// Each process is owned by a watcher task. The watcher evicts the table
/// entry if the process dies on its own, and performs the TERM/KILL
/// escalation when the tunnel is detached.
pub struct TunnelManager {
    defaults: TunnelConfig,
    active: TunnelTable,
    next_generation: AtomicU64,
}

impl TunnelManager {
    pub fn new(defaults: TunnelConfig) -> Self {
        Self {
            defaults,
            active: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
        }
    }

    async fn spawn_tunnel(
        &self,
        request: &AttachRequest,
        config: &TunnelConfig,
    ) -> Result<(TunnelProvider, String, Child)> {
        let binary = locate_binary(&config.binary).ok_or_else(|| {
            DevloopError::TunnelBinaryMissing(format!(
                "{} is not installed. {INSTALL_HINT}",
                config.binary
            ))
        })?;
        let local_url = format!("http://127.0.0.1:{}", request.port);

        match config.mode {
            TunnelMode::Quick => {
                let mut child = Command::new(&binary)
                    .arg("tunnel")
                    .arg("--no-autoupdate")
                    .arg("--url")
                    .arg(&local_url)
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .spawn()
                    .map_err(|e| DevloopError::TunnelStartFailed(e.to_string()))?;

                let rx = subscribe_process_output(&mut child, request.session_id.clone());
                let timeout = Duration::from_secs(config.startup_timeout_secs);
                match wait_for_public_url(rx, timeout).await {
                    Ok(url) => Ok((TunnelProvider::CloudflareQuick, url, child)),
                    Err(err) => {
                        terminate_child(&mut child, Duration::ZERO).await;
                        Err(err)
                    }
                }
            }
            TunnelMode::Named => {
                let (Some(name), Some(domain)) = (config.name.as_deref(), config.domain.as_deref())
                else {
                    return Err(DevloopError::invalid_input(
                        "Named tunnels require both a tunnel name and a domain",
                    ));
                };
                let mut child = Command::new(&binary)
                    .arg("tunnel")
                    .arg("--no-autoupdate")
                    .arg("run")
                    .arg("--url")
                    .arg(&local_url)
                    .arg(name)
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .spawn()
                    .map_err(|e| DevloopError::TunnelStartFailed(e.to_string()))?;

                // Keep draining output so the process never blocks on a full pipe.
                drop(subscribe_process_output(&mut child, request.session_id.clone()));
                let url = format!("https://{}", domain.trim_end_matches('/'));
                Ok((TunnelProvider::CloudflareNamed, url, child))
            }
        }
    }
}

#[async_trait]
impl Tunnels for TunnelManager {
    async fn attach(&self, request: AttachRequest) -> Result<TunnelState> {
        if let Some(existing) = self.active.lock().await.get(&request.session_id) {
            tracing::debug!(session_id = %request.session_id, "tunnel already attached");
            return Ok(existing.state());
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        if let Some(url) = request.public_url.clone() {
            let mut active = self.active.lock().await;
            let entry = active
                .entry(request.session_id.clone())
                .or_insert(ActiveTunnel {
                    generation,
                    url,
                    port: request.port,
                    provider: TunnelProvider::Manual,
                    config: None,
                    pid: None,
                    stop: None,
                });
            return Ok(entry.state());
        }

        let config = request.config.clone().unwrap_or_else(|| self.defaults.clone());
        let (provider, url, mut child) = self.spawn_tunnel(&request, &config).await?;
        let pid = child.id();

        let mut active = self.active.lock().await;
        if let Some(existing) = active.get(&request.session_id) {
            // Lost a race with a concurrent attach for the same session.
            let state = existing.state();
            drop(active);
            terminate_child(&mut child, Duration::ZERO).await;
            return Ok(state);
        }

        let grace = Duration::from_secs(config.shutdown_grace_secs);
        let stop = spawn_watcher(
            Arc::clone(&self.active),
            request.session_id.clone(),
            generation,
            child,
            grace,
        );
        tracing::info!(
            session_id = %request.session_id,
            provider = provider.as_str(),
            url = %url,
            "tunnel attached"
        );
        let entry = ActiveTunnel {
            generation,
            url,
            port: request.port,
            provider,
            config: Some(config),
            pid,
            stop: Some(stop),
        };
        let state = entry.state();
        active.insert(request.session_id, entry);
        Ok(state)
    }

    async fn detach(&self, session_id: &str) -> Result<TunnelState> {
        let removed = self.active.lock().await.remove(session_id);
        let Some(tunnel) = removed else {
            return Ok(TunnelState::disconnected());
        };
        if let Some(stop) = tunnel.stop {
            let (ack_tx, ack_rx) = oneshot::channel();
            if stop.send(ack_tx).is_ok() {
                let _ = ack_rx.await;
            }
        }
        tracing::info!(
            session_id,
            provider = tunnel.provider.as_str(),
            mode = ?tunnel.config.as_ref().map(|c| c.mode),
            "tunnel detached"
        );
        Ok(TunnelState::disconnected())
    }

    async fn list(&self) -> Vec<TunnelInfo> {
        let active = self.active.lock().await;
        let mut tunnels: Vec<TunnelInfo> = active.iter().map(|(id, t)| t.info(id)).collect();
        tunnels.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        tunnels
    }

    async fn status(&self, session_id: &str) -> Result<TunnelInfo> {
        self.active
            .lock()
            .await
            .get(session_id)
            .map(|t| t.info(session_id))
            .ok_or_else(|| DevloopError::TunnelNotFound(session_id.to_string()))
    }

    async fn shutdown_all(&self) {
        let ids: Vec<String> = self.active.lock().await.keys().cloned().collect();
        for id in ids {
            let _ = self.detach(&id).await;
        }
    }
}

enum WatchOutcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    StopRequested(Option<oneshot::Sender<()>>),
}

fn spawn_watcher(
    active: TunnelTable,
    session_id: String,
    generation: u64,
    mut child: Child,
    grace: Duration,
) -> StopSignal {
    let (stop_tx, stop_rx) = oneshot::channel::<oneshot::Sender<()>>();
    tokio::spawn(async move {
        let outcome = tokio::select! {
            status = child.wait() => WatchOutcome::Exited(status),
            ack = stop_rx => WatchOutcome::StopRequested(ack.ok()),
        };
        match outcome {
            WatchOutcome::Exited(status) => {
                tracing::warn!(session_id = %session_id, ?status, "tunnel process exited unexpectedly");
                let mut active = active.lock().await;
                if active
                    .get(&session_id)
                    .is_some_and(|t| t.generation == generation)
                {
                    active.remove(&session_id);
                }
            }
            WatchOutcome::StopRequested(ack) => {
                terminate_child(&mut child, grace).await;
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
        }
    });
    stop_tx
}

fn locate_binary(binary: &str) -> Option<PathBuf> {
    if binary.contains(std::path::MAIN_SEPARATOR) {
        let path = PathBuf::from(binary);
        return path.is_file().then_some(path);
    }
    find_in_path(binary)
}

fn subscribe_process_output(child: &mut Child, session_id: String) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();

    if let Some(stdout) = child.stdout.take() {
        let tx = tx.clone();
        let session_id = session_id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(session_id = %session_id, "[tunnel] {}", line);
                let _ = tx.send(line);
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(session_id = %session_id, "[tunnel] {}", line);
                let _ = tx.send(line);
            }
        });
    }

    rx
}

async fn wait_for_public_url(
    mut rx: mpsc::UnboundedReceiver<String>,
    timeout: Duration,
) -> Result<String> {
    let scan = async {
        while let Some(line) = rx.recv().await {
            for url in extract_https_urls(&line) {
                if is_cloudflared_public_url(&url) {
                    return Ok(url);
                }
            }
        }
        Err(DevloopError::TunnelStartFailed(
            "tunnel process exited before publishing a URL".to_string(),
        ))
    };

    tokio::time::timeout(timeout, scan).await.map_err(|_| {
        DevloopError::TunnelStartFailed(format!(
            "timed out after {}s waiting for a public URL",
            timeout.as_secs()
        ))
    })?
}

pub(crate) fn extract_https_urls(line: &str) -> Vec<String> {
    let mut urls = Vec::new();
    let mut rest = line;

    while let Some(start) = rest.find("https://") {
        let candidate = &rest[start..];
        let end = candidate
            .find(|c: char| c.is_whitespace() || matches!(c, '"' | '\'' | '<' | '>' | '|'))
            .unwrap_or(candidate.len());
        let cleaned = candidate[..end].trim_end_matches([',', ';', ')', ']', '}', '/']);

        if cleaned.len() > "https://".len() {
            urls.push(cleaned.to_string());
        }

        rest = &candidate[end..];
    }

    urls
}

pub(crate) fn is_cloudflared_public_url(candidate: &str) -> bool {
    let Ok(parsed) = reqwest::Url::parse(candidate) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    let host = host.to_ascii_lowercase();
    // The API hostname shows up in cloudflared's own log lines.
    host.ends_with(".trycloudflare.com") && host != "api.trycloudflare.com"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_value(TunnelProvider::CloudflareQuick).unwrap(),
            "cloudflare-quick"
        );
        assert_eq!(TunnelProvider::CloudflareNamed.as_str(), "cloudflare-named");
    }

    #[test]
    fn disconnected_state_omits_url() {
        let json = serde_json::to_value(TunnelState::disconnected()).unwrap();
        assert_eq!(json, serde_json::json!({"connected": false, "provider": "none"}));
    }

    #[test]
    fn extract_urls_from_cloudflared_banner() {
        let urls = extract_https_urls(
            "2024-05-01T10:00:00Z INF |  https://quiet-river-1234.trycloudflare.com                          |",
        );
        assert_eq!(urls, vec!["https://quiet-river-1234.trycloudflare.com"]);
    }

    #[test]
    fn extract_urls_trailing_punctuation() {
        let urls = extract_https_urls("see https://example.com, or https://other.com;");
        assert_eq!(urls, vec!["https://example.com", "https://other.com"]);
    }

    #[test]
    fn extract_urls_none() {
        assert!(extract_https_urls("no urls here http://only-http.com").is_empty());
    }

    #[test]
    fn cloudflared_url_matching() {
        assert!(is_cloudflared_public_url("https://foo-bar.trycloudflare.com"));
        assert!(!is_cloudflared_public_url("https://api.trycloudflare.com"));
        assert!(!is_cloudflared_public_url("https://example.com"));
        assert!(!is_cloudflared_public_url("not a url"));
    }

    #[tokio::test]
    async fn manual_url_is_recorded_without_spawning() {
        let manager = TunnelManager::new(TunnelConfig {
            binary: "/nonexistent/cloudflared".to_string(),
            ..TunnelConfig::default()
        });
        let state = manager
            .attach(AttachRequest {
                session_id: "s1".to_string(),
                port: 8081,
                public_url: Some("https://dev.example.com".to_string()),
                config: None,
            })
            .await
            .unwrap();
        assert_eq!(
            state,
            TunnelState::connected(TunnelProvider::Manual, "https://dev.example.com")
        );

        let info = manager.status("s1").await.unwrap();
        assert_eq!(info.pid, None);
        assert_eq!(manager.list().await.len(), 1);

        assert_eq!(manager.detach("s1").await.unwrap(), TunnelState::disconnected());
        assert_eq!(manager.status("s1").await.unwrap_err().code(), "TUNNEL_NOT_FOUND");
    }

    #[tokio::test]
    async fn detach_without_tunnel_is_disconnected() {
        let manager = TunnelManager::new(TunnelConfig::default());
        let state = manager.detach("missing").await.unwrap();
        assert!(!state.connected);
        assert_eq!(state.provider, TunnelProvider::None);
        assert!(state.url.is_none());
    }

    #[tokio::test]
    async fn missing_binary_is_reported() {
        let manager = TunnelManager::new(TunnelConfig {
            binary: "devloop-no-such-cloudflared".to_string(),
            ..TunnelConfig::default()
        });
        let err = manager
            .attach(AttachRequest {
                session_id: "s1".to_string(),
                port: 8081,
                public_url: None,
                config: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TUNNEL_BINARY_MISSING");
        assert!(err.to_string().contains("Install"));
    }
}
