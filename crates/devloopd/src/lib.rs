//! Wiring shared by the `devloopd` binary: building the orchestrator and the
//! agent bridge from config, signal handling, and CLI output formatting.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dl_agent::{AgentBridge, ConfigSpecialists, HttpRuntimeClient};
use dl_api::read_server_info;
use dl_config::{DaemonConfig, TunnelConfig, TunnelMode, WorkspacePaths};
use dl_runtime::process::is_process_alive;
use dl_runtime::{PathResolver, ProcessSupervisor};
use dl_session::{
    FileSessionRegistry, GitWorktreeManager, SessionOrchestrator, SessionRecord, TunnelManager,
    TunnelRequest, TunnelState, WorktreeInfo,
};

/// Build-time daemon version string.
///
/// When `DEVLOOP_VERSION` is provided in the build environment (for example
/// by CI release workflows), that value is used. Otherwise we fall back to the
/// crate package version.
pub const DAEMON_VERSION: &str = match option_env!("DEVLOOP_VERSION") {
    Some(version) => version,
    None => env!("CARGO_PKG_VERSION"),
};

pub const DEFAULT_LOG_FILTER: &str =
    "devloopd=info,dl_api=info,dl_agent=info,dl_session=info,dl_runtime=info,tower_http=info";

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Resolves once on Ctrl+C or, on unix, SIGTERM.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", err);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// The workspace a command operates on: the explicit path, or the current
/// directory.
pub fn resolve_workspace(explicit: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    let path = match explicit {
        Some(path) => path,
        None => std::env::current_dir()?,
    };
    if !path.is_dir() {
        anyhow::bail!("Workspace is not a directory: {}", path.display());
    }
    Ok(path.canonicalize()?)
}

pub fn build_orchestrator(config: &DaemonConfig, workspace: &Path) -> SessionOrchestrator {
    let paths = WorkspacePaths::new(workspace);
    SessionOrchestrator::new(
        Arc::new(FileSessionRegistry::new(paths.sessions_path())),
        Arc::new(GitWorktreeManager::new()),
        Arc::new(TunnelManager::new(config.tunnel.clone())),
        config.ports.clone(),
    )
}

pub fn build_supervisor(config: &DaemonConfig) -> Arc<ProcessSupervisor> {
    Arc::new(ProcessSupervisor::new(
        Arc::new(PathResolver::new(config.runtime.binary.clone())),
        config.runtime.clone(),
    ))
}

pub fn build_bridge(
    config: &DaemonConfig,
    workspace: &Path,
    supervisor: Arc<ProcessSupervisor>,
) -> AgentBridge {
    AgentBridge::new(
        workspace,
        Arc::new(HttpRuntimeClient::new()),
        supervisor,
        Arc::new(ConfigSpecialists::new(config.specialists.clone())),
    )
}

/// Tunnel options from the command line. `--named` switches to a named
/// tunnel on top of the configured defaults.
pub fn tunnel_request(
    defaults: &TunnelConfig,
    public_url: Option<String>,
    named: Option<String>,
    domain: Option<String>,
) -> TunnelRequest {
    let config = named.map(|name| TunnelConfig {
        mode: TunnelMode::Named,
        name: Some(name),
        domain: domain.or_else(|| defaults.domain.clone()),
        ..defaults.clone()
    });
    TunnelRequest { public_url, config }
}

/// Fails when another server already serves this workspace.
pub async fn ensure_no_running_server(workspace: &Path) -> anyhow::Result<()> {
    if let Some(info) = read_server_info(workspace).await? {
        if info.pid != std::process::id() && is_process_alive(info.pid) {
            anyhow::bail!(
                "Agent server already running for this workspace (PID {}, {})",
                info.pid,
                info.url
            );
        }
        tracing::warn!(pid = info.pid, "Ignoring stale server info");
    }
    Ok(())
}

pub fn format_tunnel(tunnel: &TunnelState) -> String {
    match (&tunnel.url, tunnel.connected) {
        (Some(url), true) => format!("{} {}", tunnel.provider.as_str(), url),
        _ => "none".to_string(),
    }
}

pub fn format_session(session: &SessionRecord) -> String {
    let state = if session.is_live() { "running" } else { "stopped" };
    format!(
        "{}  {:<7}  port {:<5}  {}  {}  tunnel: {}",
        session.id,
        state,
        session.port,
        session.label,
        session.project_root.display(),
        format_tunnel(&session.tunnel)
    )
}

pub fn format_worktree(worktree: &WorktreeInfo) -> String {
    let branch = if worktree.bare {
        "(bare)".to_string()
    } else if worktree.detached {
        "(detached)".to_string()
    } else {
        worktree
            .branch
            .as_deref()
            .map(|b| b.trim_start_matches("refs/heads/").to_string())
            .unwrap_or_default()
    };
    let head: String = worktree.head.chars().take(8).collect();
    format!("{}  {}  {}", worktree.path.display(), head, branch)
}
