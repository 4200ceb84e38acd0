use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use devloopd::{
    build_bridge, build_orchestrator, build_supervisor, ensure_no_running_server, format_session,
    format_tunnel, format_worktree, resolve_workspace, shutdown_signal, tunnel_request,
};
use dl_api::rest::health::init_start_time;
use dl_api::{build_router, remove_server_info, write_server_info, AppState, ServerInfo};
use dl_config::DaemonConfig;
use dl_error::DevloopError;
use dl_runtime::RuntimeSupervisor;
use dl_session::{
    CreateSessionRequest, GitWorktreeManager, SessionOrchestrator, TunnelState, Tunnels,
    WorktreeRequest, Worktrees,
};

#[derive(Parser)]
#[command(
    name = "devloopd",
    version = devloopd::DAEMON_VERSION,
    about = "Development sessions and coding agents for a workspace"
)]
struct Cli {
    /// Workspace directory (defaults to the current directory)
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent server in the foreground
    Serve {
        /// Port to bind to (overrides config)
        #[arg(long)]
        port: Option<u16>,
        /// Address to bind to (overrides config)
        #[arg(long)]
        host: Option<IpAddr>,
    },
    /// Manage development sessions
    Session {
        #[command(subcommand)]
        command: SessionCommands,
    },
    /// Manage public tunnels for sessions
    Tunnel {
        #[command(subcommand)]
        command: TunnelCommands,
    },
    /// Manage session worktrees
    Worktree {
        #[command(subcommand)]
        command: WorktreeCommands,
    },
    /// Manage the backing agent runtime
    Runtime {
        #[command(subcommand)]
        command: RuntimeCommands,
    },
    /// Print version
    Version,
}

#[derive(Args)]
struct TunnelArgs {
    /// Record an externally managed public URL instead of spawning a tunnel
    #[arg(long)]
    public_url: Option<String>,
    /// Run the named tunnel NAME instead of a quick tunnel
    #[arg(long, value_name = "NAME")]
    named: Option<String>,
    /// Public hostname routed to the named tunnel
    #[arg(long, requires = "named")]
    domain: Option<String>,
}

#[derive(Subcommand)]
enum SessionCommands {
    /// Create a session; with a tunnel, stays in the foreground until Ctrl+C
    Create {
        #[arg(long)]
        label: String,
        /// Project root (defaults to the workspace)
        #[arg(long)]
        root: Option<PathBuf>,
        /// Request a specific port
        #[arg(long)]
        port: Option<u16>,
        /// Attach a tunnel using the configured defaults
        #[arg(long)]
        tunnel: bool,
        #[command(flatten)]
        tunnel_args: TunnelArgs,
    },
    /// Stop a session, detaching its tunnel and releasing its port
    Stop { id: String },
    /// List sessions
    List,
    /// Show a session's endpoints
    Show { id: String },
}

#[derive(Subcommand)]
enum TunnelCommands {
    /// Attach a tunnel; process tunnels stay in the foreground until Ctrl+C
    Attach {
        session: String,
        #[command(flatten)]
        args: TunnelArgs,
    },
    /// Mark a session's tunnel as detached
    Detach { session: String },
}

#[derive(Subcommand)]
enum WorktreeCommands {
    /// Provision an isolated worktree for a session
    Provision {
        session: String,
        /// Worktree location (defaults beside the repository)
        #[arg(long)]
        path: Option<PathBuf>,
        /// Ref the new branch starts from
        #[arg(long)]
        base: Option<String>,
    },
    /// Remove a session's worktree
    Cleanup {
        session: String,
        /// Discard uncommitted changes
        #[arg(long)]
        force: bool,
    },
    /// List the worktrees of a repository
    List {
        /// Repository root (defaults to the workspace)
        #[arg(long)]
        root: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum RuntimeCommands {
    /// Start the runtime and keep it running until Ctrl+C
    Start,
    /// Stop the recorded runtime process
    Stop,
    /// Show runtime status
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    devloopd::init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<DevloopError>() {
                Some(devloop) => eprintln!("{}", devloop.cli_line()),
                None => eprintln!("ERROR: {err:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    if let Commands::Version = cli.command {
        println!("devloopd {}", devloopd::DAEMON_VERSION);
        return Ok(());
    }

    let config = DaemonConfig::load()?;
    let workspace = resolve_workspace(cli.workspace)?;

    match cli.command {
        Commands::Serve { port, host } => serve(config, workspace, port, host).await,
        Commands::Session { command } => session_command(&config, &workspace, command).await,
        Commands::Tunnel { command } => tunnel_command(&config, &workspace, command).await,
        Commands::Worktree { command } => worktree_command(&config, &workspace, command).await,
        Commands::Runtime { command } => runtime_command(&config, &workspace, command).await,
        Commands::Version => Ok(()),
    }
}

async fn serve(
    mut config: DaemonConfig,
    workspace: PathBuf,
    port: Option<u16>,
    host: Option<IpAddr>,
) -> anyhow::Result<()> {
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(host) = host {
        config.host = host;
    }
    ensure_no_running_server(&workspace).await?;

    let supervisor = build_supervisor(&config);
    let runtime_was_running = supervisor.status(&workspace).await?.running;
    let bridge = Arc::new(build_bridge(&config, &workspace, supervisor.clone()));

    init_start_time();
    let app = build_router(AppState::new(config.clone(), bridge.clone()));

    let listener = tokio::net::TcpListener::bind(SocketAddr::new(config.host, config.port)).await?;
    let local = listener.local_addr()?;
    let url = format!("http://{local}");
    write_server_info(
        &workspace,
        &ServerInfo {
            pid: std::process::id(),
            port: local.port(),
            url: url.clone(),
            workspace: workspace.clone(),
            started_at: Utc::now(),
        },
    )
    .await?;

    tracing::info!(workspace = %workspace.display(), "Listening on {}", local);
    println!("devloop agent server running...");
    println!();
    println!("  API:       {url}");
    println!("  Workspace: {}", workspace.display());
    println!();

    let shutdown_bridge = bridge.clone();
    let shutdown = async move {
        shutdown_signal().await;
        tracing::info!("Shutting down...");
        shutdown_bridge.shutdown().await;
    };
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    // A runtime that predates this server belongs to someone else.
    if !runtime_was_running {
        if let Err(err) = supervisor.stop(&workspace).await {
            tracing::warn!("Failed to stop agent runtime: {}", err);
        }
    }
    remove_server_info(&workspace).await?;
    Ok(())
}

async fn session_command(
    config: &DaemonConfig,
    workspace: &Path,
    command: SessionCommands,
) -> anyhow::Result<()> {
    let orchestrator = build_orchestrator(config, workspace);

    match command {
        SessionCommands::Create {
            label,
            root,
            port,
            tunnel,
            tunnel_args,
        } => {
            let project_root = match root {
                Some(root) => resolve_workspace(Some(root))?,
                None => workspace.to_path_buf(),
            };
            let wants_tunnel =
                tunnel || tunnel_args.public_url.is_some() || tunnel_args.named.is_some();
            let request = CreateSessionRequest {
                label,
                project_root,
                port,
                tunnel: wants_tunnel.then(|| {
                    tunnel_request(
                        &config.tunnel,
                        tunnel_args.public_url,
                        tunnel_args.named,
                        tunnel_args.domain,
                    )
                }),
            };
            let session = orchestrator.create_session(request).await?;
            println!("{}", format_session(&session));
            println!("  local: http://localhost:{}", session.port);
            hold_tunnel(&orchestrator, &session.id, &session.tunnel).await
        }
        SessionCommands::Stop { id } => {
            let session = orchestrator.stop_session(&id).await?;
            println!("{}", format_session(&session));
            Ok(())
        }
        SessionCommands::List => {
            let sessions = orchestrator.list_sessions().await?;
            if sessions.is_empty() {
                println!("No sessions");
            }
            for session in &sessions {
                println!("{}", format_session(session));
            }
            Ok(())
        }
        SessionCommands::Show { id } => {
            let endpoint = orchestrator.resolve_endpoint(&id).await?;
            println!("Session: {}", endpoint.session_id);
            println!("  local:  {}", endpoint.local_url);
            println!("  tunnel: {}", format_tunnel(&endpoint.tunnel));
            Ok(())
        }
    }
}

async fn tunnel_command(
    config: &DaemonConfig,
    workspace: &Path,
    command: TunnelCommands,
) -> anyhow::Result<()> {
    let orchestrator = build_orchestrator(config, workspace);

    match command {
        TunnelCommands::Attach { session, args } => {
            let request = tunnel_request(&config.tunnel, args.public_url, args.named, args.domain);
            let state = orchestrator.attach_tunnel(&session, request).await?;
            println!("Tunnel: {}", format_tunnel(&state));
            hold_tunnel(&orchestrator, &session, &state).await
        }
        TunnelCommands::Detach { session } => {
            orchestrator.detach_tunnel(&session).await?;
            println!("Tunnel detached.");
            Ok(())
        }
    }
}

/// Tunnel processes live in this process's tunnel table, so the command
/// stays up until interrupted or until the tunnel process exits.
async fn hold_tunnel(
    orchestrator: &SessionOrchestrator,
    session_id: &str,
    tunnel: &TunnelState,
) -> anyhow::Result<()> {
    if !tunnel.connected || !tunnel.provider.is_process() {
        return Ok(());
    }
    println!();
    println!("Tunnel is up. Press Ctrl+C to detach.");

    let signal = shutdown_signal();
    tokio::pin!(signal);
    let mut ticker = tokio::time::interval(Duration::from_secs(2));
    loop {
        tokio::select! {
            _ = &mut signal => break,
            _ = ticker.tick() => {
                if orchestrator.tunnels().status(session_id).await.is_err() {
                    eprintln!("Tunnel process exited.");
                    break;
                }
            }
        }
    }

    orchestrator.detach_tunnel(session_id).await?;
    println!("Tunnel detached.");
    Ok(())
}

async fn worktree_command(
    config: &DaemonConfig,
    workspace: &Path,
    command: WorktreeCommands,
) -> anyhow::Result<()> {
    match command {
        WorktreeCommands::Provision {
            session,
            path,
            base,
        } => {
            let orchestrator = build_orchestrator(config, workspace);
            let info = orchestrator
                .provision_worktree(
                    &session,
                    WorktreeRequest {
                        requested_path: path,
                        base_ref: base,
                    },
                )
                .await?;
            println!("{}", format_worktree(&info));
            Ok(())
        }
        WorktreeCommands::Cleanup { session, force } => {
            let orchestrator = build_orchestrator(config, workspace);
            let session = orchestrator.cleanup_worktree(&session, force).await?;
            println!("{}", format_session(&session));
            Ok(())
        }
        WorktreeCommands::List { root } => {
            let root = match root {
                Some(root) => resolve_workspace(Some(root))?,
                None => workspace.to_path_buf(),
            };
            for worktree in GitWorktreeManager::new().list(&root).await? {
                println!("{}", format_worktree(&worktree));
            }
            Ok(())
        }
    }
}

async fn runtime_command(
    config: &DaemonConfig,
    workspace: &Path,
    command: RuntimeCommands,
) -> anyhow::Result<()> {
    let supervisor = build_supervisor(config);

    match command {
        RuntimeCommands::Start => {
            let status = supervisor.status(workspace).await?;
            if let (true, Some(record)) = (status.running, status.record) {
                println!("Agent runtime already running (PID {}) at {}", record.pid, record.url);
                return Ok(());
            }
            let record = supervisor.start(workspace).await?;
            println!("Agent runtime running (PID {}) at {}", record.pid, record.url);
            println!("Press Ctrl+C to stop.");
            shutdown_signal().await;
            supervisor.stop(workspace).await?;
            println!("Agent runtime stopped.");
            Ok(())
        }
        RuntimeCommands::Stop => {
            if supervisor.stop(workspace).await? {
                println!("Agent runtime stopped.");
            } else {
                println!("Agent runtime is not running.");
            }
            Ok(())
        }
        RuntimeCommands::Status => {
            let status = supervisor.status(workspace).await?;
            match status.record {
                Some(record) if status.running => {
                    println!("Agent runtime is running (PID {})", record.pid);
                    println!("  URL:     {}", record.url);
                    println!("  Started: {}", record.started_at.to_rfc3339());
                }
                _ => println!("Agent runtime is not running"),
            }
            Ok(())
        }
    }
}
