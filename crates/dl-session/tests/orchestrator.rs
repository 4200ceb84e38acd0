use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dl_config::{PortConfig, TunnelConfig};
use dl_error::{DevloopError, Result};
use dl_session::{
    CleanupRequest, CreateSessionRequest, InMemorySessionRegistry, ProvisionRequest,
    SessionOrchestrator, SessionRecord, SessionRegistry, SessionState, TunnelManager, TunnelProvider,
    TunnelRequest, Tunnels, WorktreeInfo, WorktreeRequest, Worktrees,
};
use tokio::sync::Mutex;

/// Records provisioned checkouts in memory instead of calling git.
#[derive(Default)]
struct FakeWorktrees {
    checkouts: Mutex<HashMap<PathBuf, PathBuf>>,
}

#[async_trait]
impl Worktrees for FakeWorktrees {
    async fn provision(&self, request: ProvisionRequest) -> Result<WorktreeInfo> {
        let path = request
            .requested_path
            .unwrap_or_else(|| PathBuf::from(format!("/wt/{}", request.session_id)));
        let mut checkouts = self.checkouts.lock().await;
        if checkouts.contains_key(&path) {
            return Err(DevloopError::WorktreePathExists { path });
        }
        checkouts.insert(path.clone(), request.source_root);
        Ok(WorktreeInfo {
            path,
            head: "abc123".to_string(),
            branch: Some(format!("refs/heads/devloop/{}", request.session_id)),
            bare: false,
            detached: false,
        })
    }

    async fn cleanup(&self, request: CleanupRequest) -> Result<()> {
        self.checkouts.lock().await.remove(&request.path);
        Ok(())
    }

    async fn list(&self, _source_root: &Path) -> Result<Vec<WorktreeInfo>> {
        Ok(Vec::new())
    }

    fn exists(&self, _path: &Path) -> bool {
        false
    }
}

struct Harness {
    orchestrator: SessionOrchestrator,
    registry: Arc<InMemorySessionRegistry>,
}

fn harness() -> Harness {
    let registry = Arc::new(InMemorySessionRegistry::new());
    let tunnels = Arc::new(TunnelManager::new(TunnelConfig {
        binary: "/nonexistent/cloudflared".to_string(),
        ..TunnelConfig::default()
    }));
    let orchestrator = SessionOrchestrator::new(
        registry.clone(),
        Arc::new(FakeWorktrees::default()),
        tunnels,
        PortConfig {
            max_attempts: 100,
            ..PortConfig::default()
        },
    );
    Harness {
        orchestrator,
        registry,
    }
}

fn create(label: &str, port: Option<u16>) -> CreateSessionRequest {
    CreateSessionRequest {
        label: label.to_string(),
        project_root: PathBuf::from("/work/app"),
        port,
        tunnel: None,
    }
}

#[tokio::test]
async fn create_persists_running_session() {
    let h = harness();
    let session = h
        .orchestrator
        .create_session(create("web", Some(18_081)))
        .await
        .unwrap();
    assert_eq!(session.state, SessionState::Running);
    assert_eq!(session.port, 18_081);
    assert!(!session.tunnel.connected);

    let stored = h.registry.load().await.unwrap();
    assert_eq!(stored, vec![session]);
}

#[tokio::test]
async fn blank_label_is_invalid() {
    let h = harness();
    let err = h
        .orchestrator
        .create_session(create("   ", None))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_INPUT");
}

#[tokio::test]
async fn port_conflict_until_holder_stops() {
    let h = harness();
    let first = h
        .orchestrator
        .create_session(create("first", Some(18_082)))
        .await
        .unwrap();

    let err = h
        .orchestrator
        .create_session(create("second", Some(18_082)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "PORT_IN_USE");
    assert!(err.to_string().contains(&first.id));

    let stopped = h.orchestrator.stop_session(&first.id).await.unwrap();
    assert_eq!(stopped.state, SessionState::Stopped);

    let second = h
        .orchestrator
        .create_session(create("second", Some(18_082)))
        .await
        .unwrap();
    assert_eq!(second.port, 18_082);

    // Stopped sessions are retained.
    assert_eq!(h.orchestrator.list_sessions().await.unwrap().len(), 2);
}

#[tokio::test]
async fn allocated_ports_do_not_collide() {
    let h = harness();
    let a = h.orchestrator.create_session(create("a", None)).await.unwrap();
    let b = h.orchestrator.create_session(create("b", None)).await.unwrap();
    assert_ne!(a.port, b.port);
}

#[tokio::test]
async fn missing_session_is_not_found_everywhere() {
    let h = harness();
    let o = &h.orchestrator;
    let codes = [
        o.stop_session("nope").await.unwrap_err().code(),
        o.get_session("nope").await.unwrap_err().code(),
        o.resolve_endpoint("nope").await.unwrap_err().code(),
        o.detach_tunnel("nope").await.unwrap_err().code(),
        o.attach_tunnel("nope", TunnelRequest::default())
            .await
            .unwrap_err()
            .code(),
        o.provision_worktree("nope", WorktreeRequest::default())
            .await
            .unwrap_err()
            .code(),
        o.cleanup_worktree("nope", false).await.unwrap_err().code(),
    ];
    assert!(codes.iter().all(|code| *code == "SESSION_NOT_FOUND"), "{codes:?}");
}

#[tokio::test]
async fn manual_tunnel_flows_into_endpoint_and_stop() {
    let h = harness();
    let session = h
        .orchestrator
        .create_session(CreateSessionRequest {
            tunnel: Some(TunnelRequest {
                public_url: Some("https://preview.example.com".to_string()),
                config: None,
            }),
            ..create("web", Some(18_083))
        })
        .await
        .unwrap();
    assert_eq!(session.tunnel.provider, TunnelProvider::Manual);

    let endpoint = h.orchestrator.resolve_endpoint(&session.id).await.unwrap();
    assert_eq!(endpoint.local_url, "http://localhost:18083");
    assert_eq!(
        endpoint.tunnel.url.as_deref(),
        Some("https://preview.example.com")
    );

    let stopped = h.orchestrator.stop_session(&session.id).await.unwrap();
    assert!(!stopped.tunnel.connected);
    assert_eq!(stopped.tunnel.provider, TunnelProvider::None);
    assert!(h.orchestrator.tunnels().list().await.is_empty());
}

#[tokio::test]
async fn detach_without_tunnel_reports_disconnected() {
    let h = harness();
    let session = h
        .orchestrator
        .create_session(create("web", Some(18_084)))
        .await
        .unwrap();
    let state = h.orchestrator.detach_tunnel(&session.id).await.unwrap();
    assert_eq!(
        serde_json::to_value(state).unwrap(),
        serde_json::json!({"connected": false, "provider": "none"})
    );
}

#[tokio::test]
async fn failed_tunnel_releases_port() {
    let h = harness();
    let err = h
        .orchestrator
        .create_session(CreateSessionRequest {
            tunnel: Some(TunnelRequest::default()),
            ..create("web", Some(18_085))
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), "TUNNEL_BINARY_MISSING");
    assert!(h.registry.load().await.unwrap().is_empty());

    // Port is free again for this orchestrator.
    h.orchestrator
        .create_session(create("web", Some(18_085)))
        .await
        .unwrap();
}

#[tokio::test]
async fn attach_to_stopped_session_is_rejected() {
    let h = harness();
    let session = h
        .orchestrator
        .create_session(create("web", Some(18_086)))
        .await
        .unwrap();
    h.orchestrator.stop_session(&session.id).await.unwrap();
    let err = h
        .orchestrator
        .attach_tunnel(
            &session.id,
            TunnelRequest {
                public_url: Some("https://x.example.com".to_string()),
                config: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_INPUT");
}

#[tokio::test]
async fn worktree_swaps_project_root() {
    let h = harness();
    let session = h
        .orchestrator
        .create_session(create("web", Some(18_087)))
        .await
        .unwrap();

    let info = h
        .orchestrator
        .provision_worktree(&session.id, WorktreeRequest::default())
        .await
        .unwrap();
    let provisioned = h.orchestrator.get_session(&session.id).await.unwrap();
    assert_eq!(provisioned.project_root, info.path);
    let association = provisioned.worktree.unwrap();
    assert_eq!(association.source_root, PathBuf::from("/work/app"));

    let again = h
        .orchestrator
        .provision_worktree(&session.id, WorktreeRequest::default())
        .await
        .unwrap_err();
    assert_eq!(again.code(), "INVALID_INPUT");

    let cleaned = h
        .orchestrator
        .cleanup_worktree(&session.id, false)
        .await
        .unwrap();
    assert_eq!(cleaned.project_root, PathBuf::from("/work/app"));
    assert!(cleaned.worktree.is_none());

    let err = h
        .orchestrator
        .cleanup_worktree(&session.id, false)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "WORKTREE_NOT_FOUND");
}

/// Registry whose saves fail until `fail_saves` is cleared.
#[derive(Default)]
struct FlakyRegistry {
    inner: InMemorySessionRegistry,
    fail_saves: AtomicBool,
}

#[async_trait]
impl SessionRegistry for FlakyRegistry {
    async fn load(&self) -> Result<Vec<SessionRecord>> {
        self.inner.load().await
    }

    async fn save(&self, sessions: &[SessionRecord]) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(DevloopError::internal("disk full"));
        }
        self.inner.save(sessions).await
    }
}

#[tokio::test]
async fn failed_save_rolls_back_tunnel_and_port() {
    let registry = Arc::new(FlakyRegistry {
        fail_saves: AtomicBool::new(true),
        ..FlakyRegistry::default()
    });
    let tunnels = Arc::new(TunnelManager::new(TunnelConfig::default()));
    // A single usable port makes a leaked reservation visible.
    let orchestrator = SessionOrchestrator::new(
        registry.clone(),
        Arc::new(FakeWorktrees::default()),
        tunnels.clone(),
        PortConfig {
            default_port: 18_091,
            range_start: 18_091,
            range_end: 18_091,
            max_attempts: 5,
        },
    );
    let request = || CreateSessionRequest {
        tunnel: Some(TunnelRequest {
            public_url: Some("https://preview.example.com".to_string()),
            config: None,
        }),
        ..create("web", None)
    };

    let err = orchestrator.create_session(request()).await.unwrap_err();
    assert_eq!(err.code(), "INTERNAL_ERROR");
    assert!(tunnels.list().await.is_empty());
    assert!(registry.load().await.unwrap().is_empty());

    registry.fail_saves.store(false, Ordering::SeqCst);
    let session = orchestrator.create_session(request()).await.unwrap();
    assert_eq!(session.port, 18_091);
    assert_eq!(tunnels.list().await.len(), 1);
}
