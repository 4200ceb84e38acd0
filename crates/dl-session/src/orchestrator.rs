use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use dl_config::{PortConfig, TunnelConfig};
use dl_error::{DevloopError, Result};
use serde::Serialize;
use uuid::Uuid;

use crate::port::PortAllocator;
use crate::registry::{SessionRecord, SessionRegistry, SessionState, WorktreeAssociation};
use crate::tunnel::{AttachRequest, TunnelState, Tunnels};
use crate::worktree::{CleanupRequest, ProvisionRequest, WorktreeInfo, Worktrees};

#[derive(Debug, Clone, Default)]
pub struct TunnelRequest {
    pub public_url: Option<String>,
    pub config: Option<TunnelConfig>,
}

#[derive(Debug, Clone)]
pub struct CreateSessionRequest {
    pub label: String,
    pub project_root: PathBuf,
    pub port: Option<u16>,
    pub tunnel: Option<TunnelRequest>,
}

#[derive(Debug, Clone, Default)]
pub struct WorktreeRequest {
    pub requested_path: Option<PathBuf>,
    pub base_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEndpoint {
    pub session_id: String,
    pub local_url: String,
    pub tunnel: TunnelState,
}

/// Composes ports, worktrees and tunnels into session CRUD.
///
/// Every operation loads the full session list from the registry, mutates
/// it, and saves it back. Concurrent writers in other processes can lose
/// updates; nothing guards against that.
pub struct SessionOrchestrator {
    registry: Arc<dyn SessionRegistry>,
    worktrees: Arc<dyn Worktrees>,
    tunnels: Arc<dyn Tunnels>,
    ports: Mutex<PortAllocator>,
}

impl SessionOrchestrator {
    pub fn new(
        registry: Arc<dyn SessionRegistry>,
        worktrees: Arc<dyn Worktrees>,
        tunnels: Arc<dyn Tunnels>,
        ports: PortConfig,
    ) -> Self {
        Self {
            registry,
            worktrees,
            tunnels,
            ports: Mutex::new(PortAllocator::new(ports)),
        }
    }

    pub fn tunnels(&self) -> &Arc<dyn Tunnels> {
        &self.tunnels
    }

    pub async fn create_session(&self, request: CreateSessionRequest) -> Result<SessionRecord> {
        let label = request.label.trim();
        if label.is_empty() {
            return Err(DevloopError::invalid_input("label is required"));
        }

        let mut sessions = self.registry.load().await?;
        let live_ports: HashSet<u16> = sessions
            .iter()
            .filter(|s| s.is_live())
            .map(|s| s.port)
            .collect();

        let port = match request.port {
            Some(port) => {
                if let Some(holder) = sessions.iter().find(|s| s.is_live() && s.port == port) {
                    return Err(DevloopError::PortInUse {
                        port,
                        session_id: holder.id.clone(),
                    });
                }
                self.with_ports(|ports| ports.reserve(port))?;
                port
            }
            None => self.with_ports(|ports| ports.allocate(&live_ports))??,
        };

        let now = Utc::now();
        let mut record = SessionRecord {
            id: Uuid::new_v4().to_string(),
            label: label.to_string(),
            project_root: request.project_root,
            port,
            state: SessionState::Running,
            tunnel: TunnelState::disconnected(),
            worktree: None,
            created_at: now,
            updated_at: now,
        };

        if let Some(tunnel) = request.tunnel {
            let attached = self
                .tunnels
                .attach(AttachRequest {
                    session_id: record.id.clone(),
                    port,
                    public_url: tunnel.public_url,
                    config: tunnel.config,
                })
                .await;
            match attached {
                Ok(state) => record.tunnel = state,
                Err(err) => {
                    self.with_ports(|ports| ports.release(port))?;
                    return Err(err);
                }
            }
        }

        sessions.push(record.clone());
        if let Err(err) = self.registry.save(&sessions).await {
            if record.tunnel.connected {
                if let Err(detach_err) = self.tunnels.detach(&record.id).await {
                    tracing::warn!(session_id = %record.id, "Failed to detach tunnel: {}", detach_err);
                }
            }
            self.with_ports(|ports| ports.release(port))?;
            return Err(err);
        }
        tracing::info!(session_id = %record.id, port, label = %record.label, "session created");
        Ok(record)
    }

    pub async fn stop_session(&self, session_id: &str) -> Result<SessionRecord> {
        let mut sessions = self.registry.load().await?;
        let index = find_index(&sessions, session_id)?;

        let tunnel = self.tunnels.detach(session_id).await?;
        let session = &mut sessions[index];
        self.with_ports(|ports| ports.release(session.port))?;
        session.state = SessionState::Stopped;
        session.tunnel = tunnel;
        session.touch();
        let stopped = session.clone();

        self.registry.save(&sessions).await?;
        tracing::info!(session_id, "session stopped");
        Ok(stopped)
    }

    pub async fn provision_worktree(
        &self,
        session_id: &str,
        request: WorktreeRequest,
    ) -> Result<WorktreeInfo> {
        let mut sessions = self.registry.load().await?;
        let index = find_index(&sessions, session_id)?;
        if sessions[index].worktree.is_some() {
            return Err(DevloopError::invalid_input(format!(
                "Session {session_id} already has a worktree; clean it up first"
            )));
        }

        let source_root = sessions[index].project_root.clone();
        let info = self
            .worktrees
            .provision(ProvisionRequest {
                session_id: session_id.to_string(),
                source_root: source_root.clone(),
                requested_path: request.requested_path,
                base_ref: request.base_ref,
            })
            .await?;

        let session = &mut sessions[index];
        session.worktree = Some(WorktreeAssociation {
            source_root,
            path: info.path.clone(),
        });
        session.project_root = info.path.clone();
        session.touch();
        self.registry.save(&sessions).await?;
        Ok(info)
    }

    pub async fn cleanup_worktree(&self, session_id: &str, force: bool) -> Result<SessionRecord> {
        let mut sessions = self.registry.load().await?;
        let index = find_index(&sessions, session_id)?;
        let association = sessions[index]
            .worktree
            .clone()
            .ok_or_else(|| DevloopError::WorktreeNotFound(session_id.to_string()))?;

        self.worktrees
            .cleanup(CleanupRequest {
                source_root: association.source_root.clone(),
                path: association.path,
                force,
            })
            .await?;

        let session = &mut sessions[index];
        session.worktree = None;
        session.project_root = association.source_root;
        session.touch();
        let updated = session.clone();
        self.registry.save(&sessions).await?;
        Ok(updated)
    }

    pub async fn attach_tunnel(
        &self,
        session_id: &str,
        request: TunnelRequest,
    ) -> Result<TunnelState> {
        let mut sessions = self.registry.load().await?;
        let index = find_index(&sessions, session_id)?;
        if !sessions[index].is_live() {
            return Err(DevloopError::invalid_input(format!(
                "Session {session_id} is stopped"
            )));
        }

        let state = self
            .tunnels
            .attach(AttachRequest {
                session_id: session_id.to_string(),
                port: sessions[index].port,
                public_url: request.public_url,
                config: request.config,
            })
            .await?;

        let session = &mut sessions[index];
        session.tunnel = state.clone();
        session.touch();
        self.registry.save(&sessions).await?;
        Ok(state)
    }

    pub async fn detach_tunnel(&self, session_id: &str) -> Result<TunnelState> {
        let mut sessions = self.registry.load().await?;
        let index = find_index(&sessions, session_id)?;

        let state = self.tunnels.detach(session_id).await?;
        let session = &mut sessions[index];
        session.tunnel = state.clone();
        session.touch();
        self.registry.save(&sessions).await?;
        Ok(state)
    }

    pub async fn resolve_endpoint(&self, session_id: &str) -> Result<SessionEndpoint> {
        let session = self.get_session(session_id).await?;
        Ok(SessionEndpoint {
            local_url: format!("http://localhost:{}", session.port),
            session_id: session.id,
            tunnel: session.tunnel,
        })
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionRecord>> {
        self.registry.load().await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<SessionRecord> {
        let sessions = self.registry.load().await?;
        let index = find_index(&sessions, session_id)?;
        Ok(sessions[index].clone())
    }

    fn with_ports<T>(&self, f: impl FnOnce(&mut PortAllocator) -> T) -> Result<T> {
        let mut ports = self
            .ports
            .lock()
            .map_err(|_| DevloopError::internal("port allocator lock poisoned"))?;
        Ok(f(&mut ports))
    }
}

fn find_index(sessions: &[SessionRecord], session_id: &str) -> Result<usize> {
    sessions
        .iter()
        .position(|s| s.id == session_id)
        .ok_or_else(|| DevloopError::SessionNotFound(session_id.to_string()))
}
