//! Error taxonomy shared by every devloop crate.
//!
//! Each variant carries a stable string code (`SESSION_NOT_FOUND`,
//! `PORT_IN_USE`, ...) that surfaces unchanged at the HTTP boundary and on
//! the command line. Managers return these errors uncaught; only the API and
//! CLI layers translate them.

use serde::Serialize;
use std::path::PathBuf;

pub type Result<T, E = DevloopError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum DevloopError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    #[error("Port {port} is already held by session {session_id}")]
    PortInUse { port: u16, session_id: String },
    #[error("No free port found after {attempts} attempts")]
    PortExhausted { attempts: usize },
    #[error("Branch '{branch}' already exists")]
    WorktreeBranchExists { branch: String },
    #[error("Worktree path already exists: {}", .path.display())]
    WorktreePathExists { path: PathBuf },
    #[error("Worktree has uncommitted changes (use force to discard): {}", .path.display())]
    WorktreeDirty { path: PathBuf },
    #[error("Failed to create worktree: {0}")]
    WorktreeCreateFailed(String),
    #[error("Session {0} has no worktree attached")]
    WorktreeNotFound(String),
    #[error("Not a git repository: {}", .0.display())]
    NotAGitRepo(PathBuf),
    #[error("Agent runtime did not report ready within {timeout_secs}s")]
    RuntimeTimeout { timeout_secs: u64 },
    #[error("Agent runtime exited before ready ({status}): {output}")]
    RuntimeExit { status: String, output: String },
    #[error("Agent runtime executable not found: {0}")]
    RuntimeNotFound(String),
    #[error("Agent runtime request failed: {0}")]
    RuntimeRequest(String),
    #[error("Agent not found: {0}")]
    AgentNotFound(String),
    #[error("No tunnel for session {0}")]
    TunnelNotFound(String),
    #[error("{0}")]
    TunnelBinaryMissing(String),
    #[error("Tunnel failed to start: {0}")]
    TunnelStartFailed(String),
    #[error("{0}")]
    InvalidInput(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Internal(String),
}

impl DevloopError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::PortInUse { .. } => "PORT_IN_USE",
            Self::PortExhausted { .. } => "PORT_EXHAUSTED",
            Self::WorktreeBranchExists { .. } => "WORKTREE_BRANCH_EXISTS",
            Self::WorktreePathExists { .. } => "WORKTREE_PATH_EXISTS",
            Self::WorktreeDirty { .. } => "WORKTREE_DIRTY",
            Self::WorktreeCreateFailed(_) => "WORKTREE_CREATE_FAILED",
            Self::WorktreeNotFound(_) => "WORKTREE_NOT_FOUND",
            Self::NotAGitRepo(_) => "NOT_A_GIT_REPO",
            Self::RuntimeTimeout { .. } => "OPENCODE_SERVER_TIMEOUT",
            Self::RuntimeExit { .. } => "OPENCODE_SERVER_EXIT",
            Self::RuntimeNotFound(_) => "RUNTIME_NOT_FOUND",
            Self::RuntimeRequest(_) => "RUNTIME_REQUEST_FAILED",
            Self::AgentNotFound(_) => "AGENT_NOT_FOUND",
            Self::TunnelNotFound(_) => "TUNNEL_NOT_FOUND",
            Self::TunnelBinaryMissing(_) => "TUNNEL_BINARY_MISSING",
            Self::TunnelStartFailed(_) => "TUNNEL_START_FAILED",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::Io(_) => "IO_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::SessionNotFound(_)
                | Self::WorktreeNotFound(_)
                | Self::AgentNotFound(_)
                | Self::TunnelNotFound(_)
        )
    }

    /// HTTP status for this error: 404 for not-found kinds, 400 for invalid
    /// input, 500 otherwise.
    pub fn status_code(&self) -> u16 {
        if self.is_not_found() {
            return 404;
        }
        match self {
            Self::InvalidInput(_) => 400,
            _ => 500,
        }
    }

    /// Line printed to stderr by the CLI before exiting with status 1.
    pub fn cli_line(&self) -> String {
        format!("{}: {}", self.code(), self)
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code(),
            message: self.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}
