use std::path::{Path, PathBuf};
use std::process::Output;

use async_trait::async_trait;
use dl_error::{DevloopError, Result};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

const DEFAULT_BASE_REF: &str = "main";
const WORKTREES_DIR: &str = ".devloop-worktrees";

/// One entry of `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub head: String,
    pub branch: Option<String>,
    pub bare: bool,
    pub detached: bool,
}

#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub session_id: String,
    pub source_root: PathBuf,
    pub requested_path: Option<PathBuf>,
    pub base_ref: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CleanupRequest {
    pub source_root: PathBuf,
    pub path: PathBuf,
    pub force: bool,
}

#[async_trait]
pub trait Worktrees: Send + Sync {
    async fn provision(&self, request: ProvisionRequest) -> Result<WorktreeInfo>;
    async fn cleanup(&self, request: CleanupRequest) -> Result<()>;
    async fn list(&self, source_root: &Path) -> Result<Vec<WorktreeInfo>>;
    fn exists(&self, path: &Path) -> bool;
}

/// `Worktrees` backed by the `git` command line.
#[derive(Debug, Clone, Default)]
pub struct GitWorktreeManager;

impl GitWorktreeManager {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Worktrees for GitWorktreeManager {
    async fn provision(&self, request: ProvisionRequest) -> Result<WorktreeInfo> {
        ensure_git_repo(&request.source_root).await?;

        let branch = branch_name(&request.session_id);
        let path = request
            .requested_path
            .clone()
            .unwrap_or_else(|| default_worktree_path(&request.source_root, &request.session_id));
        let base_ref = request.base_ref.as_deref().unwrap_or(DEFAULT_BASE_REF);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let path_arg = path.to_string_lossy();
        let output = run_git(
            &request.source_root,
            &["worktree", "add", "-b", &branch, &path_arg, base_ref],
        )
        .await?;
        if !output.status.success() {
            let stderr = command_stderr(&output);
            tracing::warn!(
                session_id = %request.session_id,
                path = %path.display(),
                "git worktree add failed: {}",
                stderr
            );
            return Err(classify_add_failure(&stderr, &branch, &path));
        }

        let head = run_git_ok(&path, &["rev-parse", "HEAD"]).await?;
        tracing::info!(
            session_id = %request.session_id,
            path = %path.display(),
            branch = %branch,
            "worktree provisioned"
        );
        Ok(WorktreeInfo {
            path,
            head: String::from_utf8_lossy(&head.stdout).trim().to_string(),
            branch: Some(format!("refs/heads/{branch}")),
            bare: false,
            detached: false,
        })
    }

    async fn cleanup(&self, request: CleanupRequest) -> Result<()> {
        if !request.path.exists() {
            tracing::info!(
                path = %request.path.display(),
                "worktree directory already gone, pruning"
            );
            run_git_ok(&request.source_root, &["worktree", "prune"]).await?;
            return Ok(());
        }

        let path_arg = request.path.to_string_lossy();
        let mut args = vec!["worktree", "remove"];
        if request.force {
            args.push("--force");
        }
        args.push(&path_arg);

        let output = run_git(&request.source_root, &args).await?;
        if output.status.success() {
            tracing::info!(path = %request.path.display(), "worktree removed");
            return Ok(());
        }
        let stderr = command_stderr(&output);
        if stderr.contains("modified or untracked files") || stderr.contains("use --force") {
            return Err(DevloopError::WorktreeDirty { path: request.path });
        }
        Err(DevloopError::internal(format!(
            "git worktree remove failed: {stderr}"
        )))
    }

    async fn list(&self, source_root: &Path) -> Result<Vec<WorktreeInfo>> {
        ensure_git_repo(source_root).await?;
        let output = run_git_ok(source_root, &["worktree", "list", "--porcelain"]).await?;
        Ok(parse_porcelain(&String::from_utf8_lossy(&output.stdout)))
    }

    fn exists(&self, path: &Path) -> bool {
        is_worktree_checkout(path)
    }
}

pub fn branch_name(session_id: &str) -> String {
    format!("devloop/{session_id}")
}

/// `<parent of source>/.devloop-worktrees/<repo name>/<session id>`
pub fn default_worktree_path(source_root: &Path, session_id: &str) -> PathBuf {
    let repo_name = source_root
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "repo".to_string());
    let parent = source_root.parent().unwrap_or(source_root);
    parent.join(WORKTREES_DIR).join(repo_name).join(session_id)
}

/// A linked worktree has a `.git` file pointing at the primary repository;
/// a primary clone has a `.git` directory instead.
pub fn is_worktree_checkout(path: &Path) -> bool {
    let marker = path.join(".git");
    if !marker.is_file() {
        return false;
    }
    std::fs::read_to_string(marker)
        .map(|content| content.starts_with("gitdir:"))
        .unwrap_or(false)
}

pub fn parse_porcelain(output: &str) -> Vec<WorktreeInfo> {
    let mut worktrees = Vec::new();
    let mut current: Option<WorktreeInfo> = None;

    for line in output.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            worktrees.extend(current.take());
            continue;
        }
        if let Some(path) = line.strip_prefix("worktree ") {
            worktrees.extend(current.take());
            current = Some(WorktreeInfo {
                path: PathBuf::from(path),
                head: String::new(),
                branch: None,
                bare: false,
                detached: false,
            });
            continue;
        }
        let Some(entry) = current.as_mut() else {
            continue;
        };
        if let Some(head) = line.strip_prefix("HEAD ") {
            entry.head = head.to_string();
        } else if let Some(branch) = line.strip_prefix("branch ") {
            entry.branch = Some(branch.to_string());
        } else if line == "bare" {
            entry.bare = true;
        } else if line == "detached" {
            entry.detached = true;
        }
    }
    worktrees.extend(current);
    worktrees
}

fn classify_add_failure(stderr: &str, branch: &str, path: &Path) -> DevloopError {
    if stderr.contains("a branch named") && stderr.contains("already exists") {
        DevloopError::WorktreeBranchExists {
            branch: branch.to_string(),
        }
    } else if stderr.contains("already exists")
        || stderr.contains("already registered")
        || stderr.contains("already a working tree")
    {
        DevloopError::WorktreePathExists {
            path: path.to_path_buf(),
        }
    } else {
        DevloopError::WorktreeCreateFailed(stderr.to_string())
    }
}

async fn run_git(cwd: &Path, args: &[&str]) -> Result<Output> {
    Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .await
        .map_err(|e| DevloopError::internal(format!("Failed to run git: {e}")))
}

fn command_stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

async fn run_git_ok(cwd: &Path, args: &[&str]) -> Result<Output> {
    let output = run_git(cwd, args).await?;
    if output.status.success() {
        Ok(output)
    } else {
        let stderr = command_stderr(&output);
        Err(DevloopError::internal(format!(
            "git {} failed: {stderr}",
            args.join(" ")
        )))
    }
}

async fn ensure_git_repo(cwd: &Path) -> Result<()> {
    if !cwd.is_dir() {
        return Err(DevloopError::NotAGitRepo(cwd.to_path_buf()));
    }
    let output = run_git(cwd, &["rev-parse", "--is-inside-work-tree"]).await?;
    let inside = output.status.success() && String::from_utf8_lossy(&output.stdout).trim() == "true";
    if inside {
        Ok(())
    } else {
        Err(DevloopError::NotAGitRepo(cwd.to_path_buf()))
    }
}
