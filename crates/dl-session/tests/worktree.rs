#![cfg(unix)]

use std::path::Path;
use std::process::Command;

use dl_session::worktree::{branch_name, default_worktree_path};
use dl_session::{CleanupRequest, GitWorktreeManager, ProvisionRequest, Worktrees};

fn git(cwd: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .expect("git should be installed");
    assert!(
        output.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
}

/// A repository with one commit on `main`, nested so the default worktree
/// location stays inside the temp dir.
fn init_repo(root: &Path) -> std::path::PathBuf {
    let repo = root.join("app");
    std::fs::create_dir_all(&repo).unwrap();
    git(&repo, &["init", "-q"]);
    git(&repo, &["config", "user.email", "dev@example.com"]);
    git(&repo, &["config", "user.name", "Dev"]);
    git(&repo, &["config", "commit.gpgsign", "false"]);
    std::fs::write(repo.join("README.md"), "hello\n").unwrap();
    git(&repo, &["add", "."]);
    git(&repo, &["commit", "-q", "-m", "init"]);
    git(&repo, &["branch", "-M", "main"]);
    repo
}

fn provision(session_id: &str, source_root: &Path) -> ProvisionRequest {
    ProvisionRequest {
        session_id: session_id.to_string(),
        source_root: source_root.to_path_buf(),
        requested_path: None,
        base_ref: None,
    }
}

#[tokio::test]
async fn provision_list_cleanup() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = init_repo(tmp.path());
    let manager = GitWorktreeManager::new();

    let info = manager.provision(provision("s1", &repo)).await.unwrap();
    assert_eq!(info.path, default_worktree_path(&repo, "s1"));
    assert_eq!(info.branch.as_deref(), Some("refs/heads/devloop/s1"));
    assert_eq!(info.head.len(), 40);
    assert!(manager.exists(&info.path));
    assert!(!manager.exists(&repo));

    let listed = manager.list(&repo).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert!(listed
        .iter()
        .any(|w| w.branch.as_deref() == Some("refs/heads/devloop/s1")));

    manager
        .cleanup(CleanupRequest {
            source_root: repo.clone(),
            path: info.path.clone(),
            force: false,
        })
        .await
        .unwrap();
    assert!(!info.path.exists());
    assert_eq!(manager.list(&repo).await.unwrap().len(), 1);
}

#[tokio::test]
async fn non_repository_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let err = GitWorktreeManager::new()
        .provision(provision("s1", tmp.path()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "NOT_A_GIT_REPO");
}

#[tokio::test]
async fn existing_branch_is_reported() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = init_repo(tmp.path());
    git(&repo, &["branch", &branch_name("s1")]);

    let err = GitWorktreeManager::new()
        .provision(provision("s1", &repo))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "WORKTREE_BRANCH_EXISTS");
}

#[tokio::test]
async fn existing_path_is_reported() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = init_repo(tmp.path());
    let occupied = tmp.path().join("occupied");
    std::fs::create_dir_all(&occupied).unwrap();
    std::fs::write(occupied.join("file.txt"), "x").unwrap();

    let err = GitWorktreeManager::new()
        .provision(ProvisionRequest {
            requested_path: Some(occupied),
            ..provision("s1", &repo)
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), "WORKTREE_PATH_EXISTS");
}

#[tokio::test]
async fn dirty_worktree_needs_force() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = init_repo(tmp.path());
    let manager = GitWorktreeManager::new();
    let info = manager.provision(provision("s1", &repo)).await.unwrap();
    std::fs::write(info.path.join("scratch.txt"), "wip").unwrap();

    let request = CleanupRequest {
        source_root: repo.clone(),
        path: info.path.clone(),
        force: false,
    };
    let err = manager.cleanup(request.clone()).await.unwrap_err();
    assert_eq!(err.code(), "WORKTREE_DIRTY");

    manager
        .cleanup(CleanupRequest {
            force: true,
            ..request
        })
        .await
        .unwrap();
    assert!(!info.path.exists());
}

#[tokio::test]
async fn externally_deleted_worktree_is_pruned() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = init_repo(tmp.path());
    let manager = GitWorktreeManager::new();
    let info = manager.provision(provision("s1", &repo)).await.unwrap();

    std::fs::remove_dir_all(&info.path).unwrap();
    manager
        .cleanup(CleanupRequest {
            source_root: repo.clone(),
            path: info.path,
            force: false,
        })
        .await
        .unwrap();
    assert_eq!(manager.list(&repo).await.unwrap().len(), 1);
}
