//! Git worktree management for parallel workers.
//!
//! Each parallel worker runs in `{worktreesDir}/{ticket}` on its own branch
//! `ralph/{ticket}`, created from HEAD. Only `.git` history is shared between
//! workers. Branches are left in place after removal so the worker's commits
//! stay reachable.

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, warn};

/// Errors from worktree operations.
#[derive(Debug, thiserror::Error)]
pub enum WorktreeError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Git exited non-zero; carries its stderr.
    #[error("git command failed: {0}")]
    Git(String),
}

impl WorktreeError {
    /// Human-facing detail, stderr for git failures.
    pub fn detail(&self) -> String {
        match self {
            Self::Io(e) => e.to_string(),
            Self::Git(stderr) => stderr.trim().to_string(),
        }
    }
}

/// How a worktree was removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorktreeRemoval {
    Git,
    /// `git worktree remove` failed and the directory was deleted directly.
    Fallback { git_error: String },
}

/// Branch name for a ticket's worktree.
pub fn branch_for(ticket: &str) -> String {
    format!("ralph/{ticket}")
}

/// Creates and removes isolated checkouts.
#[async_trait]
pub trait WorktreeManager: Send + Sync {
    /// Version-control root containing `start`, if any.
    async fn repo_root(&self, start: &Path) -> Option<PathBuf>;

    /// Force-removes anything stale at `path`, then checks out a fresh
    /// `branch` from HEAD there.
    async fn create(&self, repo_root: &Path, path: &Path, branch: &str)
    -> Result<(), WorktreeError>;

    /// Removes the worktree at `path`, falling back to a recursive delete.
    async fn remove(&self, repo_root: &Path, path: &Path) -> Result<WorktreeRemoval, WorktreeError>;
}

/// [`WorktreeManager`] backed by the `git` CLI.
#[derive(Debug, Clone)]
pub struct GitWorktrees {
    git: String,
}

impl Default for GitWorktrees {
    fn default() -> Self {
        Self {
            git: "git".to_string(),
        }
    }
}

impl GitWorktrees {
    pub fn new() -> Self {
        Self::default()
    }

    fn command(&self, cwd: &Path) -> Command {
        let mut cmd = Command::new(&self.git);
        cmd.current_dir(cwd).stdin(std::process::Stdio::null());
        cmd
    }

    async fn prune(&self, repo_root: &Path) {
        if let Err(e) = self
            .command(repo_root)
            .args(["worktree", "prune"])
            .output()
            .await
        {
            debug!("git worktree prune failed: {}", e);
        }
    }

    /// `git worktree remove -f`, reporting stderr on failure.
    async fn git_remove(&self, repo_root: &Path, path: &Path) -> Result<(), WorktreeError> {
        let output = self
            .command(repo_root)
            .args(["worktree", "remove", "-f"])
            .arg(path)
            .output()
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(WorktreeError::Git(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ))
        }
    }
}

#[async_trait]
impl WorktreeManager for GitWorktrees {
    async fn repo_root(&self, start: &Path) -> Option<PathBuf> {
        let output = self
            .command(start)
            .args(["rev-parse", "--show-toplevel"])
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let root = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!root.is_empty()).then(|| PathBuf::from(root))
    }

    async fn create(
        &self,
        repo_root: &Path,
        path: &Path,
        branch: &str,
    ) -> Result<(), WorktreeError> {
        if path.exists() {
            debug!("Removing stale worktree at {}", path.display());
            self.remove(repo_root, path).await?;
        } else {
            // A deleted directory can leave a registered worktree behind.
            self.prune(repo_root).await;
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let output = self
            .command(repo_root)
            .args(["worktree", "add", "-B", branch])
            .arg(path)
            .arg("HEAD")
            .output()
            .await?;

        if !output.status.success() {
            return Err(WorktreeError::Git(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }
        debug!("Created worktree {} on {}", path.display(), branch);
        Ok(())
    }

    async fn remove(&self, repo_root: &Path, path: &Path) -> Result<WorktreeRemoval, WorktreeError> {
        match self.git_remove(repo_root, path).await {
            Ok(()) => {
                self.prune(repo_root).await;
                Ok(WorktreeRemoval::Git)
            }
            Err(e) => {
                let git_error = e.detail();
                warn!(
                    "git worktree remove failed for {}: {}; deleting directly",
                    path.display(),
                    git_error
                );
                match tokio::fs::remove_dir_all(path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(WorktreeError::Io(e)),
                }
                self.prune(repo_root).await;
                Ok(WorktreeRemoval::Fallback { git_error })
            }
        }
    }
}
