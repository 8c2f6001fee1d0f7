//! Project root discovery and the on-disk layout of Ralph state.
//!
//! All Ralph state lives under `.tf/` in the project root:
//! ```text
//! .tf/
//! ├── knowledge/tickets/{id}/   # close-summary.md, review.md (written by the agent)
//! └── ralph/
//!     ├── config.json
//!     ├── lock
//!     ├── progress.md
//!     ├── AGENTS.md             # lessons learned
//!     ├── logs/{id}.log|.jsonl
//!     └── worktrees/{id}/
//! ```
//!
//! # Example
//!
//! ```
//! use tf_core::ProjectPaths;
//! use std::path::PathBuf;
//!
//! let paths = ProjectPaths::new(PathBuf::from("/project"));
//! assert_eq!(paths.lock_path().to_string_lossy(), "/project/.tf/ralph/lock");
//! assert_eq!(
//!     paths.resolve(".tf/ralph/worktrees").to_string_lossy(),
//!     "/project/.tf/ralph/worktrees"
//! );
//! ```

use std::path::{Path, PathBuf};

/// Name of the marker directory that identifies a project root.
pub const PROJECT_MARKER: &str = ".tf";

/// Resolved layout for one project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectPaths {
    root: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Walks up from `start` to the first directory containing `.tf`.
    /// Falls back to `start` itself when no ancestor carries the marker.
    pub fn discover(start: &Path) -> Self {
        let found = start
            .ancestors()
            .find(|dir| dir.join(PROJECT_MARKER).is_dir())
            .unwrap_or(start);
        Self::new(found.to_path_buf())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a configured path: absolute paths pass through, relative
    /// ones are joined onto the project root.
    pub fn resolve(&self, configured: impl AsRef<Path>) -> PathBuf {
        let p = configured.as_ref();
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.root.join(p)
        }
    }

    pub fn tf_dir(&self) -> PathBuf {
        self.root.join(PROJECT_MARKER)
    }

    pub fn ralph_dir(&self) -> PathBuf {
        self.tf_dir().join("ralph")
    }

    pub fn config_path(&self) -> PathBuf {
        self.ralph_dir().join("config.json")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.ralph_dir().join("lock")
    }

    pub fn progress_path(&self) -> PathBuf {
        self.ralph_dir().join("progress.md")
    }

    pub fn lessons_path(&self) -> PathBuf {
        self.ralph_dir().join("AGENTS.md")
    }

    /// Pre-0.4 in-project session directory.
    pub fn legacy_sessions_dir(&self) -> PathBuf {
        self.ralph_dir().join("sessions")
    }

    /// Per-project prompt location checked before the per-user one.
    pub fn project_prompt_path(&self) -> PathBuf {
        self.root.join(".pi").join("prompts").join("tf.md")
    }
}

/// Artifact directory for `ticket` under a knowledge root.
pub fn ticket_artifact_dir(knowledge_dir: &Path, ticket: &str) -> PathBuf {
    knowledge_dir.join("tickets").join(ticket)
}

/// Expands a leading `~` using `$HOME`.
pub fn expand_home(path: &str) -> PathBuf {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    match (path, home) {
        ("~", Some(home)) => home,
        (p, Some(home)) if p.starts_with("~/") => home.join(&p[2..]),
        (p, _) => PathBuf::from(p),
    }
}
