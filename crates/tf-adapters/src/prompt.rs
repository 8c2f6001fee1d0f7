//! Workflow prompt discovery.
//!
//! The agent needs a `tf.md` prompt in the project (`.pi/prompts/tf.md`) or
//! in the user's agent directory (`~/.pi/agent/prompts/tf.md`).

use std::path::{Path, PathBuf};
use tf_core::ProjectPaths;
use tf_core::paths::expand_home;

/// Per-user prompt location.
pub const USER_PROMPT_PATH: &str = "~/.pi/agent/prompts/tf.md";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptLocator {
    project: PathBuf,
    user: Option<PathBuf>,
}

impl PromptLocator {
    pub fn new(project: impl Into<PathBuf>, user: Option<PathBuf>) -> Self {
        Self {
            project: project.into(),
            user,
        }
    }

    /// Standard locations for `paths`.
    pub fn for_project(paths: &ProjectPaths) -> Self {
        let user = expand_home(USER_PROMPT_PATH);
        // Without $HOME the tilde cannot be resolved
        let user = (!user.starts_with("~")).then_some(user);
        Self::new(paths.project_prompt_path(), user)
    }

    /// Every location checked, project first.
    pub fn candidates(&self) -> Vec<PathBuf> {
        std::iter::once(self.project.clone())
            .chain(self.user.clone())
            .collect()
    }

    /// The first candidate that exists.
    pub fn find(&self) -> Option<PathBuf> {
        self.candidates().into_iter().find(|p| is_file(p))
    }
}

fn is_file(path: &Path) -> bool {
    path.metadata().is_ok_and(|m| m.is_file())
}
