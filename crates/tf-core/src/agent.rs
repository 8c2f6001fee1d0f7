//! The seam between the loop and the agent subprocess.
//!
//! The loop describes one attempt as an [`AgentRequest`] and gets back an
//! [`AttemptOutcome`]. How the process is spawned, routed and killed lives
//! behind [`AgentRunner`].

use crate::config::PiOutput;
use async_trait::async_trait;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Internal exit code for an attempt that hit its deadline.
pub const TIMEOUT_SENTINEL: i32 = -1;

/// Process exit code reported when the restart budget ran out on timeouts.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Result of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    /// Exited non-zero, or was killed by a signal (`128 + signal`).
    Failed { code: i32 },
    TimedOut,
}

impl AttemptOutcome {
    /// Legacy integer form: `0`, the exit code, or [`TIMEOUT_SENTINEL`].
    pub fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Failed { code } => code,
            Self::TimedOut => TIMEOUT_SENTINEL,
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed { code } => write!(f, "exit {code}"),
            Self::TimedOut => write!(f, "timeout"),
        }
    }
}

/// Where the agent's stdout and stderr go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputPlan {
    Inherit,
    Discard,
    /// Both streams appended to one file.
    Combined(PathBuf),
    /// JSON stream on stdout to `stdout`, diagnostics on stderr to `stderr`.
    Split { stdout: PathBuf, stderr: PathBuf },
}

impl OutputPlan {
    /// Chooses routing for `ticket`.
    ///
    /// `custom_log` overrides `{logs_dir}/{ticket}.log` in file mode. JSON
    /// capture sends output to `{logs_dir}/{ticket}.jsonl`; combined with
    /// file mode the user log receives stderr separately, and the two paths
    /// must differ.
    pub fn resolve(
        mode: PiOutput,
        custom_log: Option<&Path>,
        capture_json: bool,
        logs_dir: &Path,
        ticket: &str,
    ) -> Result<Self, AgentError> {
        let log_path = custom_log
            .map(Path::to_path_buf)
            .unwrap_or_else(|| logs_dir.join(format!("{ticket}.log")));
        let json_path = logs_dir.join(format!("{ticket}.jsonl"));

        Ok(match (capture_json, mode) {
            (true, PiOutput::File) => {
                if log_path == json_path {
                    return Err(AgentError::OutputCollision { path: log_path });
                }
                Self::Split {
                    stdout: json_path,
                    stderr: log_path,
                }
            }
            (true, _) => Self::Combined(json_path),
            (false, PiOutput::File) => Self::Combined(log_path),
            (false, PiOutput::Discard) => Self::Discard,
            (false, PiOutput::Inherit) => Self::Inherit,
        })
    }

    /// The file a human should read after a failure, if any.
    pub fn log_path(&self) -> Option<&Path> {
        match self {
            Self::Inherit | Self::Discard => None,
            Self::Combined(path) => Some(path),
            Self::Split { stderr, .. } => Some(stderr),
        }
    }
}

/// One agent invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRequest {
    pub ticket: String,
    pub workflow: String,
    pub flags: String,
    /// Working directory: the project root, or a worktree.
    pub cwd: PathBuf,
    pub output: OutputPlan,
    /// Request the structured JSON stream from the agent.
    pub json_mode: bool,
    /// `None` waits forever.
    pub timeout: Option<Duration>,
}

impl AgentRequest {
    /// The workflow prompt argument: `"{workflow} {ticket} {flags}"`.
    pub fn prompt(&self) -> String {
        let mut prompt = format!("{} {}", self.workflow.trim(), self.ticket);
        if !self.flags.trim().is_empty() {
            prompt.push(' ');
            prompt.push_str(self.flags.trim());
        }
        prompt
    }
}

/// Errors that keep an attempt from producing an outcome.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent command '{0}' not found on PATH")]
    NotFound(String),

    #[error("workflow prompt not found; looked in {}", join_paths(.checked))]
    PromptMissing { checked: Vec<PathBuf> },

    #[error("JSON capture and log file both resolve to {path}; set a different piOutputFile")]
    OutputCollision { path: PathBuf },

    #[error("failed to open agent output {path}: {source}")]
    Output {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn agent '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("failed waiting for agent: {0}")]
    Wait(#[source] io::Error),
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(" and ")
}

/// Runs the agent subprocess.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Checks that the agent binary and workflow prompt exist.
    async fn preflight(&self) -> Result<(), AgentError>;

    /// The argv that [`AgentRunner::run`] would spawn.
    fn command_line(&self, request: &AgentRequest) -> Vec<String>;

    /// Runs one attempt to completion, enforcing `request.timeout`.
    async fn run(&self, request: &AgentRequest) -> Result<AttemptOutcome, AgentError>;
}
