//! Runs the `pi` agent as a subprocess.
//!
//! Each attempt spawns the agent in its own process group so termination
//! reaches anything it started. On timeout the group gets SIGTERM, then
//! SIGKILL after a grace period, and the child is always reaped before
//! [`PiRunner::run`] returns. Dropping the future kills the child.

use crate::pi_backend::PiBackend;
use crate::prompt::PromptLocator;
use async_trait::async_trait;
use serde_json::json;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tf_core::{
    AgentError, AgentRequest, AgentRunner, AttemptOutcome, Logger, OutputPlan, ProjectPaths,
};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Time between SIGTERM and SIGKILL.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// [`AgentRunner`] for the `pi` binary.
pub struct PiRunner {
    backend: PiBackend,
    prompts: PromptLocator,
    logger: Logger,
    grace_period: Duration,
}

impl PiRunner {
    pub fn new(backend: PiBackend, prompts: PromptLocator, logger: Logger) -> Self {
        Self {
            backend,
            prompts,
            logger,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    /// Runner for `command` with the standard prompt locations of `paths`.
    pub fn for_project(command: &str, paths: &ProjectPaths, logger: Logger) -> Self {
        Self::new(
            PiBackend::new(command),
            PromptLocator::for_project(paths),
            logger,
        )
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    fn build(&self, request: &AgentRequest) -> Result<Command, AgentError> {
        let (program, args) = self
            .backend
            .build_command(&request.prompt(), request.json_mode);

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .current_dir(&request.cwd)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        match &request.output {
            OutputPlan::Inherit => {
                cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
            }
            OutputPlan::Discard => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
            OutputPlan::Combined(path) => {
                let file = open_log(path)?;
                let dup = file.try_clone().map_err(|source| AgentError::Output {
                    path: path.clone(),
                    source,
                })?;
                cmd.stdout(Stdio::from(file)).stderr(Stdio::from(dup));
            }
            OutputPlan::Split { stdout, stderr } => {
                cmd.stdout(Stdio::from(open_log(stdout)?))
                    .stderr(Stdio::from(open_log(stderr)?));
            }
        }
        Ok(cmd)
    }

    async fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            use nix::sys::signal::Signal;
            use nix::unistd::Pid;

            let pgid = Pid::from_raw(pid as i32);
            debug!(pgid = pid, "Sending SIGTERM to agent process group");
            signal_group(pgid, Signal::SIGTERM);

            if tokio::time::timeout(self.grace_period, child.wait())
                .await
                .is_err()
            {
                debug!(pgid = pid, "Grace period elapsed, sending SIGKILL");
            }
            // Also sweeps up anything left in the group after the leader exits
            signal_group(pgid, Signal::SIGKILL);
        }

        if let Err(e) = child.kill().await {
            debug!(error = %e, "Agent already reaped");
        }
        if let Err(e) = child.wait().await {
            warn!(error = %e, "Failed to reap agent");
        }
    }
}

/// Signals every process in group `pgid`. Returns false when the group is
/// already gone or the signal could not be delivered.
#[cfg(unix)]
fn signal_group(pgid: nix::unistd::Pid, signal: nix::sys::signal::Signal) -> bool {
    use nix::errno::Errno;

    match nix::sys::signal::killpg(pgid, signal) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(e) => {
            debug!(pgid = pgid.as_raw(), signal = ?signal, error = %e, "Failed to signal agent process group");
            false
        }
    }
}

fn open_log(path: &Path) -> Result<File, AgentError> {
    let err = |source| AgentError::Output {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(err)?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(err)
}

/// Maps an exit status to an outcome. Signal deaths become `128 + signal`.
fn outcome_of(status: ExitStatus) -> AttemptOutcome {
    if status.success() {
        return AttemptOutcome::Success;
    }
    if let Some(code) = status.code() {
        return AttemptOutcome::Failed { code };
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return AttemptOutcome::Failed { code: 128 + signal };
        }
    }
    AttemptOutcome::Failed { code: 1 }
}

#[async_trait]
impl AgentRunner for PiRunner {
    async fn preflight(&self) -> Result<(), AgentError> {
        let binary = which::which(&self.backend.command)
            .map_err(|_| AgentError::NotFound(self.backend.command.clone()))?;
        debug!(binary = %binary.display(), "Resolved agent binary");

        let prompt = self.prompts.find().ok_or_else(|| AgentError::PromptMissing {
            checked: self.prompts.candidates(),
        })?;
        debug!(prompt = %prompt.display(), "Found workflow prompt");
        Ok(())
    }

    fn command_line(&self, request: &AgentRequest) -> Vec<String> {
        self.backend.argv(request)
    }

    async fn run(&self, request: &AgentRequest) -> Result<AttemptOutcome, AgentError> {
        let mut child = self
            .build(request)?
            .spawn()
            .map_err(|source| AgentError::Spawn {
                command: self.backend.command.clone(),
                source,
            })?;
        debug!(ticket = %request.ticket, pid = ?child.id(), "Spawned agent");

        let status = match request.timeout {
            None => child.wait().await.map_err(AgentError::Wait)?,
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => status.map_err(AgentError::Wait)?,
                Err(_) => {
                    self.logger.warn(
                        "Agent attempt timed out; terminating",
                        &[
                            ("event", json!("attempt_timeout")),
                            ("ticket", json!(request.ticket)),
                            ("timeout_ms", json!(limit.as_millis() as u64)),
                        ],
                    );
                    self.terminate(&mut child).await;
                    return Ok(AttemptOutcome::TimedOut);
                }
            },
        };

        let outcome = outcome_of(status);
        if let AttemptOutcome::Failed { code } = outcome {
            let mut fields = vec![
                ("event", json!("agent_exit")),
                ("ticket", json!(request.ticket)),
                ("exit_code", json!(code)),
            ];
            if let Some(log) = request.output.log_path() {
                fields.push(("log", json!(log.display().to_string())));
            }
            self.logger.error("Agent exited with non-zero status", &fields);
        }
        Ok(outcome)
    }
}
