//! The Ralph loop orchestrator.
//!
//! Repeatedly selects a ready ticket, hands it to the agent, records the
//! result in the progress journal and decides whether to continue. Serial
//! mode runs one agent at a time with a restart budget for timeouts.
//! Parallel mode batches tickets with disjoint component tags and runs each
//! in its own git worktree.

mod parallel;
mod serial;
#[cfg(test)]
mod tests;

pub use parallel::{UNTAGGED_COMPONENT, select_batch};

use crate::agent::{AgentError, AgentRequest, AgentRunner, AttemptOutcome, OutputPlan, TIMEOUT_EXIT_CODE};
use crate::artifacts::{close_summary_path, read_artifacts};
use crate::config::{RalphConfig, warn_legacy_sessions_once};
use crate::lessons::LessonsFile;
use crate::logger::Logger;
use crate::loop_lock::{self, LockError};
use crate::paths::{ProjectPaths, expand_home};
use crate::progress::{JournalStatus, ProgressError, ProgressJournal, TicketRecord, TicketStatus};
use crate::progress_indicator::ProgressIndicator;
use crate::redact::sanitize_command;
use crate::session_store::SessionStore;
use crate::ticket::is_valid_ticket_id;
use crate::ticket_source::TicketSource;
use crate::worktree::WorktreeManager;
use serde_json::json;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// The line printed on stdout when a loop finishes cleanly.
pub const COMPLETION_PROMISE: &str = "<promise>COMPLETE</promise>";

/// Why a loop run stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionReason {
    /// The completion check reported no ready tickets.
    BacklogEmpty,
    /// `maxIterations` tickets were processed.
    MaxIterations,
    /// The ticket query came back empty `maxIterations` times in a row.
    NoTicket,
    /// A single `run` finished its ticket.
    TicketComplete,
    /// The agent exited non-zero.
    TicketFailed { ticket: String, code: i32 },
    /// Every attempt on the ticket timed out.
    TimeoutExhausted { ticket: String, attempts: u32 },
    /// Nothing was spawned.
    DryRun,
}

impl CompletionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BacklogEmpty => "backlog_empty",
            Self::MaxIterations => "max_iterations_reached",
            Self::NoTicket => "no_ticket",
            Self::TicketComplete => "ticket_complete",
            Self::TicketFailed { .. } => "ticket_failed",
            Self::TimeoutExhausted { .. } => "timeout_exhausted",
            Self::DryRun => "dry_run",
        }
    }

    /// Process exit code for this reason.
    ///
    /// - 0: backlog empty, iteration cap, idle cap, dry run
    /// - n: the failing agent's exit code
    /// - 124: restart budget exhausted by timeouts
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::TicketFailed { code, .. } => *code,
            Self::TimeoutExhausted { .. } => TIMEOUT_EXIT_CODE,
            _ => 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code() == 0
    }
}

/// Summary of one loop run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub reason: CompletionReason,
    /// Tickets attempted during this run.
    pub iterations: u32,
    pub completed: u32,
    pub failed: u32,
}

impl LoopOutcome {
    pub fn exit_code(&self) -> i32 {
        self.reason.exit_code()
    }
}

/// Errors that abort a loop before it can reach a completion reason.
#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Progress(#[from] ProgressError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("invalid ticket id {0:?}")]
    InvalidTicket(String),

    #[error("failed to append lessons to {path}: {source}")]
    Lessons {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Per-invocation switches that are not part of the persisted config.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopOptions {
    /// Select and log, but spawn nothing and write nothing.
    pub dry_run: bool,
    /// Show the `[n/total]` indicator (serial mode only).
    pub progress: bool,
}

/// Counters for the current run.
#[derive(Debug, Clone, Copy, Default)]
struct RunStats {
    iterations: u32,
    completed: u32,
    failed: u32,
}

/// Execution mode picked at loop start.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Mode {
    Serial,
    Parallel { repo_root: PathBuf },
}

impl Mode {
    fn label(&self) -> &'static str {
        match self {
            Self::Serial => "serial",
            Self::Parallel { .. } => "parallel",
        }
    }
}

/// Drives tickets through the agent.
pub struct RalphLoop {
    paths: ProjectPaths,
    config: RalphConfig,
    logger: Logger,
    tickets: Arc<dyn TicketSource>,
    agent: Arc<dyn AgentRunner>,
    worktrees: Arc<dyn WorktreeManager>,
    options: LoopOptions,
    journal: ProgressJournal,
    lessons: LessonsFile,
    stdout: Box<dyn Write + Send>,
    progress_output: Option<(Box<dyn Write + Send>, bool)>,
    stats: RunStats,
    /// Journal status this run has set, `None` before the first write.
    phase: Option<JournalStatus>,
}

impl RalphLoop {
    pub fn new(
        paths: ProjectPaths,
        config: RalphConfig,
        logger: Logger,
        tickets: Arc<dyn TicketSource>,
        agent: Arc<dyn AgentRunner>,
        worktrees: Arc<dyn WorktreeManager>,
    ) -> Self {
        let journal = ProgressJournal::new(paths.progress_path());
        let lessons = LessonsFile::new(paths.lessons_path());
        Self {
            paths,
            config,
            logger,
            tickets,
            agent,
            worktrees,
            options: LoopOptions::default(),
            journal,
            lessons,
            stdout: Box::new(io::stdout()),
            progress_output: None,
            stats: RunStats::default(),
            phase: None,
        }
    }

    pub fn with_options(mut self, options: LoopOptions) -> Self {
        self.options = options;
        self
    }

    /// Replaces stdout as the destination of the completion promise.
    pub fn with_stdout(mut self, out: impl Write + Send + 'static) -> Self {
        self.stdout = Box::new(out);
        self
    }

    /// Sends the progress indicator to `out` instead of stderr.
    pub fn with_progress_output(mut self, out: impl Write + Send + 'static, tty: bool) -> Self {
        self.progress_output = Some((Box::new(out), tty));
        self
    }

    pub fn config(&self) -> &RalphConfig {
        &self.config
    }

    pub fn journal(&self) -> &ProgressJournal {
        &self.journal
    }

    /// Runs the loop until the backlog drains, a cap is hit or a ticket fails.
    pub async fn start(&mut self) -> Result<LoopOutcome, LoopError> {
        self.tickets.reset_caches();
        self.stats = RunStats::default();
        self.phase = None;

        if self.options.dry_run {
            return self.dry_run().await;
        }

        self.agent.preflight().await?;
        let _lock = loop_lock::acquire(&self.paths.lock_path())?;

        let mode = self.choose_mode().await;
        if self.options.progress && mode != Mode::Serial {
            self.logger.warn(
                "Progress indicator requires serial mode; disabling it",
                &[("event", json!("progress_disabled"))],
            );
            self.options.progress = false;
        }

        self.journal.ensure()?;
        self.set_phase(JournalStatus::Running, None)?;
        self.log_loop_start(&mode, &[]);

        let result = match &mode {
            Mode::Serial => self.run_serial().await,
            Mode::Parallel { repo_root } => self.run_parallel(repo_root).await,
        };
        self.finish(result, true, None)
    }

    /// Processes exactly one ticket: `ticket`, or whatever the query selects.
    pub async fn run_ticket(&mut self, ticket: Option<String>) -> Result<LoopOutcome, LoopError> {
        self.tickets.reset_caches();
        self.stats = RunStats::default();
        self.phase = None;

        let ticket = match ticket {
            Some(id) if !is_valid_ticket_id(&id) => return Err(LoopError::InvalidTicket(id)),
            Some(id) => Some(id),
            None => self.select_ticket(1).await,
        };
        let Some(ticket) = ticket else {
            return Ok(self.outcome(CompletionReason::NoTicket));
        };

        if self.options.dry_run {
            self.log_dry_run_command(&ticket, self.paths.root().to_path_buf(), self.attempt_timeout())?;
            self.log_journal_stats();
            return Ok(self.outcome(CompletionReason::DryRun));
        }

        self.agent.preflight().await?;
        let _lock = loop_lock::acquire(&self.paths.lock_path())?;

        self.journal.ensure()?;
        self.set_phase(JournalStatus::Running, Some(ticket.as_str()))?;
        self.log_loop_start(&Mode::Serial, &[("ticket", json!(ticket))]);

        let result = self.process_ticket(&ticket, 1).await.map(|failure| {
            self.stats.iterations = 1;
            failure.unwrap_or(CompletionReason::TicketComplete)
        });
        self.finish(result, false, Some(ticket.as_str()))
    }

    /// The ticket the query selects, if it names a usable id. Logs why
    /// nothing was selected otherwise.
    pub(super) async fn select_ticket(&self, iteration: u32) -> Option<String> {
        let Some(id) = self.tickets.select().await else {
            self.logger.log_no_ticket_selected("query_empty", iteration);
            return None;
        };
        let id = self.usable_id(id);
        if id.is_none() {
            self.logger.log_no_ticket_selected("invalid_ticket_id", iteration);
        }
        id
    }

    /// Drops ids that cannot name a worktree or log file.
    pub(super) fn usable_id(&self, id: String) -> Option<String> {
        if is_valid_ticket_id(&id) {
            return Some(id);
        }
        self.logger.warn(
            "Ignoring invalid ticket id",
            &[("event", json!("invalid_ticket_id")), ("ticket", json!(id))],
        );
        None
    }

    /// Demotes parallel mode to serial when it cannot run safely.
    async fn choose_mode(&self) -> Mode {
        let workers = ("workers", json!(self.config.parallel_workers));
        if self.config.parallel_workers <= 1 {
            self.logger.log_decision("serial", "single_worker", &[workers]);
            return Mode::Serial;
        }

        if self.config.attempt_timeout_ms > 0 || self.config.max_restarts > 0 {
            self.logger.warn(
                "Parallel mode does not support attempt timeouts or restarts; running serially",
                &[
                    ("event", json!("mode_demoted")),
                    ("attempt_timeout_ms", json!(self.config.attempt_timeout_ms)),
                    ("max_restarts", json!(self.config.max_restarts)),
                ],
            );
            self.logger
                .log_decision("serial", "timeout_or_restarts", &[workers]);
            return Mode::Serial;
        }

        match self.worktrees.repo_root(self.paths.root()).await {
            Some(repo_root) => {
                self.logger.log_decision(
                    "parallel",
                    "workers_available",
                    &[workers, ("repo_root", json!(repo_root.display().to_string()))],
                );
                Mode::Parallel { repo_root }
            }
            None => {
                self.logger.warn(
                    "Parallel mode needs a git repository; running serially",
                    &[("event", json!("mode_demoted")), ("reason", json!("no_repo_root"))],
                );
                self.logger.log_decision("serial", "no_repo_root", &[workers]);
                Mode::Serial
            }
        }
    }

    fn log_loop_start(&self, mode: &Mode, extra: &[(&str, serde_json::Value)]) {
        let mut fields = vec![
            ("workers", json!(self.workers_for(mode))),
            ("workflow", json!(self.config.workflow)),
            ("attempt_timeout_ms", json!(self.config.attempt_timeout_ms)),
            ("max_restarts", json!(self.config.max_restarts)),
        ];
        if let Some(session) = self.active_session() {
            fields.push(("session", json!(session)));
        }
        fields.extend_from_slice(extra);
        self.logger
            .log_loop_start(mode.label(), self.config.max_iterations, &fields);
    }

    fn workers_for(&self, mode: &Mode) -> u32 {
        match mode {
            Mode::Serial => 1,
            Mode::Parallel { .. } => self.config.parallel_workers,
        }
    }

    /// Id of the active planning session, if sessions are enabled and one is open.
    fn active_session(&self) -> Option<String> {
        let resolution = self.config.resolve_session_dir(&self.paths);
        if let Some(message) = &resolution.legacy_warning {
            warn_legacy_sessions_once(|| {
                self.logger
                    .warn(message, &[("event", json!("legacy_session_dir"))]);
            });
        }
        let dir = resolution.path?;
        match SessionStore::new(&dir).load_active() {
            Ok(session) => session.map(|s| s.session_id),
            Err(e) => {
                debug!(dir = %dir.display(), error = %e, "Could not read active planning session");
                None
            }
        }
    }

    /// Writes the journal status and logs the change.
    fn set_phase(&mut self, to: JournalStatus, ticket: Option<&str>) -> Result<(), ProgressError> {
        self.journal.set_state(to)?;
        let from = self
            .phase
            .replace(to)
            .map_or_else(|| "NOT_STARTED".to_string(), |s| s.to_string());
        self.logger
            .log_phase_transition(ticket.unwrap_or("-"), &from, &to.to_string());
        Ok(())
    }

    /// Updates the journal status and logs the completion event.
    fn finish(
        &mut self,
        result: Result<CompletionReason, LoopError>,
        emit_promise: bool,
        ticket: Option<&str>,
    ) -> Result<LoopOutcome, LoopError> {
        let reason = match result {
            Ok(reason) => reason,
            Err(e) => {
                if let Err(state_err) = self.set_phase(JournalStatus::Failed, ticket) {
                    warn!(error = %state_err, "Failed to mark journal FAILED");
                }
                return Err(e);
            }
        };

        if reason.is_success() {
            self.set_phase(JournalStatus::Complete, ticket)?;
            if emit_promise && self.config.promise_on_complete {
                self.emit_promise();
            }
        } else {
            self.set_phase(JournalStatus::Failed, ticket)?;
        }

        self.logger.log_loop_complete(
            reason.as_str(),
            self.stats.iterations,
            self.stats.completed,
            self.stats.failed,
        );
        Ok(self.outcome(reason))
    }

    fn emit_promise(&mut self) {
        let written = writeln!(self.stdout, "{COMPLETION_PROMISE}").and_then(|()| self.stdout.flush());
        if let Err(e) = written {
            warn!(error = %e, "Failed to write completion promise");
        }
    }

    fn outcome(&self, reason: CompletionReason) -> LoopOutcome {
        LoopOutcome {
            reason,
            iterations: self.stats.iterations,
            completed: self.stats.completed,
            failed: self.stats.failed,
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Shared helpers for both modes
    // ─────────────────────────────────────────────────────────────────────

    fn attempt_timeout(&self) -> Option<Duration> {
        (self.config.attempt_timeout_ms > 0).then(|| Duration::from_millis(self.config.attempt_timeout_ms))
    }

    /// Builds the request for one attempt on `ticket` in `cwd`. Agent logs
    /// always land under the main project, even for worktree runs.
    fn request_for(
        &self,
        ticket: &str,
        cwd: PathBuf,
        timeout: Option<Duration>,
    ) -> Result<AgentRequest, AgentError> {
        let logs_dir = self.paths.resolve(&self.config.logs_dir);
        let custom_log = self
            .config
            .pi_output_file
            .as_deref()
            .map(|f| self.paths.resolve(expand_home(f)));
        let output = OutputPlan::resolve(
            self.config.pi_output,
            custom_log.as_deref(),
            self.config.capture_json,
            &logs_dir,
            ticket,
        )?;
        Ok(AgentRequest {
            ticket: ticket.to_string(),
            workflow: self.config.workflow.clone(),
            flags: self.config.workflow_flags.clone(),
            cwd,
            output,
            json_mode: self.config.capture_json,
            timeout,
        })
    }

    /// Journals a finished ticket. Returns the reason to stop when it failed.
    ///
    /// Artifacts are read from `knowledge_dir`; the summary falls back to the
    /// ticket title when the close summary has none.
    fn record_outcome(
        &mut self,
        ticket: &str,
        title: Option<String>,
        outcome: AttemptOutcome,
        attempts: u32,
        knowledge_dir: &Path,
        log_path: Option<&Path>,
        iteration: u32,
    ) -> Result<Option<CompletionReason>, LoopError> {
        let artifacts = read_artifacts(knowledge_dir, ticket);
        let status = if outcome.is_success() {
            TicketStatus::Complete
        } else {
            TicketStatus::Failed
        };
        let mut record = TicketRecord::new(ticket, status);
        record.summary = artifacts.close.summary.clone().or(title);
        record.issues = artifacts.issues;
        record.commit = artifacts.close.commit.clone();

        let failure = match outcome {
            AttemptOutcome::Success => None,
            AttemptOutcome::Failed { code } => Some((
                format!("exit {code}"),
                CompletionReason::TicketFailed {
                    ticket: ticket.to_string(),
                    code,
                },
            )),
            AttemptOutcome::TimedOut => Some((
                format!("timeout after {attempts} attempts"),
                CompletionReason::TimeoutExhausted {
                    ticket: ticket.to_string(),
                    attempts,
                },
            )),
        };

        let Some((error, reason)) = failure else {
            self.journal.update(&record)?;
            self.stats.completed += 1;
            self.logger
                .log_ticket_complete(ticket, status.as_str(), iteration, None);
            if let Some(block) = &artifacts.close.lessons {
                self.append_lessons(ticket, block)?;
            }
            return Ok(None);
        };

        record.error = Some(error.clone());
        self.journal.update(&record)?;
        self.stats.failed += 1;
        self.logger
            .log_ticket_complete(ticket, status.as_str(), iteration, Some(&error));
        let artifact = log_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| close_summary_path(knowledge_dir, ticket));
        self.logger.log_error_summary(
            Some(ticket),
            &format!("Ticket {ticket} failed: {error}"),
            Some(&artifact),
        );
        Ok(Some(reason))
    }

    /// Journals a ticket that never produced an outcome.
    fn record_failure(
        &mut self,
        ticket: &str,
        title: Option<String>,
        error: &str,
        iteration: u32,
    ) -> Result<(), LoopError> {
        let mut record = TicketRecord::new(ticket, TicketStatus::Failed);
        record.summary = title;
        record.error = Some(error.to_string());
        self.journal.update(&record)?;
        self.stats.failed += 1;
        self.logger
            .log_ticket_complete(ticket, TicketStatus::Failed.as_str(), iteration, Some(error));
        Ok(())
    }

    fn append_lessons(&self, ticket: &str, block: &str) -> Result<(), LoopError> {
        match self.lessons.append(ticket, block) {
            Ok(true) => {
                debug!(ticket, path = %self.lessons.path().display(), "Appended lessons");
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(source) => Err(LoopError::Lessons {
                path: self.lessons.path().to_path_buf(),
                source,
            }),
        }
    }

    fn progress_indicator(&mut self, total: u32) -> ProgressIndicator<Box<dyn Write + Send>> {
        match self.progress_output.take() {
            Some((out, tty)) => ProgressIndicator::new(out, tty, total),
            None => ProgressIndicator::stderr(total),
        }
    }

    async fn sleep_ms(&self, ms: u64) {
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Dry run
    // ─────────────────────────────────────────────────────────────────────

    async fn dry_run(&mut self) -> Result<LoopOutcome, LoopError> {
        let mode = self.choose_mode().await;
        self.log_loop_start(&mode, &[("dry_run", json!(true))]);

        match &mode {
            Mode::Serial => {
                if let Some(ticket) = self.select_ticket(1).await {
                    self.log_dry_run_command(&ticket, self.paths.root().to_path_buf(), self.attempt_timeout())?;
                }
            }
            Mode::Parallel { .. } => {
                let limit = self.config.parallel_workers.min(self.config.max_iterations) as usize;
                let batch = self.next_batch(limit).await;
                if batch.is_empty() {
                    self.logger.log_no_ticket_selected("query_empty", 1);
                }
                let worktrees_dir = self.paths.resolve(&self.config.parallel_worktrees_dir);
                for ticket in &batch {
                    self.log_dry_run_command(ticket, worktrees_dir.join(ticket), None)?;
                }
            }
        }

        self.log_journal_stats();
        Ok(self.outcome(CompletionReason::DryRun))
    }

    fn log_dry_run_command(
        &self,
        ticket: &str,
        cwd: PathBuf,
        timeout: Option<Duration>,
    ) -> Result<(), LoopError> {
        let request = self.request_for(ticket, cwd, timeout)?;
        let argv = self.agent.command_line(&request);
        self.logger.info(
            "Dry run: would execute",
            &[
                ("event", json!("dry_run")),
                ("ticket", json!(ticket)),
                ("cwd", json!(request.cwd.display().to_string())),
                ("command", json!(sanitize_command(&argv.join(" ")))),
            ],
        );
        Ok(())
    }

    fn log_journal_stats(&self) {
        if !self.journal.path().exists() {
            return;
        }
        match self.journal.snapshot() {
            Ok(snapshot) => self.logger.info(
                "Current progress",
                &[
                    ("event", json!("progress_stats")),
                    ("status", json!(snapshot.status)),
                    ("completed", json!(snapshot.completed)),
                    ("failed", json!(snapshot.failed)),
                    ("iterations", json!(snapshot.iterations)),
                ],
            ),
            Err(e) => self.logger.warn(
                "Progress journal is unreadable",
                &[("event", json!("progress_stats")), ("error", json!(e.to_string()))],
            ),
        }
    }
}
