//! In-memory doubles for the loop's collaborators.
//!
//! Used by this crate's tests and by downstream crates that want to drive a
//! [`crate::RalphLoop`] without a ticket store, an agent binary or git.

use crate::agent::{AgentError, AgentRequest, AgentRunner, AttemptOutcome};
use crate::artifacts::{CLOSE_SUMMARY_FILE, REVIEW_FILE};
use crate::paths::ticket_artifact_dir;
use crate::ticket::TicketDocument;
use crate::ticket_source::TicketSource;
use crate::worktree::{WorktreeError, WorktreeManager, WorktreeRemoval};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─────────────────────────────────────────────────────────────────────────────
// Captured writer
// ─────────────────────────────────────────────────────────────────────────────

/// Cloneable in-memory writer; every clone appends to the same buffer.
#[derive(Debug, Clone, Default)]
pub struct CapturedOutput {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl CapturedOutput {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&lock(&self.buf)).into_owned()
    }
}

impl Write for CapturedOutput {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        lock(&self.buf).extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Ticket source
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct FakeTickets {
    ready: Vec<String>,
    tags: HashMap<String, Vec<String>>,
    titles: HashMap<String, String>,
    /// Consumed by `select` before falling back to the head of `ready`.
    scripted_selects: VecDeque<Option<String>>,
    never_empty: bool,
    resets: usize,
}

/// Ticket store backed by an ordered ready list.
///
/// `select` returns the head of the list without removing it, the way
/// `tk ready | head -1` does; tickets leave the list through
/// [`FakeTicketSource::close`], usually called by a [`FakeAgentRunner`].
#[derive(Debug, Default)]
pub struct FakeTicketSource {
    inner: Mutex<FakeTickets>,
}

impl FakeTicketSource {
    pub fn new<I, S>(ready: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let source = Self::default();
        lock(&source.inner).ready = ready.into_iter().map(Into::into).collect();
        source
    }

    pub fn with_tags(self, id: &str, tags: &[&str]) -> Self {
        lock(&self.inner)
            .tags
            .insert(id.to_string(), tags.iter().map(|t| (*t).to_string()).collect());
        self
    }

    pub fn with_title(self, id: &str, title: &str) -> Self {
        lock(&self.inner)
            .titles
            .insert(id.to_string(), title.to_string());
        self
    }

    /// Queues explicit `select` results.
    pub fn with_selects<I>(self, selects: I) -> Self
    where
        I: IntoIterator<Item = Option<&'static str>>,
    {
        lock(&self.inner)
            .scripted_selects
            .extend(selects.into_iter().map(|s| s.map(str::to_string)));
        self
    }

    /// The completion check never reports an empty backlog.
    pub fn never_empty(self) -> Self {
        lock(&self.inner).never_empty = true;
        self
    }

    /// Removes `id` from the ready list.
    pub fn close(&self, id: &str) {
        lock(&self.inner).ready.retain(|t| t != id);
    }

    pub fn ready(&self) -> Vec<String> {
        lock(&self.inner).ready.clone()
    }

    pub fn reset_count(&self) -> usize {
        lock(&self.inner).resets
    }
}

#[async_trait]
impl TicketSource for FakeTicketSource {
    async fn select(&self) -> Option<String> {
        let mut inner = lock(&self.inner);
        if let Some(scripted) = inner.scripted_selects.pop_front() {
            return scripted;
        }
        inner.ready.first().cloned()
    }

    async fn list_ready(&self) -> Vec<String> {
        lock(&self.inner).ready.clone()
    }

    async fn backlog_empty(&self) -> bool {
        let inner = lock(&self.inner);
        !inner.never_empty && inner.ready.is_empty() && inner.scripted_selects.is_empty()
    }

    async fn tags(&self, id: &str) -> Vec<String> {
        lock(&self.inner).tags.get(id).cloned().unwrap_or_default()
    }

    async fn title(&self, id: &str) -> Option<String> {
        lock(&self.inner).titles.get(id).cloned()
    }

    async fn show(&self, id: &str) -> Option<TicketDocument> {
        let inner = lock(&self.inner);
        Some(TicketDocument {
            title: inner.titles.get(id).cloned(),
            tags: inner.tags.get(id).cloned().unwrap_or_default(),
            status: Some("open".to_string()),
            deps: Vec::new(),
        })
    }

    fn reset_caches(&self) {
        lock(&self.inner).resets += 1;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Agent runner
// ─────────────────────────────────────────────────────────────────────────────

/// Artifacts a fake agent writes for a ticket before exiting.
#[derive(Debug, Clone, Default)]
pub struct FakeArtifacts {
    pub close_summary: Option<String>,
    pub review: Option<String>,
}

/// Agent double with scripted outcomes.
///
/// Each ticket pops from its outcome queue; an empty queue means success.
/// Successful tickets are closed on the linked [`FakeTicketSource`].
#[derive(Debug, Default)]
pub struct FakeAgentRunner {
    outcomes: Mutex<HashMap<String, VecDeque<AttemptOutcome>>>,
    artifacts: Mutex<HashMap<String, FakeArtifacts>>,
    calls: Mutex<Vec<AgentRequest>>,
    delays: Mutex<HashMap<String, Duration>>,
    closes: Option<Arc<FakeTicketSource>>,
    preflight_error: Option<String>,
    knowledge_dir: Option<PathBuf>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl FakeAgentRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Closes tickets on `source` when they succeed.
    pub fn closing(mut self, source: Arc<FakeTicketSource>) -> Self {
        self.closes = Some(source);
        self
    }

    pub fn with_outcomes(self, ticket: &str, outcomes: &[AttemptOutcome]) -> Self {
        lock(&self.outcomes).insert(ticket.to_string(), outcomes.iter().copied().collect());
        self
    }

    pub fn with_artifacts(self, ticket: &str, artifacts: FakeArtifacts) -> Self {
        lock(&self.artifacts).insert(ticket.to_string(), artifacts);
        self
    }

    pub fn with_delay(self, ticket: &str, delay: Duration) -> Self {
        lock(&self.delays).insert(ticket.to_string(), delay);
        self
    }

    pub fn failing_preflight(mut self, message: &str) -> Self {
        self.preflight_error = Some(message.to_string());
        self
    }

    /// Knowledge directory, relative to the request cwd, that artifacts are
    /// written under. Defaults to `.tf/knowledge`.
    pub fn with_knowledge_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.knowledge_dir = Some(dir.into());
        self
    }

    pub fn calls(&self) -> Vec<AgentRequest> {
        lock(&self.calls).clone()
    }

    pub fn call_tickets(&self) -> Vec<String> {
        lock(&self.calls).iter().map(|c| c.ticket.clone()).collect()
    }

    /// Highest number of attempts observed running at once.
    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn write_artifacts(&self, request: &AgentRequest) -> io::Result<()> {
        let Some(artifacts) = lock(&self.artifacts).get(&request.ticket).cloned() else {
            return Ok(());
        };
        let knowledge = self
            .knowledge_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(".tf/knowledge"));
        let dir = ticket_artifact_dir(&request.cwd.join(knowledge), &request.ticket);
        std::fs::create_dir_all(&dir)?;
        if let Some(text) = &artifacts.close_summary {
            std::fs::write(dir.join(CLOSE_SUMMARY_FILE), text)?;
        }
        if let Some(text) = &artifacts.review {
            std::fs::write(dir.join(REVIEW_FILE), text)?;
        }
        Ok(())
    }
}

#[async_trait]
impl AgentRunner for FakeAgentRunner {
    async fn preflight(&self) -> Result<(), AgentError> {
        match &self.preflight_error {
            Some(message) => Err(AgentError::NotFound(message.clone())),
            None => Ok(()),
        }
    }

    fn command_line(&self, request: &AgentRequest) -> Vec<String> {
        vec!["pi".to_string(), "-p".to_string(), request.prompt()]
    }

    async fn run(&self, request: &AgentRequest) -> Result<AttemptOutcome, AgentError> {
        lock(&self.calls).push(request.clone());

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);

        let delay = lock(&self.delays).get(&request.ticket).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        } else {
            tokio::task::yield_now().await;
        }

        let outcome = lock(&self.outcomes)
            .get_mut(&request.ticket)
            .and_then(VecDeque::pop_front)
            .unwrap_or(AttemptOutcome::Success);

        if outcome.is_success() {
            self.write_artifacts(request).map_err(AgentError::Wait)?;
            if let Some(source) = &self.closes {
                source.close(&request.ticket);
            }
        }

        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(outcome)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Worktrees
// ─────────────────────────────────────────────────────────────────────────────

/// Worktree manager that creates plain directories.
#[derive(Debug, Default)]
pub struct FakeWorktrees {
    repo_root: Option<PathBuf>,
    fail_create: Mutex<HashMap<String, String>>,
    fail_git_remove: bool,
    created: Mutex<Vec<(PathBuf, String)>>,
    removed: Mutex<Vec<PathBuf>>,
}

impl FakeWorktrees {
    /// A manager that reports `repo_root` as the version-control root.
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: Some(repo_root.into()),
            ..Self::default()
        }
    }

    /// A manager with no repository: parallel mode cannot run.
    pub fn without_repo() -> Self {
        Self::default()
    }

    /// Fails creation for any path ending in `ticket`, with `stderr`.
    pub fn failing_create(self, ticket: &str, stderr: &str) -> Self {
        lock(&self.fail_create).insert(ticket.to_string(), stderr.to_string());
        self
    }

    /// Makes the git removal path fail so the fallback runs.
    pub fn failing_git_remove(mut self) -> Self {
        self.fail_git_remove = true;
        self
    }

    pub fn created(&self) -> Vec<(PathBuf, String)> {
        lock(&self.created).clone()
    }

    pub fn removed(&self) -> Vec<PathBuf> {
        lock(&self.removed).clone()
    }
}

#[async_trait]
impl WorktreeManager for FakeWorktrees {
    async fn repo_root(&self, _start: &Path) -> Option<PathBuf> {
        self.repo_root.clone()
    }

    async fn create(&self, _repo_root: &Path, path: &Path, branch: &str) -> Result<(), WorktreeError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if let Some(stderr) = lock(&self.fail_create).get(&name) {
            return Err(WorktreeError::Git(stderr.clone()));
        }
        if path.exists() {
            std::fs::remove_dir_all(path)?;
        }
        std::fs::create_dir_all(path)?;
        lock(&self.created).push((path.to_path_buf(), branch.to_string()));
        Ok(())
    }

    async fn remove(&self, _repo_root: &Path, path: &Path) -> Result<WorktreeRemoval, WorktreeError> {
        if path.exists() {
            std::fs::remove_dir_all(path)?;
        }
        lock(&self.removed).push(path.to_path_buf());
        if self.fail_git_remove {
            Ok(WorktreeRemoval::Fallback {
                git_error: "fatal: not a working tree".to_string(),
            })
        } else {
            Ok(WorktreeRemoval::Git)
        }
    }
}

/// Set of ids, for assertions that ignore order.
pub fn id_set<I, S>(ids: I) -> HashSet<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    ids.into_iter().map(Into::into).collect()
}
