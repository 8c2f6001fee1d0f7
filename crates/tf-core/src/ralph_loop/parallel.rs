//! Parallel mode: batches of tickets with disjoint component tags, each run
//! in its own worktree.

use super::{CompletionReason, LoopError, RalphLoop};
use crate::agent::AgentRequest;
use crate::paths::ProjectPaths;
use crate::ticket::TicketRef;
use crate::worktree::{WorktreeRemoval, branch_for};
use futures::future::join_all;
use serde_json::json;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Component claimed by tickets without a component tag, so at most one
/// untagged ticket lands in a batch.
pub const UNTAGGED_COMPONENT: &str = "__untagged__";

/// Picks up to `limit` tickets, in order, whose component tags do not overlap.
///
/// Tickets without a component tag are skipped unless `allow_untagged` is
/// set, in which case they all share [`UNTAGGED_COMPONENT`].
pub fn select_batch(
    candidates: &[TicketRef],
    prefix: &str,
    allow_untagged: bool,
    limit: usize,
) -> Vec<TicketRef> {
    let mut claimed: HashSet<&str> = HashSet::new();
    let mut batch = Vec::new();

    for ticket in candidates {
        if batch.len() >= limit {
            break;
        }
        let mut components = ticket.component_tags(prefix);
        if components.is_empty() {
            if !allow_untagged {
                continue;
            }
            components.push(UNTAGGED_COMPONENT);
        }
        if components.iter().any(|c| claimed.contains(c)) {
            continue;
        }
        claimed.extend(components);
        batch.push(ticket.clone());
    }
    batch
}

/// A ticket whose worktree exists and whose agent is about to run.
struct Launch {
    ticket: String,
    title: Option<String>,
    iteration: u32,
    worktree: PathBuf,
    request: AgentRequest,
}

impl RalphLoop {
    pub(super) async fn run_parallel(&mut self, repo_root: &Path) -> Result<CompletionReason, LoopError> {
        let max = self.config.max_iterations;
        let mut idle_polls = 0u32;

        while self.stats.iterations < max {
            if self.tickets.backlog_empty().await {
                return Ok(CompletionReason::BacklogEmpty);
            }

            let limit = self.config.parallel_workers.min(max - self.stats.iterations) as usize;
            let batch = self.next_batch(limit).await;
            if batch.is_empty() {
                idle_polls += 1;
                self.logger
                    .log_no_ticket_selected("query_empty", self.stats.iterations + 1);
                if idle_polls >= max {
                    return Ok(CompletionReason::NoTicket);
                }
                self.sleep_ms(self.config.sleep_between_retries_ms).await;
                continue;
            }
            idle_polls = 0;

            let failure = self.run_batch(repo_root, &batch).await?;
            self.stats.iterations = self.stats.iterations.saturating_add(batch.len() as u32).min(max);
            if let Some(reason) = failure {
                return Ok(reason);
            }
            if self.stats.iterations < max {
                self.sleep_ms(self.config.sleep_between_tickets_ms).await;
            }
        }

        Ok(CompletionReason::MaxIterations)
    }

    /// Lists ready tickets and picks a component-diverse batch, falling back
    /// to a single selected ticket when none qualifies.
    pub(super) async fn next_batch(&self, limit: usize) -> Vec<String> {
        let prefix = &self.config.component_tag_prefix;
        let mut candidates = Vec::new();
        let ready = self.tickets.list_ready().await;
        for id in ready.into_iter().filter_map(|id| self.usable_id(id)) {
            let tags = self.tickets.tags(&id).await;
            candidates.push(TicketRef::new(id).with_tags(tags));
        }

        let batch = select_batch(&candidates, prefix, self.config.parallel_allow_untagged, limit);
        if batch.is_empty() {
            let selected = self.tickets.select().await.and_then(|id| self.usable_id(id));
            return match selected {
                Some(id) => {
                    self.logger.log_decision(
                        "single_ticket_fallback",
                        "no_component_diverse_batch",
                        &[("ticket", json!(id))],
                    );
                    self.logger
                        .log_batch_selected(std::slice::from_ref(&id), &[], "fallback");
                    vec![id]
                }
                None => Vec::new(),
            };
        }

        let mut components: Vec<String> = Vec::new();
        for ticket in &batch {
            for tag in ticket.component_tags(prefix) {
                if !components.iter().any(|c| c == tag) {
                    components.push(tag.to_string());
                }
            }
        }
        let ids: Vec<String> = batch.into_iter().map(|t| t.id).collect();
        self.logger
            .log_batch_selected(&ids, &components, "component_diversity");
        ids
    }

    /// Creates worktrees, runs the agents together and journals every result
    /// in spawn order. Returns the first failure, after the whole batch is
    /// recorded and its worktrees removed.
    async fn run_batch(
        &mut self,
        repo_root: &Path,
        batch: &[String],
    ) -> Result<Option<CompletionReason>, LoopError> {
        let worktrees_dir = self.paths.resolve(&self.config.parallel_worktrees_dir);
        let mut launches = Vec::with_capacity(batch.len());

        for (index, ticket) in batch.iter().enumerate() {
            let iteration = self.stats.iterations + index as u32 + 1;
            let title = self.tickets.title(ticket).await;
            self.logger
                .log_ticket_start(ticket, iteration, title.as_deref());

            let worktree = worktrees_dir.join(ticket);
            match self
                .worktrees
                .create(repo_root, &worktree, &branch_for(ticket))
                .await
            {
                Ok(()) => {
                    self.logger
                        .log_worktree_operation(ticket, "add", &worktree, None);
                    let request = self.request_for(ticket, worktree.clone(), None)?;
                    launches.push(Launch {
                        ticket: ticket.clone(),
                        title,
                        iteration,
                        worktree,
                        request,
                    });
                }
                Err(e) => {
                    let detail = e.detail();
                    self.logger
                        .log_worktree_operation(ticket, "add", &worktree, Some(&detail));
                    self.record_failure(ticket, title, &detail, iteration)?;
                }
            }
        }

        let results = join_all(launches.iter().map(|l| self.agent.run(&l.request))).await;

        let mut first_failure = None;
        let mut first_error = None;
        for (launch, result) in launches.into_iter().zip(results) {
            let Launch {
                ticket,
                title,
                iteration,
                worktree,
                request,
            } = launch;

            match result {
                Ok(outcome) => {
                    self.logger
                        .log_tool_execution(&self.config.agent_command, Some(&ticket), Some(outcome.code()));
                    let knowledge_dir = ProjectPaths::new(&worktree).resolve(&self.config.knowledge_dir);
                    let failure = self.record_outcome(
                        &ticket,
                        title,
                        outcome,
                        1,
                        &knowledge_dir,
                        request.output.log_path(),
                        iteration,
                    )?;
                    first_failure = first_failure.or(failure);
                }
                Err(e) => {
                    self.record_failure(&ticket, title, &e.to_string(), iteration)?;
                    first_error = first_error.or(Some(e));
                }
            }

            if self.config.parallel_keep_worktrees {
                debug!(ticket = %ticket, worktree = %worktree.display(), "Keeping worktree");
            } else {
                self.remove_worktree(repo_root, &ticket, &worktree).await;
            }
        }

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(first_failure),
        }
    }

    async fn remove_worktree(&self, repo_root: &Path, ticket: &str, worktree: &Path) {
        match self.worktrees.remove(repo_root, worktree).await {
            Ok(WorktreeRemoval::Git) => {
                self.logger
                    .log_worktree_operation(ticket, "remove", worktree, None);
            }
            Ok(WorktreeRemoval::Fallback { git_error }) => {
                self.logger.warn(
                    "git worktree remove failed; deleted directory instead",
                    &[
                        ("event", json!("worktree")),
                        ("ticket", json!(ticket)),
                        ("operation", json!("remove_fallback")),
                        ("error", json!(git_error.trim())),
                    ],
                );
            }
            Err(e) => {
                self.logger
                    .log_worktree_operation(ticket, "remove", worktree, Some(&e.detail()));
            }
        }
    }
}
