//! Serial mode: one agent at a time, with restarts on timeout.

use super::{CompletionReason, LoopError, RalphLoop};
use crate::agent::AttemptOutcome;
use serde_json::json;
use tracing::debug;

impl RalphLoop {
    pub(super) async fn run_serial(&mut self) -> Result<CompletionReason, LoopError> {
        let max = self.config.max_iterations;
        let mut idle_polls = 0u32;
        let mut progress = if self.options.progress {
            Some(self.progress_indicator(max))
        } else {
            None
        };

        while self.stats.iterations < max {
            if self.tickets.backlog_empty().await {
                return Ok(CompletionReason::BacklogEmpty);
            }

            let Some(ticket) = self.select_ticket(self.stats.iterations + 1).await else {
                idle_polls += 1;
                if idle_polls >= max {
                    return Ok(CompletionReason::NoTicket);
                }
                self.sleep_ms(self.config.sleep_between_retries_ms).await;
                continue;
            };
            idle_polls = 0;

            let iteration = self.stats.iterations + 1;
            if let Some(p) = progress.as_mut()
                && let Err(e) = p.update(iteration, &format!("Processing {ticket}"))
            {
                debug!(error = %e, "Progress update failed");
            }

            let failure = self.process_ticket(&ticket, iteration).await?;
            self.stats.iterations = iteration;

            if let Some(p) = progress.as_mut() {
                let status = if failure.is_some() { "FAILED" } else { "COMPLETE" };
                if let Err(e) = p.finish(iteration, &format!("{ticket} {status}")) {
                    debug!(error = %e, "Progress update failed");
                }
            }

            if let Some(reason) = failure {
                return Ok(reason);
            }
            if self.stats.iterations < max {
                self.sleep_ms(self.config.sleep_between_tickets_ms).await;
            }
        }

        Ok(CompletionReason::MaxIterations)
    }

    /// Runs `ticket` in the project root with the restart budget and
    /// journals the result. Only timeouts are retried.
    pub(super) async fn process_ticket(
        &mut self,
        ticket: &str,
        iteration: u32,
    ) -> Result<Option<CompletionReason>, LoopError> {
        let title = self.tickets.title(ticket).await;
        self.logger
            .log_ticket_start(ticket, iteration, title.as_deref());

        let request = self.request_for(ticket, self.paths.root().to_path_buf(), self.attempt_timeout())?;
        self.journal.set_current_ticket(Some(ticket))?;

        let max_attempts = self.config.max_restarts.saturating_add(1);
        let mut attempts = 0u32;
        let outcome = loop {
            attempts += 1;
            let outcome = match self.agent.run(&request).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.record_failure(ticket, title, &e.to_string(), iteration)?;
                    return Err(e.into());
                }
            };
            self.logger
                .log_tool_execution(&self.config.agent_command, Some(ticket), Some(outcome.code()));

            if outcome == AttemptOutcome::TimedOut && attempts < max_attempts {
                self.logger.warn(
                    "Attempt timed out; restarting",
                    &[
                        ("event", json!("attempt_restart")),
                        ("ticket", json!(ticket)),
                        ("attempt", json!(attempts)),
                        ("max_attempts", json!(max_attempts)),
                    ],
                );
                continue;
            }
            break outcome;
        };

        if outcome == AttemptOutcome::TimedOut {
            self.logger.error(
                "Restart budget exhausted",
                &[
                    ("event", json!("restarts_exhausted")),
                    ("ticket", json!(ticket)),
                    ("attempts", json!(attempts)),
                ],
            );
        }

        let knowledge_dir = self.paths.resolve(&self.config.knowledge_dir);
        self.record_outcome(
            ticket,
            title,
            outcome,
            attempts,
            &knowledge_dir,
            request.output.log_path(),
            iteration,
        )
    }
}
