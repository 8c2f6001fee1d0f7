use super::*;
use crate::agent::AttemptOutcome;
use crate::config::{PiOutput, SessionDirSetting};
use crate::logger::LogLevel;
use crate::progress::JournalSnapshot;
use crate::session_store::SessionStore;
use crate::testing::{
    CapturedOutput, FakeAgentRunner, FakeArtifacts, FakeTicketSource, FakeWorktrees, id_set,
};
use crate::ticket::TicketRef;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn test_config() -> RalphConfig {
    RalphConfig {
        sleep_between_tickets_ms: 0,
        sleep_between_retries_ms: 0,
        session_dir: Some(SessionDirSetting::Disabled),
        ..RalphConfig::default()
    }
}

struct Harness {
    temp: TempDir,
    tickets: Arc<FakeTicketSource>,
    agent: Arc<FakeAgentRunner>,
    worktrees: Arc<FakeWorktrees>,
    log: CapturedOutput,
    stdout: CapturedOutput,
}

impl Harness {
    fn new(
        temp: TempDir,
        tickets: Arc<FakeTicketSource>,
        agent: FakeAgentRunner,
        worktrees: FakeWorktrees,
    ) -> Self {
        Self {
            temp,
            tickets,
            agent: Arc::new(agent),
            worktrees: Arc::new(worktrees),
            log: CapturedOutput::default(),
            stdout: CapturedOutput::default(),
        }
    }

    fn ralph(&self, config: RalphConfig) -> RalphLoop {
        RalphLoop::new(
            ProjectPaths::new(self.temp.path()),
            config,
            Logger::with_writer(LogLevel::Debug, self.log.clone()),
            self.tickets.clone(),
            self.agent.clone(),
            self.worktrees.clone(),
        )
        .with_stdout(self.stdout.clone())
    }

    fn paths(&self) -> ProjectPaths {
        ProjectPaths::new(self.temp.path())
    }

    fn snapshot(&self) -> JournalSnapshot {
        ProgressJournal::new(self.paths().progress_path())
            .snapshot()
            .unwrap()
    }

    fn history_ids(&self) -> Vec<String> {
        self.snapshot().history.into_iter().map(|e| e.id).collect()
    }
}

fn serial_harness(ready: &[&str]) -> (Harness, Arc<FakeTicketSource>) {
    let temp = TempDir::new().unwrap();
    let tickets = Arc::new(FakeTicketSource::new(ready.iter().copied()));
    let agent = FakeAgentRunner::new().closing(tickets.clone());
    let harness = Harness::new(temp, tickets.clone(), agent, FakeWorktrees::without_repo());
    (harness, tickets)
}

fn parallel_tickets() -> FakeTicketSource {
    FakeTicketSource::new(["pt-1", "pt-2", "pt-3", "pt-4", "pt-5"])
        .with_tags("pt-1", &["component:api"])
        .with_tags("pt-2", &["component:api"])
        .with_tags("pt-3", &["component:cli"])
        .with_tags("pt-4", &["component:cli", "component:docs"])
        .with_tags("pt-5", &["component:docs"])
}

fn parallel_config() -> RalphConfig {
    RalphConfig {
        parallel_workers: 3,
        max_iterations: 3,
        ..test_config()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Serial mode
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_happy_path_serial() {
    let temp = TempDir::new().unwrap();
    let tickets = Arc::new(FakeTicketSource::new(["pt-A"]).with_title("pt-A", "Do A"));
    let agent = FakeAgentRunner::new().closing(tickets.clone()).with_artifacts(
        "pt-A",
        FakeArtifacts {
            close_summary: Some(
                "Summary: Did A\nCommit: abc1234\n\n## Lessons Learned\n\nAlways X\n".to_string(),
            ),
            review: Some("Critical: 0\nMajor: 0\nMinor: 0\n".to_string()),
        },
    );
    let h = Harness::new(temp, tickets, agent, FakeWorktrees::without_repo());

    let config = RalphConfig {
        max_iterations: 1,
        ..test_config()
    };
    let outcome = h.ralph(config).start().await.unwrap();

    assert_eq!(outcome.reason, CompletionReason::MaxIterations);
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!((outcome.completed, outcome.failed, outcome.iterations), (1, 0, 1));

    let snapshot = h.snapshot();
    assert_eq!(snapshot.status, "COMPLETE");
    assert_eq!((snapshot.completed, snapshot.failed, snapshot.iterations), (1, 0, 1));
    assert_eq!(snapshot.history.len(), 1);
    let entry = snapshot.history.last().unwrap();
    assert_eq!(entry.id, "pt-A");
    assert_eq!(entry.status, "COMPLETE");
    assert_eq!(entry.summary.as_deref(), Some("Did A"));
    assert_eq!(entry.commit.as_deref(), Some("abc1234"));
    assert_eq!(entry.issues.as_deref(), Some("Critical(0)/Major(0)/Minor(0)"));

    let lessons = std::fs::read_to_string(h.paths().lessons_path()).unwrap();
    let last_block = lessons.rsplit("## Lesson from").next().unwrap();
    assert!(last_block.starts_with(" pt-A"));
    assert!(last_block.contains("Always X"));

    assert_eq!(h.stdout.contents(), format!("{COMPLETION_PROMISE}\n"));
    assert!(!h.paths().lock_path().exists(), "lock must be released");

    let log = h.log.contents();
    assert!(log.contains("event=loop_start"));
    assert!(log.contains("mode=serial"));
    assert!(log.contains("event=ticket_start"));
    assert!(log.contains("title=\"Do A\""));
    assert!(log.contains("reason=max_iterations_reached"));
}

#[tokio::test]
async fn test_backlog_empty_stops_loop() {
    let (h, tickets) = serial_harness(&["pt-1", "pt-2"]);

    let outcome = h.ralph(test_config()).start().await.unwrap();

    assert_eq!(outcome.reason, CompletionReason::BacklogEmpty);
    assert_eq!(outcome.completed, 2);
    assert!(tickets.ready().is_empty());
    assert_eq!(h.history_ids(), vec!["pt-1", "pt-2"]);
    assert_eq!(tickets.reset_count(), 1);
    assert!(h.log.contents().contains("reason=backlog_empty"));
}

#[tokio::test]
async fn test_counters_match_history() {
    let (h, _) = serial_harness(&["a", "b", "c"]);

    h.ralph(test_config()).start().await.unwrap();

    let snapshot = h.snapshot();
    assert_eq!(
        (snapshot.completed + snapshot.failed) as usize,
        snapshot.history.len()
    );
    assert_eq!(snapshot.history.last().unwrap().id, "c");
}

#[tokio::test]
async fn test_summary_falls_back_to_title() {
    let temp = TempDir::new().unwrap();
    let tickets = Arc::new(FakeTicketSource::new(["pt-1"]).with_title("pt-1", "Fix the widget"));
    let agent = FakeAgentRunner::new().closing(tickets.clone());
    let h = Harness::new(temp, tickets, agent, FakeWorktrees::without_repo());

    h.ralph(test_config()).start().await.unwrap();

    let snapshot = h.snapshot();
    assert_eq!(snapshot.history[0].summary.as_deref(), Some("Fix the widget"));
    assert!(!h.paths().lessons_path().exists());
}

#[tokio::test]
async fn test_timeout_restarts_exhaust_budget() {
    let temp = TempDir::new().unwrap();
    let tickets = Arc::new(FakeTicketSource::new(["pt-T"]));
    let agent = FakeAgentRunner::new().with_outcomes("pt-T", &[AttemptOutcome::TimedOut; 3]);
    let h = Harness::new(temp, tickets, agent, FakeWorktrees::without_repo());

    let config = RalphConfig {
        attempt_timeout_ms: 1000,
        max_restarts: 2,
        ..test_config()
    };
    let outcome = h.ralph(config).start().await.unwrap();

    assert_eq!(
        outcome.reason,
        CompletionReason::TimeoutExhausted {
            ticket: "pt-T".to_string(),
            attempts: 3
        }
    );
    assert_eq!(outcome.exit_code(), TIMEOUT_EXIT_CODE);

    let calls = h.agent.calls();
    assert_eq!(calls.len(), 3);
    assert!(calls.iter().all(|c| c.timeout == Some(Duration::from_millis(1000))));

    let snapshot = h.snapshot();
    assert_eq!(snapshot.status, "FAILED");
    assert_eq!(snapshot.failed, 1);
    let error = snapshot.history[0].error.clone().unwrap();
    assert!(error.contains("timeout"));
    assert!(error.contains('3'));

    assert!(h.stdout.contents().is_empty(), "no promise on failure");
    assert!(!h.paths().lock_path().exists());

    let log = h.log.contents();
    assert_eq!(log.matches("event=attempt_restart").count(), 2);
    assert!(log.contains("event=restarts_exhausted"));
}

#[tokio::test]
async fn test_timeout_then_success() {
    let temp = TempDir::new().unwrap();
    let tickets = Arc::new(FakeTicketSource::new(["pt-T"]));
    let agent = FakeAgentRunner::new()
        .closing(tickets.clone())
        .with_outcomes("pt-T", &[AttemptOutcome::TimedOut, AttemptOutcome::Success]);
    let h = Harness::new(temp, tickets, agent, FakeWorktrees::without_repo());

    let config = RalphConfig {
        attempt_timeout_ms: 500,
        max_restarts: 1,
        ..test_config()
    };
    let outcome = h.ralph(config).start().await.unwrap();

    assert_eq!(outcome.reason, CompletionReason::BacklogEmpty);
    assert_eq!(h.agent.calls().len(), 2);
    assert_eq!(h.snapshot().completed, 1);
}

#[tokio::test]
async fn test_non_timeout_failure_is_not_retried() {
    let temp = TempDir::new().unwrap();
    let tickets = Arc::new(FakeTicketSource::new(["pt-F", "pt-G"]));
    let agent = FakeAgentRunner::new().with_outcomes("pt-F", &[AttemptOutcome::Failed { code: 3 }]);
    let h = Harness::new(temp, tickets, agent, FakeWorktrees::without_repo());

    let config = RalphConfig {
        max_restarts: 2,
        attempt_timeout_ms: 1000,
        ..test_config()
    };
    let outcome = h.ralph(config).start().await.unwrap();

    assert_eq!(outcome.exit_code(), 3);
    assert_eq!(h.agent.call_tickets(), vec!["pt-F"]);

    let snapshot = h.snapshot();
    assert_eq!(snapshot.history[0].error.as_deref(), Some("exit 3"));
    assert_eq!(snapshot.status, "FAILED");

    // Inherited output has no log file; the summary names the close summary.
    let log = h.log.contents();
    assert!(log.contains("event=error_summary"));
    assert!(log.contains("close-summary.md"));
}

#[tokio::test]
async fn test_failure_names_agent_log() {
    let temp = TempDir::new().unwrap();
    let tickets = Arc::new(FakeTicketSource::new(["pt-F"]));
    let agent = FakeAgentRunner::new().with_outcomes("pt-F", &[AttemptOutcome::Failed { code: 1 }]);
    let h = Harness::new(temp, tickets, agent, FakeWorktrees::without_repo());

    let config = RalphConfig {
        pi_output: PiOutput::File,
        ..test_config()
    };
    h.ralph(config).start().await.unwrap();

    let expected = h.paths().resolve(".tf/ralph/logs").join("pt-F.log");
    assert!(h.log.contents().contains(&expected.display().to_string()));
    assert_eq!(h.agent.calls()[0].output.log_path(), Some(expected.as_path()));
}

#[tokio::test]
async fn test_idle_polls_are_capped() {
    let temp = TempDir::new().unwrap();
    let tickets = Arc::new(FakeTicketSource::new(Vec::<String>::new()).never_empty());
    let h = Harness::new(temp, tickets, FakeAgentRunner::new(), FakeWorktrees::without_repo());

    let config = RalphConfig {
        max_iterations: 3,
        ..test_config()
    };
    let outcome = h.ralph(config).start().await.unwrap();

    assert_eq!(outcome.reason, CompletionReason::NoTicket);
    assert_eq!(outcome.exit_code(), 0);
    assert!(h.agent.calls().is_empty());
    assert_eq!(h.log.contents().matches("event=no_ticket_selected").count(), 3);
}

#[tokio::test]
async fn test_progress_indicator_lines() {
    let (h, _) = serial_harness(&["pt-1", "pt-2"]);
    let progress = CapturedOutput::default();

    let options = LoopOptions {
        progress: true,
        ..LoopOptions::default()
    };
    let config = RalphConfig {
        max_iterations: 2,
        ..test_config()
    };
    h.ralph(config)
        .with_options(options)
        .with_progress_output(progress.clone(), false)
        .start()
        .await
        .unwrap();

    let out = progress.contents();
    assert!(out.contains("[1/2] Processing pt-1"));
    assert!(out.contains("[2/2] pt-2 COMPLETE"));
    assert!(!out.contains('\r'));
}

// ─────────────────────────────────────────────────────────────────────────────
// Preflight and lock
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_preflight_failure_touches_nothing() {
    let temp = TempDir::new().unwrap();
    let tickets = Arc::new(FakeTicketSource::new(["pt-1"]));
    let agent = FakeAgentRunner::new().failing_preflight("pi");
    let h = Harness::new(temp, tickets, agent, FakeWorktrees::without_repo());

    let err = h.ralph(test_config()).start().await.unwrap_err();

    assert!(matches!(err, LoopError::Agent(AgentError::NotFound(_))));
    assert!(!h.paths().lock_path().exists());
    assert!(!h.paths().progress_path().exists());
    assert!(h.agent.calls().is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn test_live_lock_refuses_start() {
    let (h, _) = serial_harness(&["pt-1"]);
    let lock_path = h.paths().lock_path();
    std::fs::create_dir_all(lock_path.parent().unwrap()).unwrap();
    let owner = std::os::unix::process::parent_id();
    std::fs::write(&lock_path, format!("{owner} 2026-01-01T00:00:00Z\n")).unwrap();

    let err = h.ralph(test_config()).start().await.unwrap_err();

    assert!(matches!(err, LoopError::Lock(LockError::Held { pid, .. }) if pid == owner));
    assert!(lock_path.exists(), "someone else's lock must survive");
    assert!(h.agent.calls().is_empty());
}

#[tokio::test]
async fn test_stale_lock_is_replaced_and_released() {
    let (h, _) = serial_harness(&["pt-1"]);
    let lock_path = h.paths().lock_path();
    std::fs::create_dir_all(lock_path.parent().unwrap()).unwrap();
    std::fs::write(&lock_path, "999999999 2020-01-01T00:00:00Z\n").unwrap();

    let outcome = h.ralph(test_config()).start().await.unwrap();

    assert_eq!(outcome.completed, 1);
    assert!(!lock_path.exists());
}

// ─────────────────────────────────────────────────────────────────────────────
// Dry run and single-ticket runs
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_dry_run_spawns_nothing() {
    let temp = TempDir::new().unwrap();
    let tickets = Arc::new(FakeTicketSource::new(["pt-A"]));
    let agent = FakeAgentRunner::new().failing_preflight("pi");
    let h = Harness::new(temp, tickets, agent, FakeWorktrees::without_repo());

    let outcome = h
        .ralph(test_config())
        .with_options(LoopOptions {
            dry_run: true,
            ..LoopOptions::default()
        })
        .start()
        .await
        .unwrap();

    assert_eq!(outcome.reason, CompletionReason::DryRun);
    assert!(h.agent.calls().is_empty());
    assert!(!h.paths().progress_path().exists());
    assert!(!h.paths().lock_path().exists());
    assert!(h.stdout.contents().is_empty());

    let log = h.log.contents();
    assert!(log.contains("Dry run: would execute"));
    assert!(log.contains("/tf pt-A --auto"));
}

#[tokio::test]
async fn test_dry_run_reports_journal_stats() {
    let (h, _) = serial_harness(&["pt-1"]);
    h.ralph(test_config()).start().await.unwrap();

    let tickets = Arc::new(FakeTicketSource::new(["pt-2"]));
    let mut dry = RalphLoop::new(
        h.paths(),
        test_config(),
        Logger::with_writer(LogLevel::Info, h.log.clone()),
        tickets,
        h.agent.clone(),
        h.worktrees.clone(),
    )
    .with_options(LoopOptions {
        dry_run: true,
        ..LoopOptions::default()
    });
    dry.start().await.unwrap();

    let log = h.log.contents();
    let stats = log
        .lines()
        .find(|l| l.contains("event=progress_stats"))
        .unwrap();
    assert!(stats.contains("completed=1"));
    assert!(stats.contains("status=COMPLETE"));
}

#[tokio::test]
async fn test_dry_run_parallel_lists_batch() {
    let temp = TempDir::new().unwrap();
    let repo = temp.path().to_path_buf();
    let tickets = Arc::new(parallel_tickets());
    let h = Harness::new(temp, tickets, FakeAgentRunner::new(), FakeWorktrees::new(repo));

    h.ralph(parallel_config())
        .with_options(LoopOptions {
            dry_run: true,
            ..LoopOptions::default()
        })
        .start()
        .await
        .unwrap();

    let log = h.log.contents();
    assert_eq!(log.matches("Dry run: would execute").count(), 3);
    assert!(log.contains("tickets=pt-1,pt-3,pt-5"));
    assert!(h.worktrees.created().is_empty());
}

#[tokio::test]
async fn test_run_ticket_explicit_id() {
    let (h, _) = serial_harness(&[]);

    let outcome = h
        .ralph(test_config())
        .run_ticket(Some("pt-X".to_string()))
        .await
        .unwrap();

    assert_eq!(outcome.reason, CompletionReason::TicketComplete);
    assert_eq!(outcome.iterations, 1);
    assert_eq!(h.agent.call_tickets(), vec!["pt-X"]);
    assert_eq!(h.history_ids(), vec!["pt-X"]);
    assert!(h.stdout.contents().is_empty(), "run does not print the promise");
    assert!(!h.paths().lock_path().exists());
}

#[tokio::test]
async fn test_run_ticket_selects_when_absent() {
    let (h, _) = serial_harness(&["pt-Q"]);

    let outcome = h.ralph(test_config()).run_ticket(None).await.unwrap();

    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(h.agent.call_tickets(), vec!["pt-Q"]);
}

#[tokio::test]
async fn test_run_ticket_nothing_selected() {
    let (h, _) = serial_harness(&[]);

    let outcome = h.ralph(test_config()).run_ticket(None).await.unwrap();

    assert_eq!(outcome.reason, CompletionReason::NoTicket);
    assert!(h.agent.calls().is_empty());
    assert!(!h.paths().progress_path().exists());
}

#[tokio::test]
async fn test_run_ticket_rejects_invalid_id() {
    let (h, _) = serial_harness(&[]);

    let err = h
        .ralph(test_config())
        .run_ticket(Some("../x".to_string()))
        .await
        .unwrap_err();

    assert!(matches!(err, LoopError::InvalidTicket(ref id) if id == "../x"));
    assert!(h.agent.calls().is_empty());
    assert!(!h.paths().progress_path().exists());
}

#[tokio::test]
async fn test_serial_skips_invalid_selection() {
    let (h, _) = serial_harness(&[".."]);

    let config = RalphConfig {
        max_iterations: 2,
        ..test_config()
    };
    let outcome = h.ralph(config).start().await.unwrap();

    assert_eq!(outcome.reason, CompletionReason::NoTicket);
    assert!(h.agent.calls().is_empty());
    let log = h.log.contents();
    assert_eq!(log.matches("reason=invalid_ticket_id").count(), 2);
    assert!(log.contains("event=invalid_ticket_id"));
}

#[tokio::test]
async fn test_mode_decision_and_phase_transitions_logged() {
    let (h, _) = serial_harness(&["pt-1"]);

    h.ralph(test_config()).start().await.unwrap();

    let log = h.log.contents();
    let decision = log.lines().find(|l| l.contains("event=decision")).unwrap();
    assert!(decision.contains("decision=serial"));
    assert!(decision.contains("reason=single_worker"));
    assert!(log.contains("event=phase_transition from=NOT_STARTED ticket=- to=RUNNING"));
    assert!(log.contains("event=phase_transition from=RUNNING ticket=- to=COMPLETE"));
}

#[tokio::test]
async fn test_failed_run_logs_phase_transition_for_ticket() {
    let temp = TempDir::new().unwrap();
    let tickets = Arc::new(FakeTicketSource::new(["pt-1"]));
    let agent = FakeAgentRunner::new().with_outcomes("pt-1", &[AttemptOutcome::Failed { code: 4 }]);
    let h = Harness::new(temp, tickets, agent, FakeWorktrees::without_repo());

    let outcome = h.ralph(test_config()).run_ticket(None).await.unwrap();

    assert_eq!(outcome.exit_code(), 4);
    let log = h.log.contents();
    assert!(log.contains("event=phase_transition from=NOT_STARTED ticket=pt-1 to=RUNNING"));
    assert!(log.contains("event=phase_transition from=RUNNING ticket=pt-1 to=FAILED"));
}

#[tokio::test]
async fn test_loop_start_names_active_session() {
    let (h, _) = serial_harness(&[]);
    let sessions = h.temp.path().join("sessions-home");
    SessionStore::new(&sessions).start("seed-auth").unwrap();

    let config = RalphConfig {
        session_dir: Some(SessionDirSetting::Path(sessions.display().to_string())),
        ..test_config()
    };
    h.ralph(config).start().await.unwrap();

    assert!(h.log.contents().contains("session=seed-auth@"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Parallel mode
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_select_batch_component_diversity() {
    let candidates = vec![
        TicketRef::new("pt-1").with_tags(["component:api"]),
        TicketRef::new("pt-2").with_tags(["component:api"]),
        TicketRef::new("pt-3").with_tags(["component:cli"]),
        TicketRef::new("pt-4").with_tags(["component:cli", "component:docs"]),
        TicketRef::new("pt-5").with_tags(["component:docs"]),
    ];

    let batch = select_batch(&candidates, "component:", false, 3);
    let ids: Vec<&str> = batch.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["pt-1", "pt-3", "pt-5"]);

    let small = select_batch(&candidates, "component:", false, 2);
    assert_eq!(small.len(), 2);
}

#[test]
fn test_select_batch_untagged() {
    let candidates = vec![
        TicketRef::new("u-1"),
        TicketRef::new("u-2").with_tags(["backend"]),
        TicketRef::new("t-1").with_tags(["component:api"]),
    ];

    let strict = select_batch(&candidates, "component:", false, 3);
    assert_eq!(strict.len(), 1);
    assert_eq!(strict[0].id, "t-1");

    let relaxed = select_batch(&candidates, "component:", true, 3);
    let ids: Vec<&str> = relaxed.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["u-1", "t-1"], "only one untagged ticket per batch");
}

#[tokio::test]
async fn test_parallel_batch_runs_in_worktrees() {
    let temp = TempDir::new().unwrap();
    let repo = temp.path().to_path_buf();
    let tickets = Arc::new(parallel_tickets());
    let agent = FakeAgentRunner::new()
        .closing(tickets.clone())
        .with_delay("pt-1", Duration::from_millis(30))
        .with_delay("pt-3", Duration::from_millis(30))
        .with_delay("pt-5", Duration::from_millis(30))
        .with_artifacts(
            "pt-3",
            FakeArtifacts {
                close_summary: Some("Summary: CLI done\n\n### Lessons Learned\nUse clap\n".to_string()),
                review: None,
            },
        );
    let h = Harness::new(temp, tickets, agent, FakeWorktrees::new(&repo));

    let outcome = h.ralph(parallel_config()).start().await.unwrap();

    assert_eq!(outcome.reason, CompletionReason::MaxIterations);
    assert_eq!(outcome.completed, 3);
    assert_eq!(h.agent.max_concurrency(), 3);

    let worktrees_dir = repo.join(".tf/ralph/worktrees");
    let created: Vec<_> = h.worktrees.created();
    assert_eq!(
        created,
        vec![
            (worktrees_dir.join("pt-1"), "ralph/pt-1".to_string()),
            (worktrees_dir.join("pt-3"), "ralph/pt-3".to_string()),
            (worktrees_dir.join("pt-5"), "ralph/pt-5".to_string()),
        ]
    );
    for call in h.agent.calls() {
        assert_eq!(call.cwd, worktrees_dir.join(&call.ticket));
        assert_eq!(call.timeout, None);
    }

    // Journaled in spawn order, with artifacts read from the worktree.
    let snapshot = h.snapshot();
    let ids: Vec<&str> = snapshot.history.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["pt-1", "pt-3", "pt-5"]);
    assert_eq!(snapshot.history[1].summary.as_deref(), Some("CLI done"));
    let lessons = std::fs::read_to_string(h.paths().lessons_path()).unwrap();
    assert!(lessons.contains("## Lesson from pt-3"));

    assert_eq!(h.worktrees.removed().len(), 3);
    let log = h.log.contents();
    assert!(log.contains("mode=parallel"));
    assert!(log.contains("decision=parallel"));
    assert!(log.contains("reason=workers_available"));
}

#[tokio::test]
async fn test_parallel_keep_worktrees() {
    let temp = TempDir::new().unwrap();
    let repo = temp.path().to_path_buf();
    let tickets = Arc::new(parallel_tickets());
    let agent = FakeAgentRunner::new().closing(tickets.clone());
    let h = Harness::new(temp, tickets, agent, FakeWorktrees::new(&repo));

    let config = RalphConfig {
        parallel_keep_worktrees: true,
        ..parallel_config()
    };
    h.ralph(config).start().await.unwrap();

    assert!(h.worktrees.removed().is_empty());
    assert!(repo.join(".tf/ralph/worktrees/pt-1").is_dir());
}

#[tokio::test]
async fn test_parallel_failure_reported_in_spawn_order() {
    let temp = TempDir::new().unwrap();
    let repo = temp.path().to_path_buf();
    let tickets = Arc::new(parallel_tickets());
    // pt-3 finishes first, but pt-1 was spawned first.
    let agent = FakeAgentRunner::new()
        .closing(tickets.clone())
        .with_delay("pt-1", Duration::from_millis(50))
        .with_outcomes("pt-1", &[AttemptOutcome::Failed { code: 2 }])
        .with_outcomes("pt-3", &[AttemptOutcome::Failed { code: 5 }]);
    let h = Harness::new(temp, tickets, agent, FakeWorktrees::new(&repo));

    let outcome = h.ralph(parallel_config()).start().await.unwrap();

    assert_eq!(
        outcome.reason,
        CompletionReason::TicketFailed {
            ticket: "pt-1".to_string(),
            code: 2
        }
    );
    assert_eq!(outcome.exit_code(), 2);
    assert_eq!((outcome.completed, outcome.failed), (1, 2));

    // The rest of the batch is still journaled, including pt-5's success.
    assert_eq!(h.history_ids(), vec!["pt-1", "pt-3", "pt-5"]);
    let snapshot = h.snapshot();
    assert_eq!(snapshot.status, "FAILED");
    assert_eq!((snapshot.completed, snapshot.failed), (1, 2));
    assert_eq!(h.tickets.ready(), vec!["pt-1", "pt-2", "pt-3", "pt-4"]);

    let worktrees_dir = repo.join(".tf/ralph/worktrees");
    assert_eq!(h.worktrees.removed().len(), 3);
    for ticket in ["pt-1", "pt-3", "pt-5"] {
        assert!(!worktrees_dir.join(ticket).exists(), "{ticket} worktree left behind");
    }

    let artifact = worktrees_dir.join("pt-1/.tf/knowledge/tickets/pt-1/close-summary.md");
    assert!(h.log.contents().contains(&artifact.display().to_string()));
}

#[tokio::test]
async fn test_parallel_failure_keeps_worktrees_when_configured() {
    let temp = TempDir::new().unwrap();
    let repo = temp.path().to_path_buf();
    let tickets = Arc::new(parallel_tickets());
    let agent = FakeAgentRunner::new()
        .closing(tickets.clone())
        .with_outcomes("pt-3", &[AttemptOutcome::Failed { code: 1 }]);
    let h = Harness::new(temp, tickets, agent, FakeWorktrees::new(&repo));

    let config = RalphConfig {
        parallel_keep_worktrees: true,
        ..parallel_config()
    };
    let outcome = h.ralph(config).start().await.unwrap();

    assert_eq!(outcome.exit_code(), 1);
    assert_eq!(h.history_ids(), vec!["pt-1", "pt-3", "pt-5"]);
    assert!(h.worktrees.removed().is_empty());
    for ticket in ["pt-1", "pt-3", "pt-5"] {
        assert!(repo.join(".tf/ralph/worktrees").join(ticket).is_dir());
    }
}

#[tokio::test]
async fn test_parallel_rejects_path_like_ids() {
    let temp = TempDir::new().unwrap();
    let repo = temp.path().to_path_buf();
    let tickets = Arc::new(
        FakeTicketSource::new(["..", ".", "/abs"])
            .with_tags("..", &["component:api"])
            .with_tags(".", &["component:cli"])
            .with_tags("/abs", &["component:docs"]),
    );
    let agent = FakeAgentRunner::new().closing(tickets.clone());
    let h = Harness::new(temp, tickets, agent, FakeWorktrees::new(&repo));
    let state_file = repo.join(".tf/ralph/AGENTS.md");
    std::fs::create_dir_all(state_file.parent().unwrap()).unwrap();
    std::fs::write(&state_file, "# Lessons\n").unwrap();

    let config = RalphConfig {
        max_iterations: 2,
        ..parallel_config()
    };
    let outcome = h.ralph(config).start().await.unwrap();

    assert_eq!(outcome.reason, CompletionReason::NoTicket);
    assert!(h.worktrees.created().is_empty());
    assert!(h.worktrees.removed().is_empty());
    assert!(h.agent.calls().is_empty());
    assert_eq!(std::fs::read_to_string(&state_file).unwrap(), "# Lessons\n");

    let log = h.log.contents();
    assert!(log.contains("event=invalid_ticket_id"));
    assert!(log.contains("ticket=.."));
}

#[tokio::test]
async fn test_parallel_worktree_failure_skips_ticket() {
    let temp = TempDir::new().unwrap();
    let repo = temp.path().to_path_buf();
    let tickets = Arc::new(parallel_tickets());
    let agent = FakeAgentRunner::new().closing(tickets.clone());
    let worktrees = FakeWorktrees::new(&repo).failing_create("pt-3", "fatal: 'ralph/pt-3' is already checked out");
    let h = Harness::new(temp, tickets, agent, worktrees);

    let outcome = h.ralph(parallel_config()).start().await.unwrap();

    assert_eq!(outcome.reason, CompletionReason::MaxIterations);
    assert_eq!((outcome.completed, outcome.failed), (2, 1));
    assert_eq!(id_set(h.agent.call_tickets()), id_set(["pt-1", "pt-5"]));

    let snapshot = h.snapshot();
    let failed = snapshot.history.iter().find(|e| e.id == "pt-3").unwrap();
    assert_eq!(failed.status, "FAILED");
    assert!(failed.error.as_deref().unwrap().contains("already checked out"));
    assert_eq!(
        (snapshot.completed + snapshot.failed) as usize,
        snapshot.history.len()
    );
    assert!(h.log.contents().contains("Worktree operation failed"));
}

#[tokio::test]
async fn test_parallel_fallback_to_single_select() {
    let temp = TempDir::new().unwrap();
    let repo = temp.path().to_path_buf();
    // No component tags and untagged tickets not allowed: nothing batches.
    let tickets = Arc::new(FakeTicketSource::new(["pt-1"]));
    let agent = FakeAgentRunner::new().closing(tickets.clone());
    let h = Harness::new(temp, tickets, agent, FakeWorktrees::new(&repo));

    let outcome = h.ralph(parallel_config()).start().await.unwrap();

    assert_eq!(outcome.reason, CompletionReason::BacklogEmpty);
    assert_eq!(h.agent.call_tickets(), vec!["pt-1"]);
    let log = h.log.contents();
    assert!(log.contains("reason=fallback"));
    assert!(log.contains("decision=single_ticket_fallback"));
    assert!(log.contains("reason=no_component_diverse_batch"));
}

#[tokio::test]
async fn test_parallel_demoted_when_timeout_set() {
    let temp = TempDir::new().unwrap();
    let repo = temp.path().to_path_buf();
    let tickets = Arc::new(parallel_tickets());
    let agent = FakeAgentRunner::new().closing(tickets.clone());
    let h = Harness::new(temp, tickets, agent, FakeWorktrees::new(&repo));

    let config = RalphConfig {
        attempt_timeout_ms: 1000,
        max_iterations: 1,
        ..parallel_config()
    };
    h.ralph(config).start().await.unwrap();

    assert!(h.worktrees.created().is_empty());
    assert_eq!(h.agent.calls()[0].cwd, repo);
    let log = h.log.contents();
    assert!(log.contains("event=mode_demoted"));
    assert!(log.contains("mode=serial"));
    assert!(log.contains("reason=timeout_or_restarts"));
}

#[tokio::test]
async fn test_parallel_demoted_without_repo() {
    let (h, _) = serial_harness(&["pt-1"]);

    h.ralph(parallel_config()).start().await.unwrap();

    let log = h.log.contents();
    assert!(log.contains("reason=no_repo_root"));
    assert!(log.contains("mode=serial"));
}

#[tokio::test]
async fn test_progress_disabled_in_parallel_mode() {
    let temp = TempDir::new().unwrap();
    let repo = temp.path().to_path_buf();
    let tickets = Arc::new(parallel_tickets());
    let agent = FakeAgentRunner::new().closing(tickets.clone());
    let h = Harness::new(temp, tickets, agent, FakeWorktrees::new(&repo));
    let progress = CapturedOutput::default();

    h.ralph(parallel_config())
        .with_options(LoopOptions {
            progress: true,
            ..LoopOptions::default()
        })
        .with_progress_output(progress.clone(), false)
        .start()
        .await
        .unwrap();

    assert!(progress.contents().is_empty());
    assert!(h.log.contents().contains("event=progress_disabled"));
}
