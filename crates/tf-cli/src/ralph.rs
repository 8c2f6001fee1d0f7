//! `tf ralph` subcommands.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use std::sync::Arc;
use tf_adapters::PiRunner;
use tf_core::{
    ConfigLayer, GitWorktrees, LogLevel, Logger, LoopOptions, LoopOutcome, PiOutput,
    ProjectPaths, RalphConfig, RalphLoop, ShellTicketSource,
};

#[derive(Parser, Debug)]
pub struct RalphArgs {
    #[command(subcommand)]
    command: RalphCommands,
}

impl RalphArgs {
    pub fn common(&self) -> &CommonArgs {
        match &self.command {
            RalphCommands::Run(args) => &args.common,
            RalphCommands::Start(args) => &args.common,
        }
    }
}

#[derive(Subcommand, Debug)]
enum RalphCommands {
    /// Process a single ticket
    Run(RunArgs),

    /// Process tickets until the backlog is empty or a limit is reached
    Start(StartArgs),
}

/// Options shared by `run` and `start`.
#[derive(Args, Debug)]
pub struct CommonArgs {
    /// Log the agent command without running it
    #[arg(long)]
    pub dry_run: bool,

    /// Debug-level loop logs
    #[arg(short, long, conflicts_with_all = ["debug", "quiet"])]
    pub verbose: bool,

    /// Debug-level loop logs plus internal diagnostics
    #[arg(long, conflicts_with = "quiet")]
    pub debug: bool,

    /// Only warnings and errors
    #[arg(short, long)]
    pub quiet: bool,

    /// Ask the agent for its JSON event stream and keep it under the logs dir
    #[arg(long)]
    pub capture_json: bool,

    /// Workflow flags passed after the ticket id
    #[arg(long, value_name = "FLAGS", allow_hyphen_values = true)]
    pub flags: Option<String>,

    /// Where agent output goes (inherit, file, discard)
    #[arg(long, value_name = "MODE")]
    pub pi_output: Option<PiOutput>,

    /// Log file for agent output in file mode
    #[arg(long, value_name = "PATH")]
    pub pi_output_file: Option<String>,
}

impl CommonArgs {
    fn log_level(&self) -> Option<LogLevel> {
        if self.verbose || self.debug {
            Some(LogLevel::Debug)
        } else if self.quiet {
            Some(LogLevel::Warn)
        } else {
            None
        }
    }

    fn layer(&self) -> ConfigLayer {
        ConfigLayer {
            log_level: self.log_level(),
            capture_json: self.capture_json.then_some(true),
            workflow_flags: self.flags.clone(),
            pi_output: self.pi_output,
            pi_output_file: self.pi_output_file.clone(),
            ..ConfigLayer::default()
        }
    }
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Ticket id; selected with the ticket query when omitted
    ticket: Option<String>,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Parser, Debug)]
struct StartArgs {
    /// Maximum number of tickets to process
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u32).range(1..))]
    max_iterations: Option<u32>,

    /// Run up to N tickets at once in separate worktrees
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u32).range(1..))]
    parallel: Option<u32>,

    /// Force serial mode
    #[arg(long, conflicts_with = "parallel")]
    no_parallel: bool,

    /// Show a [n/total] progress line (serial mode only)
    #[arg(long)]
    progress: bool,

    #[command(flatten)]
    common: CommonArgs,
}

impl StartArgs {
    fn layer(&self) -> ConfigLayer {
        let mut layer = self.common.layer();
        layer.max_iterations = self.max_iterations;
        layer.parallel_workers = if self.no_parallel {
            Some(1)
        } else {
            self.parallel
        };
        layer
    }
}

/// Runs a `tf ralph` subcommand and returns the process exit code.
pub async fn execute(args: RalphArgs) -> Result<i32> {
    match args.command {
        RalphCommands::Run(run) => {
            let mut ralph = build_loop(run.common.layer(), &run.common, false)?;
            let outcome = ralph.run_ticket(run.ticket).await?;
            Ok(report(&outcome))
        }
        RalphCommands::Start(start) => {
            let mut ralph = build_loop(start.layer(), &start.common, start.progress)?;
            let outcome = ralph.start().await?;
            Ok(report(&outcome))
        }
    }
}

fn build_loop(cli: ConfigLayer, common: &CommonArgs, progress: bool) -> Result<RalphLoop> {
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    let paths = ProjectPaths::discover(&cwd);
    let loaded = RalphConfig::load(&paths, |name| std::env::var(name).ok(), cli)
        .context("Failed to load Ralph configuration")?;

    let logger = Logger::new(loaded.config.log_level);
    for warning in &loaded.warnings {
        logger.warn(warning, &[("event", json!("config_warning"))]);
    }

    let config = loaded.config;
    let tickets = Arc::new(
        ShellTicketSource::new(
            paths.root(),
            config.ticket_query.clone(),
            config.completion_check.clone(),
        )
        .with_logger(logger.clone()),
    );
    let agent = Arc::new(PiRunner::for_project(
        &config.agent_command,
        &paths,
        logger.clone(),
    ));
    let worktrees = Arc::new(GitWorktrees::new());

    Ok(
        RalphLoop::new(paths, config, logger, tickets, agent, worktrees).with_options(
            LoopOptions {
                dry_run: common.dry_run,
                progress,
            },
        ),
    )
}

fn report(outcome: &LoopOutcome) -> i32 {
    tracing::debug!(
        reason = outcome.reason.as_str(),
        iterations = outcome.iterations,
        completed = outcome.completed,
        failed = outcome.failed,
        "Loop finished"
    );
    outcome.exit_code()
}
