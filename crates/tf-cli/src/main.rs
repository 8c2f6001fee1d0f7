//! # tf-cli
//!
//! Binary entry point for the Ticketflow Ralph loop.
//!
//! This crate provides:
//! - CLI argument parsing using `clap`
//! - `tf ralph run` for a single ticket and `tf ralph start` for the loop
//! - Exit-code mapping and operator interrupt handling

mod ralph;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// Exit code after Ctrl-C.
const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Ticketflow - ticket-driven agent workflows
#[derive(Parser, Debug)]
#[command(name = "tf", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Autonomous ticket processing (the Ralph loop)
    Ralph(ralph::RalphArgs),
}

impl Cli {
    fn debug_requested(&self) -> bool {
        match &self.command {
            Commands::Ralph(args) => args.common().debug,
        }
    }
}

/// Internal diagnostics go to stderr through `tracing`. `RUST_LOG` wins over
/// the flag-derived default.
fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug_requested());

    // Dropping the command future on interrupt releases the loop lock and
    // kills the agent (kill_on_drop).
    let command = match cli.command {
        Commands::Ralph(args) => ralph::execute(args),
    };
    let finished = tokio::select! {
        result = command => Some(result?),
        _ = tokio::signal::ctrl_c() => None,
    };

    let code = match finished {
        Some(code) => code,
        None => {
            eprintln!("Interrupted");
            INTERRUPTED_EXIT_CODE
        }
    };
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
