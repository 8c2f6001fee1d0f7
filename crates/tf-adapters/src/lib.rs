//! # tf-adapters
//!
//! Agent adapters for the Ticketflow Ralph loop.
//!
//! This crate provides:
//! - Argv construction for the `pi` agent
//! - Workflow prompt discovery (project, then user)
//! - [`PiRunner`], the subprocess [`tf_core::AgentRunner`] with output
//!   routing and timeout termination of the whole process group

mod executor;
mod pi_backend;
mod prompt;

pub use executor::{DEFAULT_GRACE_PERIOD, PiRunner};
pub use pi_backend::PiBackend;
pub use prompt::{PromptLocator, USER_PROMPT_PATH};
