//! Command-line interface for batch-coordinator.
//!
//! Provides commands to run a job to completion, inspect its progress and
//! trigger recovery or counter reconciliation by hand.

mod commands;

pub use commands::{default_job_id, parse_cli, read_items, run, run_with_cli, Cli, Commands};
