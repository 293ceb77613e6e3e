//! Command-line interface definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Multi-agent conversational orchestrator.
#[derive(Debug, Parser)]
#[command(name = "roundtable", version, about)]
pub struct Cli {
    /// Path to config.yaml (defaults to `<home>/config.yaml`).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Ask a question and print the synthesized answer.
    Ask {
        /// The user message.
        question: String,
        /// Session id (a fresh one is generated when omitted).
        #[arg(long)]
        session: Option<String>,
        /// User id.
        #[arg(long, default_value = "local")]
        user: String,
        /// Print activity events to stderr while the turn runs.
        #[arg(long)]
        verbose: bool,
    },
    /// Print the configured agent roster.
    Agents,
    /// Validate the configuration and exit.
    Check,
}
