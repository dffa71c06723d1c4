//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - ask: submit one prompt and print the completion
//! - batch: submit one prompt per line of a file, concurrently
//! - workers: show the configured endpoints and their budgets

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// tokenlane - schedule chat completions across rate-limited endpoints
#[derive(Parser, Debug)]
#[command(name = "tokenlane")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Submit a single prompt
    Ask {
        /// Prompt text
        prompt: String,

        /// Acceptable model (repeatable)
        #[arg(short, long = "model", required = true)]
        models: Vec<String>,

        /// System prompt, overrides the configured default
        #[arg(short, long)]
        system: Option<String>,

        /// Completion token limit, overrides the configured default
        #[arg(long)]
        max_tokens: Option<u32>,

        /// Token demand to reserve; estimated from the prompt when omitted
        #[arg(long)]
        demand: Option<u64>,

        /// Retry attempt number, selects the request timeout
        #[arg(long, default_value_t = 1)]
        attempt: u32,
    },

    /// Submit every non-empty line of a file as its own prompt
    Batch {
        /// File with one prompt per line
        file: PathBuf,

        /// Acceptable model (repeatable)
        #[arg(short, long = "model", required = true)]
        models: Vec<String>,

        /// Completion token limit, overrides the configured default
        #[arg(long)]
        max_tokens: Option<u32>,
    },

    /// List configured endpoints
    Workers,
}
