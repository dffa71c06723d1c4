//! CLI module for tokenlane - command-line interface and subcommands.
//!
//! Provides the main entry point with subcommands for submitting prompts
//! and inspecting the configured endpoints.

pub mod commands;

pub use commands::Cli;
