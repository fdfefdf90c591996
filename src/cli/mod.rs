//! CLI module for buildwatch - command-line interface and subcommands.

pub mod commands;

pub use commands::Cli;
