//! Command-line interface
//!
//! Argument parsing and the implementation of each subcommand.

pub mod args;
pub mod commands;

pub use args::{CliArgs, Command};
