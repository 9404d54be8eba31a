//! CLI module for the Stratus control plane.
//!
//! This module provides the command-line interface for reconciling
//! inventories and driving tasks.

mod commands;
mod output;

pub use commands::{Cli, Commands, LeaseCommands, OutputFormat, TaskCommands};
pub use output::OutputFormatter;
