//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::state::{ResourceKind, ScopeRef};

/// Stratus - multi-cloud inventory reconciliation and task orchestration.
#[derive(Parser, Debug)]
#[command(name = "stratus")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, env = "STRATUS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate the configuration.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Reconcile the inventory with the providers.
    Sync {
        /// Only sync the provider entry with this name.
        #[arg(short, long)]
        provider: Option<String>,

        /// Only sync this resource kind.
        #[arg(short, long)]
        kind: Option<ResourceKind>,
    },

    /// List recorded entities.
    Inventory {
        /// Only list entities of this scope (`provider/account/region`).
        #[arg(short, long)]
        scope: Option<ScopeRef>,
    },

    /// Create a resource.
    Create {
        /// Scope to create it in (`provider/account/region`).
        #[arg(short, long)]
        scope: ScopeRef,

        /// Resource kind.
        #[arg(short, long)]
        kind: ResourceKind,

        /// Resource name.
        name: String,

        /// Disk size in GB.
        #[arg(long)]
        size_gb: Option<u32>,

        /// Disk storage type.
        #[arg(long)]
        storage_type: Option<String>,

        /// Local id of the containing entity.
        #[arg(long)]
        parent: Option<String>,

        /// Wait for the task to finish.
        #[arg(short, long)]
        wait: bool,
    },

    /// Delete an entity, remotely then locally.
    Delete {
        /// Entity id.
        id: String,

        /// Wait for the task to finish.
        #[arg(short, long)]
        wait: bool,
    },

    /// Refresh an entity's status from its provider.
    Refresh {
        /// Entity id.
        id: String,

        /// Wait for the task to finish.
        #[arg(short, long)]
        wait: bool,
    },

    /// Inspect tasks.
    Tasks {
        /// Tasks subcommand.
        #[command(subcommand)]
        command: TaskCommands,
    },

    /// Manage the journal lease.
    Lease {
        /// Lease subcommand.
        #[command(subcommand)]
        command: LeaseCommands,
    },
}

/// Task subcommands.
#[derive(Subcommand, Debug)]
pub enum TaskCommands {
    /// List tasks.
    List {
        /// Include finished tasks.
        #[arg(short, long)]
        all: bool,
    },

    /// Show one task with its stage history.
    Show {
        /// Task id.
        id: String,
    },

    /// Re-drive or fail tasks abandoned by a previous run.
    Recover,
}

/// Lease subcommands.
#[derive(Subcommand, Debug)]
pub enum LeaseCommands {
    /// Show the current lease holder.
    Show,

    /// Release the lease.
    Release {
        /// Lease id to release.
        #[arg(long)]
        lock_id: Option<String>,

        /// Break the lease whoever holds it (dangerous).
        #[arg(long)]
        force: bool,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

impl Cli {
    /// Parses CLI arguments from the command line.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ProviderKind;

    #[test]
    fn test_parses_sync_filters() {
        let cli = Cli::try_parse_from(["stratus", "sync", "--provider", "aws-main", "--kind", "disk"])
            .expect("parses");
        match cli.command {
            Commands::Sync { provider, kind } => {
                assert_eq!(provider.as_deref(), Some("aws-main"));
                assert_eq!(kind, Some(ResourceKind::Disk));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parses_create_with_scope() {
        let cli = Cli::try_parse_from([
            "stratus",
            "--output",
            "json",
            "create",
            "--scope",
            "aws/1234/us-east-1",
            "--kind",
            "disk",
            "data",
            "--size-gb",
            "20",
            "--storage-type",
            "gp2",
        ])
        .expect("parses");
        assert!(matches!(cli.output, OutputFormat::Json));
        match cli.command {
            Commands::Create { scope, kind, name, size_gb, .. } => {
                assert_eq!(scope, ScopeRef::new(ProviderKind::Aws, "1234", "us-east-1"));
                assert_eq!(kind, ResourceKind::Disk);
                assert_eq!(name, "data");
                assert_eq!(size_gb, Some(20));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_rejects_malformed_scope() {
        assert!(Cli::try_parse_from(["stratus", "inventory", "--scope", "aws"]).is_err());
    }

    #[test]
    fn test_lease_release_flags() {
        let cli = Cli::try_parse_from(["stratus", "lease", "release", "--force"]).expect("parses");
        assert!(matches!(
            cli.command,
            Commands::Lease {
                command: LeaseCommands::Release { force: true, lock_id: None }
            }
        ));
    }
}
