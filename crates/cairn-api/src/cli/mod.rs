//! CLI command definitions for the `cairn` binary.
//!
//! Every command runs the engine in-process against the local database.
//! Commands that start work (`submit`, `resume`, `deliver`, `recover`) drive
//! their plan until it finishes or parks on an external callback.

pub mod maintenance;
pub mod plan;
pub mod render;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Run and inspect durable plan executions.
#[derive(Parser)]
#[command(name = "cairn", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Also export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Submit a plan graph (JSON file) and drive it.
    #[command(alias = "run")]
    Submit {
        /// Path to the plan graph JSON.
        graph: PathBuf,

        /// Grouping tag stored on the execution metadata.
        #[arg(long)]
        tag: Option<String>,

        /// Account the execution belongs to.
        #[arg(long)]
        account: Option<String>,

        /// Free-form notes kept alongside the execution.
        #[arg(long)]
        notes: Option<String>,

        /// Seconds to keep driving before handing back control.
        #[arg(long, default_value_t = 60)]
        wait: u64,
    },

    /// Re-run stages of a finished execution as a new execution.
    Resume {
        /// Plan execution id to resume from.
        id: String,

        /// Stage identifier to re-run (repeatable). Defaults to the failed stages.
        #[arg(long = "stage")]
        stages: Vec<String>,

        #[arg(long, default_value_t = 60)]
        wait: u64,
    },

    /// Abort a running plan execution.
    Abort {
        id: String,
    },

    /// Show a plan execution.
    #[command(alias = "show")]
    Status {
        id: String,
    },

    /// List the node executions of a plan execution.
    Nodes {
        id: String,

        /// Include attempts superseded by a retry.
        #[arg(long)]
        all: bool,
    },

    /// Deliver the result of an externally executed step.
    Deliver {
        /// Callback id the step is parked on.
        correlation_id: String,

        /// Final status of the step (e.g. succeeded, failed).
        #[arg(long, default_value = "succeeded")]
        status: String,

        /// Step outputs as JSON.
        #[arg(long)]
        outputs: Option<String>,

        /// Failure message.
        #[arg(long)]
        message: Option<String>,

        #[arg(long, default_value_t = 60)]
        wait: u64,
    },

    /// Pick up executions left behind by an earlier process and drive them.
    Recover {
        #[arg(long, default_value_t = 60)]
        wait: u64,
    },

    /// Repair executions whose status no longer matches their nodes.
    Sweep,

    /// Delete executions past their retention deadline.
    Purge,

    /// Keep an execution for the given number of days from now.
    Retain {
        id: String,

        #[arg(long)]
        days: u32,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_submit_with_run_alias() {
        let cli = Cli::try_parse_from(["cairn", "run", "plan.json", "--account", "acct-1"]).unwrap();
        match cli.command {
            Commands::Submit {
                graph,
                account,
                wait,
                ..
            } => {
                assert_eq!(graph, PathBuf::from("plan.json"));
                assert_eq!(account.as_deref(), Some("acct-1"));
                assert_eq!(wait, 60);
            }
            _ => panic!("expected submit"),
        }
    }

    #[test]
    fn test_parse_repeated_stages() {
        let cli = Cli::try_parse_from(["cairn", "resume", "id", "--stage", "build", "--stage", "deploy"])
            .unwrap();
        match cli.command {
            Commands::Resume { stages, .. } => assert_eq!(stages, vec!["build", "deploy"]),
            _ => panic!("expected resume"),
        }
    }

    #[test]
    fn test_parse_deliver_defaults_to_succeeded() {
        let cli = Cli::try_parse_from(["cairn", "--json", "deliver", "cb-1"]).unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Deliver {
                correlation_id,
                status,
                outputs,
                ..
            } => {
                assert_eq!(correlation_id, "cb-1");
                assert_eq!(status, "succeeded");
                assert!(outputs.is_none());
            }
            _ => panic!("expected deliver"),
        }
    }

    #[test]
    fn test_parse_retain_requires_days() {
        assert!(Cli::try_parse_from(["cairn", "retain", "id"]).is_err());
        let cli = Cli::try_parse_from(["cairn", "retain", "id", "--days", "90"]).unwrap();
        match cli.command {
            Commands::Retain { id, days } => {
                assert_eq!(id, "id");
                assert_eq!(days, 90);
            }
            _ => panic!("expected retain"),
        }
    }

    #[test]
    fn test_parse_verbosity_counts() {
        let cli = Cli::try_parse_from(["cairn", "-vv", "sweep"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Commands::Sweep));
    }
}
