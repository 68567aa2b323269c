//! CLI command definitions for the `nforge` binary.

pub mod plugins;
pub mod workflow;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

/// Validate and run DAG workflows.
#[derive(Parser)]
#[command(name = "nforge", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Engine config file (defaults to ./neuronforge.toml).
    #[arg(long, global = true, env = "NEURONFORGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Also export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check a workflow file and show its execution plan.
    Validate {
        /// Workflow file (YAML or JSON).
        file: PathBuf,
    },

    /// Execute a workflow.
    Run {
        /// Workflow file (YAML or JSON).
        file: PathBuf,

        /// Initial input as JSON, bound to `input` (overrides the file's).
        #[arg(long)]
        input: Option<String>,

        /// Directory to save the run state in, for `resume`.
        #[arg(long)]
        state_dir: Option<PathBuf>,
    },

    /// Continue a stopped, failed, or interrupted run from its saved state.
    Resume {
        /// Workflow file the run was started from.
        file: PathBuf,

        /// Execution id printed by `run`.
        #[arg(long)]
        execution_id: Uuid,

        /// Directory the state was saved in.
        #[arg(long)]
        state_dir: PathBuf,
    },

    /// List registered plugins and their actions.
    Plugins,
}

/// Map `-v`/`-q` to a tracing filter. `RUST_LOG` still wins when set.
pub fn verbosity_filter(verbose: u8, quiet: bool) -> &'static str {
    match verbose {
        0 if quiet => "error",
        0 => "warn",
        1 => "info,neuronforge=debug",
        _ => "trace",
    }
}
