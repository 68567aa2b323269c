//! NeuronForge command-line entry point.
//!
//! Binary name: `nforge`
//!
//! Parses arguments, sets up tracing, loads the engine config, then
//! dispatches to the command handler.

mod cli;
mod state;

use clap::Parser;

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = cli::verbosity_filter(cli.verbose, cli.quiet);
    if let Err(e) = neuronforge_observe::tracing_setup::init_tracing_with_filter(filter, cli.otel) {
        eprintln!("Warning: failed to initialize tracing: {e}");
    }

    let outcome = dispatch(cli).await;
    neuronforge_observe::tracing_setup::shutdown_tracing();
    outcome
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let state = AppState::init(cli.config.as_deref()).await;

    match cli.command {
        Commands::Validate { file } => cli::workflow::handle_validate(&state, &file, cli.json),

        Commands::Run {
            file,
            input,
            state_dir,
        } => cli::workflow::handle_run(&state, &file, input.as_deref(), state_dir.as_deref(), cli.json).await,

        Commands::Resume {
            file,
            execution_id,
            state_dir,
        } => cli::workflow::handle_resume(&state, &file, execution_id, &state_dir, cli.json).await,

        Commands::Plugins => cli::plugins::handle_list(&state, cli.json),
    }
}
