//! cairn command-line entry point.
//!
//! Binary name: `cairn`
//!
//! Parses CLI arguments, sets up tracing, wires the engine over the local
//! SQLite database and dispatches to the command handlers.

mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;

use cairn_observe::{LogFormat, init_tracing, shutdown_tracing};
use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,cairn=debug",
        _ => "trace",
    };
    let format = if cli.log_json {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    };
    init_tracing(filter, format, cli.otel).map_err(|e| anyhow::anyhow!(e))?;

    let result = dispatch(cli).await;
    shutdown_tracing();
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "cairn", &mut std::io::stdout());
        return Ok(());
    }

    let state = AppState::init().await?;
    let json = cli.json;

    match cli.command {
        Commands::Submit {
            graph,
            tag,
            account,
            notes,
            wait,
        } => cli::plan::submit_plan(&state, &graph, tag, account, notes, wait, json).await,

        Commands::Resume { id, stages, wait } => {
            cli::plan::resume_plan(&state, &id, stages, wait, json).await
        }

        Commands::Abort { id } => cli::plan::abort_plan(&state, &id, json).await,

        Commands::Status { id } => cli::plan::show_plan(&state, &id, json).await,

        Commands::Nodes { id, all } => cli::plan::list_nodes(&state, &id, all, json).await,

        Commands::Deliver {
            correlation_id,
            status,
            outputs,
            message,
            wait,
        } => {
            cli::plan::deliver(&state, &correlation_id, &status, outputs, message, wait, json)
                .await
        }

        Commands::Recover { wait } => cli::plan::recover(&state, wait, json).await,

        Commands::Sweep => cli::maintenance::sweep(&state, json).await,

        Commands::Purge => cli::maintenance::purge(&state, json).await,

        Commands::Retain { id, days } => cli::maintenance::retain(&state, &id, days, json).await,

        Commands::Completions { .. } => Ok(()),
    }
}
