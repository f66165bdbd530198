//! flowrun CLI entry point.
//!
//! Binary name: `flowrun`
//!
//! Parses CLI arguments, initializes tracing, then dispatches to the
//! command handler.

mod cli;

use std::process::ExitCode;

use clap::Parser;
use flowrun_observe::tracing_setup::{LogSettings, init_tracing, shutdown_tracing};

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let settings = LogSettings {
        verbosity: if cli.quiet { -1 } else { cli.verbose.min(i8::MAX as u8) as i8 },
        json: cli.log_json,
        otel: cli.otel,
    };
    init_tracing(&settings).map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let result = match cli.command {
        Commands::Validate { file, flows } => cli::validate::validate(&file, flows.as_deref(), cli.json).await,
        Commands::Run {
            file,
            inputs,
            flows,
            config,
            timeout_secs,
        } => {
            let args = cli::run::RunArgs {
                file,
                inputs,
                flows,
                config,
                timeout_secs,
            };
            cli::run::run(args, cli.json).await
        }
        Commands::Serve { flows, db, config } => {
            cli::serve::serve(&flows, db.as_deref(), config.as_deref(), cli.json).await
        }
    };

    shutdown_tracing();
    result
}
