use anyhow::Result;
use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use sketchforge::cli::{Cli, Command};
use sketchforge::commands::{self, BuildOptions};

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = commands::load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Build {
            sketch,
            board,
            upload,
            port,
            max_attempts,
            libraries,
            session_log,
        } => {
            commands::build(
                config,
                BuildOptions {
                    sketch,
                    board,
                    upload,
                    port,
                    max_attempts,
                    libraries,
                    session_log,
                },
            )
            .await
        }
        Command::Ports { board } => commands::ports(config, board).await,
        Command::Boards => Ok(commands::boards(&config)),
        Command::Replay { log, revision } => commands::replay(&log, revision),
    }
}
