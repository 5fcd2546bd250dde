//! cachi2 CLI entry point.
//!
//! Parses arguments, initializes logging, runs the requested subcommand and
//! renders failures with the user-friendly error reporting (exit code 2 for
//! usage errors, 1 for everything else).

use cachi2::cli::Cli;
use cachi2::core::ErrorDisplay;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = cli.execute().await {
        let display = ErrorDisplay::from_error(&error);
        display.display();
        std::process::exit(display.exit_code());
    }
}
