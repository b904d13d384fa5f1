mod cli;
mod commands;
mod output;
mod utils;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::cli::Cli;
use crate::commands::handle_command;
use crate::utils::print_error;

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let cli = Cli::parse();

    // Set up logging
    setup_logging(&cli);

    if let Err(e) = handle_command(cli).await {
        print_error(&format!("{e:#}"));
        std::process::exit(1);
    }
}

fn setup_logging(cli: &Cli) {
    let filter_level = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else {
        "warn"
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_level));

    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}
