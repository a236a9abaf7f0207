//! Entry point for the rld linker.
//!
//! Simple flow: parse args → run the link pipeline → exit. Fatal errors
//! print a diagnostic and remove any partially written output.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use rld::config::{Cli, Config};
use rld::linker;
use rld::writer;

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_cli(&cli)?;

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    writer::install_signal_handlers();

    if let Err(err) = linker::link(config) {
        writer::cleanup();
        eprintln!("rld: error: {:#}", err);
        std::process::exit(1);
    }
    Ok(())
}
