//! changewatch CLI: polls listing pages and launches extraction for new items.
//!
//! Watches configured sources for newly published items and hands them to an
//! external extraction worker, backing off from sources that block it.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
