//! Graph overview CLI.
//!
//! Enriches a reference list of organisations with counts from the
//! bibliographic graph API, harvests their datasources, validates OAI-PMH
//! endpoints and keeps a dated history of per-datasource snapshots.

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
