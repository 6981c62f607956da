//! larder CLI: resumable recipe harvesting.
//!
//! Lists and fetches recipes, enriches them through a transform service,
//! validates names, downloads images and exports a filtered JSONL dataset.
//! Every stage checkpoints to a local database, so an interrupted run picks
//! up where it stopped.

mod commands;

use std::process::ExitCode;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
