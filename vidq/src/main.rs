//! vidq - a video transcoding job service.
//!
//! Jobs are submitted over HTTP, wait in a bounded priority queue and are
//! executed by a fixed pool of workers, each driving one FFmpeg process.
//!
//! Architecture:
//! - `vidq serve` runs the scheduler, workers and HTTP server in one process
//! - Job state is kept in SQLite so queued work survives a restart
//! - Other subcommands are a thin client that talks to the server via HTTP

mod cli;
mod config;
mod db;
mod error;
mod models;
mod process;
mod scheduler;
mod server;
mod transcoder;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cli::{execute, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing()?;

    let cli = Cli::parse();
    execute(cli).await
}

fn init_tracing() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("vidq=info"))?;
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v == "json");

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .with(env_filter)
            .init();
    }
    Ok(())
}
