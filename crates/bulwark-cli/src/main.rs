//! Bulwark CLI - fetch through the resilience pipeline, classify status
//! codes, and serve the mock API.

mod mock;

use anyhow::{Context, Result};
use bulwark::{
    classify, RawError, ResilienceConfig, ResilientClient, Resolved, SnapshotStore, SOURCE_API,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "bulwark")]
#[command(about = "Client-side HTTP resilience toolkit")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// GET a URL as JSON through cache, retry and circuit breaker
    Fetch {
        url: String,

        /// JSON config file (camelCase keys, all optional)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Snapshot directory (defaults to the user cache dir)
        #[arg(long)]
        snapshot_dir: Option<PathBuf>,

        /// JSON value to return when the live request and snapshot both fail
        #[arg(long)]
        fallback: Option<String>,
    },

    /// Print how a status code is classified (0 = network failure)
    Classify { code: u16 },

    /// Serve the mock API
    Mock {
        /// Port to listen on (0 = auto-assign)
        #[arg(short, long, default_value = "0")]
        port: u16,

        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr so stdout stays machine-readable
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    match args.command {
        Command::Fetch {
            url,
            config,
            snapshot_dir,
            fallback,
        } => fetch(&url, config, snapshot_dir, fallback).await,
        Command::Classify { code } => {
            let classified = classify(RawError::status(code, format!("HTTP {}", code)));
            println!("{}", serde_json::to_string_pretty(&classified)?);
            Ok(())
        }
        Command::Mock { port, host } => serve_mock(&host, port).await,
    }
}

async fn fetch(
    url: &str,
    config: Option<PathBuf>,
    snapshot_dir: Option<PathBuf>,
    fallback: Option<String>,
) -> Result<()> {
    let config = match config {
        Some(path) => ResilienceConfig::load(&path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ResilienceConfig::default(),
    };

    let snapshot_dir = snapshot_dir
        .or_else(|| dirs::cache_dir().map(|d| d.join("bulwark").join("snapshots")))
        .context("No snapshot directory given and no user cache directory found")?;
    info!("Snapshot directory: {}", snapshot_dir.display());

    let client = ResilientClient::new(&config)?.with_snapshots(SnapshotStore::new(snapshot_dir));

    let resolved = match fallback {
        Some(raw) => {
            let fallback: serde_json::Value =
                serde_json::from_str(&raw).context("--fallback is not valid JSON")?;
            client.get_with_fallback(url, fallback).await
        }
        None => {
            let data = client.get_json(url).await.map_err(|e| {
                anyhow::anyhow!("{} ({})", e.user_message(), e)
            })?;
            Resolved {
                source: SOURCE_API.to_string(),
                data,
            }
        }
    };

    println!("{}", serde_json::to_string_pretty(&resolved)?);
    Ok(())
}

async fn serve_mock(host: &str, port: u16) -> Result<()> {
    let addr = mock::start_mock_server(host, port).await?;

    // Print port for scripts to read (intentional stdout)
    println!("MOCK_PORT={}", addr.port());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    Ok(())
}
