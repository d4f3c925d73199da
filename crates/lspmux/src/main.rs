//! lspmux - multiplexing LSP proxy.
//!
//! Speaks LSP to a single editor client on stdin/stdout and fans the traffic
//! across the backend servers listed in the configuration file.

use clap::Parser;
use lspmux::backend::Backend;
use lspmux::router::Router;
use lspmux::transport::{self, Endpoint, Source, QUEUE_DEPTH};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lspmux")]
#[command(author, version, about = "Multiplexing LSP proxy", long_about = None)]
struct Cli {
    /// JSON configuration file: an array of backend server entries
    config: PathBuf,

    /// Enable verbose logging (overridden by RUST_LOG)
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // stdout is the LSP channel; logs go to stderr
    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    std::process::exit(match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("lspmux: {err:#}");
            2
        }
    });
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let servers = lspmux::config::load(&cli.config).await?;
    info!(servers = servers.len(), config = %cli.config.display(), "starting");

    let (event_tx, event_rx) = mpsc::channel(QUEUE_DEPTH);

    let client_tx = transport::start_io(Source::Client, Endpoint::stdio(), event_tx.clone());

    let mut backends = Vec::with_capacity(servers.len());
    for (index, config) in servers.into_iter().enumerate() {
        let endpoint = Endpoint::open(&config).await?;
        let tx = transport::start_io(Source::Backend(index), endpoint, event_tx.clone());
        backends.push(Backend::new(config, tx));
    }
    drop(event_tx);

    let code = Router::new(backends, client_tx, event_rx).run().await?;
    info!(code, "session ended");
    Ok(code)
}
