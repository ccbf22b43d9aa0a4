//! Write-notify push server binary
//!
//! Run with: cargo run --bin push-server -- --help

use anyhow::{Context, Result};
use clap::Parser;
use rdma_push::server::{serve_connection, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "push-server")]
#[command(about = "Passive side of the RDMA write-then-notify push protocol")]
struct Args {
    /// Listen port
    #[arg(long, default_value = "9191")]
    port: u16,

    /// Remotely writable buffer capacity in u32 elements
    #[arg(long, default_value = "512")]
    buf_elements: usize,

    /// Notification wait bound in milliseconds
    #[arg(long, default_value = "30000")]
    notify_timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Optional JSON config file; command-line flags are ignored when set
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Number of worker threads
    #[arg(long, default_value = "2")]
    worker_threads: usize,
}

async fn run_with_config(args: Args) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    let config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
        }
        None => ServerConfig {
            port: args.port,
            buf_elements: args.buf_elements,
            notify_timeout_ms: args.notify_timeout_ms,
            ..Default::default()
        },
    };

    tracing::info!("=== push-server configuration ===");
    tracing::info!("Port: {}", config.port);
    tracing::info!("Buffer: {} elements", config.buf_elements);
    tracing::info!("Notify timeout: {} ms", config.notify_timeout_ms);
    tracing::info!("=================================");

    let payloads = serve_connection(&config).await?;
    for (cycle, elements) in payloads.iter().enumerate() {
        println!("cycle {}: received {} element(s)", cycle + 1, elements.len());
        for (i, element) in elements.iter().take(10).enumerate() {
            println!("{} -> {}", i + 1, element);
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let worker_threads = args.worker_threads;

    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?
        .block_on(run_with_config(args))
}
