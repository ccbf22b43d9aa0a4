//! Write-notify push client binary
//!
//! Run with: cargo run --bin push-client -- --help

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use rdma_push::client::{run_client, ClientConfig};

#[derive(Parser, Debug)]
#[command(name = "push-client")]
#[command(about = "Active side of the RDMA write-then-notify push protocol")]
struct Args {
    /// Server host name or address
    #[arg(long, default_value = "127.0.0.1")]
    server_addr: String,

    /// Server port
    #[arg(long, default_value = "9191")]
    port: u16,

    /// Payload buffer capacity in u32 elements
    #[arg(long, default_value = "512")]
    buf_elements: usize,

    /// Resolution/connect bound in milliseconds
    #[arg(long, default_value = "500")]
    resolve_timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Optional JSON config file; connection flags are ignored when set
    #[arg(long)]
    config: Option<PathBuf>,

    /// File whose bytes are pushed to the server
    file: PathBuf,
}

/// Loads a file as big-endian u32 elements, zero-padding the tail.
fn load_elements(path: &PathBuf) -> Result<Vec<u32>> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let elements = bytes
        .chunks(4)
        .map(|chunk| {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            u32::from_be_bytes(word)
        })
        .collect();
    Ok(elements)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

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
        None => ClientConfig {
            server_addr: args.server_addr.clone(),
            port: args.port,
            buf_elements: args.buf_elements,
            resolve_timeout_ms: args.resolve_timeout_ms,
            ..Default::default()
        },
    };

    let elements = load_elements(&args.file)?;
    println!("pushing {} element(s) from {}", elements.len(), args.file.display());
    for (i, element) in elements.iter().take(10).enumerate() {
        println!("{} -> {}", i + 1, element);
    }

    let acked = run_client(&config, &elements)
        .await
        .context("write-notify push failed")?;
    println!("server acknowledged {acked} element(s)");
    Ok(())
}
