//! simplerpc registry - tracks live RPC servers for discovery.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use simplerpc::RegistryConfig;
use simplerpc_registry::Registry;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "simplerpc-registry")]
#[command(about = "Heartbeat registry for simplerpc servers")]
struct Args {
    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value = "9999")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Seconds without a heartbeat before a server is dropped (0 = never)
    #[arg(long, default_value_t = RegistryConfig::DEFAULT_TIMEOUT.as_secs())]
    timeout_secs: u64,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting simplerpc registry");

    let registry = Arc::new(Registry::new(Duration::from_secs(args.timeout_secs)));
    let handle = registry
        .start(&format!("{}:{}", args.host, args.port))
        .await?;

    // Machine-readable line for wrapper scripts.
    println!("REGISTRY_URL={}", handle.url());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    drop(handle);

    Ok(())
}
