//! sharedpad-bus: Message bus broker for sharedpad editor instances.
//!
//! Instances connect over WebSocket, claim their names and exchange edit
//! signals and bootstrap calls through this process.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sharedpad_bus::{Broker, DEFAULT_LISTEN_ADDR};

#[derive(Parser, Debug)]
#[command(name = "sharedpad-bus")]
#[command(about = "Message bus broker for sharedpad sessions")]
struct Args {
    /// Address to listen on for editor instances
    #[arg(short, long, env = "SHAREDPAD_BUS_LISTEN", default_value = DEFAULT_LISTEN_ADDR)]
    listen: String,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,sharedpad_bus=debug"
    } else {
        "info,sharedpad_bus=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting sharedpad-bus");

    let listener = Broker::bind(&args.listen)
        .await
        .with_context(|| format!("Failed to listen on {}", args.listen))?;
    let broker = Broker::default();

    info!("Broker running. Press Ctrl+C to stop.");

    tokio::select! {
        _ = broker.serve(listener) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    info!("Shutting down");
    Ok(())
}
