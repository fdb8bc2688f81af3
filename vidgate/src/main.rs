use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use vidgate::server;
use vidgate_core::{logging, Config};

/// Edge video delivery gateway.
#[derive(Parser, Debug)]
#[command(name = "vidgate", version, about)]
struct Args {
    /// Path to a TOML configuration file. Environment variables with the
    /// VIDGATE_ prefix override file values.
    #[arg(short, long, env = "VIDGATE_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load configuration (load already validates)
    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("vidgate starting...");
    info!("listen address: {}", config.server.listen_address());
    info!(
        "transform host: {}, kv backend: {}",
        config.media.transform_host,
        if config.kv.url.is_some() { "redis" } else { "memory" }
    );

    // 3. Serve until shutdown
    server::run(config).await
}
