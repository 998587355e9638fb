use anyhow::Result;
use clap::Parser;
use tracing::info;

use termlink::relay::{Args, run_relay_server};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    info!("Starting termlink relay");
    run_relay_server(args).await
}
