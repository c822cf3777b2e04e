use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use instanseg_server::{serve, Config};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = Config::new();
    serve(&config)
        .await
        .with_context(|| format!("Failed to serve on {}", config.bind_address()))
}
