//! relay-gateway - HTTP Server Entry Point
//!
//! Starts the HTTP server that exposes the relay API.

use relay_gateway::{api, config::Config};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay_gateway=debug,usage=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    info!(
        channels_file = %config.channels_file.display(),
        retry_times = config.retry_times,
        timeout_secs = config.request_timeout.as_secs(),
        "Loaded configuration"
    );
    if config.database_path.is_none() {
        info!("RELAY_DATABASE_PATH is empty, task bindings are kept in memory");
    }

    // Start HTTP server
    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting server on {}", addr);

    api::serve(config).await?;

    Ok(())
}
