use anyhow::Result;
use parcel_core::{RelayConfig, run_relay};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // 0. Initialize logging (RUST_LOG overrides the default level)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    // 1. Load configuration: defaults, config.json, .env and PARCEL_* variables
    let config = RelayConfig::load()?;
    tracing::info!(
        "Starting relay on {} (data dir {:?})",
        config.bind_addr,
        config.data_dir
    );

    // 2. Stop serving on Ctrl-C
    let cancel_token = CancellationToken::new();
    let shutdown = cancel_token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Shutdown requested");
                shutdown.cancel();
            }
            Err(e) => tracing::error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    // 3. Serve until cancelled
    if let Err(e) = run_relay(config, cancel_token).await {
        tracing::error!("Relay failed: {:#}", e);
        return Err(e);
    }

    tracing::info!("Relay stopped");
    Ok(())
}
