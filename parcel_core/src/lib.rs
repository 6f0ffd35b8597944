//! Parcel relay: brokers one-shot file deliveries between a sender and a
//! receiver that cannot reach each other directly.
//!
//! Senders upload a file with delivery instructions; the relay keeps at most
//! one pending delivery per receiver until the receiver polls, downloads and
//! acknowledges it.

pub mod config;
pub mod delivery;
pub mod error;
pub mod http_api;

pub use config::{AckMode, RelayConfig, RetentionPolicy};
pub use delivery::{Broker, BrokerOptions, DeliveryRequest, DeliverySlot, SlotStatus};
pub use error::BrokerError;

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Open the broker described by `config` and serve it until `cancel_token` fires
pub async fn run_relay(config: RelayConfig, cancel_token: CancellationToken) -> anyhow::Result<()> {
    let broker = Broker::open(&config)
        .await
        .with_context(|| format!("Failed to open data directory {:?}", config.data_dir))?;

    http_api::start_http_server(
        config.bind_addr,
        Arc::new(broker),
        Duration::from_secs(config.request_timeout_secs),
        Some(cancel_token),
    )
    .await
}
