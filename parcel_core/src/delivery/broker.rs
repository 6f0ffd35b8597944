//! Delivery broker: the intake and handoff paths around the registry.
//!
//! Every delivery moves through one state machine per receiver:
//!
//! ```text
//! EMPTY --intake--> PENDING --fetch (FetchClears)--> EMPTY
//!                   PENDING --complete-------------> COMPLETED
//! COMPLETED --intake--> PENDING
//! ```
//!
//! Payloads are persisted before a slot points at them, and released only
//! after the slot that referenced them is gone.

use super::registry::Registry;
use super::slot::{DeliveryRequest, DeliverySlot, IntakeReceipt, ReceiverSummary, SlotStatus};
use super::store::{PayloadStore, PayloadStream, StagedPayload};
use super::utils::{
    make_payload_key, now_timestamp, payload_key_file_name, payload_key_owner, sanitize_file_name,
};
use crate::config::{AckMode, RelayConfig, RetentionPolicy};
use crate::delivery::constants::{DEFAULT_MAX_UPLOAD_BYTES, PAYLOAD_DIR, REGISTRY_FILE};
use crate::error::BrokerError;
use bytes::Bytes;
use futures_util::{Stream, stream};

#[derive(Debug, Clone, Copy)]
pub struct BrokerOptions {
    pub ack_mode: AckMode,
    pub retention: RetentionPolicy,
    pub max_upload_bytes: u64,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            ack_mode: AckMode::default(),
            retention: RetentionPolicy::default(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

impl From<&RelayConfig> for BrokerOptions {
    fn from(config: &RelayConfig) -> Self {
        Self {
            ack_mode: config.ack_mode,
            retention: config.retention,
            max_upload_bytes: config.max_upload_bytes,
        }
    }
}

/// A payload handed to a receiver
pub struct FetchedPayload {
    pub stream: PayloadStream,
    /// Name to offer the receiver for saving
    pub file_name: String,
    pub payload_hash: Option<String>,
    /// Whether this fetch cleared the receiver's slot
    pub cleared_slot: bool,
}

pub struct Broker {
    registry: Registry,
    store: PayloadStore,
    options: BrokerOptions,
}

impl Broker {
    pub fn new(registry: Registry, store: PayloadStore, options: BrokerOptions) -> Self {
        Self {
            registry,
            store,
            options,
        }
    }

    /// Open the registry and payload store under the configured data directory
    pub async fn open(config: &RelayConfig) -> Result<Self, BrokerError> {
        tokio::fs::create_dir_all(&config.data_dir).await?;
        let registry = if config.persist_registry {
            Registry::open(config.data_dir.join(REGISTRY_FILE)).await?
        } else {
            Registry::in_memory()
        };
        let store = PayloadStore::open(config.data_dir.join(PAYLOAD_DIR)).await?;

        tracing::info!(
            "Broker ready: data dir {:?}, ack mode {:?}, retention {:?}",
            config.data_dir,
            config.ack_mode,
            config.retention
        );
        Ok(Self::new(registry, store, BrokerOptions::from(config)))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn store(&self) -> &PayloadStore {
        &self.store
    }

    pub fn options(&self) -> &BrokerOptions {
        &self.options
    }

    pub async fn register(
        &self,
        identity: &str,
        display_name: Option<&str>,
    ) -> Result<String, BrokerError> {
        let name = self.registry.register(identity, display_name).await?;
        tracing::info!("Receiver {} registered as {:?}", identity, name);
        Ok(name)
    }

    pub async fn list(&self) -> Vec<ReceiverSummary> {
        self.registry.list().await
    }

    pub async fn active(&self) -> Vec<String> {
        self.registry.active().await
    }

    /// Receive a payload into staging, ahead of its delivery instructions
    pub async fn stage<S, E>(&self, chunks: S) -> Result<StagedPayload, BrokerError>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: Into<std::io::Error>,
    {
        self.store.stage(chunks, self.options.max_upload_bytes).await
    }

    /// Store a staged payload and make it the receiver's pending delivery.
    ///
    /// Any previous slot is replaced. Nothing is persisted when validation
    /// fails: a dropped `StagedPayload` deletes itself.
    pub async fn intake(
        &self,
        request: DeliveryRequest,
        payload: Option<StagedPayload>,
    ) -> Result<IntakeReceipt, BrokerError> {
        let payload = match payload {
            Some(p) if !request.file_name.trim().is_empty() => p,
            _ => return Err(BrokerError::MissingPayload),
        };
        if !self.registry.contains(&request.receiver_id).await {
            tracing::warn!("Rejected upload for unknown receiver {}", request.receiver_id);
            return Err(BrokerError::UnknownReceiver(request.receiver_id));
        }

        let file_name = sanitize_file_name(&request.file_name);
        let payload_key = make_payload_key(&request.receiver_id, &file_name);
        let stored = self.store.commit(payload, &payload_key).await?;

        let slot = DeliverySlot {
            payload_key: payload_key.clone(),
            original_name: file_name.clone(),
            target_path: request.target_path,
            execute: request.execute,
            status: SlotStatus::Pending,
            size: stored.size,
            payload_hash: Some(stored.hash),
            created_at: now_timestamp(),
        };

        let displaced = match self.registry.set_slot(&request.receiver_id, slot).await {
            Ok(displaced) => displaced,
            Err(e) => {
                // The slot never pointed at it, so the payload is unreachable
                if let Err(remove_err) = self.store.remove(&payload_key).await {
                    tracing::warn!(
                        "Failed to remove orphaned payload {}: {}",
                        payload_key,
                        remove_err
                    );
                }
                return Err(e);
            }
        };
        if let Some(old) = displaced {
            tracing::info!(
                "Delivery {} for {} replaced by {}",
                old.payload_key,
                request.receiver_id,
                payload_key
            );
            self.release(&old.payload_key).await;
        }

        tracing::info!(
            "Accepted {} ({} bytes) for receiver {}",
            file_name,
            stored.size,
            request.receiver_id
        );
        Ok(IntakeReceipt {
            file_name,
            receiver_id: request.receiver_id,
            payload_key,
            size: stored.size,
        })
    }

    /// Intake an in-memory payload; `None` means no file was supplied
    pub async fn intake_bytes(
        &self,
        request: DeliveryRequest,
        bytes: Option<Bytes>,
    ) -> Result<IntakeReceipt, BrokerError> {
        if request.file_name.trim().is_empty() {
            return Err(BrokerError::MissingPayload);
        }
        let staged = match bytes {
            Some(b) => Some(
                self.stage(stream::iter([Ok::<_, std::io::Error>(b)]))
                    .await?,
            ),
            None => None,
        };
        self.intake(request, staged).await
    }

    /// The receiver's pending delivery, or `None` when nothing is pending
    pub async fn poll(&self, identity: &str) -> Result<Option<DeliverySlot>, BrokerError> {
        let slot = self
            .registry
            .get_slot(identity)
            .await?
            .filter(DeliverySlot::is_pending);
        tracing::debug!("Poll from {}: pending={}", identity, slot.is_some());
        Ok(slot)
    }

    /// The receiver's slot including completed ones
    pub async fn inspect(&self, identity: &str) -> Result<Option<DeliverySlot>, BrokerError> {
        self.registry.get_slot(identity).await
    }

    /// Open a payload for download.
    ///
    /// In `FetchClears` mode, the owning receiver's slot is cleared if it is
    /// still pending on this exact key. A cleared payload is deleted once the
    /// returned stream is dropped (under `DeleteOnRelease`).
    pub async fn fetch(&self, payload_key: &str) -> Result<FetchedPayload, BrokerError> {
        let file = self.store.open_payload(payload_key).await?;
        let owner = payload_key_owner(payload_key)
            .ok_or_else(|| BrokerError::PayloadNotFound(payload_key.to_string()))?;

        let current = self
            .registry
            .get_slot(&owner)
            .await
            .ok()
            .flatten()
            .filter(|slot| slot.payload_key == payload_key);

        // Opened before any slot changes so a failure here leaves the slot alone
        let mut stream = PayloadStream::new(file, None).await?;

        let cleared = match self.options.ack_mode {
            AckMode::FetchClears => self.registry.clear_slot_if(&owner, payload_key).await?,
            AckMode::ExplicitComplete => None,
        };
        let cleared_slot = cleared.is_some();
        if cleared_slot {
            tracing::info!("Delivery {} fetched by {}, slot cleared", payload_key, owner);
            if self.options.retention == RetentionPolicy::DeleteOnRelease {
                stream.release_on_drop(self.store.removal_guard(payload_key));
            }
        } else {
            tracing::info!("Payload {} fetched", payload_key);
        }

        let slot = cleared.or(current);
        let file_name = slot
            .as_ref()
            .map(|s| s.original_name.clone())
            .or_else(|| payload_key_file_name(payload_key).map(str::to_string))
            .unwrap_or_else(|| payload_key.to_string());

        Ok(FetchedPayload {
            stream,
            file_name,
            payload_hash: slot.and_then(|s| s.payload_hash),
            cleared_slot,
        })
    }

    /// Mark the receiver's pending delivery as completed.
    ///
    /// Returns whether a pending delivery was completed. The slot is kept with
    /// status `COMPLETED`; its payload is released.
    pub async fn complete(&self, identity: &str) -> Result<bool, BrokerError> {
        match self.registry.mark_completed(identity).await? {
            Some(slot) => {
                tracing::info!("Delivery {} completed by {}", slot.payload_key, identity);
                self.release(&slot.payload_key).await;
                Ok(true)
            }
            None => {
                tracing::debug!("Complete from {} with nothing pending", identity);
                Ok(false)
            }
        }
    }

    /// Delete a payload nothing references any more
    async fn release(&self, payload_key: &str) {
        if self.options.retention == RetentionPolicy::Keep {
            return;
        }
        if let Err(e) = self.store.remove(payload_key).await {
            tracing::warn!("Failed to release payload {}: {}", payload_key, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn broker(dir: &tempfile::TempDir, options: BrokerOptions) -> Broker {
        let store = PayloadStore::open(dir.path().join(PAYLOAD_DIR))
            .await
            .unwrap();
        Broker::new(Registry::in_memory(), store, options)
    }

    fn request(receiver: &str, file_name: &str) -> DeliveryRequest {
        DeliveryRequest {
            receiver_id: receiver.to_string(),
            file_name: file_name.to_string(),
            target_path: "/tmp".to_string(),
            execute: false,
        }
    }

    #[tokio::test]
    async fn test_failed_slot_write_removes_payload() {
        let dir = tempfile::tempdir().unwrap();
        let registry_path = dir.path().join(REGISTRY_FILE);
        let registry = Registry::open(&registry_path).await.unwrap();
        let store = PayloadStore::open(dir.path().join(PAYLOAD_DIR))
            .await
            .unwrap();
        let broker = Broker::new(registry, store, BrokerOptions::default());
        broker.register("r1", None).await.unwrap();

        // A directory in place of the document makes every later save fail
        std::fs::remove_file(&registry_path).unwrap();
        std::fs::create_dir(&registry_path).unwrap();

        let result = broker
            .intake_bytes(request("r1", "a.txt"), Some(Bytes::from_static(b"hi")))
            .await;
        assert!(matches!(result, Err(BrokerError::Storage(_))));
        assert!(broker.poll("r1").await.unwrap().is_none());
        let payloads = std::fs::read_dir(dir.path().join(PAYLOAD_DIR)).unwrap().count();
        assert_eq!(payloads, 0);
    }

    #[tokio::test]
    async fn test_intake_rejects_missing_payload() {
        let dir = tempfile::tempdir().unwrap();
        let broker = broker(&dir, BrokerOptions::default()).await;
        broker.register("r1", None).await.unwrap();

        assert!(matches!(
            broker.intake_bytes(request("r1", "a.txt"), None).await,
            Err(BrokerError::MissingPayload)
        ));
        assert!(matches!(
            broker
                .intake_bytes(request("r1", ""), Some(Bytes::from_static(b"hi")))
                .await,
            Err(BrokerError::MissingPayload)
        ));
        assert!(broker.poll("r1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_payload_checked_before_receiver() {
        let dir = tempfile::tempdir().unwrap();
        let broker = broker(&dir, BrokerOptions::default()).await;

        assert!(matches!(
            broker.intake_bytes(request("ghost", ""), None).await,
            Err(BrokerError::MissingPayload)
        ));
    }

    #[tokio::test]
    async fn test_intake_over_limit() {
        let dir = tempfile::tempdir().unwrap();
        let options = BrokerOptions {
            max_upload_bytes: 4,
            ..BrokerOptions::default()
        };
        let broker = broker(&dir, options).await;
        broker.register("r1", None).await.unwrap();

        assert!(matches!(
            broker
                .intake_bytes(request("r1", "a.txt"), Some(Bytes::from_static(b"too long")))
                .await,
            Err(BrokerError::PayloadTooLarge { .. })
        ));
        assert!(broker.poll("r1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fetch_in_explicit_mode_keeps_slot() {
        let dir = tempfile::tempdir().unwrap();
        let options = BrokerOptions {
            ack_mode: AckMode::ExplicitComplete,
            ..BrokerOptions::default()
        };
        let broker = broker(&dir, options).await;
        broker.register("r1", None).await.unwrap();
        let receipt = broker
            .intake_bytes(request("r1", "a.txt"), Some(Bytes::from_static(b"hi")))
            .await
            .unwrap();

        let fetched = broker.fetch(&receipt.payload_key).await.unwrap();
        assert!(!fetched.cleared_slot);
        assert_eq!(fetched.file_name, "a.txt");
        assert_eq!(fetched.stream.collect_bytes().await.unwrap(), b"hi");
        assert!(broker.poll("r1").await.unwrap().is_some());

        assert!(broker.complete("r1").await.unwrap());
        assert!(broker.poll("r1").await.unwrap().is_none());
        assert!(!broker.store().contains(&receipt.payload_key).await);
    }

    #[tokio::test]
    async fn test_keep_retention() {
        let dir = tempfile::tempdir().unwrap();
        let options = BrokerOptions {
            retention: RetentionPolicy::Keep,
            ..BrokerOptions::default()
        };
        let broker = broker(&dir, options).await;
        broker.register("r1", None).await.unwrap();

        let first = broker
            .intake_bytes(request("r1", "a.txt"), Some(Bytes::from_static(b"1")))
            .await
            .unwrap();
        let second = broker
            .intake_bytes(request("r1", "b.txt"), Some(Bytes::from_static(b"2")))
            .await
            .unwrap();
        assert!(broker.store().contains(&first.payload_key).await);

        let fetched = broker.fetch(&second.payload_key).await.unwrap();
        assert!(fetched.cleared_slot);
        assert!(!fetched.stream.releases_payload());
        drop(fetched);
        assert!(broker.store().contains(&second.payload_key).await);
    }

    #[tokio::test]
    async fn test_fetch_reports_hash() {
        let dir = tempfile::tempdir().unwrap();
        let broker = broker(&dir, BrokerOptions::default()).await;
        broker.register("r1", None).await.unwrap();
        let receipt = broker
            .intake_bytes(request("r1", "a.txt"), Some(Bytes::from_static(b"hi")))
            .await
            .unwrap();

        let fetched = broker.fetch(&receipt.payload_key).await.unwrap();
        assert_eq!(
            fetched.payload_hash.as_deref(),
            Some(blake3::hash(b"hi").to_hex().as_str())
        );
    }
}
