//! Receiver registry.
//!
//! Maps receiver identities to their display name and their single delivery
//! slot. All access goes through one `RwLock`; every mutation is persisted
//! while the write lock is still held, and rolled back in memory if the
//! document cannot be written.

use super::slot::{DeliverySlot, ReceiverRecord, ReceiverSummary, SlotStatus};
use super::utils::{default_display_name, validate_identity};
use crate::error::BrokerError;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;
use tokio::sync::RwLock;

type Receivers = HashMap<String, ReceiverRecord>;

pub struct Registry {
    receivers: RwLock<Receivers>,
    /// JSON document the registry is mirrored to; `None` keeps it in memory only
    persist_path: Option<PathBuf>,
}

impl Registry {
    pub fn in_memory() -> Self {
        Self {
            receivers: RwLock::new(HashMap::new()),
            persist_path: None,
        }
    }

    /// Load the registry document at `path`, or start empty if it does not exist
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, BrokerError> {
        let path = path.into();
        let receivers = match fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str::<Receivers>(&content)?,
            Err(e) if e.kind() == ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        tracing::info!(
            "Loaded {} receiver(s) from {:?}",
            receivers.len(),
            path
        );

        Ok(Self {
            receivers: RwLock::new(receivers),
            persist_path: Some(path),
        })
    }

    async fn save(&self, receivers: &Receivers) -> Result<(), BrokerError> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };

        let json = serde_json::to_string_pretty(receivers)?;
        let tmp_path = path.with_extension("json.tmp");
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&tmp_path, json).await?;
        fs::rename(&tmp_path, path).await?;
        Ok(())
    }

    /// Persist after a mutation of `identity`, restoring `before` on failure
    async fn commit(
        &self,
        receivers: &mut Receivers,
        identity: &str,
        before: Option<ReceiverRecord>,
    ) -> Result<(), BrokerError> {
        if let Err(e) = self.save(receivers).await {
            tracing::error!("Failed to persist registry: {}", e);
            match before {
                Some(record) => receivers.insert(identity.to_string(), record),
                None => receivers.remove(identity),
            };
            return Err(e);
        }
        Ok(())
    }

    /// Create a receiver or rename an existing one; returns the name in effect.
    ///
    /// Re-registration never touches the receiver's delivery slot.
    pub async fn register(
        &self,
        identity: &str,
        display_name: Option<&str>,
    ) -> Result<String, BrokerError> {
        validate_identity(identity)?;
        let name = display_name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| default_display_name(identity));

        let mut receivers = self.receivers.write().await;
        let before = receivers.get(identity).cloned();
        match receivers.get_mut(identity) {
            Some(record) => record.name = name.clone(),
            None => {
                receivers.insert(
                    identity.to_string(),
                    ReceiverRecord {
                        name: name.clone(),
                        pending_file: None,
                    },
                );
            }
        }
        self.commit(&mut receivers, identity, before).await?;

        Ok(name)
    }

    pub async fn contains(&self, identity: &str) -> bool {
        self.receivers.read().await.contains_key(identity)
    }

    /// Snapshot of all receivers, sorted by identity
    pub async fn list(&self) -> Vec<ReceiverSummary> {
        let receivers = self.receivers.read().await;
        let mut list: Vec<ReceiverSummary> = receivers
            .iter()
            .map(|(id, record)| ReceiverSummary {
                id: id.clone(),
                name: record.name.clone(),
            })
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    /// Identities that currently have a pending delivery
    pub async fn active(&self) -> Vec<String> {
        let receivers = self.receivers.read().await;
        let mut ids: Vec<String> = receivers
            .iter()
            .filter(|(_, r)| r.pending_file.as_ref().is_some_and(DeliverySlot::is_pending))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Replace the receiver's slot; returns the displaced slot, if any
    pub async fn set_slot(
        &self,
        identity: &str,
        slot: DeliverySlot,
    ) -> Result<Option<DeliverySlot>, BrokerError> {
        let mut receivers = self.receivers.write().await;
        let record = receivers
            .get_mut(identity)
            .ok_or_else(|| BrokerError::UnknownReceiver(identity.to_string()))?;
        let before = record.clone();
        let previous = record.pending_file.replace(slot);
        self.commit(&mut receivers, identity, Some(before)).await?;

        Ok(previous)
    }

    /// Current slot, whatever its status
    pub async fn get_slot(&self, identity: &str) -> Result<Option<DeliverySlot>, BrokerError> {
        let receivers = self.receivers.read().await;
        receivers
            .get(identity)
            .map(|r| r.pending_file.clone())
            .ok_or_else(|| BrokerError::UnknownReceiver(identity.to_string()))
    }

    /// Remove the receiver's slot. No-op for empty slots and unknown receivers.
    pub async fn clear_slot(&self, identity: &str) -> Result<Option<DeliverySlot>, BrokerError> {
        self.clear_where(identity, |_| true).await
    }

    /// Remove the slot only if it is pending and still references `payload_key`.
    ///
    /// A fetch of an older payload therefore cannot erase a newer intake.
    pub async fn clear_slot_if(
        &self,
        identity: &str,
        payload_key: &str,
    ) -> Result<Option<DeliverySlot>, BrokerError> {
        self.clear_where(identity, |slot| {
            slot.is_pending() && slot.payload_key == payload_key
        })
        .await
    }

    async fn clear_where(
        &self,
        identity: &str,
        matches: impl FnOnce(&DeliverySlot) -> bool,
    ) -> Result<Option<DeliverySlot>, BrokerError> {
        let mut receivers = self.receivers.write().await;
        let Some(record) = receivers.get_mut(identity) else {
            return Ok(None);
        };
        if !record.pending_file.as_ref().is_some_and(matches) {
            return Ok(None);
        }
        let before = record.clone();
        let removed = record.pending_file.take();
        self.commit(&mut receivers, identity, Some(before)).await?;

        Ok(removed)
    }

    /// Move a pending slot to `COMPLETED`.
    ///
    /// Returns the completed slot, or `None` if there was nothing pending.
    pub async fn mark_completed(
        &self,
        identity: &str,
    ) -> Result<Option<DeliverySlot>, BrokerError> {
        let mut receivers = self.receivers.write().await;
        let record = receivers
            .get_mut(identity)
            .ok_or_else(|| BrokerError::UnknownReceiver(identity.to_string()))?;

        let Some(slot) = record.pending_file.as_mut().filter(|s| s.is_pending()) else {
            return Ok(None);
        };
        slot.status = SlotStatus::Completed;
        let completed = slot.clone();

        let mut before = record.clone();
        if let Some(s) = before.pending_file.as_mut() {
            s.status = SlotStatus::Pending;
        }
        self.commit(&mut receivers, identity, Some(before)).await?;

        Ok(Some(completed))
    }
}
