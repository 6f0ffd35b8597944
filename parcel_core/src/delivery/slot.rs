//! Delivery slot and receiver record types.

use serde::{Deserialize, Serialize};

/// Lifecycle tag of a delivery slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlotStatus {
    Pending,
    Completed,
}

/// The single outstanding delivery held for a receiver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliverySlot {
    /// Key of the stored payload (non-owning reference into the payload store)
    #[serde(alias = "unique_filename")]
    pub payload_key: String,
    /// Sanitized name the sender uploaded the file under
    pub original_name: String,
    /// Where the receiver should place the file; never interpreted here
    pub target_path: String,
    /// Whether the receiver should run the file after saving it
    pub execute: bool,
    #[serde(default = "pending")]
    pub status: SlotStatus,
    /// Payload size in bytes
    #[serde(default)]
    pub size: u64,
    /// BLAKE3 hash of the payload (64-character hex string)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_hash: Option<String>,
    /// Unix timestamp when the slot was created
    #[serde(default)]
    pub created_at: u64,
}

fn pending() -> SlotStatus {
    SlotStatus::Pending
}

impl DeliverySlot {
    pub fn is_pending(&self) -> bool {
        self.status == SlotStatus::Pending
    }
}

/// Persisted receiver record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverRecord {
    pub name: String,
    #[serde(default)]
    pub pending_file: Option<DeliverySlot>,
}

/// Public view of a registered receiver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiverSummary {
    pub id: String,
    pub name: String,
}

/// Sender-supplied delivery instructions accompanying a payload
#[derive(Debug, Clone, Default)]
pub struct DeliveryRequest {
    pub receiver_id: String,
    pub file_name: String,
    pub target_path: String,
    pub execute: bool,
}

/// Acknowledgement returned by a successful intake
#[derive(Debug, Clone, Serialize)]
pub struct IntakeReceipt {
    pub file_name: String,
    pub receiver_id: String,
    pub payload_key: String,
    pub size: u64,
}
