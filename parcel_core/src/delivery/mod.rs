//! Pending-delivery core.
//!
//! This module provides:
//! - The receiver registry and its per-receiver delivery slot
//! - The filesystem payload store
//! - The broker tying intake (sender side) and handoff (receiver side) together

pub mod broker;
pub mod constants;
pub mod registry;
pub mod slot;
pub mod store;
pub mod utils;

// Re-export public API
pub use broker::{Broker, BrokerOptions, FetchedPayload};
pub use registry::Registry;
pub use slot::{
    DeliveryRequest, DeliverySlot, IntakeReceipt, ReceiverRecord, ReceiverSummary, SlotStatus,
};
pub use store::{PayloadStore, PayloadStream, StagedPayload};
