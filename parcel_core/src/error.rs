//! Error taxonomy of the delivery broker.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    /// Intake without a file or with an empty file name
    #[error("missing payload: a file with a non-empty name is required")]
    MissingPayload,

    #[error("receiver not registered: {0}")]
    UnknownReceiver(String),

    #[error("payload not found: {0}")]
    PayloadNotFound(String),

    #[error("invalid receiver id: {0}")]
    InvalidIdentity(String),

    #[error("payload too large: {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: u64, limit: u64 },

    /// Disk full, permission denied and friends
    #[error("storage failure: {0}")]
    Storage(#[from] std::io::Error),

    #[error("registry document is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}
