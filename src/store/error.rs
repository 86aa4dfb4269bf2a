use thiserror::Error;

use super::entities::RecordId;

/// Errors produced by [RecordStore](super::RecordStore) implementations and by decoding
/// their results.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to read/write record journal: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Record {0} not found")]
    NotFound(RecordId),

    #[error("Duration {0} is not a valid number of minutes")]
    InvalidDuration(f64),

    #[error("Aggregate result field '{field}' has unexpected value {value}")]
    MalformedAggregate {
        field: String,
        value: serde_json::Value,
    },
}
