//! Ingestion Error Types
//!
//! Errors are graded by what they fail:
//!
//! - Per-message (`Decode`-class) problems never surface here - the batch
//!   handler skips the message, advances the partition offset, and moves on.
//! - `BufferWrite` (local disk) fails the whole batch; the broker redelivers
//!   and watermarks suppress the duplicates.
//! - `Flush` and `Kv` leave the affected buffer open; the commit coordinator
//!   withholds the offset until a later pass succeeds.
//! - `Commit` is retried on the next periodic pass.

use std::time::Duration;

use thiserror::Error;

use crate::buffer::BufferState;

pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("buffer is {state:?}, not open")]
    BufferClosed { state: BufferState },

    #[error("buffer write failed: {0}")]
    BufferWrite(#[from] std::io::Error),

    #[error("flush upload failed: {0}")]
    Flush(String),

    #[error("offset commit failed: {0}")]
    Commit(String),

    #[error("kv store failure: {0}")]
    Kv(String),

    #[error("team lookup failure: {0}")]
    Teams(String),

    #[error("partition {0} is not owned by this consumer")]
    PartitionNotOwned(i32),

    #[error("partition {partition} cannot move from {from:?} to {to:?}")]
    InvalidPartitionTransition {
        partition: i32,
        from: crate::lifecycle::PartitionState,
        to: crate::lifecycle::PartitionState,
    },

    #[error("revocation did not complete within {0:?}")]
    RevocationTimeout(Duration),

    #[error("metadata encode failed: {0}")]
    MetadataEncode(#[from] serde_json::Error),
}

impl From<sessionhouse_store::StoreError> for IngestError {
    fn from(err: sessionhouse_store::StoreError) -> Self {
        match err {
            sessionhouse_store::StoreError::Kv(msg) => IngestError::Kv(msg),
            sessionhouse_store::StoreError::Log(msg) => IngestError::Commit(msg),
            sessionhouse_store::StoreError::Teams(msg) => IngestError::Teams(msg),
        }
    }
}
