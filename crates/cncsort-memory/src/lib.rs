//! `cncsort-memory` – Durable records
//!
//! # Modules
//!
//! - [`detection_store`] – the [`DetectionStore`] trait with its SQLite
//!   ([`SqliteDetectionStore`]) and in-memory ([`InMemoryDetectionStore`])
//!   implementations.  Status updates are monotonic in both.
//! - [`map_archive`] – [`MapArchive`]: writes a bed map's metadata, raw
//!   frames and composite to disk.

use cncsort_types::{ObjectId, SorterError, WorkStatus};
use thiserror::Error;

pub mod detection_store;
pub mod map_archive;

pub use detection_store::{DetectionStore, InMemoryDetectionStore, SqliteDetectionStore};
pub use map_archive::{ArchiveMetadata, MapArchive};

/// Errors that can arise from store and archive operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Object not found: {0}")]
    NotFound(ObjectId),

    #[error("Object {id}: status cannot move from {from} to {to}")]
    InvalidTransition {
        id: ObjectId,
        from: WorkStatus,
        to: WorkStatus,
    },

    #[error("Corrupt record {id}: {details}")]
    Corrupt { id: String, details: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StoreError> for SorterError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::InvalidTransition { from, to, .. } => SorterError::InvalidTransition { from, to },
            other => SorterError::Store(other.to_string()),
        }
    }
}
