//! Onitu Store - the shared metadata store
//!
//! A typed key-value store over SQLite, shared by every process of a
//! session. Keys are canonical UTF-8 strings with `:` as hierarchical
//! separator; values are self-describing JSON records. The store offers
//! point reads/writes, lexicographic range scans, and atomic write batches.
//!
//! Closing the store flips every subsequent call to [`StoreError::Closed`],
//! which the rest of the system treats as a clean shutdown signal.

pub mod keys;
mod store;

pub use store::{Store, WriteBatch};

use thiserror::Error;

/// Errors surfaced by the metadata store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store has been closed; shutdown is in progress.
    #[error("metadata store closed")]
    Closed,

    /// Underlying database failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Filesystem failure while preparing the store location.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A value could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<StoreError> for onitu_core::Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Closed => onitu_core::Error::StoreClosed,
            other => onitu_core::Error::service(other.to_string()),
        }
    }
}
