//! Error types for the record store and the persistence engine.

use thiserror::Error;

/// Result alias for record store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result alias for persistence operations.
pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Errors raised by a [`RecordStore`](crate::store::RecordStore) backend.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Backend failure (RocksDB error, missing column family, ...)
    #[error("Database error: {0}")]
    Database(String),
    /// Record envelope could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Record envelope could not be decoded
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    /// Stored key does not follow the record key layout
    #[error("Invalid record key: {0}")]
    InvalidKey(String),
    /// The store was closed
    #[error("Record store is closed")]
    Closed,
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Errors raised by [`Persistence`](crate::Persistence) operations.
#[derive(Debug, Clone, Error)]
pub enum PersistenceError {
    /// The backing store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A chunked update could not be reassembled.
    #[error("Malformed record for `{doc_name}` at clock {clock}: {reason}")]
    MalformedRecord {
        doc_name: String,
        clock: u64,
        reason: String,
    },

    /// The CRDT library rejected a payload.
    #[error("CRDT error: {0}")]
    Crdt(String),

    /// A meta value could not be (de)serialized.
    #[error("Meta value error: {0}")]
    Meta(String),

    /// LZ4 decompression failed.
    #[error("Compression error: {0}")]
    Compression(String),

    /// Configuration rejected at construction time.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// `destroy` has already been called.
    #[error("Persistence has been destroyed")]
    Closed,
}

impl PersistenceError {
    /// Whether this error means the backing store could not be reached or
    /// refused the operation. Such errors are surfaced as-is; retrying is up
    /// to the caller.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(
            self,
            PersistenceError::Store(StoreError::Database(_) | StoreError::Closed)
                | PersistenceError::Closed
        )
    }

    pub(crate) fn malformed(doc_name: &str, clock: u64, reason: impl Into<String>) -> Self {
        PersistenceError::MalformedRecord {
            doc_name: doc_name.to_string(),
            clock,
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(e: serde_json::Error) -> Self {
        PersistenceError::Meta(e.to_string())
    }
}
