//! # crdt-docstore: Durable storage for Yrs documents
//!
//! Persists incremental CRDT updates per document in an append-only log,
//! with checkpoints, checkpoint-aware compaction and point-in-time
//! reconstruction.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  encoded updates   ┌──────────────┐
//! │  Caller     │ ─────────────────► │ Persistence  │
//! │  (server)   │ ◄───────────────── │  (facade)    │
//! └─────────────┘   yrs::Doc / diff  └──────┬───────┘
//!                                           │
//!                 ┌──────────────┬──────────┼──────────────┬───────────┐
//!                 ▼              ▼          ▼              ▼           ▼
//!           ClockManager    UpdateLog   Compactor   CheckpointManager  MetaStore
//!                                │  chunk │ lz4
//!                                ▼
//!                    ┌───────────────────────────┐
//!                    │ RecordStore               │
//!                    │  RocksDB CF "yjs-writings"│
//!                    │  or in-memory BTreeMap    │
//!                    └───────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`persistence`]: public facade ([`Persistence`])
//! - [`update_log`]: append / range read / atomic replace
//! - [`compaction`]: merges update runs between checkpoints
//! - [`checkpoint`]: checkpoint clocks and the intervals they fence
//! - [`reconstruct`]: replay into a `yrs::Doc`
//! - [`chunk`]: splits oversized payloads into parts
//! - [`store`]: record store trait, RocksDB and in-memory backends
//!
//! ## Example
//!
//! ```no_run
//! use crdt_docstore::{Persistence, PersistenceConfig};
//!
//! # fn main() -> crdt_docstore::Result<()> {
//! let persistence = Persistence::new("/var/lib/docs", PersistenceConfig::default())?;
//! # let update: Vec<u8> = Vec::new();
//! let clock = persistence.store_update("my-doc", &update)?;
//! let checkpoint = persistence.checkpoint("my-doc")?;
//! let doc = persistence.get_ydoc("my-doc", Some(checkpoint))?;
//! # let _ = (clock, doc);
//! persistence.destroy()?;
//! # Ok(())
//! # }
//! ```

pub mod checkpoint;
pub mod chunk;
pub mod clock;
pub mod compaction;
pub mod config;
pub mod crdt;
pub mod error;
pub mod meta;
pub mod persistence;
pub mod reconstruct;
pub mod record;
pub mod store;
pub mod update_log;

// Re-exports for convenience
pub use compaction::CompactionReport;
pub use config::{
    Connection, PersistenceConfig, RocksConfig, DEFAULT_COLLECTION, DEFAULT_FLUSH_SIZE,
    DEFAULT_MAX_PART_SIZE,
};
pub use error::{PersistenceError, Result, StoreError, StoreResult};
pub use persistence::{DocStateVector, Persistence, StoredStateVector};
pub use record::{Record, RecordKey, RecordKind};
pub use store::{Db, Filter, MemoryRecordStore, Order, RecordStore, RocksRecordStore, WriteOp};
