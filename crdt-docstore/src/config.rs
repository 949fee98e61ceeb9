//! Engine configuration and connection selection.

use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{PersistenceError, Result};
use crate::store::rocks::Db;

/// Default collection (column family) name.
pub const DEFAULT_COLLECTION: &str = "yjs-writings";

/// Default open-interval record count before automatic compaction.
pub const DEFAULT_FLUSH_SIZE: usize = 400;

/// Default chunk ceiling: payload bytes per stored update part.
pub const DEFAULT_MAX_PART_SIZE: usize = 15_000_000;

/// RocksDB tuning knobs.
#[derive(Debug, Clone)]
pub struct RocksConfig {
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for RocksConfig {
    fn default() -> Self {
        Self {
            block_cache_size: 256 * 1024 * 1024, // 256MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024, // 64MB
        }
    }
}

impl RocksConfig {
    /// Small caches for tests.
    pub fn for_testing() -> Self {
        Self {
            block_cache_size: 8 * 1024 * 1024, // 8MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024, // 4MB
        }
    }
}

/// Persistence configuration.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Collection holding every record (a RocksDB column family)
    pub collection_name: String,
    /// Automatic compaction fires once the open interval holds more than
    /// this many update records
    pub flush_size: usize,
    /// Maximum payload bytes per stored update part
    pub max_part_size: usize,
    /// LZ4-compress update payloads before chunking
    pub compress_payloads: bool,
    /// RocksDB tuning (ignored for non-RocksDB stores)
    pub rocks: RocksConfig,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            collection_name: DEFAULT_COLLECTION.to_string(),
            flush_size: DEFAULT_FLUSH_SIZE,
            max_part_size: DEFAULT_MAX_PART_SIZE,
            compress_payloads: false,
            rocks: RocksConfig::default(),
        }
    }
}

impl PersistenceConfig {
    /// Config for testing: small RocksDB caches, default thresholds.
    pub fn for_testing() -> Self {
        Self {
            rocks: RocksConfig::for_testing(),
            ..Self::default()
        }
    }

    pub fn with_collection(mut self, name: impl Into<String>) -> Self {
        self.collection_name = name.into();
        self
    }

    pub fn with_flush_size(mut self, flush_size: usize) -> Self {
        self.flush_size = flush_size;
        self
    }

    pub fn with_max_part_size(mut self, max_part_size: usize) -> Self {
        self.max_part_size = max_part_size;
        self
    }

    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compress_payloads = enabled;
        self
    }

    /// Reject configurations the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.collection_name.is_empty() {
            return Err(PersistenceError::Config("collection_name must not be empty".into()));
        }
        if self.flush_size == 0 {
            return Err(PersistenceError::Config("flush_size must be at least 1".into()));
        }
        if self.max_part_size == 0 {
            return Err(PersistenceError::Config("max_part_size must be at least 1".into()));
        }
        Ok(())
    }
}

/// Where the records live.
///
/// A `Path` is opened by the engine, which then owns the database and
/// releases it on `destroy`. A `Client` is a handle owned by the caller;
/// the engine never closes it.
#[derive(Clone)]
pub enum Connection {
    /// Open (or create) a RocksDB database at this path.
    Path(PathBuf),
    /// Use an already opened database.
    Client(Arc<Db>),
}

impl Connection {
    /// Whether the engine owns the underlying database.
    pub fn is_owned(&self) -> bool {
        matches!(self, Connection::Path(_))
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Connection::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Connection::Client(db) => f.debug_tuple("Client").field(&db.path()).finish(),
        }
    }
}

impl From<&str> for Connection {
    fn from(path: &str) -> Self {
        Connection::Path(PathBuf::from(path))
    }
}

impl From<String> for Connection {
    fn from(path: String) -> Self {
        Connection::Path(PathBuf::from(path))
    }
}

impl From<PathBuf> for Connection {
    fn from(path: PathBuf) -> Self {
        Connection::Path(path)
    }
}

impl From<&std::path::Path> for Connection {
    fn from(path: &std::path::Path) -> Self {
        Connection::Path(path.to_path_buf())
    }
}

impl From<Arc<Db>> for Connection {
    fn from(db: Arc<Db>) -> Self {
        Connection::Client(db)
    }
}
