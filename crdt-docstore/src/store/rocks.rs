//! RocksDB-backed record store.
//!
//! One column family per collection. Every record of the collection lives
//! in that column family under its encoded [`RecordKey`]; the value is the
//! bincode-encoded [`StoredRecord`] envelope.
//!
//! - Prefix scans per document (`name_len ‖ doc_name`) serve `find`
//! - `SeekForPrev` serves `find_last` (current clock lookup)
//! - `WriteBatch` gives the all-or-nothing `write_batch` used by compaction
//!
//! Reference: Kleppmann, DDIA Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, BoundColumnFamily, Cache, DBCompressionType, DBWithThreadMode, Direction,
    IteratorMode, MultiThreaded, Options, WriteBatch, WriteOptions,
};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use super::{prefix_upper_bound, sort_by_order, Filter, Order, RecordStore, WriteOp};
use crate::config::RocksConfig;
use crate::error::{StoreError, StoreResult};
use crate::record::{Record, RecordKey, StoredRecord};

/// RocksDB handle type accepted by [`Connection::Client`](crate::Connection::Client).
///
/// Multi-threaded column family mode, so a collection can be created on a
/// shared handle without exclusive access.
pub type Db = DBWithThreadMode<MultiThreaded>;

/// RocksDB-backed [`RecordStore`] for one collection.
pub struct RocksRecordStore {
    db: Arc<Db>,
    collection: String,
    sync_writes: bool,
    /// Next insertion sequence number
    sequence: AtomicU64,
    closed: AtomicBool,
}

impl RocksRecordStore {
    /// Open (or create) the database at `path` and bind to `collection`.
    pub fn open(
        path: impl AsRef<Path>,
        collection: &str,
        config: &RocksConfig,
    ) -> StoreResult<Self> {
        let db = Self::open_db(path, config)?;
        Self::with_db(db, collection, config)
    }

    /// Open (or create) a database that several stores may share.
    ///
    /// Existing column families are reopened with the same tuning.
    pub fn open_db(path: impl AsRef<Path>, config: &RocksConfig) -> StoreResult<Arc<Db>> {
        let path = path.as_ref();
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(128 * 1024 * 1024); // 128MB WAL limit
        db_opts.increase_parallelism(num_cpus());

        // A fresh directory has no column family list yet
        let existing = Db::list_cf(&db_opts, path).unwrap_or_default();
        let descriptors: Vec<rocksdb::ColumnFamilyDescriptor> = existing
            .iter()
            .filter(|name| name.as_str() != rocksdb::DEFAULT_COLUMN_FAMILY_NAME)
            .map(|name| rocksdb::ColumnFamilyDescriptor::new(name, Self::cf_options(config)))
            .collect();

        let db = Db::open_cf_descriptors(&db_opts, path, descriptors)?;
        log::info!("Opened record database at {}", path.display());
        Ok(Arc::new(db))
    }

    /// Bind to `collection` on an already opened database, creating the
    /// column family if needed.
    pub fn with_db(db: Arc<Db>, collection: &str, config: &RocksConfig) -> StoreResult<Self> {
        if db.cf_handle(collection).is_none() {
            if let Err(e) = db.create_cf(collection, &Self::cf_options(config)) {
                // Another store may have created it concurrently
                if db.cf_handle(collection).is_none() {
                    return Err(e.into());
                }
            }
            log::debug!("Created collection '{collection}'");
        }

        let store = Self {
            db,
            collection: collection.to_string(),
            sync_writes: config.sync_writes,
            sequence: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        };
        let next = store.recover_sequence()?;
        store.sequence.store(next, Ordering::SeqCst);
        Ok(store)
    }

    /// Column-family options: bloom filter, LRU block cache, LZ4.
    fn cf_options(config: &RocksConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024); // 16KB blocks
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(4);
        opts
    }

    /// Highest insertion sequence in the collection, plus one.
    fn recover_sequence(&self) -> StoreResult<u64> {
        let cf = self.cf()?;
        let mut next = 0u64;
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            next = next.max(StoredRecord::decode_seq(&value)? + 1);
        }
        Ok(next)
    }

    /// The shared database handle.
    pub fn db(&self) -> &Arc<Db> {
        &self.db
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    fn cf(&self) -> StoreResult<Arc<BoundColumnFamily<'_>>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        self.db.cf_handle(&self.collection).ok_or_else(|| {
            StoreError::Database(format!("Column family '{}' not found", self.collection))
        })
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.sync_writes);
        write_opts
    }

    /// Insertion sequence for `key`: kept if the key exists, fresh otherwise.
    fn sequence_for(&self, cf: &Arc<BoundColumnFamily<'_>>, key: &RecordKey) -> StoreResult<u64> {
        match self.db.get_cf(cf, key.as_bytes())? {
            Some(bytes) => Ok(StoredRecord::decode(&bytes)?.seq),
            None => Ok(self.sequence.fetch_add(1, Ordering::SeqCst)),
        }
    }

    /// Forward scan over the filter's key prefix.
    fn scan(&self, filter: &Filter) -> StoreResult<Vec<(Box<[u8]>, StoredRecord)>> {
        let cf = self.cf()?;
        let prefix = filter.key_prefix();
        let mut found = Vec::new();

        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let stored = StoredRecord::decode(&value)?;
            log::trace!("Scanned record {:?} of '{}'", stored.record.kind(), stored.record.doc_name());
            if filter.matches(&stored.record) {
                found.push((key, stored));
            }
        }
        Ok(found)
    }
}

impl RecordStore for RocksRecordStore {
    fn put(&self, record: Record) -> StoreResult<()> {
        let cf = self.cf()?;
        let key = record.key();
        let seq = self.sequence_for(&cf, &key)?;
        let value = StoredRecord { seq, record }.encode()?;
        self.db
            .put_cf_opt(&cf, key.as_bytes(), &value, &self.write_options())?;
        Ok(())
    }

    fn get(&self, key: &RecordKey) -> StoreResult<Option<Record>> {
        let cf = self.cf()?;
        match self.db.get_cf(&cf, key.as_bytes())? {
            Some(bytes) => Ok(Some(StoredRecord::decode(&bytes)?.record)),
            None => Ok(None),
        }
    }

    fn find(&self, filter: &Filter, order: Order) -> StoreResult<Vec<StoredRecord>> {
        let mut found: Vec<StoredRecord> =
            self.scan(filter)?.into_iter().map(|(_, stored)| stored).collect();
        sort_by_order(&mut found, order);
        Ok(found)
    }

    fn find_last(&self, filter: &Filter) -> StoreResult<Option<Record>> {
        let cf = self.cf()?;
        let prefix = filter.key_prefix();
        let upper = prefix_upper_bound(&prefix);

        let mode = match &upper {
            Some(upper) => IteratorMode::From(upper, Direction::Reverse),
            None => IteratorMode::End,
        };
        for item in self.db.iterator_cf(&cf, mode) {
            let (key, value) = item?;
            // SeekForPrev may land exactly on the bound itself
            if let Some(upper) = &upper {
                if key.as_ref() >= upper.as_slice() {
                    continue;
                }
            }
            if !key.starts_with(&prefix) {
                break;
            }
            let stored = StoredRecord::decode(&value)?;
            if filter.matches(&stored.record) {
                return Ok(Some(stored.record));
            }
        }
        Ok(None)
    }

    fn count(&self, filter: &Filter) -> StoreResult<u64> {
        Ok(self.scan(filter)?.len() as u64)
    }

    fn delete_many(&self, filter: &Filter) -> StoreResult<u64> {
        let doomed = self.scan(filter)?;
        if doomed.is_empty() {
            return Ok(0);
        }
        let cf = self.cf()?;
        let mut batch = WriteBatch::default();
        for (key, _) in &doomed {
            batch.delete_cf(&cf, key);
        }
        self.db.write_opt(batch, &self.write_options())?;
        Ok(doomed.len() as u64)
    }

    fn write_batch(&self, ops: Vec<WriteOp>) -> StoreResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let cf = self.cf()?;
        let mut batch = WriteBatch::default();
        for op in ops {
            match op {
                WriteOp::Put(record) => {
                    let key = record.key();
                    let seq = self.sequence_for(&cf, &key)?;
                    let value = StoredRecord { seq, record }.encode()?;
                    batch.put_cf(&cf, key.as_bytes(), &value);
                }
                WriteOp::Delete(key) => batch.delete_cf(&cf, key.as_bytes()),
            }
        }
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    fn close(&self) -> StoreResult<()> {
        let cf = self.cf()?;
        self.db.flush_cf(&cf)?;
        self.closed.store(true, Ordering::Release);
        log::info!("Closed collection '{}'", self.collection);
        Ok(())
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{CheckpointRecord, RecordKind, StateVectorRecord, UpdateRecord};
    use tempfile::tempdir;

    fn update(doc: &str, clock: u64, part: u32) -> Record {
        Record::Update(UpdateRecord {
            doc_name: doc.into(),
            clock,
            part_index: part,
            part_count: 1,
            compressed: false,
            payload: format!("{doc}_{clock}_{part}").into_bytes(),
        })
    }

    fn state_vector(doc: &str) -> Record {
        Record::StateVector(StateVectorRecord {
            doc_name: doc.into(),
            clock: 1,
            value: vec![0],
        })
    }

    #[test]
    fn test_store_open_creates_collection() {
        let dir = tempdir().unwrap();
        let store =
            RocksRecordStore::open(dir.path().join("db"), "writings", &RocksConfig::for_testing())
                .unwrap();
        assert_eq!(store.collection(), "writings");
        assert!(store.db().cf_handle("writings").is_some());
        assert_eq!(store.count(&Filter::all()).unwrap(), 0);
    }

    #[test]
    fn test_put_find_in_clock_order() {
        let dir = tempdir().unwrap();
        let store =
            RocksRecordStore::open(dir.path().join("db"), "c", &RocksConfig::for_testing()).unwrap();
        for clock in [3, 1, 1000, 2] {
            store.put(update("doc", clock, 0)).unwrap();
        }
        store.put(state_vector("doc")).unwrap();

        let found = store
            .find(&Filter::doc("doc").kind(RecordKind::Update), Order::Key)
            .unwrap();
        let clocks: Vec<u64> = found.iter().filter_map(|s| s.record.clock()).collect();
        assert_eq!(clocks, vec![1, 2, 3, 1000]);
        assert_eq!(store.count(&Filter::doc("doc")).unwrap(), 5);
    }

    #[test]
    fn test_find_last_skips_following_kind() {
        let dir = tempdir().unwrap();
        let store =
            RocksRecordStore::open(dir.path().join("db"), "c", &RocksConfig::for_testing()).unwrap();
        store.put(update("doc", 1, 0)).unwrap();
        store.put(update("doc", 7, 0)).unwrap();
        store.put(update("doc", 7, 1)).unwrap();
        // Sorts right after the update range
        store.put(state_vector("doc")).unwrap();
        store.put(update("zzz", 50, 0)).unwrap();

        let last = store
            .find_last(&Filter::doc("doc").kind(RecordKind::Update))
            .unwrap()
            .unwrap();
        match last {
            Record::Update(u) => {
                assert_eq!(u.clock, 7);
                assert_eq!(u.part_index, 1);
            }
            other => panic!("unexpected record {other:?}"),
        }
        assert!(store
            .find_last(&Filter::doc("doc").kind(RecordKind::Checkpoint))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_write_batch_is_applied_together() {
        let dir = tempdir().unwrap();
        let store =
            RocksRecordStore::open(dir.path().join("db"), "c", &RocksConfig::for_testing()).unwrap();
        for clock in 1..=5 {
            store.put(update("doc", clock, 0)).unwrap();
        }
        let mut ops = vec![WriteOp::Put(update("doc", 5, 0))];
        ops.extend((1..5).map(|c| WriteOp::Delete(RecordKey::update("doc", c, 0))));
        store.write_batch(ops).unwrap();

        let remaining = store.find(&Filter::doc("doc"), Order::Key).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].record.clock(), Some(5));
    }

    #[test]
    fn test_delete_many_leaves_other_documents() {
        let dir = tempdir().unwrap();
        let store =
            RocksRecordStore::open(dir.path().join("db"), "c", &RocksConfig::for_testing()).unwrap();
        store.put(update("a", 1, 0)).unwrap();
        store.put(state_vector("a")).unwrap();
        store
            .put(Record::Checkpoint(CheckpointRecord {
                doc_name: "a".into(),
                clock: 1,
            }))
            .unwrap();
        store.put(update("b", 1, 0)).unwrap();

        assert_eq!(store.delete_many(&Filter::doc("a")).unwrap(), 3);
        assert_eq!(store.count(&Filter::all()).unwrap(), 1);
    }

    #[test]
    fn test_sequence_recovery_keeps_first_seen_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        let config = RocksConfig::for_testing();
        {
            let store = RocksRecordStore::open(&path, "c", &config).unwrap();
            store.put(state_vector("zeta")).unwrap();
            store.put(state_vector("alpha")).unwrap();
        }
        {
            let store = RocksRecordStore::open(&path, "c", &config).unwrap();
            store.put(state_vector("mid")).unwrap();
            // Upsert keeps the original position
            store.put(state_vector("zeta")).unwrap();
            let names: Vec<String> = store
                .find(&Filter::all(), Order::Insertion)
                .unwrap()
                .iter()
                .map(|s| s.record.doc_name().to_string())
                .collect();
            assert_eq!(names, vec!["zeta", "alpha", "mid"]);
        }
    }

    #[test]
    fn test_collections_share_one_database() {
        let dir = tempdir().unwrap();
        let config = RocksConfig::for_testing();
        let db = RocksRecordStore::open_db(dir.path().join("db"), &config).unwrap();
        let first = RocksRecordStore::with_db(db.clone(), "first", &config).unwrap();
        let second = RocksRecordStore::with_db(db.clone(), "second", &config).unwrap();

        first.put(update("doc", 1, 0)).unwrap();
        assert_eq!(first.count(&Filter::all()).unwrap(), 1);
        assert_eq!(second.count(&Filter::all()).unwrap(), 0);
    }

    #[test]
    fn test_closed_store_rejects_operations() {
        let dir = tempdir().unwrap();
        let store =
            RocksRecordStore::open(dir.path().join("db"), "c", &RocksConfig::for_testing()).unwrap();
        store.close().unwrap();
        assert!(matches!(store.put(update("doc", 1, 0)), Err(StoreError::Closed)));
    }
}
