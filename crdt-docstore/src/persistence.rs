//! The `Persistence` facade: the public operation surface of the engine.
//!
//! ```text
//!                    ┌──────────────┐
//!  store_update ───► │ ClockManager │ per-document lock
//!  checkpoint        └──────┬───────┘
//!  flush_document           ▼
//!  clear_document    ┌──────────────┐   ┌────────────┐
//!                    │  UpdateLog   │◄──│ Compactor  │◄── CheckpointManager
//!                    └──────┬───────┘   └────────────┘
//!  get_ydoc ───────► Reconstructor
//!                           ▼
//!                    ┌──────────────┐
//!                    │ RecordStore  │ RocksDB column family / in-memory
//!                    └──────────────┘
//! ```

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;
use yrs::Doc;

use crate::checkpoint::CheckpointManager;
use crate::clock::ClockManager;
use crate::compaction::{CompactionReport, Compactor};
use crate::config::{Connection, PersistenceConfig};
use crate::crdt;
use crate::error::{PersistenceError, Result};
use crate::meta::MetaStore;
use crate::reconstruct::Reconstructor;
use crate::record::{Record, RecordKind};
use crate::store::{Filter, MemoryRecordStore, Order, RecordStore, RocksRecordStore};
use crate::update_log::UpdateLog;

/// A document's state vector together with the clock it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredStateVector {
    pub state_vector: Vec<u8>,
    pub clock: u64,
}

/// One entry of [`Persistence::get_all_doc_state_vectors`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocStateVector {
    pub name: String,
    pub state_vector: Vec<u8>,
    pub clock: u64,
}

struct Engine {
    store: Arc<dyn RecordStore>,
    clocks: ClockManager,
    log: Arc<UpdateLog>,
    checkpoints: Arc<CheckpointManager>,
    compactor: Compactor,
    reconstructor: Reconstructor,
    meta: MetaStore,
}

impl Engine {
    fn new(store: Arc<dyn RecordStore>, config: &PersistenceConfig) -> Self {
        let log = Arc::new(UpdateLog::new(
            store.clone(),
            config.max_part_size,
            config.compress_payloads,
        ));
        let checkpoints = Arc::new(CheckpointManager::new(store.clone()));
        Self {
            clocks: ClockManager::new(),
            compactor: Compactor::new(log.clone(), checkpoints.clone(), config.flush_size),
            reconstructor: Reconstructor::new(log.clone()),
            meta: MetaStore::new(store.clone()),
            log,
            checkpoints,
            store,
        }
    }

    fn current_clock(&self, doc_name: &str) -> Result<u64> {
        ClockManager::current_clock(self.store.as_ref(), doc_name)
    }
}

/// Durable storage for Yrs documents.
///
/// Cheap to share behind an `Arc`; every operation takes `&self`.
pub struct Persistence {
    engine: RwLock<Option<Engine>>,
    owned: bool,
    config: PersistenceConfig,
}

impl Persistence {
    /// Open a persistence engine on a RocksDB path or an existing handle.
    pub fn new(connection: impl Into<Connection>, config: PersistenceConfig) -> Result<Self> {
        config.validate()?;
        let connection = connection.into();
        let owned = connection.is_owned();
        let store = match connection {
            Connection::Path(path) => {
                let store = RocksRecordStore::open(&path, &config.collection_name, &config.rocks)?;
                log::info!(
                    "Opened document store at {} (collection '{}')",
                    path.display(),
                    config.collection_name
                );
                store
            }
            Connection::Client(db) => {
                let store = RocksRecordStore::with_db(db, &config.collection_name, &config.rocks)?;
                log::info!(
                    "Attached to external document store (collection '{}')",
                    config.collection_name
                );
                store
            }
        };
        Self::build(Arc::new(store), owned, config)
    }

    /// Run on any [`RecordStore`]. `owned` decides whether [`destroy`]
    /// closes it.
    ///
    /// [`destroy`]: Persistence::destroy
    pub fn with_store(
        store: Arc<dyn RecordStore>,
        owned: bool,
        config: PersistenceConfig,
    ) -> Result<Self> {
        config.validate()?;
        Self::build(store, owned, config)
    }

    /// Engine backed by a private in-memory store.
    pub fn in_memory(config: PersistenceConfig) -> Result<Self> {
        Self::with_store(Arc::new(MemoryRecordStore::new()), true, config)
    }

    fn build(store: Arc<dyn RecordStore>, owned: bool, config: PersistenceConfig) -> Result<Self> {
        Ok(Self {
            engine: RwLock::new(Some(Engine::new(store, &config))),
            owned,
            config,
        })
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    /// Whether `destroy` releases the backing store.
    pub fn owns_store(&self) -> bool {
        self.owned
    }

    pub fn is_destroyed(&self) -> bool {
        self.engine
            .read()
            .map(|engine| engine.is_none())
            .unwrap_or_else(|e| e.into_inner().is_none())
    }

    fn with_engine<T>(&self, f: impl FnOnce(&Engine) -> Result<T>) -> Result<T> {
        let guard = self.engine.read().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(engine) => f(engine),
            None => Err(PersistenceError::Closed),
        }
    }

    // ─── Updates & Documents ──────────────────────────────────────────

    /// Append an encoded Yrs update (v1) to `doc_name` and return its clock.
    ///
    /// May compact the open interval when it grows past `flush_size`. The
    /// update is durable once its clock is returned; a failed automatic
    /// compaction is logged and leaves the log uncompacted, never failing
    /// the write.
    pub fn store_update(&self, doc_name: &str, update: &[u8]) -> Result<u64> {
        self.with_engine(|engine| {
            engine.clocks.with_doc_lock(doc_name, || -> Result<u64> {
                let clock = engine.log.append(doc_name, update)?;
                if let Err(e) = engine.compactor.maybe_compact(doc_name) {
                    log::warn!(
                        "Automatic compaction of '{doc_name}' failed after clock {clock}: {e}"
                    );
                }
                Ok(clock)
            })
        })
    }

    /// Rebuild `doc_name` from updates with clock ≤ `at_clock`, or from all
    /// updates when `at_clock` is `None`. Unknown documents are empty.
    pub fn get_ydoc(&self, doc_name: &str, at_clock: Option<u64>) -> Result<Doc> {
        self.with_engine(|engine| engine.reconstructor.build(doc_name, at_clock))
    }

    /// Compact every checkpoint interval of `doc_name`.
    pub fn flush_document(&self, doc_name: &str) -> Result<CompactionReport> {
        self.with_engine(|engine| {
            let report = engine
                .clocks
                .with_doc_lock(doc_name, || engine.compactor.compact_all(doc_name))?;
            log::info!(
                "Flushed '{doc_name}': {} -> {} update records",
                report.records_before,
                report.records_after
            );
            Ok(report)
        })
    }

    /// Mark the current clock of `doc_name` as a checkpoint.
    pub fn checkpoint(&self, doc_name: &str) -> Result<u64> {
        self.with_engine(|engine| {
            engine
                .clocks
                .with_doc_lock(doc_name, || engine.checkpoints.create(doc_name))
        })
    }

    /// Delete every record of `doc_name` and return how many were removed.
    pub fn clear_document(&self, doc_name: &str) -> Result<u64> {
        self.with_engine(|engine| {
            let removed = engine.clocks.with_doc_lock(doc_name, || {
                engine.store.delete_many(&Filter::doc(doc_name))
            })?;
            log::info!("Cleared '{doc_name}' ({removed} records)");
            Ok(removed)
        })
    }

    /// Names of stored documents in first-write order. Documents that only
    /// carry meta entries are not listed.
    ///
    /// Every append writes the state-vector record in the same batch as the
    /// update, so state-vector records alone name every document with
    /// updates without decoding any update payload.
    pub fn get_all_doc_names(&self) -> Result<Vec<String>> {
        self.with_engine(|engine| {
            let filter = Filter::all().kind(RecordKind::StateVector);
            let mut seen: HashSet<String> = HashSet::new();
            let mut names = Vec::new();
            for stored in engine.store.find(&filter, Order::Insertion)? {
                let name = stored.record.doc_name();
                if !seen.contains(name) {
                    seen.insert(name.to_string());
                    names.push(name.to_string());
                }
            }
            Ok(names)
        })
    }

    // ─── State Vectors & Sync ─────────────────────────────────────────

    /// Stored state vector of `doc_name`, rebuilt first when it is missing
    /// or older than the latest update. `None` for unknown documents.
    pub fn get_state_vector(&self, doc_name: &str) -> Result<Option<StoredStateVector>> {
        self.with_engine(|engine| {
            let current = engine.current_clock(doc_name)?;
            if current == 0 {
                return Ok(None);
            }
            let record = match engine.log.state_vector(doc_name)? {
                Some(sv) if sv.clock >= current => Some(sv),
                stale => {
                    log::warn!(
                        "State vector of '{doc_name}' missing or stale (clock {:?}, current {current}), rebuilding",
                        stale.map(|sv| sv.clock)
                    );
                    engine
                        .clocks
                        .with_doc_lock(doc_name, || engine.log.rebuild_state_vector(doc_name))?
                }
            };
            Ok(record.map(|sv| StoredStateVector {
                state_vector: sv.value,
                clock: sv.clock,
            }))
        })
    }

    /// State vectors of every document, in first-write order.
    pub fn get_all_doc_state_vectors(&self) -> Result<Vec<DocStateVector>> {
        self.with_engine(|engine| {
            let filter = Filter::all().kind(RecordKind::StateVector);
            let mut vectors = Vec::new();
            for stored in engine.store.find(&filter, Order::Insertion)? {
                if let Record::StateVector(sv) = stored.record {
                    vectors.push(DocStateVector {
                        name: sv.doc_name,
                        state_vector: sv.value,
                        clock: sv.clock,
                    });
                }
            }
            Ok(vectors)
        })
    }

    /// Update that brings a peer at `state_vector` up to the current
    /// content of `doc_name`.
    pub fn get_diff(&self, doc_name: &str, state_vector: &[u8]) -> Result<Vec<u8>> {
        self.with_engine(|engine| {
            let merged = match engine.reconstructor.merged_update(doc_name)? {
                Some(merged) => merged,
                None => crdt::encode_state_as_update(&crdt::new_document()),
            };
            crdt::diff_update(&merged, state_vector)
        })
    }

    /// Highest clock absorbed by `doc_name`'s updates (0 when empty).
    pub fn get_current_clock(&self, doc_name: &str) -> Result<u64> {
        self.with_engine(|engine| engine.current_clock(doc_name))
    }

    /// Checkpoint clocks of `doc_name`, ascending.
    pub fn list_checkpoints(&self, doc_name: &str) -> Result<Vec<u64>> {
        self.with_engine(|engine| engine.checkpoints.list_boundaries(doc_name))
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    pub fn set_meta<T: Serialize + ?Sized>(&self, doc_name: &str, key: &str, value: &T) -> Result<()> {
        self.with_engine(|engine| engine.meta.set(doc_name, key, value))
    }

    pub fn get_meta<T: DeserializeOwned>(&self, doc_name: &str, key: &str) -> Result<Option<T>> {
        self.with_engine(|engine| engine.meta.get(doc_name, key))
    }

    /// Returns whether the key existed.
    pub fn del_meta(&self, doc_name: &str, key: &str) -> Result<bool> {
        self.with_engine(|engine| engine.meta.delete(doc_name, key))
    }

    // ─── Lifecycle ────────────────────────────────────────────────────

    /// Shut the engine down. An owned store is flushed and closed; a
    /// borrowed one is left open. Later calls return
    /// [`PersistenceError::Closed`]; repeating `destroy` is a no-op.
    pub fn destroy(&self) -> Result<()> {
        let engine = {
            let mut guard = self.engine.write().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        let Some(engine) = engine else {
            return Ok(());
        };
        if self.owned {
            engine.store.close()?;
        }
        log::info!(
            "Destroyed persistence for collection '{}' (store {})",
            self.config.collection_name,
            if self.owned { "closed" } else { "left open" }
        );
        Ok(())
    }
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("collection", &self.config.collection_name)
            .field("owned", &self.owned)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{StoreError, StoreResult};
    use crate::record::{RecordKey, StoredRecord};
    use crate::store::WriteOp;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use yrs::{GetString, ReadTxn, Text, Transact, WriteTxn};

    fn edit(doc: &Doc, content: &str) -> Vec<u8> {
        let before = doc.transact().state_vector();
        {
            let mut txn = doc.transact_mut();
            let text = txn.get_or_insert_text("name");
            let len = text.get_string(&txn).len() as u32;
            text.insert(&mut txn, len, content);
        }
        doc.transact().encode_state_as_update_v1(&before)
    }

    fn text_of(doc: &Doc) -> String {
        let txn = doc.transact();
        txn.get_text("name")
            .map(|t| t.get_string(&txn))
            .unwrap_or_default()
    }

    fn memory(store: &Arc<MemoryRecordStore>) -> Persistence {
        Persistence::with_store(store.clone(), true, PersistenceConfig::for_testing()).unwrap()
    }

    #[test]
    fn test_store_and_load() {
        let store = Arc::new(MemoryRecordStore::new());
        let persistence = memory(&store);
        let source = Doc::new();

        assert_eq!(persistence.store_update("doc", &edit(&source, "hello")).unwrap(), 1);
        assert_eq!(store.len(), 2);
        assert_eq!(persistence.store_update("doc", &edit(&source, " there")).unwrap(), 2);
        assert_eq!(store.len(), 3);

        let doc = persistence.get_ydoc("doc", None).unwrap();
        assert_eq!(text_of(&doc), "hello there");
        assert_eq!(persistence.get_current_clock("doc").unwrap(), 2);
    }

    #[test]
    fn test_flush_keeps_content() {
        let store = Arc::new(MemoryRecordStore::new());
        let persistence = memory(&store);
        let source = Doc::new();
        persistence.store_update("doc", &edit(&source, "a")).unwrap();
        persistence.store_update("doc", &edit(&source, "b")).unwrap();

        let report = persistence.flush_document("doc").unwrap();
        assert_eq!(report.records_before, 2);
        assert_eq!(report.records_after, 1);
        assert_eq!(store.len(), 2);
        assert_eq!(text_of(&persistence.get_ydoc("doc", None).unwrap()), "ab");
    }

    #[test]
    fn test_invalid_update_is_rejected_without_writes() {
        let store = Arc::new(MemoryRecordStore::new());
        let persistence = memory(&store);
        let err = persistence.store_update("doc", &[0xFF, 0xFF, 0xFF]).unwrap_err();
        assert!(matches!(err, PersistenceError::Crdt(_)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_state_vector_is_rebuilt_when_missing() {
        let store = Arc::new(MemoryRecordStore::new());
        let persistence = memory(&store);
        let source = Doc::new();
        persistence.store_update("doc", &edit(&source, "abc")).unwrap();
        store
            .delete_many(&Filter::doc("doc").kind(RecordKind::StateVector))
            .unwrap();

        let sv = persistence.get_state_vector("doc").unwrap().unwrap();
        assert_eq!(sv.clock, 1);
        assert_eq!(sv.state_vector, crdt::encode_state_vector(&source));
        assert_eq!(store.len(), 2);
        assert!(persistence.get_state_vector("missing").unwrap().is_none());
    }

    #[test]
    fn test_get_diff_from_peer_state() {
        let persistence = Persistence::in_memory(PersistenceConfig::for_testing()).unwrap();
        let source = Doc::new();
        let first = edit(&source, "shared ");
        persistence.store_update("doc", &first).unwrap();
        persistence.store_update("doc", &edit(&source, "and new")).unwrap();

        let peer = Doc::new();
        crdt::apply_update(&peer, &first).unwrap();
        let diff = persistence
            .get_diff("doc", &crdt::encode_state_vector(&peer))
            .unwrap();
        crdt::apply_update(&peer, &diff).unwrap();
        assert_eq!(text_of(&peer), "shared and new");
    }

    #[test]
    fn test_doc_names_skip_meta_only_documents() {
        let persistence = Persistence::in_memory(PersistenceConfig::for_testing()).unwrap();
        persistence.set_meta("meta-only", "k", &1).unwrap();
        persistence.store_update("b", &edit(&Doc::new(), "x")).unwrap();
        persistence.store_update("a", &edit(&Doc::new(), "y")).unwrap();
        assert_eq!(persistence.get_all_doc_names().unwrap(), vec!["b", "a"]);

        let vectors = persistence.get_all_doc_state_vectors().unwrap();
        let names: Vec<&str> = vectors.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn test_destroy_closes_owned_store() {
        let store = Arc::new(MemoryRecordStore::new());
        let persistence = memory(&store);
        persistence.destroy().unwrap();
        assert!(persistence.is_destroyed());
        assert!(matches!(
            persistence.get_ydoc("doc", None).unwrap_err(),
            PersistenceError::Closed
        ));
        assert!(store.find(&Filter::all(), Order::Key).is_err());
        persistence.destroy().unwrap();
    }

    #[test]
    fn test_destroy_leaves_borrowed_store_open() {
        let store = Arc::new(MemoryRecordStore::new());
        let persistence =
            Persistence::with_store(store.clone(), false, PersistenceConfig::for_testing()).unwrap();
        persistence.store_update("doc", &edit(&Doc::new(), "kept")).unwrap();
        persistence.destroy().unwrap();
        assert_eq!(store.count(&Filter::doc("doc")).unwrap(), 2);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let err = Persistence::in_memory(PersistenceConfig::for_testing().with_flush_size(0))
            .unwrap_err();
        assert!(matches!(err, PersistenceError::Config(_)));
    }

    /// Memory store whose `fail_at`-th batch write fails.
    struct FailingBatchStore {
        inner: MemoryRecordStore,
        batches: AtomicUsize,
        fail_at: usize,
    }

    impl FailingBatchStore {
        fn new(fail_at: usize) -> Self {
            Self {
                inner: MemoryRecordStore::new(),
                batches: AtomicUsize::new(0),
                fail_at,
            }
        }
    }

    impl RecordStore for FailingBatchStore {
        fn put(&self, record: Record) -> StoreResult<()> {
            self.inner.put(record)
        }

        fn get(&self, key: &RecordKey) -> StoreResult<Option<Record>> {
            self.inner.get(key)
        }

        fn find(&self, filter: &Filter, order: Order) -> StoreResult<Vec<StoredRecord>> {
            self.inner.find(filter, order)
        }

        fn find_last(&self, filter: &Filter) -> StoreResult<Option<Record>> {
            self.inner.find_last(filter)
        }

        fn delete_many(&self, filter: &Filter) -> StoreResult<u64> {
            self.inner.delete_many(filter)
        }

        fn write_batch(&self, ops: Vec<WriteOp>) -> StoreResult<()> {
            let n = self.batches.fetch_add(1, AtomicOrdering::SeqCst) + 1;
            if n == self.fail_at {
                return Err(StoreError::Database("injected batch failure".into()));
            }
            self.inner.write_batch(ops)
        }
    }

    #[test]
    fn test_failed_automatic_compaction_keeps_write() {
        // batch 1: first append, batch 2: second append, batch 3: compaction
        let store = Arc::new(FailingBatchStore::new(3));
        let config = PersistenceConfig::for_testing().with_flush_size(1);
        let persistence = Persistence::with_store(store.clone(), true, config).unwrap();
        let source = Doc::new();
        let updates = Filter::doc("doc").kind(RecordKind::Update);

        assert_eq!(persistence.store_update("doc", &edit(&source, "a")).unwrap(), 1);
        assert_eq!(persistence.store_update("doc", &edit(&source, "b")).unwrap(), 2);
        assert_eq!(persistence.get_current_clock("doc").unwrap(), 2);
        assert_eq!(text_of(&persistence.get_ydoc("doc", None).unwrap()), "ab");
        assert_eq!(store.count(&updates).unwrap(), 2);

        // the next write compacts the whole open interval
        assert_eq!(persistence.store_update("doc", &edit(&source, "c")).unwrap(), 3);
        assert_eq!(store.count(&updates).unwrap(), 1);
        assert_eq!(text_of(&persistence.get_ydoc("doc", None).unwrap()), "abc");
    }

    #[test]
    fn test_failed_append_is_reported() {
        let store = Arc::new(FailingBatchStore::new(1));
        let persistence =
            Persistence::with_store(store.clone(), true, PersistenceConfig::for_testing()).unwrap();
        let err = persistence
            .store_update("doc", &edit(&Doc::new(), "lost"))
            .unwrap_err();
        assert!(err.is_store_unavailable());
        assert_eq!(persistence.get_current_clock("doc").unwrap(), 0);
    }

    #[test]
    fn test_missing_part_surfaces_malformed_record() {
        let store = Arc::new(MemoryRecordStore::new());
        let config = PersistenceConfig::for_testing().with_max_part_size(16);
        let persistence = Persistence::with_store(store.clone(), true, config).unwrap();
        let clock = persistence
            .store_update("doc", &edit(&Doc::new(), &"chunked ".repeat(20)))
            .unwrap();
        assert!(store.count(&Filter::doc("doc").kind(RecordKind::Update)).unwrap() >= 3);

        store
            .write_batch(vec![WriteOp::Delete(RecordKey::update("doc", clock, 1))])
            .unwrap();

        let err = persistence.get_ydoc("doc", None).unwrap_err();
        match err {
            PersistenceError::MalformedRecord { doc_name, clock: at, .. } => {
                assert_eq!(doc_name, "doc");
                assert_eq!(at, clock);
            }
            other => panic!("expected MalformedRecord, got {other:?}"),
        }
        assert!(matches!(
            persistence.flush_document("doc").unwrap_err(),
            PersistenceError::MalformedRecord { .. }
        ));
    }
}
