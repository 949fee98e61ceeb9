//! In-memory record store.
//!
//! Keeps records in a `BTreeMap` keyed by the encoded [`RecordKey`], so it
//! orders exactly like the RocksDB backend. Batches are applied under one
//! write lock.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{prefix_upper_bound, sort_by_order, Filter, Order, RecordStore, WriteOp};
use crate::error::{StoreError, StoreResult};
use crate::record::{Record, RecordKey, StoredRecord};

/// Volatile [`RecordStore`] for tests and embedders without durability needs.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: RwLock<BTreeMap<Vec<u8>, StoredRecord>>,
    sequence: AtomicU64,
    closed: AtomicBool,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records across all documents.
    pub fn len(&self) -> usize {
        self.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, BTreeMap<Vec<u8>, StoredRecord>>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(self.records.read().unwrap_or_else(|e| e.into_inner()))
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, BTreeMap<Vec<u8>, StoredRecord>>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(self.records.write().unwrap_or_else(|e| e.into_inner()))
    }

    fn upsert(&self, map: &mut BTreeMap<Vec<u8>, StoredRecord>, record: Record) {
        let key = record.key().as_bytes().to_vec();
        let seq = match map.get(&key) {
            Some(existing) => existing.seq,
            None => self.sequence.fetch_add(1, Ordering::SeqCst),
        };
        map.insert(key, StoredRecord { seq, record });
    }

    fn scan<'a>(
        map: &'a BTreeMap<Vec<u8>, StoredRecord>,
        filter: &'a Filter,
    ) -> impl DoubleEndedIterator<Item = (&'a Vec<u8>, &'a StoredRecord)> + 'a {
        let prefix = filter.key_prefix();
        let upper = match prefix_upper_bound(&prefix) {
            Some(upper) => Bound::Excluded(upper),
            None => Bound::Unbounded,
        };
        map.range::<Vec<u8>, _>((Bound::Included(prefix), upper))
            .filter(move |(_, stored)| filter.matches(&stored.record))
    }
}

impl RecordStore for MemoryRecordStore {
    fn put(&self, record: Record) -> StoreResult<()> {
        let mut map = self.write()?;
        self.upsert(&mut map, record);
        Ok(())
    }

    fn get(&self, key: &RecordKey) -> StoreResult<Option<Record>> {
        let map = self.read()?;
        Ok(map.get(key.as_bytes()).map(|stored| stored.record.clone()))
    }

    fn find(&self, filter: &Filter, order: Order) -> StoreResult<Vec<StoredRecord>> {
        let map = self.read()?;
        let mut found: Vec<StoredRecord> =
            Self::scan(&map, filter).map(|(_, stored)| stored.clone()).collect();
        sort_by_order(&mut found, order);
        Ok(found)
    }

    fn find_last(&self, filter: &Filter) -> StoreResult<Option<Record>> {
        let map = self.read()?;
        let last = Self::scan(&map, filter).next_back();
        Ok(last.map(|(_, stored)| stored.record.clone()))
    }

    fn count(&self, filter: &Filter) -> StoreResult<u64> {
        let map = self.read()?;
        Ok(Self::scan(&map, filter).count() as u64)
    }

    fn delete_many(&self, filter: &Filter) -> StoreResult<u64> {
        let mut map = self.write()?;
        let doomed: Vec<Vec<u8>> = Self::scan(&map, filter).map(|(key, _)| key.clone()).collect();
        for key in &doomed {
            map.remove(key);
        }
        Ok(doomed.len() as u64)
    }

    fn write_batch(&self, ops: Vec<WriteOp>) -> StoreResult<()> {
        let mut map = self.write()?;
        for op in ops {
            match op {
                WriteOp::Put(record) => self.upsert(&mut map, record),
                WriteOp::Delete(key) => {
                    map.remove(key.as_bytes());
                }
            }
        }
        Ok(())
    }

    fn close(&self) -> StoreResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
