//! Record store: the key-value substrate every component writes through.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐   put / find / write_batch   ┌──────────────────────┐
//! │ Persistence  │ ───────────────────────────► │ dyn RecordStore      │
//! │ (components) │                              ├──────────────────────┤
//! └──────────────┘                              │ RocksRecordStore     │
//!                                               │  CF per collection   │
//!                                               │ MemoryRecordStore    │
//!                                               │  BTreeMap            │
//!                                               └──────────────────────┘
//! ```
//!
//! Backends only need ordered keys, prefix scans and an atomic multi-key
//! write. They never interpret payloads.

pub mod memory;
pub mod rocks;

pub use memory::MemoryRecordStore;
pub use rocks::{Db, RocksRecordStore};

use std::ops::RangeInclusive;

use crate::error::StoreResult;
use crate::record::{Record, RecordKey, RecordKind, StoredRecord};

/// Record selection. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub doc_name: Option<String>,
    pub kinds: Vec<RecordKind>,
    pub clocks: Option<RangeInclusive<u64>>,
}

impl Filter {
    /// Every record of the collection.
    pub fn all() -> Self {
        Self::default()
    }

    /// Every record of one document.
    pub fn doc(doc_name: &str) -> Self {
        Self {
            doc_name: Some(doc_name.to_string()),
            ..Self::default()
        }
    }

    pub fn kind(mut self, kind: RecordKind) -> Self {
        self.kinds.push(kind);
        self
    }

    /// Restrict to records whose clock lies in `range`. Meta records carry
    /// no clock and never match a clock-restricted filter.
    pub fn clocks(mut self, range: RangeInclusive<u64>) -> Self {
        self.clocks = Some(range);
        self
    }

    pub fn matches(&self, record: &Record) -> bool {
        if let Some(name) = &self.doc_name {
            if record.doc_name() != name {
                return false;
            }
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&record.kind()) {
            return false;
        }
        if let Some(range) = &self.clocks {
            match record.clock() {
                Some(clock) if range.contains(&clock) => {}
                _ => return false,
            }
        }
        true
    }

    /// Narrowest key prefix every matching record shares.
    pub fn key_prefix(&self) -> Vec<u8> {
        match (&self.doc_name, self.kinds.as_slice()) {
            (Some(name), [kind]) => RecordKey::kind_prefix(name, *kind),
            (Some(name), _) => RecordKey::doc_prefix(name),
            (None, _) => Vec::new(),
        }
    }
}

/// Result ordering for [`RecordStore::find`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    /// Ascending key: per document, by kind then clock then part.
    #[default]
    Key,
    /// Ascending first-insertion sequence.
    Insertion,
}

/// One step of an atomic batch.
#[derive(Debug, Clone)]
pub enum WriteOp {
    Put(Record),
    Delete(RecordKey),
}

/// Key-value substrate holding one collection of records.
///
/// # Invariants
///
/// - `put` is an upsert keyed by [`Record::key`]; an existing key keeps its
///   insertion sequence
/// - `find` in [`Order::Key`] returns update records of a document in
///   ascending `(clock, part_index)`
/// - `write_batch` applies all of its operations or none, and readers never
///   observe a partially applied batch
pub trait RecordStore: Send + Sync {
    /// Insert or overwrite one record.
    fn put(&self, record: Record) -> StoreResult<()>;

    /// Point lookup.
    fn get(&self, key: &RecordKey) -> StoreResult<Option<Record>>;

    /// All records matching `filter`, with their insertion sequence.
    fn find(&self, filter: &Filter, order: Order) -> StoreResult<Vec<StoredRecord>>;

    /// Greatest-keyed record matching `filter`.
    fn find_last(&self, filter: &Filter) -> StoreResult<Option<Record>>;

    /// Number of records matching `filter`.
    fn count(&self, filter: &Filter) -> StoreResult<u64> {
        Ok(self.find(filter, Order::Key)?.len() as u64)
    }

    /// Delete every record matching `filter`; returns how many went.
    fn delete_many(&self, filter: &Filter) -> StoreResult<u64>;

    /// Apply `ops` atomically, in order.
    fn write_batch(&self, ops: Vec<WriteOp>) -> StoreResult<()>;

    /// Flush and release backend resources. Later calls fail with
    /// [`StoreError::Closed`](crate::error::StoreError::Closed).
    fn close(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// Smallest key greater than every key starting with `prefix`, or `None`
/// when no such bound exists (empty or all-`0xFF` prefix).
pub(crate) fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.pop() {
        if last < u8::MAX {
            upper.push(last + 1);
            return Some(upper);
        }
    }
    None
}

/// Sort helper shared by backends that scan in key order.
pub(crate) fn sort_by_order(records: &mut [StoredRecord], order: Order) {
    if order == Order::Insertion {
        records.sort_by_key(|r| r.seq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{CheckpointRecord, MetaRecord, UpdateRecord};

    fn update(doc: &str, clock: u64) -> Record {
        Record::Update(UpdateRecord {
            doc_name: doc.into(),
            clock,
            part_index: 0,
            part_count: 1,
            compressed: false,
            payload: Vec::new(),
        })
    }

    #[test]
    fn test_filter_matches_doc_kind_and_clock() {
        let filter = Filter::doc("a").kind(RecordKind::Update).clocks(2..=4);
        assert!(filter.matches(&update("a", 2)));
        assert!(filter.matches(&update("a", 4)));
        assert!(!filter.matches(&update("a", 5)));
        assert!(!filter.matches(&update("b", 3)));
        assert!(!filter.matches(&Record::Checkpoint(CheckpointRecord {
            doc_name: "a".into(),
            clock: 3,
        })));
    }

    #[test]
    fn test_clock_filter_never_matches_meta() {
        let meta = Record::Meta(MetaRecord {
            doc_name: "a".into(),
            key: "k".into(),
            value: Vec::new(),
        });
        assert!(Filter::doc("a").matches(&meta));
        assert!(!Filter::doc("a").clocks(0..=u64::MAX).matches(&meta));
    }

    #[test]
    fn test_prefix_upper_bound() {
        assert_eq!(prefix_upper_bound(b""), None);
        assert_eq!(prefix_upper_bound(&[0xFF, 0xFF]), None);
        assert_eq!(prefix_upper_bound(&[1, 2]), Some(vec![1, 3]));
        assert_eq!(prefix_upper_bound(&[1, 0xFF]), Some(vec![2]));

        let prefix = RecordKey::kind_prefix("doc", RecordKind::Update);
        let upper = prefix_upper_bound(&prefix).unwrap();
        let last = RecordKey::update("doc", u64::MAX, u32::MAX);
        assert!(last.as_bytes() < upper.as_slice());
        assert!(RecordKey::state_vector("doc").as_bytes() >= upper.as_slice());
    }

    #[test]
    fn test_key_prefix_narrowing() {
        assert!(Filter::all().key_prefix().is_empty());
        assert_eq!(Filter::doc("a").key_prefix(), RecordKey::doc_prefix("a"));
        assert_eq!(
            Filter::doc("a").kind(RecordKind::Checkpoint).key_prefix(),
            RecordKey::kind_prefix("a", RecordKind::Checkpoint)
        );
        assert_eq!(
            Filter::doc("a")
                .kind(RecordKind::Update)
                .kind(RecordKind::StateVector)
                .key_prefix(),
            RecordKey::doc_prefix("a")
        );
    }
}
