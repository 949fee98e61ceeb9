//! Per-document clock allocation.
//!
//! Clocks are derived from the store (highest stored update clock + 1) and
//! allocated while holding the document's lock, so two writers on the same
//! document never receive the same clock. Documents do not contend with
//! each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::record::RecordKind;
use crate::store::{Filter, RecordStore};

/// Serializes mutations per document and hands out clocks.
///
/// Lock entries live as long as the manager, including for cleared documents.
#[derive(Default)]
pub struct ClockManager {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ClockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding `doc_name`'s lock.
    pub fn with_doc_lock<T>(&self, doc_name: &str, f: impl FnOnce() -> T) -> T {
        let lock = self.doc_lock(doc_name);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        f()
    }

    fn doc_lock(&self, doc_name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(doc_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Number of documents with a lock entry.
    pub fn tracked_documents(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(0)
    }

    /// Highest clock absorbed by any stored update of `doc_name`, 0 if none.
    pub fn current_clock(store: &dyn RecordStore, doc_name: &str) -> Result<u64> {
        let last = store.find_last(&Filter::doc(doc_name).kind(RecordKind::Update))?;
        Ok(last.and_then(|r| r.clock()).unwrap_or(0))
    }

    /// Clock for the next update of `doc_name`. Call under the doc lock.
    pub fn next_clock(store: &dyn RecordStore, doc_name: &str) -> Result<u64> {
        Ok(Self::current_clock(store, doc_name)? + 1)
    }
}
