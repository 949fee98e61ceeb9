//! Named positions in a document's history.
//!
//! A checkpoint is only a clock. It never stores document state; instead
//! its clock fences compaction so that replaying `clock ≤ checkpoint`
//! always yields the same document.

use std::sync::Arc;

use crate::clock::ClockManager;
use crate::error::Result;
use crate::record::{CheckpointRecord, Record, RecordKind};
use crate::store::{Filter, Order, RecordStore};

pub struct CheckpointManager {
    store: Arc<dyn RecordStore>,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Record a checkpoint at the document's current clock and return it.
    /// Must run under the document's lock.
    pub fn create(&self, doc_name: &str) -> Result<u64> {
        let clock = ClockManager::current_clock(self.store.as_ref(), doc_name)?;
        self.store.put(Record::Checkpoint(CheckpointRecord {
            doc_name: doc_name.to_string(),
            clock,
        }))?;
        log::info!("Checkpoint for '{doc_name}' at clock {clock}");
        Ok(clock)
    }

    /// Checkpoint clocks of `doc_name`, ascending and deduplicated.
    pub fn list_boundaries(&self, doc_name: &str) -> Result<Vec<u64>> {
        let filter = Filter::doc(doc_name).kind(RecordKind::Checkpoint);
        let mut clocks: Vec<u64> = self
            .store
            .find(&filter, Order::Key)?
            .into_iter()
            .filter_map(|stored| stored.record.clock())
            .collect();
        clocks.sort_unstable();
        clocks.dedup();
        Ok(clocks)
    }
}

/// Half-open clock intervals `(lower, upper]` carved out by `boundaries`.
///
/// For boundaries `b1 < … < bn` the intervals are `[0, b1]`, `(b1, b2]`, …
/// and the open interval `(bn, ∞)`; each is returned as an inclusive range.
pub fn intervals(boundaries: &[u64]) -> Vec<std::ops::RangeInclusive<u64>> {
    let mut ranges = Vec::with_capacity(boundaries.len() + 1);
    let mut lower = 0u64;
    for &boundary in boundaries {
        ranges.push(lower..=boundary);
        lower = boundary.saturating_add(1);
    }
    ranges.push(lower..=u64::MAX);
    ranges
}

/// The interval after the last boundary.
pub fn open_interval(boundaries: &[u64]) -> std::ops::RangeInclusive<u64> {
    match boundaries.last() {
        Some(&last) => last.saturating_add(1)..=u64::MAX,
        None => 0..=u64::MAX,
    }
}
