//! Checkpoint-aware compaction of the update log.
//!
//! ```text
//! clocks      1  2  3 | 4  5 | 6  7  8        (| = checkpoint boundary)
//!             └──┬──┘   └┬─┘   └──┬───┘
//! merged         3       5        8
//! ```
//!
//! Each boundary-delimited interval collapses to one record carrying the
//! interval's highest clock, so replaying `clock ≤ checkpoint` is unchanged.

use std::ops::RangeInclusive;
use std::sync::Arc;

use crate::checkpoint::{self, CheckpointManager};
use crate::crdt;
use crate::error::Result;
use crate::update_log::UpdateLog;

/// Outcome of one compaction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionReport {
    /// Intervals that held more than one record and were merged
    pub intervals_merged: usize,
    /// Stored update records in the compacted intervals before the pass
    pub records_before: usize,
    /// Stored update records in the compacted intervals after the pass
    pub records_after: usize,
}

impl CompactionReport {
    pub fn changed(&self) -> bool {
        self.intervals_merged > 0
    }

    fn absorb(&mut self, other: CompactionReport) {
        self.intervals_merged += other.intervals_merged;
        self.records_before += other.records_before;
        self.records_after += other.records_after;
    }
}

pub struct Compactor {
    log: Arc<UpdateLog>,
    checkpoints: Arc<CheckpointManager>,
    flush_size: usize,
}

impl Compactor {
    pub fn new(log: Arc<UpdateLog>, checkpoints: Arc<CheckpointManager>, flush_size: usize) -> Self {
        Self {
            log,
            checkpoints,
            flush_size,
        }
    }

    /// Compact every interval of `doc_name`. Must run under the doc lock.
    pub fn compact_all(&self, doc_name: &str) -> Result<CompactionReport> {
        let boundaries = self.checkpoints.list_boundaries(doc_name)?;
        let mut report = CompactionReport::default();
        for range in checkpoint::intervals(&boundaries) {
            report.absorb(self.compact_range(doc_name, range)?);
        }
        Ok(report)
    }

    /// Compact only the interval after the last checkpoint.
    pub fn compact_open_interval(&self, doc_name: &str) -> Result<CompactionReport> {
        let boundaries = self.checkpoints.list_boundaries(doc_name)?;
        self.compact_range(doc_name, checkpoint::open_interval(&boundaries))
    }

    /// Compact the open interval when it holds more than `flush_size`
    /// stored records. Returns `None` when below the threshold.
    pub fn maybe_compact(&self, doc_name: &str) -> Result<Option<CompactionReport>> {
        let boundaries = self.checkpoints.list_boundaries(doc_name)?;
        let open = checkpoint::open_interval(&boundaries);
        let pending = self.log.clocks_in(doc_name, open.clone())?.len();
        if pending <= self.flush_size {
            return Ok(None);
        }

        log::debug!(
            "Automatic compaction of '{doc_name}': {pending} records exceed flush size {}",
            self.flush_size
        );
        self.compact_range(doc_name, open).map(Some)
    }

    fn compact_range(&self, doc_name: &str, range: RangeInclusive<u64>) -> Result<CompactionReport> {
        let updates = self.log.read_clocks(doc_name, range)?;
        let (first, last) = match (updates.first(), updates.last()) {
            (Some(first), Some(last)) if updates.len() > 1 => (first.clock, last.clock),
            _ => {
                return Ok(CompactionReport {
                    intervals_merged: 0,
                    records_before: updates.len(),
                    records_after: updates.len(),
                })
            }
        };

        let payloads: Vec<&[u8]> = updates.iter().map(|u| u.payload.as_slice()).collect();
        let merged = crdt::merge_updates(&payloads)?;
        self.log.replace(doc_name, first..=last, &merged, last)?;

        Ok(CompactionReport {
            intervals_merged: 1,
            records_before: updates.len(),
            records_after: 1,
        })
    }
}
