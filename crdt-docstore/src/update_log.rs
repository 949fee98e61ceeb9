//! Update log: append, range reads, atomic replace, and the state-vector
//! record that summarises the current update set.
//!
//! ```text
//! append(doc, bytes)
//!   │  clock = max stored clock + 1          (caller holds the doc lock)
//!   │  parts = split(lz4?(bytes))
//!   │  sv    = sv_from_update(merge(stored ‖ bytes))
//!   ▼
//! WriteBatch [ put part 0..n | put state-vector ]
//! ```

use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::sync::Arc;

use crate::chunk;
use crate::clock::ClockManager;
use crate::crdt;
use crate::error::{PersistenceError, Result};
use crate::record::{Record, RecordKey, RecordKind, StateVectorRecord, UpdateRecord};
use crate::store::{Filter, Order, RecordStore, WriteOp};

/// A whole update as replayed by readers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredUpdate {
    /// Highest original clock folded into this update
    pub clock: u64,
    /// Decoded (decompressed, reassembled) Yrs update
    pub payload: Vec<u8>,
    /// Number of stored parts
    pub part_count: u32,
}

/// Update records of every document in one collection.
pub struct UpdateLog {
    store: Arc<dyn RecordStore>,
    max_part_size: usize,
    compress: bool,
}

impl UpdateLog {
    pub fn new(store: Arc<dyn RecordStore>, max_part_size: usize, compress: bool) -> Self {
        Self {
            store,
            max_part_size,
            compress,
        }
    }

    /// Persist `payload` as the next update of `doc_name` and refresh the
    /// state vector. Must run under the document's lock.
    ///
    /// The state vector is recomputed from every stored update, so the cost
    /// of an append grows with the number of stored records. Checkpointed
    /// intervals only shrink on `flush_document`.
    pub fn append(&self, doc_name: &str, payload: &[u8]) -> Result<u64> {
        let clock = ClockManager::next_clock(self.store.as_ref(), doc_name)?;

        let mut payloads: Vec<Vec<u8>> = self
            .read_range(doc_name, None)?
            .into_iter()
            .map(|u| u.payload)
            .collect();
        payloads.push(payload.to_vec());
        let state_vector = crdt::state_vector_from_update(&crdt::merge_updates(&payloads)?)?;

        let (encoded, compressed) = self.encode_payload(payload);
        let parts = chunk::to_parts(doc_name, clock, &encoded, compressed, self.max_part_size);
        let part_count = parts.len();

        let mut ops: Vec<WriteOp> = parts
            .into_iter()
            .map(|part| WriteOp::Put(Record::Update(part)))
            .collect();
        ops.push(WriteOp::Put(Record::StateVector(StateVectorRecord {
            doc_name: doc_name.to_string(),
            clock,
            value: state_vector,
        })));
        self.store.write_batch(ops)?;

        log::debug!(
            "Stored update for '{doc_name}' at clock {clock} ({} bytes, {part_count} part(s))",
            payload.len()
        );
        Ok(clock)
    }

    /// Updates with clock ≤ `max_clock` (all when `None`), ascending.
    pub fn read_range(&self, doc_name: &str, max_clock: Option<u64>) -> Result<Vec<StoredUpdate>> {
        self.read_clocks(doc_name, 0..=max_clock.unwrap_or(u64::MAX))
    }

    /// Updates whose clock lies in `clocks`, ascending.
    pub fn read_clocks(
        &self,
        doc_name: &str,
        clocks: RangeInclusive<u64>,
    ) -> Result<Vec<StoredUpdate>> {
        let parts = self.parts(doc_name, clocks)?;
        chunk::reassemble(doc_name, parts)?
            .into_iter()
            .map(|whole| -> Result<StoredUpdate> {
                let payload =
                    self.decode_payload(doc_name, whole.clock, whole.compressed, whole.payload)?;
                Ok(StoredUpdate {
                    clock: whole.clock,
                    payload,
                    part_count: whole.part_count,
                })
            })
            .collect()
    }

    /// Distinct stored update clocks in `clocks`, ascending.
    pub fn clocks_in(&self, doc_name: &str, clocks: RangeInclusive<u64>) -> Result<Vec<u64>> {
        let mut found: Vec<u64> = self
            .parts(doc_name, clocks)?
            .into_iter()
            .filter(|part| part.part_index == 0)
            .map(|part| part.clock)
            .collect();
        found.dedup();
        Ok(found)
    }

    /// Atomically swap every update record in `clocks` for one record at
    /// `merged_clock` holding `merged_payload`.
    ///
    /// The batch writes the merged parts before deleting superseded keys,
    /// and never deletes a key it has just rewritten.
    pub fn replace(
        &self,
        doc_name: &str,
        clocks: RangeInclusive<u64>,
        merged_payload: &[u8],
        merged_clock: u64,
    ) -> Result<()> {
        if !clocks.contains(&merged_clock) {
            return Err(PersistenceError::malformed(
                doc_name,
                merged_clock,
                format!("merged clock outside {}..={}", clocks.start(), clocks.end()),
            ));
        }

        let superseded: Vec<RecordKey> = self
            .parts(doc_name, clocks.clone())?
            .iter()
            .map(|part| RecordKey::update(doc_name, part.clock, part.part_index))
            .collect();

        let (encoded, compressed) = self.encode_payload(merged_payload);
        let parts = chunk::to_parts(doc_name, merged_clock, &encoded, compressed, self.max_part_size);
        let rewritten: HashSet<RecordKey> = parts
            .iter()
            .map(|part| RecordKey::update(doc_name, part.clock, part.part_index))
            .collect();

        let mut ops: Vec<WriteOp> = parts
            .into_iter()
            .map(|part| WriteOp::Put(Record::Update(part)))
            .collect();
        ops.extend(
            superseded
                .into_iter()
                .filter(|key| !rewritten.contains(key))
                .map(WriteOp::Delete),
        );
        self.store.write_batch(ops)?;

        log::debug!(
            "Replaced updates {}..={} of '{doc_name}' with one record at clock {merged_clock}",
            clocks.start(),
            clocks.end()
        );
        Ok(())
    }

    /// Stored state-vector record of `doc_name`.
    pub fn state_vector(&self, doc_name: &str) -> Result<Option<StateVectorRecord>> {
        match self.store.get(&RecordKey::state_vector(doc_name))? {
            Some(Record::StateVector(sv)) => Ok(Some(sv)),
            Some(other) => Err(PersistenceError::malformed(
                doc_name,
                other.clock().unwrap_or(0),
                format!("{:?} record under state-vector key", other.kind()),
            )),
            None => Ok(None),
        }
    }

    /// Recompute the state vector from the full update set and store it.
    /// Returns `None` (and stores nothing) for a document without updates.
    pub fn rebuild_state_vector(&self, doc_name: &str) -> Result<Option<StateVectorRecord>> {
        let updates = self.read_range(doc_name, None)?;
        let clock = match updates.last() {
            Some(last) => last.clock,
            None => return Ok(None),
        };
        let payloads: Vec<&[u8]> = updates.iter().map(|u| u.payload.as_slice()).collect();
        let value = crdt::state_vector_from_update(&crdt::merge_updates(&payloads)?)?;
        let record = StateVectorRecord {
            doc_name: doc_name.to_string(),
            clock,
            value,
        };
        self.store.put(Record::StateVector(record.clone()))?;
        Ok(Some(record))
    }

    fn parts(&self, doc_name: &str, clocks: RangeInclusive<u64>) -> Result<Vec<UpdateRecord>> {
        let filter = Filter::doc(doc_name).kind(RecordKind::Update).clocks(clocks);
        let mut parts = Vec::new();
        for stored in self.store.find(&filter, Order::Key)? {
            if let Record::Update(part) = stored.record {
                parts.push(part);
            }
        }
        Ok(parts)
    }

    fn encode_payload(&self, payload: &[u8]) -> (Vec<u8>, bool) {
        if self.compress {
            (lz4_flex::compress_prepend_size(payload), true)
        } else {
            (payload.to_vec(), false)
        }
    }

    fn decode_payload(
        &self,
        doc_name: &str,
        clock: u64,
        compressed: bool,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>> {
        if !compressed {
            return Ok(payload);
        }
        lz4_flex::decompress_size_prepended(&payload).map_err(|e| {
            PersistenceError::Compression(format!("'{doc_name}' clock {clock}: {e}"))
        })
    }
}
