//! Thin wrappers over the Yrs primitives the engine relies on.
//!
//! All payloads use the Yjs v1 update encoding.

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::error::{PersistenceError, Result};

fn crdt_err(e: impl std::fmt::Display) -> PersistenceError {
    PersistenceError::Crdt(e.to_string())
}

/// Fresh empty document.
pub fn new_document() -> Doc {
    Doc::new()
}

/// Apply one encoded update to `doc`.
pub fn apply_update(doc: &Doc, update: &[u8]) -> Result<()> {
    let update = Update::decode_v1(update).map_err(crdt_err)?;
    let mut txn = doc.transact_mut();
    txn.apply_update(update).map_err(crdt_err)
}

/// Merge updates (in clock order) into one equivalent update.
pub fn merge_updates<T: AsRef<[u8]>>(updates: &[T]) -> Result<Vec<u8>> {
    let slices: Vec<&[u8]> = updates.iter().map(|u| u.as_ref()).collect();
    yrs::merge_updates_v1(&slices).map_err(crdt_err)
}

/// Encoded state vector of a document.
pub fn encode_state_vector(doc: &Doc) -> Vec<u8> {
    let txn = doc.transact();
    txn.state_vector().encode_v1()
}

/// Encoded state vector of everything contained in `update`.
pub fn state_vector_from_update(update: &[u8]) -> Result<Vec<u8>> {
    yrs::encode_state_vector_from_update_v1(update).map_err(crdt_err)
}

/// Part of `update` not yet covered by `state_vector`.
pub fn diff_update(update: &[u8], state_vector: &[u8]) -> Result<Vec<u8>> {
    yrs::diff_updates_v1(update, state_vector).map_err(crdt_err)
}

/// Full document state as one update.
pub fn encode_state_as_update(doc: &Doc) -> Vec<u8> {
    let txn = doc.transact();
    txn.encode_state_as_update_v1(&StateVector::default())
}
