//! Blob codec: splits oversized update payloads into ordered parts and
//! joins them back.
//!
//! ```text
//! payload ──split(max)──► [part 0][part 1]...[part n-1]   (same clock)
//!                              │
//!                        join  ▼  checks 0..n present, same part_count
//!                          payload
//! ```

use crate::error::{PersistenceError, Result};
use crate::record::UpdateRecord;

/// Split `payload` into chunks of at most `max_part_size` bytes.
///
/// Always returns at least one chunk; an empty payload becomes one empty
/// chunk. `max_part_size` of zero is treated as one byte.
pub fn split(payload: &[u8], max_part_size: usize) -> Vec<Vec<u8>> {
    if payload.is_empty() {
        return vec![Vec::new()];
    }
    payload
        .chunks(max_part_size.max(1))
        .map(<[u8]>::to_vec)
        .collect()
}

/// Concatenate chunks given in part order.
pub fn join<T: AsRef<[u8]>>(chunks: &[T]) -> Vec<u8> {
    let total = chunks.iter().map(|c| c.as_ref().len()).sum();
    let mut payload = Vec::with_capacity(total);
    for chunk in chunks {
        payload.extend_from_slice(chunk.as_ref());
    }
    payload
}

/// Build the update records for one clock.
pub fn to_parts(
    doc_name: &str,
    clock: u64,
    payload: &[u8],
    compressed: bool,
    max_part_size: usize,
) -> Vec<UpdateRecord> {
    let chunks = split(payload, max_part_size);
    let part_count = chunks.len() as u32;
    chunks
        .into_iter()
        .enumerate()
        .map(|(index, chunk)| UpdateRecord {
            doc_name: doc_name.to_string(),
            clock,
            part_index: index as u32,
            part_count,
            compressed,
            payload: chunk,
        })
        .collect()
}

/// A whole update reassembled from its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reassembled {
    pub clock: u64,
    pub compressed: bool,
    pub payload: Vec<u8>,
    /// Number of stored parts the update came from
    pub part_count: u32,
}

/// Group update parts (sorted by clock, then part index) into whole
/// updates, validating that every clock has parts `0..part_count`.
pub fn reassemble(doc_name: &str, parts: Vec<UpdateRecord>) -> Result<Vec<Reassembled>> {
    let mut updates: Vec<Reassembled> = Vec::new();
    let mut pending: Vec<UpdateRecord> = Vec::new();

    for part in parts {
        if let Some(first) = pending.first() {
            if first.clock != part.clock {
                updates.push(join_parts(doc_name, std::mem::take(&mut pending))?);
            }
        }
        pending.push(part);
    }
    if !pending.is_empty() {
        updates.push(join_parts(doc_name, pending)?);
    }
    Ok(updates)
}

fn join_parts(doc_name: &str, parts: Vec<UpdateRecord>) -> Result<Reassembled> {
    let first = match parts.first() {
        Some(first) => first,
        None => return Err(PersistenceError::malformed(doc_name, 0, "no parts")),
    };
    let clock = first.clock;
    let part_count = first.part_count;
    let compressed = first.compressed;

    if part_count == 0 {
        return Err(PersistenceError::malformed(doc_name, clock, "part count is zero"));
    }
    if parts.len() != part_count as usize {
        return Err(PersistenceError::malformed(
            doc_name,
            clock,
            format!("found {} of {part_count} parts", parts.len()),
        ));
    }
    for (expected, part) in parts.iter().enumerate() {
        if part.part_index != expected as u32 {
            return Err(PersistenceError::malformed(
                doc_name,
                clock,
                format!("missing part {expected} of {part_count}"),
            ));
        }
        if part.part_count != part_count || part.compressed != compressed {
            return Err(PersistenceError::malformed(
                doc_name,
                clock,
                format!("part {expected} disagrees on framing"),
            ));
        }
    }

    let payload = join(&parts.iter().map(|p| p.payload.as_slice()).collect::<Vec<_>>());
    Ok(Reassembled {
        clock,
        compressed,
        payload,
        part_count,
    })
}
