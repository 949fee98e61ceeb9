//! Record model shared by every store backend.
//!
//! Key layout (order-preserving, big-endian):
//! ```text
//! ┌──────────────┬──────────┬──────────┬──────────────────────────────┐
//! │ name_len u32 │ doc_name │ kind u8  │ suffix                       │
//! └──────────────┴──────────┴──────────┴──────────────────────────────┘
//!   update        suffix = clock u64 ‖ part_index u32
//!   state-vector  suffix = (empty)
//!   checkpoint    suffix = clock u64
//!   meta          suffix = key bytes (UTF-8)
//! ```
//!
//! All records of one document share the `name_len ‖ doc_name` prefix, and
//! within a kind the update/checkpoint keys sort by clock, so range scans
//! return replay order without an extra sort.

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Discriminator stored in every key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum RecordKind {
    Update = 1,
    StateVector = 2,
    Checkpoint = 3,
    Meta = 4,
}

impl RecordKind {
    pub const ALL: [RecordKind; 4] = [
        RecordKind::Update,
        RecordKind::StateVector,
        RecordKind::Checkpoint,
        RecordKind::Meta,
    ];

    fn tag(self) -> u8 {
        self as u8
    }
}

/// One stored part of a CRDT update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRecord {
    pub doc_name: String,
    /// Highest original clock absorbed into this record
    pub clock: u64,
    pub part_index: u32,
    pub part_count: u32,
    /// Whether the reassembled payload is LZ4-compressed
    pub compressed: bool,
    pub payload: Vec<u8>,
}

/// Per-document state vector of the current update set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVectorRecord {
    pub doc_name: String,
    /// Newest update clock covered by `value`
    pub clock: u64,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub doc_name: String,
    pub clock: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaRecord {
    pub doc_name: String,
    pub key: String,
    /// JSON-encoded value
    pub value: Vec<u8>,
}

/// Any record of the collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Record {
    Update(UpdateRecord),
    StateVector(StateVectorRecord),
    Checkpoint(CheckpointRecord),
    Meta(MetaRecord),
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Update(_) => RecordKind::Update,
            Record::StateVector(_) => RecordKind::StateVector,
            Record::Checkpoint(_) => RecordKind::Checkpoint,
            Record::Meta(_) => RecordKind::Meta,
        }
    }

    pub fn doc_name(&self) -> &str {
        match self {
            Record::Update(r) => &r.doc_name,
            Record::StateVector(r) => &r.doc_name,
            Record::Checkpoint(r) => &r.doc_name,
            Record::Meta(r) => &r.doc_name,
        }
    }

    /// Clock carried by update, state-vector and checkpoint records.
    pub fn clock(&self) -> Option<u64> {
        match self {
            Record::Update(r) => Some(r.clock),
            Record::StateVector(r) => Some(r.clock),
            Record::Checkpoint(r) => Some(r.clock),
            Record::Meta(_) => None,
        }
    }

    pub fn key(&self) -> RecordKey {
        match self {
            Record::Update(r) => RecordKey::update(&r.doc_name, r.clock, r.part_index),
            Record::StateVector(r) => RecordKey::state_vector(&r.doc_name),
            Record::Checkpoint(r) => RecordKey::checkpoint(&r.doc_name, r.clock),
            Record::Meta(r) => RecordKey::meta(&r.doc_name, &r.key),
        }
    }
}

/// Encoded, order-preserving record key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey(Vec<u8>);

impl RecordKey {
    /// `name_len ‖ doc_name`: shared by every record of a document.
    pub fn doc_prefix(doc_name: &str) -> Vec<u8> {
        let name = doc_name.as_bytes();
        let mut key = Vec::with_capacity(4 + name.len() + 13);
        key.extend_from_slice(&(name.len() as u32).to_be_bytes());
        key.extend_from_slice(name);
        key
    }

    /// `name_len ‖ doc_name ‖ kind`: shared by every record of one kind.
    pub fn kind_prefix(doc_name: &str, kind: RecordKind) -> Vec<u8> {
        let mut key = Self::doc_prefix(doc_name);
        key.push(kind.tag());
        key
    }

    pub fn update(doc_name: &str, clock: u64, part_index: u32) -> Self {
        let mut key = Self::kind_prefix(doc_name, RecordKind::Update);
        key.extend_from_slice(&clock.to_be_bytes());
        key.extend_from_slice(&part_index.to_be_bytes());
        RecordKey(key)
    }

    pub fn state_vector(doc_name: &str) -> Self {
        RecordKey(Self::kind_prefix(doc_name, RecordKind::StateVector))
    }

    pub fn checkpoint(doc_name: &str, clock: u64) -> Self {
        let mut key = Self::kind_prefix(doc_name, RecordKind::Checkpoint);
        key.extend_from_slice(&clock.to_be_bytes());
        RecordKey(key)
    }

    pub fn meta(doc_name: &str, meta_key: &str) -> Self {
        let mut key = Self::kind_prefix(doc_name, RecordKind::Meta);
        key.extend_from_slice(meta_key.as_bytes());
        RecordKey(key)
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        RecordKey(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Document name encoded in the key.
    pub fn doc_name(&self) -> StoreResult<&str> {
        if self.0.len() < 4 {
            return Err(StoreError::InvalidKey("key shorter than name length".into()));
        }
        let mut len_buf = [0u8; 4];
        len_buf.copy_from_slice(&self.0[..4]);
        let len = u32::from_be_bytes(len_buf) as usize;
        let name = self
            .0
            .get(4..4 + len)
            .ok_or_else(|| StoreError::InvalidKey("truncated document name".into()))?;
        std::str::from_utf8(name).map_err(|e| StoreError::InvalidKey(e.to_string()))
    }
}

/// Value stored under a [`RecordKey`].
///
/// `seq` is assigned by the store on first insert and kept across upserts,
/// which gives every record a stable first-seen position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub seq: u64,
    pub record: Record,
}

impl StoredRecord {
    pub fn encode(&self) -> StoreResult<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> StoreResult<Self> {
        let (stored, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(stored)
    }

    /// Decode only the leading `seq` of an encoded envelope, skipping the
    /// record body.
    pub fn decode_seq(bytes: &[u8]) -> StoreResult<u64> {
        let (seq, _) = bincode::serde::decode_from_slice::<u64, _>(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(seq)
    }
}
