//! Per-document key/value metadata stored next to the update log.
//!
//! Values are JSON encoded and unaffected by clocks or compaction.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{PersistenceError, Result};
use crate::record::{MetaRecord, Record, RecordKey};
use crate::store::{RecordStore, WriteOp};

pub struct MetaStore {
    store: Arc<dyn RecordStore>,
}

impl MetaStore {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Insert or overwrite `key` of `doc_name`.
    pub fn set<T: Serialize + ?Sized>(&self, doc_name: &str, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_vec(value)?;
        self.store.put(Record::Meta(MetaRecord {
            doc_name: doc_name.to_string(),
            key: key.to_string(),
            value,
        }))?;
        Ok(())
    }

    pub fn get<T: DeserializeOwned>(&self, doc_name: &str, key: &str) -> Result<Option<T>> {
        match self.store.get(&RecordKey::meta(doc_name, key))? {
            Some(Record::Meta(meta)) => Ok(Some(serde_json::from_slice(&meta.value)?)),
            Some(other) => Err(PersistenceError::Meta(format!(
                "'{doc_name}' key '{key}' holds a {:?} record",
                other.kind()
            ))),
            None => Ok(None),
        }
    }

    /// Remove `key`; returns whether it existed.
    pub fn delete(&self, doc_name: &str, key: &str) -> Result<bool> {
        let key = RecordKey::meta(doc_name, key);
        if self.store.get(&key)?.is_none() {
            return Ok(false);
        }
        self.store.write_batch(vec![WriteOp::Delete(key)])?;
        Ok(true)
    }
}
