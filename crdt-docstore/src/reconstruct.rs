//! Rebuilds a Yrs document from the update log.

use std::sync::Arc;

use yrs::Doc;

use crate::crdt;
use crate::error::Result;
use crate::update_log::UpdateLog;

pub struct Reconstructor {
    log: Arc<UpdateLog>,
}

impl Reconstructor {
    pub fn new(log: Arc<UpdateLog>) -> Self {
        Self { log }
    }

    /// Replay every update with clock ≤ `at_clock` (all when `None`) into a
    /// fresh document. Unknown documents and clocks before the first update
    /// give an empty document.
    pub fn build(&self, doc_name: &str, at_clock: Option<u64>) -> Result<Doc> {
        let doc = crdt::new_document();
        let updates = self.log.read_range(doc_name, at_clock)?;
        for update in &updates {
            log::trace!("Applying '{doc_name}' clock {}", update.clock);
            crdt::apply_update(&doc, &update.payload)?;
        }
        Ok(doc)
    }

    /// Merged current update of `doc_name`, or `None` without updates.
    pub fn merged_update(&self, doc_name: &str) -> Result<Option<Vec<u8>>> {
        let updates = self.log.read_range(doc_name, None)?;
        if updates.is_empty() {
            return Ok(None);
        }
        let payloads: Vec<&[u8]> = updates.iter().map(|u| u.payload.as_slice()).collect();
        crdt::merge_updates(&payloads).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryRecordStore;
    use yrs::{GetString, ReadTxn, Text, Transact, WriteTxn};

    fn text_of(doc: &Doc) -> String {
        let txn = doc.transact();
        txn.get_text("name")
            .map(|t| t.get_string(&txn))
            .unwrap_or_default()
    }

    fn setup(words: &[&str]) -> Reconstructor {
        let log = Arc::new(UpdateLog::new(Arc::new(MemoryRecordStore::new()), 1024, false));
        let source = Doc::new();
        for word in words {
            let before = source.transact().state_vector();
            {
                let mut txn = source.transact_mut();
                let text = txn.get_or_insert_text("name");
                let len = text.get_string(&txn).len() as u32;
                text.insert(&mut txn, len, word);
            }
            let update = source.transact().encode_state_as_update_v1(&before);
            log.append("doc", &update).unwrap();
        }
        Reconstructor::new(log)
    }

    #[test]
    fn test_build_latest_and_prefixes() {
        let rebuild = setup(&["a", "b", "c"]);
        assert_eq!(text_of(&rebuild.build("doc", None).unwrap()), "abc");
        assert_eq!(text_of(&rebuild.build("doc", Some(2)).unwrap()), "ab");
        assert_eq!(text_of(&rebuild.build("doc", Some(0)).unwrap()), "");
        assert_eq!(text_of(&rebuild.build("doc", Some(99)).unwrap()), "abc");
    }

    #[test]
    fn test_unknown_document_is_empty() {
        let rebuild = setup(&[]);
        assert_eq!(text_of(&rebuild.build("missing", None).unwrap()), "");
        assert!(rebuild.merged_update("missing").unwrap().is_none());
    }

    #[test]
    fn test_merged_update_matches_build() {
        let rebuild = setup(&["hello", " ", "world"]);
        let merged = rebuild.merged_update("doc").unwrap().unwrap();
        let doc = Doc::new();
        crdt::apply_update(&doc, &merged).unwrap();
        assert_eq!(text_of(&doc), "hello world");
    }
}
