//! CRDT merge primitive
//!
//! The engine treats update fragments as opaque blobs; the only operation
//! it ever needs is merging many fragments into one equivalent fragment
//! (used to squash history when a size quota is exceeded). The yrs-backed
//! implementation is the default; tests may supply their own.

use bytes::Bytes;
use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::Update;

/// Errors produced by the merge primitive.
#[derive(Error, Debug)]
pub enum MergeError {
    #[error("Failed to decode update: {0}")]
    Decode(String),

    #[error("Cannot merge an empty set of updates")]
    Empty,
}

/// Merges opaque CRDT update fragments into a single equivalent fragment.
pub trait UpdateMerger: Send + Sync {
    fn merge(&self, fragments: &[Bytes]) -> Result<Bytes, MergeError>;
}

/// Merge primitive backed by the Y.js v1 update encoding.
#[derive(Debug, Default, Clone, Copy)]
pub struct YrsMerger;

impl UpdateMerger for YrsMerger {
    fn merge(&self, fragments: &[Bytes]) -> Result<Bytes, MergeError> {
        if fragments.is_empty() {
            return Err(MergeError::Empty);
        }

        let mut decoded = Vec::with_capacity(fragments.len());
        for fragment in fragments {
            let update = Update::decode_v1(fragment)
                .map_err(|e| MergeError::Decode(e.to_string()))?;
            decoded.push(update);
        }

        let merged = Update::merge_updates(decoded);
        Ok(Bytes::from(merged.encode_v1()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::{Doc, GetString, ReadTxn, Text, Transact};

    fn text_update(doc: &Doc, index: u32, content: &str) -> Bytes {
        let text = doc.get_or_insert_text("content");
        let before = {
            let txn = doc.transact();
            txn.state_vector()
        };
        {
            let mut txn = doc.transact_mut();
            text.insert(&mut txn, index, content);
        }
        let txn = doc.transact();
        Bytes::from(txn.encode_diff_v1(&before))
    }

    #[test]
    fn test_merge_empty_fails() {
        assert!(matches!(YrsMerger.merge(&[]), Err(MergeError::Empty)));
    }

    #[test]
    fn test_merge_invalid_bytes_fails() {
        let result = YrsMerger.merge(&[Bytes::from_static(b"\xff\xff\xff")]);
        assert!(matches!(result, Err(MergeError::Decode(_))));
    }

    #[test]
    fn test_merged_fragment_is_equivalent() {
        let doc = Doc::new();
        let first = text_update(&doc, 0, "hello");
        let second = text_update(&doc, 5, " world");

        let merged = YrsMerger.merge(&[first, second]).unwrap();

        let replica = Doc::new();
        let text = replica.get_or_insert_text("content");
        {
            let mut txn = replica.transact_mut();
            txn.apply_update(Update::decode_v1(&merged).unwrap());
        }
        let txn = replica.transact();
        assert_eq!(text.get_string(&txn), "hello world");
    }
}
