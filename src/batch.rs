//! # Batch Value
//!
//! A keyed, ordered collection of opaque items. Batches are what clients
//! submit, what accumulators merge, and what workers consume. Items are
//! `serde_json::Value` so callers can carry any payload shape through the
//! engine untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BatchlineError, Result};

/// Sentinel key batches join when the caller does not pick one.
pub const DEFAULT_KEY: &str = "default";

/// An ordered sequence of opaque entries tagged with the per-key
/// accumulator it joins. Size always equals the item count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    key: String,
    items: Vec<Value>,
}

impl Batch {
    /// Stack a list of entries into a batch under the default key. Each
    /// input entry contributes exactly one to the batch size.
    pub fn stack(items: Vec<Value>) -> Self {
        Self {
            key: DEFAULT_KEY.to_string(),
            items,
        }
    }

    /// Concatenate a list of entries into a batch under the default key.
    /// Same semantics as [`Batch::stack`]; both constructors are kept for
    /// source compatibility.
    pub fn concat(items: Vec<Value>) -> Self {
        Self::stack(items)
    }

    /// Re-tag the batch with a different key.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// An empty batch carrying the given key.
    pub fn empty_with_key(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            items: Vec::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn items(&self) -> &[Value] {
        &self.items
    }

    pub fn into_items(self) -> Vec<Value> {
        self.items
    }

    pub fn size(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Concatenate batches left to right into one batch. Fails if any two
    /// batches carry unequal keys. An empty input list is rejected because
    /// there is no key to preserve.
    pub fn merge(batches: Vec<Batch>) -> Result<Batch> {
        let mut iter = batches.into_iter();
        let mut merged = iter.next().ok_or_else(|| {
            BatchlineError::validation("cannot merge an empty list of batches")
        })?;
        for batch in iter {
            if batch.key != merged.key {
                return Err(BatchlineError::validation(format!(
                    "cannot merge batches with different keys '{}' and '{}'",
                    merged.key, batch.key
                )));
            }
            merged.items.extend(batch.items);
        }
        Ok(merged)
    }

    /// Split into `(prefix of n, suffix of size - n)` preserving order and
    /// key. With `n >= size` the suffix is empty.
    pub fn split(mut self, n: usize) -> (Batch, Batch) {
        if n >= self.items.len() {
            let empty = Batch::empty_with_key(self.key.clone());
            return (self, empty);
        }
        let suffix_items = self.items.split_off(n);
        let suffix = Batch {
            key: self.key.clone(),
            items: suffix_items,
        };
        (self, suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stack_and_concat_are_identical() {
        let stacked = Batch::stack(vec![json!(1), json!(2), json!(3)]);
        let concatenated = Batch::concat(vec![json!(1), json!(2), json!(3)]);
        assert_eq!(stacked, concatenated);
        assert_eq!(stacked.size(), 3);
        assert_eq!(stacked.key(), DEFAULT_KEY);
    }

    #[test]
    fn test_merge_preserves_order() {
        let a = Batch::stack(vec![json!(1), json!(2)]);
        let b = Batch::stack(vec![json!(3)]);
        let merged = Batch::merge(vec![a, b]).unwrap();
        assert_eq!(merged.items(), &[json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn test_merge_rejects_mixed_keys() {
        let a = Batch::stack(vec![json!(1)]);
        let b = Batch::stack(vec![json!(2)]).with_key("double");
        assert!(Batch::merge(vec![a, b]).is_err());
    }

    #[test]
    fn test_merge_rejects_empty_list() {
        assert!(Batch::merge(vec![]).is_err());
    }

    #[test]
    fn test_split_interior() {
        let batch = Batch::stack(vec![json!(1), json!(2), json!(3)]).with_key("k");
        let (prefix, suffix) = batch.split(2);
        assert_eq!(prefix.items(), &[json!(1), json!(2)]);
        assert_eq!(suffix.items(), &[json!(3)]);
        assert_eq!(prefix.key(), "k");
        assert_eq!(suffix.key(), "k");
    }

    #[test]
    fn test_split_at_or_past_size() {
        let batch = Batch::stack(vec![json!(1), json!(2)]);
        let (prefix, suffix) = batch.clone().split(2);
        assert_eq!(prefix, batch);
        assert!(suffix.is_empty());
        assert_eq!(suffix.key(), batch.key());

        let (prefix, suffix) = batch.clone().split(5);
        assert_eq!(prefix, batch);
        assert!(suffix.is_empty());
    }

    #[test]
    fn test_merge_of_split_round_trips() {
        let batch = Batch::stack(vec![json!(1), json!(2), json!(3), json!(4)]);
        for n in 1..=batch.size() {
            let (prefix, suffix) = batch.clone().split(n);
            let rejoined = Batch::merge(vec![prefix, suffix]).unwrap();
            assert_eq!(rejoined, batch);
        }
    }
}
