//! Shared helpers for integration tests.

use batchline::{Batch, FnServing};
use serde_json::{json, Value};

/// Serving that squares each integer entry.
pub fn squares_serving() -> FnServing {
    FnServing::from_sync(|items| {
        items
            .iter()
            .map(|v| json!(v.as_i64().unwrap() * v.as_i64().unwrap()))
            .collect()
    })
}

/// A batch of consecutive integers `from..=to`.
pub fn int_batch(from: i64, to: i64) -> Batch {
    Batch::stack((from..=to).map(|n| json!(n)).collect())
}

pub fn squared(from: i64, to: i64) -> Vec<Value> {
    (from..=to).map(|n| json!(n * n)).collect()
}
