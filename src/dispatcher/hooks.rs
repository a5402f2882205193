//! # Hooks Table
//!
//! One slot per partition mapping to the ref-sizes of the batch that
//! partition is currently executing. The dispatcher writes a slot before
//! the worker starts and clears it on completion; only that partition's
//! compute function reads it, so a plain mutex per slot is safe by
//! construction.

use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::messages::{RefSize, Reply};

/// Per-partition slots holding the in-flight ref-sizes.
#[derive(Debug, Clone)]
pub struct HookSlots {
    slots: Arc<Vec<Mutex<Option<Arc<Vec<RefSize>>>>>>,
}

impl HookSlots {
    pub fn new(partitions: usize) -> Self {
        let mut slots = Vec::with_capacity(partitions);
        slots.resize_with(partitions, || Mutex::new(None));
        Self {
            slots: Arc::new(slots),
        }
    }

    pub(crate) fn set(&self, partition: usize, ref_sizes: Arc<Vec<RefSize>>) {
        if let Some(slot) = self.slots.get(partition) {
            *slot.lock().expect("hook slot lock poisoned") = Some(ref_sizes);
        }
    }

    pub(crate) fn clear(&self, partition: usize) {
        if let Some(slot) = self.slots.get(partition) {
            *slot.lock().expect("hook slot lock poisoned") = None;
        }
    }

    fn get(&self, partition: usize) -> Option<Arc<Vec<RefSize>>> {
        self.slots
            .get(partition)?
            .lock()
            .expect("hook slot lock poisoned")
            .clone()
    }
}

/// Handle a hooks-mode compute function emits named intermediate values
/// through. Bound to the partition the compute is running on.
#[derive(Debug, Clone)]
pub struct HookEmitter {
    partition: usize,
    slots: HookSlots,
}

impl HookEmitter {
    pub(crate) fn new(partition: usize, slots: HookSlots) -> Self {
        Self { partition, slots }
    }

    /// Emit a named hook event to every waiter of the batch currently
    /// executing on this partition. `output` must have one entry per item
    /// of the merged batch; each waiter receives its slice coordinates.
    pub fn emit(&self, name: impl Into<String>, output: Vec<Value>) {
        let Some(ref_sizes) = self.slots.get(self.partition) else {
            return;
        };
        let name = name.into();
        let output = Arc::new(output);
        for rs in ref_sizes.iter() {
            rs.waiter.send(Reply::Hook {
                name: name.clone(),
                start: rs.start,
                size: rs.size,
                output: Arc::clone(&output),
            });
        }
    }
}
