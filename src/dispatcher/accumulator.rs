//! # Per-Key Accumulator
//!
//! Mutable record of unsealed submissions for one batch key: the pending
//! `(waiter, batch)` entries newest-first, their summed item count, and
//! the accumulation timer state. Sealing converts the entries into one
//! merged batch plus forward-order ref-sizes describing how the output
//! slices back to each originating call.

use std::collections::VecDeque;

use tokio::task::AbortHandle;

use crate::batch::Batch;
use crate::messages::{RefSize, WaiterRef};

use super::queues::SealedBatch;

/// Accumulation timer lifecycle.
///
/// `Done` means the timer fired while no partition was free; the entries
/// stay in place (and may keep growing) until a partition picks them up.
#[derive(Debug)]
pub(crate) enum TimerState {
    Idle,
    Armed { tag: u64, abort: AbortHandle },
    Done,
}

#[derive(Debug)]
pub(crate) struct Accumulator {
    /// Pending entries, newest at the front.
    entries: VecDeque<(WaiterRef, Batch)>,
    /// Sum of batch sizes across entries.
    count: usize,
    timer: TimerState,
}

impl Accumulator {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            count: 0,
            timer: TimerState::Idle,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Push a new entry at the front.
    pub fn push(&mut self, waiter: WaiterRef, batch: Batch) {
        self.count += batch.size();
        self.entries.push_front((waiter, batch));
    }

    pub fn timer_is_idle(&self) -> bool {
        matches!(self.timer, TimerState::Idle)
    }

    pub fn timer_is_done(&self) -> bool {
        matches!(self.timer, TimerState::Done)
    }

    /// True when the given tag matches the currently armed timer.
    pub fn timer_matches(&self, tag: u64) -> bool {
        matches!(self.timer, TimerState::Armed { tag: armed, .. } if armed == tag)
    }

    pub fn arm_timer(&mut self, tag: u64, abort: AbortHandle) {
        self.cancel_timer();
        self.timer = TimerState::Armed { tag, abort };
    }

    /// The timer fired with no free partition; remember that so a later
    /// seal does not re-enqueue the key.
    pub fn mark_timer_done(&mut self) {
        self.timer = TimerState::Done;
    }

    fn cancel_timer(&mut self) {
        if let TimerState::Armed { abort, .. } =
            std::mem::replace(&mut self.timer, TimerState::Idle)
        {
            abort.abort();
        }
    }

    /// Take all entries as one sealed batch, cancelling the timer and
    /// resetting the accumulator. Returns `None` when there is nothing to
    /// seal.
    ///
    /// Ref-sizes come out in forward order (oldest submission first), so
    /// the `(start, size)` ranges tile `[0, count)` in arrival order and
    /// the merged batch carries the oldest items first.
    pub fn seal(&mut self) -> Option<SealedBatch> {
        if self.entries.is_empty() {
            return None;
        }
        self.cancel_timer();
        self.count = 0;

        let mut ref_sizes = Vec::with_capacity(self.entries.len());
        let mut batches = Vec::with_capacity(self.entries.len());
        let mut start = 0;
        // Entries are newest-first; reverse-scan yields forward order.
        while let Some((waiter, batch)) = self.entries.pop_back() {
            let size = batch.size();
            ref_sizes.push(RefSize {
                waiter,
                start,
                size,
            });
            start += size;
            batches.push(batch);
        }
        let batch = Batch::merge(batches).expect("accumulator entries share one key");
        Some(SealedBatch { batch, ref_sizes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::reply_channel;
    use serde_json::json;

    fn waiter() -> WaiterRef {
        let (tx, _rx) = reply_channel();
        WaiterRef::new(tx)
    }

    #[test]
    fn test_count_tracks_entry_sizes() {
        let mut acc = Accumulator::new();
        assert_eq!(acc.count(), 0);
        acc.push(waiter(), Batch::stack(vec![json!(1), json!(2)]));
        acc.push(waiter(), Batch::stack(vec![json!(3)]));
        assert_eq!(acc.count(), 3);
        assert!(!acc.is_empty());
    }

    #[test]
    fn test_seal_produces_forward_ref_sizes_tiling_the_output() {
        let mut acc = Accumulator::new();
        let first = waiter();
        let second = waiter();
        let first_id = first.id;
        let second_id = second.id;
        acc.push(first, Batch::stack(vec![json!(1), json!(2), json!(3)]));
        acc.push(second, Batch::stack(vec![json!(4), json!(5)]));

        let sealed = acc.seal().unwrap();
        assert_eq!(
            sealed.batch.items(),
            &[json!(1), json!(2), json!(3), json!(4), json!(5)]
        );
        assert_eq!(sealed.ref_sizes.len(), 2);
        assert_eq!(sealed.ref_sizes[0].waiter.id, first_id);
        assert_eq!(
            (sealed.ref_sizes[0].start, sealed.ref_sizes[0].size),
            (0, 3)
        );
        assert_eq!(sealed.ref_sizes[1].waiter.id, second_id);
        assert_eq!(
            (sealed.ref_sizes[1].start, sealed.ref_sizes[1].size),
            (3, 2)
        );

        // Sealing resets the accumulator.
        assert!(acc.is_empty());
        assert_eq!(acc.count(), 0);
        assert!(acc.timer_is_idle());
        assert!(acc.seal().is_none());
    }

    #[test]
    fn test_timer_state_transitions() {
        let mut acc = Accumulator::new();
        assert!(acc.timer_is_idle());

        let handle = tokio::runtime::Runtime::new()
            .unwrap()
            .block_on(async { tokio::spawn(async {}).abort_handle() });
        acc.arm_timer(7, handle);
        assert!(acc.timer_matches(7));
        assert!(!acc.timer_matches(8));

        acc.mark_timer_done();
        assert!(acc.timer_is_done());
        assert!(!acc.timer_matches(7));
    }
}
