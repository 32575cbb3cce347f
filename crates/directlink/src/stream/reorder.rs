//! # Batch Reordering
//!
//! Restores `(batch, message)` order over a transport that may duplicate or
//! reorder messages.
//!
//! Batches are expected in sequence `1, 2, 3, …` (0 skipped). Within the
//! expected batch, messages are buffered by message code and released as
//! soon as the run starting at the next expected code is contiguous. A
//! batch ends when its closing item is released.

use std::collections::BTreeMap;

use super::{next_cycle, BatchItem};
use crate::protocol::{DeltaEvent, HaveListEvent};

impl BatchItem for DeltaEvent {
    fn closes_batch(&self) -> bool {
        matches!(self, Self::CloseDelta(_))
    }
}

impl BatchItem for HaveListEvent {
    fn closes_batch(&self) -> bool {
        matches!(self, Self::Close)
    }
}

/// Why a message was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// Batch already completed.
    StaleBatch,
    /// Batch not opened yet.
    FutureBatch,
    /// Message code already delivered or buffered.
    Duplicate,
}

/// Reordering counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReorderStats {
    /// Items released in order.
    pub delivered: u64,
    /// Items that arrived ahead of a gap.
    pub buffered: u64,
    /// Items refused.
    pub dropped: u64,
    /// Batches completed.
    pub batches: u64,
}

/// In-order release of batched items.
#[derive(Debug)]
pub struct BatchReorderer<T> {
    expected_batch: u32,
    next_message: u32,
    pending: BTreeMap<u32, T>,
    stats: ReorderStats,
}

impl<T: BatchItem> Default for BatchReorderer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: BatchItem> BatchReorderer<T> {
    /// Creates a reorderer expecting batch 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            expected_batch: next_cycle(0),
            next_message: 0,
            pending: BTreeMap::new(),
            stats: ReorderStats::default(),
        }
    }

    /// Batch currently accepted.
    #[must_use]
    pub const fn expected_batch(&self) -> u32 {
        self.expected_batch
    }

    /// Number of items waiting for a gap to fill.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Counters.
    #[must_use]
    pub const fn stats(&self) -> ReorderStats {
        self.stats
    }

    /// Accepts one item and returns every item now deliverable, in order.
    ///
    /// Batch `0` bypasses ordering and is released immediately.
    pub fn push(&mut self, batch: u32, message: u32, item: T) -> Result<Vec<T>, DropReason> {
        if batch == 0 {
            self.stats.delivered += 1;
            return Ok(vec![item]);
        }
        if let Err(reason) = self.check(batch, message) {
            self.stats.dropped += 1;
            tracing::warn!(
                batch,
                message,
                expected_batch = self.expected_batch,
                next_message = self.next_message,
                ?reason,
                "reorder: message dropped"
            );
            return Err(reason);
        }

        self.pending.insert(message, item);
        let mut ready = Vec::new();
        while let Some(item) = self.pending.remove(&self.next_message) {
            self.next_message += 1;
            let closes = item.closes_batch();
            ready.push(item);
            if closes {
                self.finish_batch();
                break;
            }
        }
        self.stats.delivered += ready.len() as u64;
        if ready.is_empty() {
            self.stats.buffered += 1;
        }
        Ok(ready)
    }

    fn check(&self, batch: u32, message: u32) -> Result<(), DropReason> {
        if batch != self.expected_batch {
            // Batches advance by one; anything else is either behind or ahead.
            let behind = self.expected_batch.wrapping_sub(batch) < u32::MAX / 2;
            return Err(if behind {
                DropReason::StaleBatch
            } else {
                DropReason::FutureBatch
            });
        }
        if message < self.next_message || self.pending.contains_key(&message) {
            return Err(DropReason::Duplicate);
        }
        Ok(())
    }

    fn finish_batch(&mut self) {
        if !self.pending.is_empty() {
            tracing::warn!(
                batch = self.expected_batch,
                leftover = self.pending.len(),
                "reorder: messages after batch close discarded"
            );
            self.pending.clear();
        }
        self.expected_batch = next_cycle(self.expected_batch);
        self.next_message = 0;
        self.stats.batches += 1;
    }
}
