//! Monotonic delivery counter.
//!
//! The counter holds the next sequence id the consumer expects. It only moves
//! forward, and only through [`DeliveryCounter::force_advance`] or the gated
//! [`DeliveryCounter::advance`], which is a no-op while delivery is sequence-gated by
//! requests (every mode except `Ignored`).

use crate::config::DeliveryMode;
use crate::fragment::SequenceId;
use std::sync::atomic::{AtomicU64, Ordering};

/// First sequence id of every run.
pub const FIRST_SEQUENCE_ID: SequenceId = 1;

/// The single "next expected sequence id" value.
#[derive(Debug)]
pub struct DeliveryCounter {
    next: AtomicU64,
    gated: bool,
}

impl DeliveryCounter {
    /// Counter starting at [`FIRST_SEQUENCE_ID`].
    pub fn new(mode: DeliveryMode) -> Self {
        Self {
            next: AtomicU64::new(FIRST_SEQUENCE_ID),
            gated: mode.is_request_driven(),
        }
    }

    /// Next sequence id the consumer expects.
    pub fn get(&self) -> SequenceId {
        self.next.load(Ordering::Acquire)
    }

    /// Whether the gated path is disabled.
    pub fn is_gated(&self) -> bool {
        self.gated
    }

    /// Rewind to [`FIRST_SEQUENCE_ID`]. Only the start transition calls this.
    pub(crate) fn reset(&self) {
        self.next.store(FIRST_SEQUENCE_ID, Ordering::Release);
    }

    /// Advance unconditionally. Returns the value before the increment.
    pub fn force_advance(&self, step: u64) -> SequenceId {
        self.next.fetch_add(step, Ordering::AcqRel)
    }

    /// Advance only when not sequence-gated.
    ///
    /// Returns the value before the increment, or `None` when gated.
    pub fn advance(&self, step: u64) -> Option<SequenceId> {
        if self.gated {
            None
        } else {
            Some(self.force_advance(step))
        }
    }
}
