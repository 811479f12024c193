//! Out-of-order window completion tracking.
//!
//! Window delivery resolves a request as soon as its window closes, which need not be
//! in sequence-id order. Every completed id is recorded here and reconciled against the
//! delivery counter:
//!
//! - an entry equal to the counter advances it and is dropped,
//! - an entry behind the counter is dropped (and forgotten by the ledger),
//! - an entry older than `missing_request_window_timeout` forces the counter through
//!   its id; every id skipped on the way that was never delivered is logged as missed,
//! - anything else waits.
//!
//! This bounds how long a request that never arrives can stall the sequence.

use crate::counter::DeliveryCounter;
use crate::fragment::SequenceId;
use crate::ledger::RequestLedger;
use crate::telemetry::Telemetry;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Sequence ids delivered ahead of the counter, with the time they were recorded.
pub struct OutOfOrderTracker {
    entries: BTreeMap<SequenceId, Instant>,
    timeout: Duration,
    counter: Arc<DeliveryCounter>,
    ledger: Arc<dyn RequestLedger>,
    telemetry: Telemetry,
}

impl OutOfOrderTracker {
    /// Create an empty tracker.
    pub fn new(
        timeout: Duration,
        counter: Arc<DeliveryCounter>,
        ledger: Arc<dyn RequestLedger>,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            entries: BTreeMap::new(),
            timeout,
            counter,
            ledger,
            telemetry,
        }
    }

    /// Record a completed window and reconcile.
    pub fn record(&mut self, sequence_id: SequenceId) {
        self.record_at(sequence_id, Instant::now());
    }

    /// [`record`](Self::record) with an explicit clock reading.
    pub fn record_at(&mut self, sequence_id: SequenceId, now: Instant) {
        if sequence_id != self.counter.get() {
            debug!(
                sequence_id,
                expected = self.counter.get(),
                "Window completed out of order"
            );
        }
        self.entries.insert(sequence_id, now);
        self.reconcile(now);
    }

    /// Reconcile without recording, so timeouts escalate with no new completions.
    pub fn check_timeouts(&mut self) {
        self.reconcile(Instant::now());
    }

    /// [`check_timeouts`](Self::check_timeouts) with an explicit clock reading.
    pub fn check_timeouts_at(&mut self, now: Instant) {
        self.reconcile(now);
    }

    /// Ids still waiting for the counter, ascending.
    pub fn pending(&self) -> Vec<SequenceId> {
        self.entries.keys().copied().collect()
    }

    /// Number of waiting entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn reconcile(&mut self, now: Instant) {
        let ids: Vec<SequenceId> = self.entries.keys().copied().collect();
        for id in ids {
            let Some(&recorded) = self.entries.get(&id) else {
                // Dropped by an escalation earlier in this pass
                continue;
            };
            let expected = self.counter.get();

            if id == expected {
                self.counter.force_advance(1);
                self.entries.remove(&id);
                trace!(sequence_id = id, "Out-of-order entry reconciled");
            } else if id < expected {
                self.entries.remove(&id);
                self.ledger.remove(id);
                trace!(sequence_id = id, expected, "Dropped entry behind counter");
            } else if now.saturating_duration_since(recorded) > self.timeout {
                warn!(
                    sequence_id = id,
                    expected,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Out-of-order window timed out, advancing delivery counter"
                );
                while self.counter.get() <= id {
                    let skipped = self.counter.force_advance(1);
                    if skipped < id && !self.entries.contains_key(&skipped) {
                        warn!(sequence_id = skipped, "Missed request for sequence id");
                        self.telemetry.missed_sequence(skipped);
                    }
                }
                self.entries.retain(|seq, _| *seq > id);
            }
        }
    }
}

impl std::fmt::Debug for OutOfOrderTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutOfOrderTracker")
            .field("entries", &self.pending())
            .field("timeout", &self.timeout)
            .field("counter", &self.counter.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeliveryMode;
    use crate::ledger::RequestBuffer;
    use crate::telemetry::ReadoutMetrics;
    use tracing_test::traced_test;

    fn setup(timeout: Duration) -> (OutOfOrderTracker, Arc<DeliveryCounter>, Arc<RequestBuffer>) {
        let counter = Arc::new(DeliveryCounter::new(DeliveryMode::Window));
        let ledger = Arc::new(RequestBuffer::new());
        ledger.start_receiving();
        let tracker = OutOfOrderTracker::new(
            timeout,
            Arc::clone(&counter),
            ledger.clone(),
            Telemetry::disabled(),
        );
        (tracker, counter, ledger)
    }

    #[test]
    fn test_in_order_completion_advances() {
        let (mut tracker, counter, _) = setup(Duration::from_secs(5));
        tracker.record(1);
        tracker.record(2);
        assert_eq!(counter.get(), 3);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_reconciles_out_of_order_run() {
        let (mut tracker, counter, _) = setup(Duration::from_secs(5));
        counter.force_advance(8);
        assert_eq!(counter.get(), 9);

        tracker.record(10);
        tracker.record(11);
        assert_eq!(tracker.pending(), vec![10, 11]);
        assert_eq!(counter.get(), 9);

        tracker.record(9);
        assert_eq!(counter.get(), 12);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_entry_behind_counter_is_dropped() {
        let (mut tracker, counter, ledger) = setup(Duration::from_secs(5));
        counter.force_advance(4);
        ledger.add_request(2, 20);

        tracker.record(2);
        assert!(tracker.is_empty());
        assert_eq!(counter.get(), 5);
        assert_eq!(ledger.pending_count(), 0);
    }

    #[traced_test]
    #[test]
    fn test_timeout_escalation_skips_missing_ids() {
        let metrics = ReadoutMetrics::new();
        let counter = Arc::new(DeliveryCounter::new(DeliveryMode::Window));
        let ledger = Arc::new(RequestBuffer::new());
        let mut tracker = OutOfOrderTracker::new(
            Duration::from_millis(100),
            Arc::clone(&counter),
            ledger,
            Telemetry::new(metrics.clone()),
        );

        let start = Instant::now();
        tracker.record_at(3, start);
        tracker.record_at(5, start + Duration::from_millis(50));
        assert_eq!(counter.get(), 1);

        // Not yet timed out
        tracker.check_timeouts_at(start + Duration::from_millis(90));
        assert_eq!(counter.get(), 1);

        // Entry 3 escalates: ids 1 and 2 are missed, 3 was delivered
        tracker.check_timeouts_at(start + Duration::from_millis(120));
        assert_eq!(counter.get(), 4);
        assert_eq!(tracker.pending(), vec![5]);
        assert_eq!(metrics.snapshot().missed_sequences, 2);
        assert!(logs_contain("Missed request for sequence id"));

        // Entry 5 escalates later: 4 missed
        tracker.check_timeouts_at(start + Duration::from_millis(200));
        assert_eq!(counter.get(), 6);
        assert!(tracker.is_empty());
        assert_eq!(metrics.snapshot().missed_sequences, 3);
    }

    #[test]
    fn test_escalation_drops_earlier_pending_entries() {
        let (mut tracker, counter, _) = setup(Duration::from_millis(100));
        let start = Instant::now();
        // 4 recorded late so it has not timed out when 6 does
        tracker.record_at(6, start);
        tracker.record_at(4, start + Duration::from_millis(80));
        tracker.check_timeouts_at(start + Duration::from_millis(150));
        assert_eq!(counter.get(), 7);
        assert!(tracker.is_empty());
    }
}
