//! Pending-request ledger.
//!
//! The delivery engine consumes requests through the [`RequestLedger`] trait; the
//! transport that receives them from the network lives outside this crate.
//! [`RequestBuffer`] is the in-memory implementation that such a receiver (or a test)
//! feeds with [`RequestBuffer::add_request`].

use crate::fragment::{SequenceId, Timestamp};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Source of pending `(sequence_id → timestamp)` requests.
pub trait RequestLedger: Send + Sync {
    /// Copy of every pending request, ordered by sequence id.
    fn snapshot_pending(&self) -> BTreeMap<SequenceId, Timestamp>;

    /// Forget a request. Unknown ids are ignored.
    fn remove(&self, sequence_id: SequenceId);

    /// Block until at least one request is pending or `timeout` elapses.
    ///
    /// Returns `true` if requests are pending.
    fn wait_for_any(&self, timeout: Duration) -> bool;

    /// When the request was first seen.
    fn time_of(&self, sequence_id: SequenceId) -> Option<Instant>;

    /// Whether the receiver is still accepting requests.
    fn is_running(&self) -> bool;

    /// Number of pending requests.
    fn pending_count(&self) -> usize {
        self.snapshot_pending().len()
    }

    /// Begin accepting requests. Called by the start transition.
    fn start_receiving(&self) {}

    /// Stop accepting requests. Called first by the stop transition.
    fn stop_receiving(&self) {}
}

#[derive(Debug, Clone, Copy)]
struct PendingRequest {
    timestamp: Timestamp,
    received: Instant,
}

/// In-memory [`RequestLedger`] guarded by a mutex and condition variable.
#[derive(Debug, Default)]
pub struct RequestBuffer {
    requests: Mutex<BTreeMap<SequenceId, PendingRequest>>,
    arrived: Condvar,
    running: AtomicBool,
}

impl RequestBuffer {
    /// Create a ledger that is not yet receiving.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request. Duplicates keep their first arrival.
    ///
    /// Returns `false` when the ledger is not receiving or the id is already pending.
    pub fn add_request(&self, sequence_id: SequenceId, timestamp: Timestamp) -> bool {
        if !self.running.load(Ordering::Acquire) {
            debug!(sequence_id, "Request ignored, receiver not running");
            return false;
        }
        let mut requests = self.requests.lock();
        if requests.contains_key(&sequence_id) {
            trace!(sequence_id, "Duplicate request ignored");
            return false;
        }
        requests.insert(
            sequence_id,
            PendingRequest {
                timestamp,
                received: Instant::now(),
            },
        );
        drop(requests);
        self.arrived.notify_all();
        true
    }

    /// Number of pending requests.
    pub fn len(&self) -> usize {
        self.requests.lock().len()
    }

    /// Whether no request is pending.
    pub fn is_empty(&self) -> bool {
        self.requests.lock().is_empty()
    }

    /// Forget every pending request.
    pub fn reset(&self) {
        self.requests.lock().clear();
    }
}

impl RequestLedger for RequestBuffer {
    fn snapshot_pending(&self) -> BTreeMap<SequenceId, Timestamp> {
        self.requests
            .lock()
            .iter()
            .map(|(seq, req)| (*seq, req.timestamp))
            .collect()
    }

    fn remove(&self, sequence_id: SequenceId) {
        self.requests.lock().remove(&sequence_id);
    }

    fn wait_for_any(&self, timeout: Duration) -> bool {
        let mut requests = self.requests.lock();
        if requests.is_empty() {
            self.arrived.wait_for(&mut requests, timeout);
        }
        !requests.is_empty()
    }

    fn time_of(&self, sequence_id: SequenceId) -> Option<Instant> {
        self.requests
            .lock()
            .get(&sequence_id)
            .map(|req| req.received)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn pending_count(&self) -> usize {
        self.requests.lock().len()
    }

    fn start_receiving(&self) {
        self.reset();
        self.running.store(true, Ordering::Release);
    }

    fn stop_receiving(&self) {
        self.running.store(false, Ordering::Release);
        self.arrived.notify_all();
    }
}
