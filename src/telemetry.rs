//! Best-effort telemetry for the readout engine.
//!
//! Components report through a [`TelemetrySink`] handle passed in at construction.
//! A readout without a sink is a valid configuration: [`Telemetry`] simply drops the
//! reports. Sinks must never block; they are called with the buffer lock held.
//!
//! [`ReadoutMetrics`] is the stock sink. It keeps lock-free atomic counters and can be
//! snapshotted into a serializable [`MetricsSnapshot`].

use crate::config::DeliveryMode;
use crate::fragment::SequenceId;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Receiver of readout telemetry.
///
/// Every method has a no-op default so sinks only implement what they record.
pub trait TelemetrySink: Send + Sync {
    /// Buffer depth after a mutation.
    fn buffer_depth(&self, _fragments: usize, _bytes: usize) {}

    /// A request was resolved by the given delivery mode.
    fn request_resolved(&self, _mode: DeliveryMode) {}

    /// Empty placeholder fragments were synthesized.
    fn empty_fragments_sent(&self, _count: usize) {}

    /// A sequence id was skipped by timeout escalation.
    fn missed_sequence(&self, _sequence_id: SequenceId) {}

    /// Time spent in one `produce` call.
    fn producer_latency(&self, _elapsed: Duration) {}

    /// Fragments dropped by circular eviction or stale pruning.
    fn fragments_evicted(&self, _count: usize) {}

    /// Fragments handed to the consumer by `fetch_next`.
    fn fragments_delivered(&self, _count: usize) {}
}

/// Optional sink handle shared by all components.
#[derive(Clone, Default)]
pub struct Telemetry {
    sink: Option<Arc<dyn TelemetrySink>>,
}

impl Telemetry {
    /// Handle reporting to `sink`.
    pub fn new(sink: Arc<dyn TelemetrySink>) -> Self {
        Self { sink: Some(sink) }
    }

    /// Handle that drops every report.
    pub fn disabled() -> Self {
        Self { sink: None }
    }

    /// Whether a sink is attached.
    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    pub(crate) fn buffer_depth(&self, fragments: usize, bytes: usize) {
        if let Some(sink) = &self.sink {
            sink.buffer_depth(fragments, bytes);
        }
    }

    pub(crate) fn request_resolved(&self, mode: DeliveryMode) {
        if let Some(sink) = &self.sink {
            sink.request_resolved(mode);
        }
    }

    pub(crate) fn empty_fragments_sent(&self, count: usize) {
        if let Some(sink) = &self.sink {
            sink.empty_fragments_sent(count);
        }
    }

    pub(crate) fn missed_sequence(&self, sequence_id: SequenceId) {
        if let Some(sink) = &self.sink {
            sink.missed_sequence(sequence_id);
        }
    }

    pub(crate) fn producer_latency(&self, elapsed: Duration) {
        if let Some(sink) = &self.sink {
            sink.producer_latency(elapsed);
        }
    }

    pub(crate) fn fragments_evicted(&self, count: usize) {
        if count == 0 {
            return;
        }
        if let Some(sink) = &self.sink {
            sink.fragments_evicted(count);
        }
    }

    pub(crate) fn fragments_delivered(&self, count: usize) {
        if let Some(sink) = &self.sink {
            sink.fragments_delivered(count);
        }
    }
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// Lock-free counters implementing [`TelemetrySink`].
#[derive(Debug, Default)]
pub struct ReadoutMetrics {
    buffer_fragments: AtomicU64,
    buffer_bytes: AtomicU64,
    ignored_resolved: AtomicU64,
    single_resolved: AtomicU64,
    buffer_resolved: AtomicU64,
    window_resolved: AtomicU64,
    empty_fragments: AtomicU64,
    missed_sequences: AtomicU64,
    produce_calls: AtomicU64,
    produce_latency_us_total: AtomicU64,
    produce_latency_us_max: AtomicU64,
    evicted_fragments: AtomicU64,
    delivered_fragments: AtomicU64,
}

/// Point-in-time copy of [`ReadoutMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Fragments currently buffered
    pub buffer_fragments: u64,
    /// Bytes currently buffered
    pub buffer_bytes: u64,
    /// Delivery cycles resolved in Ignored mode
    pub ignored_resolved: u64,
    /// Requests resolved in Single mode
    pub single_resolved: u64,
    /// Requests resolved in Buffer mode
    pub buffer_resolved: u64,
    /// Requests resolved in Window mode
    pub window_resolved: u64,
    /// Empty placeholder fragments synthesized
    pub empty_fragments: u64,
    /// Sequence ids skipped by timeout escalation
    pub missed_sequences: u64,
    /// Number of `produce` calls
    pub produce_calls: u64,
    /// Mean `produce` latency in microseconds
    pub produce_latency_us_mean: u64,
    /// Worst `produce` latency in microseconds
    pub produce_latency_us_max: u64,
    /// Fragments dropped by eviction or pruning
    pub evicted_fragments: u64,
    /// Fragments handed to the consumer
    pub delivered_fragments: u64,
}

impl ReadoutMetrics {
    /// Create a zeroed metrics sink.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Copy the current counter values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let calls = self.produce_calls.load(Ordering::Relaxed);
        let total = self.produce_latency_us_total.load(Ordering::Relaxed);
        MetricsSnapshot {
            buffer_fragments: self.buffer_fragments.load(Ordering::Relaxed),
            buffer_bytes: self.buffer_bytes.load(Ordering::Relaxed),
            ignored_resolved: self.ignored_resolved.load(Ordering::Relaxed),
            single_resolved: self.single_resolved.load(Ordering::Relaxed),
            buffer_resolved: self.buffer_resolved.load(Ordering::Relaxed),
            window_resolved: self.window_resolved.load(Ordering::Relaxed),
            empty_fragments: self.empty_fragments.load(Ordering::Relaxed),
            missed_sequences: self.missed_sequences.load(Ordering::Relaxed),
            produce_calls: calls,
            produce_latency_us_mean: if calls == 0 { 0 } else { total / calls },
            produce_latency_us_max: self.produce_latency_us_max.load(Ordering::Relaxed),
            evicted_fragments: self.evicted_fragments.load(Ordering::Relaxed),
            delivered_fragments: self.delivered_fragments.load(Ordering::Relaxed),
        }
    }
}

impl TelemetrySink for ReadoutMetrics {
    fn buffer_depth(&self, fragments: usize, bytes: usize) {
        self.buffer_fragments
            .store(fragments as u64, Ordering::Relaxed);
        self.buffer_bytes.store(bytes as u64, Ordering::Relaxed);
    }

    fn request_resolved(&self, mode: DeliveryMode) {
        let counter = match mode {
            DeliveryMode::Ignored => &self.ignored_resolved,
            DeliveryMode::Single => &self.single_resolved,
            DeliveryMode::Buffer => &self.buffer_resolved,
            DeliveryMode::Window => &self.window_resolved,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn empty_fragments_sent(&self, count: usize) {
        self.empty_fragments
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    fn missed_sequence(&self, _sequence_id: SequenceId) {
        self.missed_sequences.fetch_add(1, Ordering::Relaxed);
    }

    fn producer_latency(&self, elapsed: Duration) {
        let us = elapsed.as_micros().min(u64::MAX as u128) as u64;
        self.produce_calls.fetch_add(1, Ordering::Relaxed);
        self.produce_latency_us_total
            .fetch_add(us, Ordering::Relaxed);
        self.produce_latency_us_max.fetch_max(us, Ordering::Relaxed);
    }

    fn fragments_evicted(&self, count: usize) {
        self.evicted_fragments
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    fn fragments_delivered(&self, count: usize) {
        self.delivered_fragments
            .fetch_add(count as u64, Ordering::Relaxed);
    }
}
