//! Request/response delivery policies.
//!
//! [`DeliveryEngine::fetch_next`] is the consumer-side entry point. In `Ignored` mode it
//! hands over everything the producer has buffered. In the request-driven modes it
//! resolves pending requests from the [`RequestLedger`] against the buffer:
//!
//! | Mode     | Resolution                                                        |
//! |----------|-------------------------------------------------------------------|
//! | `Single` | copy of the latest event, restamped with the request              |
//! | `Buffer` | the whole buffer, moved into one container per fragment id        |
//! | `Window` | fragments inside `[ts - offset, ts - offset + width)` per request |
//!
//! Whenever a sequence id must be passed without data, one empty placeholder per
//! configured fragment id is emitted so downstream always sees a contiguous stream.
//!
//! The buffer lock is held while a delivery cycle runs, never while waiting for
//! requests.

use crate::buffer::{BufferGuard, SharedBuffer};
use crate::config::{DeliveryMode, ReadoutConfig};
use crate::counter::DeliveryCounter;
use crate::fragment::{Fragment, FragmentId, SequenceId, Timestamp};
use crate::ledger::RequestLedger;
use crate::out_of_order::OutOfOrderTracker;
use crate::state::RunState;
use crate::telemetry::Telemetry;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Periodic wake while waiting on the buffer condition variable.
pub const DATA_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Periodic wake while waiting for requests.
pub const REQUEST_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub(crate) fn delivery_should_stop(
    state: &RunState,
    ledger: &dyn RequestLedger,
    mode: DeliveryMode,
    separate_data_thread: bool,
) -> bool {
    if !state.stop_requested() {
        return false;
    }
    !separate_data_thread
        || mode == DeliveryMode::Ignored
        || state.force_stop_requested()
        || !ledger.is_running()
}

/// Step of one `fetch_next` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchState {
    Waiting,
    Delivering,
    Finished(bool),
}

/// Window and staleness settings copied out of [`ReadoutConfig`].
#[derive(Debug, Clone, Copy)]
struct PolicySettings {
    mode: DeliveryMode,
    window_offset: u64,
    window_width: u64,
    unique_windows: bool,
    window_close_timeout: Duration,
    stale_timeout: Option<u64>,
    separate_data_thread: bool,
}

/// Implements the four delivery policies on top of the buffer, ledger and tracker.
pub struct DeliveryEngine {
    settings: PolicySettings,
    fragment_ids: Arc<[FragmentId]>,
    buffer: Arc<SharedBuffer>,
    ledger: Arc<dyn RequestLedger>,
    counter: Arc<DeliveryCounter>,
    tracker: OutOfOrderTracker,
    state: Arc<RunState>,
    telemetry: Telemetry,
}

impl DeliveryEngine {
    pub(crate) fn new(
        config: &ReadoutConfig,
        fragment_ids: Arc<[FragmentId]>,
        buffer: Arc<SharedBuffer>,
        ledger: Arc<dyn RequestLedger>,
        counter: Arc<DeliveryCounter>,
        state: Arc<RunState>,
        telemetry: Telemetry,
    ) -> Self {
        let tracker = OutOfOrderTracker::new(
            config.missing_request_window_timeout,
            Arc::clone(&counter),
            Arc::clone(&ledger),
            telemetry.clone(),
        );
        Self {
            settings: PolicySettings {
                mode: config.request_mode,
                window_offset: config.request_window_offset,
                window_width: config.request_window_width,
                unique_windows: config.request_windows_are_unique,
                window_close_timeout: config.window_close_timeout,
                stale_timeout: config.stale_fragment_timeout,
                separate_data_thread: config.separate_data_thread,
            },
            fragment_ids,
            buffer,
            ledger,
            counter,
            tracker,
            state,
            telemetry,
        }
    }

    /// Configured delivery mode.
    pub fn mode(&self) -> DeliveryMode {
        self.settings.mode
    }

    /// Out-of-order ids still waiting for the counter.
    pub fn out_of_order_pending(&self) -> Vec<SequenceId> {
        self.tracker.pending()
    }

    pub(crate) fn reset(&mut self) {
        self.tracker.clear();
    }

    /// Whether delivery should cease.
    ///
    /// True iff a stop was requested and either there is no producer thread, the mode
    /// is `Ignored`, a force stop was requested, or the request receiver has stopped.
    /// In request-driven modes this keeps outstanding requests flowing after a stop.
    pub fn check_stop(&self) -> bool {
        delivery_should_stop(
            &self.state,
            self.ledger.as_ref(),
            self.settings.mode,
            self.settings.separate_data_thread,
        )
    }

    /// Append the next batch of output fragments to `out`.
    ///
    /// Returns `false` once data taking has ended or an exception is latched. `true`
    /// with nothing appended means nothing was ready.
    pub fn fetch_next(&mut self, out: &mut Vec<Fragment>) -> bool {
        if self.state.exception() {
            return false;
        }
        let before = out.len();
        let result = match self.settings.mode {
            DeliveryMode::Ignored => self.fetch_ignored(out),
            _ => self.fetch_requested(out),
        };
        let delivered = out.len() - before;
        if delivered > 0 {
            self.telemetry.fragments_delivered(delivered);
        }
        result && !self.state.exception()
    }

    fn fetch_ignored(&mut self, out: &mut Vec<Fragment>) -> bool {
        let mut buffer = self.buffer.lock();
        let mut step = FetchState::Waiting;
        loop {
            step = match step {
                FetchState::Waiting => {
                    if self.state.exception() {
                        FetchState::Finished(false)
                    } else if !buffer.is_empty() {
                        FetchState::Delivering
                    } else if self.check_stop()
                        || self.state.buffer_depleted()
                        || !self.state.producer_running()
                    {
                        FetchState::Finished(false)
                    } else if self.buffer.wait_for(&mut buffer, DATA_POLL_INTERVAL) {
                        // Timed out with nothing produced
                        FetchState::Finished(true)
                    } else {
                        FetchState::Waiting
                    }
                }
                FetchState::Delivering => {
                    let drained = buffer.drain_all();
                    trace!(fragments = drained.len(), "Delivering buffered fragments");
                    out.extend(drained);
                    self.telemetry.request_resolved(DeliveryMode::Ignored);
                    self.buffer.notify();
                    FetchState::Finished(true)
                }
                FetchState::Finished(result) => return result,
            };
        }
    }

    fn fetch_requested(&mut self, out: &mut Vec<Fragment>) -> bool {
        let mut step = FetchState::Waiting;
        loop {
            step = match step {
                FetchState::Waiting => {
                    if self.state.exception() {
                        FetchState::Finished(false)
                    } else if self.check_stop() && self.ledger.pending_count() == 0 {
                        FetchState::Finished(false)
                    } else {
                        self.prune_stale();
                        if self.ledger.wait_for_any(REQUEST_POLL_INTERVAL) {
                            FetchState::Delivering
                        } else {
                            if self.settings.mode == DeliveryMode::Window {
                                self.tracker.check_timeouts();
                            }
                            // Nothing arrived this interval; hand the control lock back
                            FetchState::Finished(true)
                        }
                    }
                }
                FetchState::Delivering => {
                    self.apply_requests(out);
                    FetchState::Finished(true)
                }
                FetchState::Finished(result) => return result,
            };
        }
    }

    /// Drop buffered fragments older than the stale threshold (Buffer/Window only).
    pub fn prune_stale(&self) {
        if !matches!(self.settings.mode, DeliveryMode::Buffer | DeliveryMode::Window) {
            return;
        }
        let Some(stale_timeout) = self.settings.stale_timeout else {
            return;
        };
        let mut buffer = self.buffer.lock();
        let Some(newest) = buffer.newest_timestamp() else {
            return;
        };
        let pruned = buffer.prune_stale(newest, Some(stale_timeout));
        if pruned > 0 {
            debug!(pruned, newest, stale_timeout, "Pruned stale fragments");
            self.telemetry.fragments_evicted(pruned);
            self.buffer.notify();
        }
    }

    /// Resolve whatever pending requests can be resolved now.
    pub fn apply_requests(&mut self, out: &mut Vec<Fragment>) {
        let shared = Arc::clone(&self.buffer);
        let mut buffer = shared.lock();
        let before = out.len();
        match self.settings.mode {
            DeliveryMode::Ignored => {}
            DeliveryMode::Single => self.apply_single(&buffer, out),
            DeliveryMode::Buffer => self.apply_buffer(&mut buffer, out),
            DeliveryMode::Window => {
                self.apply_window(&mut buffer, out);
                self.tracker.check_timeouts();
                if out.len() == before && self.ledger.pending_count() > 0 {
                    // Nothing closed yet; give the producer a chance before returning
                    self.buffer.wait_for(&mut buffer, DATA_POLL_INTERVAL);
                }
            }
        }
    }

    fn apply_single(&mut self, buffer: &BufferGuard<'_>, out: &mut Vec<Fragment>) {
        let requests = self.ledger.snapshot_pending();
        let Some((seq, ts)) = self.collapse_requests(&requests, out) else {
            return;
        };

        if buffer.is_empty() {
            debug!(sequence_id = seq, "No data buffered for request, sending empty fragments");
            self.emit_empty(seq, ts, out);
        } else {
            let event_size = self.fragment_ids.len();
            out.extend(
                buffer
                    .latest_event(event_size)
                    .map(|frag| frag.restamped(seq, ts)),
            );
        }
        self.ledger.remove(seq);
        self.counter.force_advance(1);
        self.telemetry.request_resolved(DeliveryMode::Single);
        debug!(sequence_id = seq, timestamp = ts, "Resolved single request");
    }

    fn apply_buffer(&mut self, buffer: &mut BufferGuard<'_>, out: &mut Vec<Fragment>) {
        let requests = self.ledger.snapshot_pending();
        let Some((seq, ts)) = self.collapse_requests(&requests, out) else {
            return;
        };

        let mut count = 0;
        for &fragment_id in self.fragment_ids.iter() {
            let contents = buffer.take_all_by_fragment_id(fragment_id);
            count += contents.len();
            out.push(Fragment::container(seq, fragment_id, ts, contents, false));
        }
        let unclaimed = buffer.drain_all();
        if !unclaimed.is_empty() {
            warn!(
                fragments = unclaimed.len(),
                "Dropping fragments with unconfigured fragment ids"
            );
        }
        self.buffer.notify();

        self.ledger.remove(seq);
        self.counter.force_advance(1);
        self.telemetry.request_resolved(DeliveryMode::Buffer);
        debug!(sequence_id = seq, fragments = count, "Resolved buffer request");
    }

    fn apply_window(&mut self, buffer: &mut BufferGuard<'_>, out: &mut Vec<Fragment>) {
        let requests = self.ledger.snapshot_pending();
        let now = Instant::now();
        let mut removed_any = false;

        for (&seq, &ts) in &requests {
            if seq < self.counter.get() {
                debug!(
                    sequence_id = seq,
                    expected = self.counter.get(),
                    "Request behind delivery counter, retiring with empty fragments"
                );
                self.emit_empty(seq, ts, out);
                self.ledger.remove(seq);
                continue;
            }

            let min = ts.saturating_sub(self.settings.window_offset);
            let max = min.saturating_add(self.settings.window_width);
            let closed = buffer.newest_timestamp().is_some_and(|newest| newest >= max);
            let timed_out = !closed
                && self.ledger.time_of(seq).is_some_and(|seen| {
                    now.saturating_duration_since(seen) > self.settings.window_close_timeout
                });
            let producer_stopped = !self.state.producer_running();

            if !(closed || timed_out || producer_stopped) {
                trace!(sequence_id = seq, min, max, "Window not closed yet");
                continue;
            }

            let missing_data =
                !closed || buffer.oldest_timestamp().is_some_and(|oldest| oldest > min);
            if timed_out {
                warn!(
                    sequence_id = seq,
                    min,
                    max,
                    newest = buffer.newest_timestamp(),
                    "Request window timed out, sending incomplete data"
                );
            }

            for &fragment_id in self.fragment_ids.iter() {
                let contents = buffer.collect_window(
                    fragment_id,
                    min,
                    max,
                    self.settings.window_width,
                    self.settings.unique_windows,
                );
                removed_any |= self.settings.unique_windows && !contents.is_empty();
                out.push(Fragment::container(seq, fragment_id, ts, contents, missing_data));
            }

            self.ledger.remove(seq);
            self.telemetry.request_resolved(DeliveryMode::Window);
            debug!(sequence_id = seq, min, max, missing_data, "Resolved window request");
            self.tracker.record(seq);
        }

        if removed_any {
            self.buffer.notify();
        }
    }

    /// Collapse the pending set to its highest id for Single/Buffer delivery.
    ///
    /// Requests behind the counter were already delivered and are dropped. Every id from
    /// the counter up to the highest request gets empty placeholders. Returns the
    /// request to resolve, which then equals the counter.
    fn collapse_requests(
        &mut self,
        requests: &BTreeMap<SequenceId, Timestamp>,
        out: &mut Vec<Fragment>,
    ) -> Option<(SequenceId, Timestamp)> {
        let (&target, &target_ts) = requests.iter().next_back()?;
        let expected = self.counter.get();

        for &seq in requests.keys().take_while(|seq| **seq < expected) {
            debug!(sequence_id = seq, expected, "Dropping request already delivered");
            self.ledger.remove(seq);
        }
        if target < expected {
            return None;
        }

        while self.counter.get() < target {
            let seq = self.counter.get();
            let ts = requests.get(&seq).copied().unwrap_or(target_ts);
            trace!(sequence_id = seq, target, "Backfilling sequence id with empty fragments");
            self.emit_empty(seq, ts, out);
            self.ledger.remove(seq);
            self.counter.force_advance(1);
        }

        Some((target, target_ts))
    }

    fn emit_empty(&self, seq: SequenceId, ts: Timestamp, out: &mut Vec<Fragment>) {
        out.extend(
            self.fragment_ids
                .iter()
                .map(|id| Fragment::empty(seq, *id, ts)),
        );
        self.telemetry.empty_fragments_sent(self.fragment_ids.len());
    }
}

impl std::fmt::Debug for DeliveryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryEngine")
            .field("mode", &self.settings.mode)
            .field("fragment_ids", &self.fragment_ids)
            .field("tracker", &self.tracker)
            .finish()
    }
}
