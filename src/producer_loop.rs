//! Dedicated producer thread.
//!
//! Each iteration checks hardware health, calls [`Producer::produce`], waits for room in
//! the buffer (or evicts the oldest data in circular mode), merges the new fragments
//! and wakes the consumer. The thread ends on end of data, a producer error, lost
//! hardware health or a force stop.
//!
//! The decision to exit is taken under the buffer lock and publishes
//! `producer_running = false` there, so a resume that clears the stop flag under the
//! same lock always knows whether the thread needs restarting.

use crate::buffer::{BufferGuard, SharedBuffer};
use crate::config::{DeliveryMode, ReadoutConfig};
use crate::delivery::DATA_POLL_INTERVAL;
use crate::error::{AppResult, ReadoutError};
use crate::fragment::Fragment;
use crate::monitor;
use crate::producer::{ProduceStatus, Producer, ProducerContext};
use crate::state::RunState;
use crate::telemetry::Telemetry;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, trace, warn};

/// Backpressure waits between two "buffer full" warnings.
const BACKPRESSURE_WARN_EVERY: u32 = 100;

/// Why one pass of the data loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    /// `produce` reported end of data; `during_stop` if a stop was pending at the call
    EndOfData { during_stop: bool },
    /// Stop arrived while waiting for buffer room
    StoppedWhileFull,
    ForceStop,
    HardwareLost,
    ProducerFailed,
}

impl LoopExit {
    /// Exits that a pause causes and a resume undoes.
    fn caused_by_stop(self) -> bool {
        matches!(
            self,
            LoopExit::EndOfData { during_stop: true } | LoopExit::StoppedWhileFull
        )
    }
}

/// State moved into the producer thread.
pub(crate) struct ProducerLoop {
    producer: Arc<dyn Producer>,
    ctx: ProducerContext,
    buffer: Arc<SharedBuffer>,
    state: Arc<RunState>,
    telemetry: Telemetry,
    mode: DeliveryMode,
    circular: bool,
    sleep_on_no_data: Duration,
    inline_health_interval: Option<Duration>,
}

impl ProducerLoop {
    pub(crate) fn new(
        config: &ReadoutConfig,
        producer: Arc<dyn Producer>,
        ctx: ProducerContext,
        buffer: Arc<SharedBuffer>,
        state: Arc<RunState>,
        telemetry: Telemetry,
    ) -> Self {
        let inline_health_interval = (!config.separate_monitoring_thread
            && !config.hardware_poll_interval.is_zero())
        .then_some(config.hardware_poll_interval);
        Self {
            producer,
            ctx,
            buffer,
            state,
            telemetry,
            mode: config.request_mode,
            circular: config.circular_buffer_mode,
            sleep_on_no_data: config.sleep_on_no_data,
            inline_health_interval,
        }
    }

    /// Start the thread. `producer_running` must already be set by the caller.
    pub(crate) fn spawn(self) -> AppResult<JoinHandle<()>> {
        let span = info_span!(
            "producer_loop",
            producer = %self.producer.name(),
            run = self.ctx.run_number(),
            subrun = self.ctx.subrun()
        );
        thread::Builder::new()
            .name("daq-producer".to_string())
            .spawn(move || {
                let _entered = span.enter();
                self.run();
            })
            .map_err(|source| ReadoutError::ThreadSpawn {
                thread: "producer",
                source,
            })
    }

    fn run(self) {
        info!(mode = %self.mode, circular = self.circular, "Producer loop started");
        let mut last_health_check = Instant::now();
        loop {
            let reason = self.run_until_exit(&mut last_health_check);
            if self.finish(reason) {
                break;
            }
            debug!(?reason, "Pause lifted while ending, continuing data loop");
        }
    }

    fn run_until_exit(&self, last_health_check: &mut Instant) -> LoopExit {
        let mut batch: Vec<Fragment> = Vec::new();
        loop {
            if self.state.force_stop_requested() {
                return LoopExit::ForceStop;
            }
            if let Some(interval) = self.inline_health_interval {
                if last_health_check.elapsed() >= interval {
                    *last_health_check = Instant::now();
                    monitor::poll_health(self.producer.as_ref(), &self.state);
                }
            }
            if !self.state.hardware_ok() {
                warn!("Hardware not healthy, ending data loop");
                return LoopExit::HardwareLost;
            }

            let during_stop = self.state.stop_requested();
            batch.clear();
            let started = Instant::now();
            let result = self.producer.produce(&self.ctx, &mut batch);
            self.telemetry.producer_latency(started.elapsed());

            let status = match result {
                Ok(status) => status,
                Err(err) => {
                    self.state.latch_exception(format!(
                        "{} produce failed: {}",
                        self.producer.name(),
                        err
                    ));
                    return LoopExit::ProducerFailed;
                }
            };

            if batch.is_empty() {
                if status == ProduceStatus::EndOfData {
                    return LoopExit::EndOfData { during_stop };
                }
                if !self.sleep_on_no_data.is_zero() {
                    thread::sleep(self.sleep_on_no_data);
                }
                continue;
            }

            if let Err(exit) = self.merge(&mut batch) {
                return exit;
            }
            if status == ProduceStatus::EndOfData {
                return LoopExit::EndOfData { during_stop };
            }
        }
    }

    /// Wait for room (or evict), then merge `batch` into the buffer.
    fn merge(&self, batch: &mut Vec<Fragment>) -> Result<(), LoopExit> {
        let mut buffer = self.buffer.lock();
        if !self.circular {
            self.wait_for_room(&mut buffer, batch.len())?;
        }

        let added = batch.len();
        match self.mode {
            DeliveryMode::Single => {
                let event_size = self.ctx.fragment_ids().len();
                let discarded = buffer.replace_latest_event(std::mem::take(batch), event_size);
                if discarded > 0 {
                    trace!(discarded, "Replaced previous event");
                }
            }
            _ => {
                let mut evicted = 0;
                for fragment in batch.drain(..) {
                    if self.circular {
                        evicted += buffer.push_circular(fragment);
                    } else {
                        buffer.push(fragment);
                    }
                }
                if evicted > 0 {
                    debug!(evicted, "Circular buffer evicted oldest fragments");
                    self.telemetry.fragments_evicted(evicted);
                }
            }
        }
        trace!(added, depth = buffer.len(), "Merged produced fragments");
        drop(buffer);
        self.buffer.notify();
        Ok(())
    }

    fn wait_for_room(&self, buffer: &mut BufferGuard<'_>, pending: usize) -> Result<(), LoopExit> {
        let mut waits: u32 = 0;
        while buffer.is_too_large() {
            if self.state.force_stop_requested() {
                return Err(LoopExit::ForceStop);
            }
            if self.state.stop_requested() {
                warn!(
                    dropped = pending,
                    "Stop requested while waiting for buffer room, dropping batch"
                );
                return Err(LoopExit::StoppedWhileFull);
            }
            self.buffer.wait_for(buffer, DATA_POLL_INTERVAL);
            waits += 1;
            if waits % BACKPRESSURE_WARN_EVERY == 0 {
                warn!(
                    fragments = buffer.len(),
                    bytes = buffer.size_bytes(),
                    waited_ms = (DATA_POLL_INTERVAL * waits).as_millis() as u64,
                    "Data buffer full, producer waiting for room"
                );
            }
        }
        Ok(())
    }

    /// Decide under the buffer lock whether the thread ends. Returns `true` to exit.
    fn finish(&self, reason: LoopExit) -> bool {
        let guard = self.buffer.lock();
        if reason.caused_by_stop()
            && !self.state.stop_requested()
            && !self.state.force_stop_requested()
        {
            return false;
        }
        self.state.set_buffer_depleted(true);
        self.state.set_producer_running(false);
        drop(guard);
        self.buffer.notify();
        info!(?reason, "Producer loop exited");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferLimits;
    use crate::counter::DeliveryCounter;
    use crate::error::ProducerError;
    use crate::fragment::FragmentId;
    use crate::telemetry::ReadoutMetrics;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Produces one fragment per call, ending or failing after a fixed count.
    struct Counting {
        calls: AtomicU64,
        limit: u64,
        fail: bool,
    }

    impl Producer for Counting {
        fn produce(
            &self,
            ctx: &ProducerContext,
            out: &mut Vec<Fragment>,
        ) -> Result<ProduceStatus, ProducerError> {
            if ctx.should_stop() {
                return Ok(ProduceStatus::EndOfData);
            }
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n >= self.limit {
                if self.fail {
                    return Err(ProducerError::new("readout timeout"));
                }
                return Ok(ProduceStatus::EndOfData);
            }
            out.push(Fragment::data(ctx.ev_counter(), 0, n, vec![0u8; 8]));
            ctx.advance_counter();
            Ok(ProduceStatus::Continue)
        }

        fn on_start(&self, _ctx: &ProducerContext) -> Result<(), ProducerError> {
            Ok(())
        }

        fn on_stop(&self) -> Result<(), ProducerError> {
            Ok(())
        }
    }

    struct Setup {
        buffer: Arc<SharedBuffer>,
        state: Arc<RunState>,
        metrics: Arc<ReadoutMetrics>,
        producer_loop: ProducerLoop,
    }

    fn setup(config: ReadoutConfig, limit: u64, fail: bool) -> Setup {
        let metrics = ReadoutMetrics::new();
        let telemetry = Telemetry::new(metrics.clone());
        let buffer = Arc::new(SharedBuffer::new(config.buffer_limits(), telemetry.clone()));
        let state = Arc::new(RunState::default());
        state.set_producer_running(true);
        let ids: Vec<FragmentId> = config.resolved_fragment_ids();
        let ctx = ProducerContext::new(
            Arc::clone(&state),
            Arc::new(DeliveryCounter::new(config.request_mode)),
            ids.into(),
        );
        let producer = Arc::new(Counting {
            calls: AtomicU64::new(0),
            limit,
            fail,
        });
        let producer_loop = ProducerLoop::new(
            &config,
            producer,
            ctx,
            Arc::clone(&buffer),
            Arc::clone(&state),
            telemetry,
        );
        Setup {
            buffer,
            state,
            metrics,
            producer_loop,
        }
    }

    fn config() -> ReadoutConfig {
        ReadoutConfig {
            fragment_id: Some(0),
            data_buffer_depth_fragments: 0,
            data_buffer_depth_mbytes: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_runs_to_end_of_data() {
        let s = setup(config(), 5, false);
        s.producer_loop.spawn().unwrap().join().unwrap();
        assert_eq!(s.buffer.lock().len(), 5);
        assert!(s.state.buffer_depleted());
        assert!(!s.state.producer_running());
        assert!(!s.state.exception());
        assert_eq!(s.metrics.snapshot().produce_calls, 6);
    }

    #[test]
    fn test_error_latches_exception() {
        let s = setup(config(), 2, true);
        s.producer_loop.spawn().unwrap().join().unwrap();
        assert!(s.state.exception());
        assert!(s
            .state
            .latest_exception()
            .is_some_and(|msg| msg.contains("readout timeout")));
        assert_eq!(s.buffer.lock().len(), 2);
        assert!(!s.state.producer_running());
    }

    #[test]
    fn test_circular_mode_keeps_newest() {
        let s = setup(
            ReadoutConfig {
                circular_buffer_mode: true,
                data_buffer_depth_fragments: 3,
                ..config()
            },
            5,
            false,
        );
        s.producer_loop.spawn().unwrap().join().unwrap();
        let kept: Vec<_> = s.buffer.lock().iter().map(Fragment::timestamp).collect();
        assert_eq!(kept, vec![2, 3, 4]);
        assert_eq!(s.metrics.snapshot().evicted_fragments, 2);
    }

    #[test]
    fn test_single_mode_keeps_latest_event() {
        let s = setup(
            ReadoutConfig {
                request_mode: DeliveryMode::Single,
                ..config()
            },
            4,
            false,
        );
        s.producer_loop.spawn().unwrap().join().unwrap();
        let kept: Vec<_> = s.buffer.lock().iter().map(Fragment::timestamp).collect();
        assert_eq!(kept, vec![3]);
    }

    #[test]
    fn test_backpressure_blocks_until_drained() {
        let s = setup(
            ReadoutConfig {
                data_buffer_depth_fragments: 2,
                ..config()
            },
            10,
            false,
        );
        let handle = s.producer_loop.spawn().unwrap();
        thread::sleep(Duration::from_millis(50));
        // Two fit and a third is merged before the buffer reads as too large
        assert_eq!(s.buffer.lock().len(), 3);
        assert!(s.state.producer_running());

        let mut delivered = 0;
        while delivered < 10 {
            let mut buffer = s.buffer.lock();
            delivered += buffer.drain_all().len();
            drop(buffer);
            s.buffer.notify();
            thread::sleep(Duration::from_millis(5));
        }
        handle.join().unwrap();
        assert_eq!(delivered, 10);
    }

    #[test]
    fn test_stop_while_full_drops_batch() {
        let s = setup(
            ReadoutConfig {
                data_buffer_depth_fragments: 1,
                ..config()
            },
            10,
            false,
        );
        let handle = s.producer_loop.spawn().unwrap();
        thread::sleep(Duration::from_millis(30));
        s.state.set_stop(true);
        handle.join().unwrap();
        assert_eq!(s.buffer.lock().len(), 2);
        assert!(!s.state.producer_running());
    }

    #[test]
    fn test_hardware_loss_ends_loop() {
        let s = setup(config(), u64::MAX, false);
        s.state.set_hardware_ok(false);
        s.producer_loop.spawn().unwrap().join().unwrap();
        assert!(s.buffer.lock().is_empty());
        assert!(!s.state.producer_running());
        assert!(!s.state.exception());
    }
}
