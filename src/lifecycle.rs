//! Run control and the consumer entry point.
//!
//! [`Readout`] ties the pieces together: it owns the buffer, the delivery counter and
//! the run flags, starts and joins the producer and monitor threads, and exposes
//! [`Readout::fetch_next`] to the single consumer thread.
//!
//! # State machine
//!
//! ```text
//! Idle --start--> Running --pause--> Paused --resume--> Running --stop--> Idle
//!                                      \------------------stop-----------/
//! ```
//!
//! Transitions take the state lock, which `fetch_next` also holds for the duration of
//! a call. The producer's unblock hooks (`on_stop_no_mutex`, `on_pause_no_mutex`) and
//! the stop flag are applied before the lock is taken so an in-flight fetch returns
//! promptly. Hook failures latch the exception and are returned, but the readout keeps
//! working; the exception persists until the next `start`.

use crate::buffer::{BufferStats, SharedBuffer};
use crate::config::{DeliveryMode, ReadoutConfig};
use crate::counter::DeliveryCounter;
use crate::delivery::{delivery_should_stop, DeliveryEngine};
use crate::error::{AppResult, ProducerError, ReadoutError};
use crate::fragment::{Fragment, FragmentId, SequenceId};
use crate::ledger::RequestLedger;
use crate::monitor::MonitorLoop;
use crate::producer::{self, ProduceStatus, Producer, ProducerContext};
use crate::producer_loop::ProducerLoop;
use crate::state::RunState;
use crate::telemetry::Telemetry;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Run-control state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    /// Not taking data
    Idle,
    /// Taking data
    Running,
    /// Between subruns
    Paused,
}

impl LifecycleState {
    fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Running => "running",
            LifecycleState::Paused => "paused",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serializable point-in-time view of a readout.
#[derive(Debug, Clone, Serialize)]
pub struct ReadoutStatus {
    /// Run-control state
    pub state: LifecycleState,
    /// Delivery mode
    pub mode: DeliveryMode,
    /// Current run number
    pub run_number: u64,
    /// Current subrun
    pub subrun: u64,
    /// Next sequence id the consumer expects
    pub ev_counter: SequenceId,
    /// Buffered fragments
    pub buffer_fragments: usize,
    /// Buffered bytes
    pub buffer_bytes: usize,
    /// Requests waiting in the ledger
    pub pending_requests: usize,
    /// Window completions waiting for the counter
    pub out_of_order: Vec<SequenceId>,
    /// Whether the producer thread is alive
    pub producer_running: bool,
    /// Last reported hardware health
    pub hardware_ok: bool,
    /// Latched exception message
    pub exception: Option<String>,
}

impl fmt::Display for ReadoutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} mode): run {} subrun {}, next sequence id {}, buffer {} fragments / {} bytes, {} pending requests",
            self.state,
            self.mode,
            self.run_number,
            self.subrun,
            self.ev_counter,
            self.buffer_fragments,
            self.buffer_bytes,
            self.pending_requests
        )?;
        if !self.out_of_order.is_empty() {
            write!(f, ", out of order {:?}", self.out_of_order)?;
        }
        if !self.producer_running && self.state == LifecycleState::Running {
            write!(f, ", producer stopped")?;
        }
        if let Some(message) = &self.exception {
            write!(f, ", exception: {}", message)?;
        }
        Ok(())
    }
}

/// Everything guarded by the state lock.
struct Control {
    engine: DeliveryEngine,
    producer_thread: Option<JoinHandle<()>>,
    monitor_thread: Option<JoinHandle<()>>,
}

/// Buffering and delivery front-end around one [`Producer`].
pub struct Readout {
    config: ReadoutConfig,
    producer: Arc<dyn Producer>,
    ledger: Arc<dyn RequestLedger>,
    buffer: Arc<SharedBuffer>,
    counter: Arc<DeliveryCounter>,
    state: Arc<RunState>,
    ctx: ProducerContext,
    telemetry: Telemetry,
    phase: Mutex<LifecycleState>,
    control: Mutex<Control>,
}

impl Readout {
    /// Validate `config` and build an idle readout.
    pub fn new(
        config: ReadoutConfig,
        producer: Arc<dyn Producer>,
        ledger: Arc<dyn RequestLedger>,
        telemetry: Telemetry,
    ) -> AppResult<Self> {
        config.validate()?;

        let fragment_ids: Arc<[FragmentId]> = config.resolved_fragment_ids().into();
        let buffer = Arc::new(SharedBuffer::new(config.buffer_limits(), telemetry.clone()));
        let counter = Arc::new(DeliveryCounter::new(config.request_mode));
        let state = Arc::new(RunState::default());
        let ctx = ProducerContext::new(
            Arc::clone(&state),
            Arc::clone(&counter),
            Arc::clone(&fragment_ids),
        );
        let engine = DeliveryEngine::new(
            &config,
            Arc::clone(&fragment_ids),
            Arc::clone(&buffer),
            Arc::clone(&ledger),
            Arc::clone(&counter),
            Arc::clone(&state),
            telemetry.clone(),
        );

        info!(
            producer = producer.name(),
            mode = %config.request_mode,
            fragment_ids = ?fragment_ids,
            separate_data_thread = config.separate_data_thread,
            "Readout configured"
        );

        Ok(Self {
            config,
            producer,
            ledger,
            buffer,
            counter,
            state,
            ctx,
            telemetry,
            phase: Mutex::new(LifecycleState::Idle),
            control: Mutex::new(Control {
                engine,
                producer_thread: None,
                monitor_thread: None,
            }),
        })
    }

    /// Begin run `run_number`.
    ///
    /// Resets the delivery counter, the subrun, the run flags and the buffer, calls
    /// `on_start`, then starts the producer and monitor threads and the request
    /// receiver. Only accepted while idle.
    pub fn start(&self, run_number: u64, timeout: Duration, timestamp: u64) -> AppResult<()> {
        let mut control = self.control.lock();
        self.require("start", &[LifecycleState::Idle])?;
        info!(
            run = run_number,
            timeout_ms = timeout.as_millis() as u64,
            timestamp,
            "Starting readout"
        );

        self.state.begin_run(run_number);
        self.counter.reset();
        control.engine.reset();
        self.buffer.lock().clear();

        self.producer
            .on_start(&self.ctx)
            .map_err(|source| self.hook_failed("on_start", source))?;

        let spawned = self
            .spawn_producer(&mut control)
            .and_then(|()| self.spawn_monitor(&mut control));
        if let Err(err) = spawned {
            self.state.set_stop(true);
            self.join_threads(&mut control);
            return Err(err);
        }

        self.ledger.start_receiving();
        self.set_phase(LifecycleState::Running);
        Ok(())
    }

    /// End the run. On return no producer or monitor thread is running.
    ///
    /// Requests already received keep being answered by `fetch_next` until the
    /// ledger is empty.
    pub fn stop(&self, timeout: Duration, timestamp: u64) -> AppResult<()> {
        self.require("stop", &[LifecycleState::Running, LifecycleState::Paused])?;
        info!(
            timeout_ms = timeout.as_millis() as u64,
            timestamp, "Stopping readout"
        );

        self.ledger.stop_receiving();
        let unblock = self
            .producer
            .on_stop_no_mutex()
            .map_err(|source| self.hook_failed("on_stop_no_mutex", source));
        self.state.set_stop(true);
        self.buffer.notify();

        let mut control = self.control.lock();
        self.require("stop", &[LifecycleState::Running, LifecycleState::Paused])?;
        let hook = self
            .producer
            .on_stop()
            .map_err(|source| self.hook_failed("on_stop", source));
        self.join_threads(&mut control);
        self.set_phase(LifecycleState::Idle);
        info!(
            run = self.state.run_number(),
            next_sequence_id = self.counter.get(),
            "Readout stopped"
        );
        unblock.and(hook)
    }

    /// Suspend data taking. Threads are not joined.
    pub fn pause(&self, timeout: Duration, timestamp: u64) -> AppResult<()> {
        self.require("pause", &[LifecycleState::Running])?;
        info!(
            timeout_ms = timeout.as_millis() as u64,
            timestamp, "Pausing readout"
        );

        let unblock = self
            .producer
            .on_pause_no_mutex()
            .map_err(|source| self.hook_failed("on_pause_no_mutex", source));
        self.state.set_stop(true);
        self.buffer.notify();

        let _control = self.control.lock();
        self.require("pause", &[LifecycleState::Running])?;
        let hook = self
            .producer
            .on_pause()
            .map_err(|source| self.hook_failed("on_pause", source));
        self.set_phase(LifecycleState::Paused);
        unblock.and(hook)
    }

    /// Continue data taking in a new subrun.
    ///
    /// Clears the buffer and the stop flag and restarts the producer thread if it
    /// ended during the pause.
    pub fn resume(&self, timeout: Duration, timestamp: u64) -> AppResult<()> {
        let mut control = self.control.lock();
        self.require("resume", &[LifecycleState::Paused])?;
        let subrun = self.state.next_subrun();
        info!(
            subrun,
            timeout_ms = timeout.as_millis() as u64,
            timestamp,
            "Resuming readout"
        );

        {
            // The producer decides whether to exit under this lock
            let mut buffer = self.buffer.lock();
            buffer.clear();
            self.state.set_stop(false);
        }

        if self.config.separate_data_thread && !self.state.producer_running() {
            if let Some(handle) = control.producer_thread.take() {
                self.join_thread("producer", handle);
            }
            debug!("Restarting producer thread");
            self.spawn_producer(&mut control)?;
        }
        let monitor_ended = control
            .monitor_thread
            .as_ref()
            .is_some_and(JoinHandle::is_finished);
        if monitor_ended && self.state.hardware_ok() {
            if let Some(handle) = control.monitor_thread.take() {
                self.join_thread("monitor", handle);
            }
            self.spawn_monitor(&mut control)?;
        }

        self.set_phase(LifecycleState::Running);
        self.producer
            .on_resume(&self.ctx)
            .map_err(|source| self.hook_failed("on_resume", source))
    }

    /// Make every loop exit after its current unit of work.
    ///
    /// Still call [`stop`](Self::stop) afterwards to run the stop hooks and join.
    pub fn force_stop(&self) {
        warn!("Force stop requested");
        self.state.set_force_stop(true);
        self.state.set_stop(true);
        self.buffer.notify();
    }

    /// Whether delivery should cease.
    ///
    /// True iff a stop was requested and either there is no producer thread, the mode
    /// is `Ignored`, a force stop was requested, or the request receiver has stopped.
    pub fn check_stop(&self) -> bool {
        delivery_should_stop(
            &self.state,
            self.ledger.as_ref(),
            self.config.request_mode,
            self.config.separate_data_thread,
        )
    }

    /// Append the next batch of output fragments to `out`.
    ///
    /// Returns `false` when data taking has ended or an exception is latched, `true`
    /// otherwise (`out` may be unchanged when nothing was ready). After a stop, data
    /// still buffered and requests still pending keep being delivered. Must be called
    /// from a single consumer thread.
    pub fn fetch_next(&self, out: &mut Vec<Fragment>) -> bool {
        let mut control = self.control.lock();
        if self.lifecycle_state() == LifecycleState::Idle
            && self.ledger.pending_count() == 0
            && self.buffer.lock().is_empty()
        {
            return false;
        }
        if self.config.separate_data_thread {
            control.engine.fetch_next(out)
        } else {
            self.fetch_inline(out)
        }
    }

    /// Ignored mode without a producer thread: produce on the caller's thread.
    fn fetch_inline(&self, out: &mut Vec<Fragment>) -> bool {
        if self.state.exception()
            || self.state.buffer_depleted()
            || !self.state.hardware_ok()
            || self.check_stop()
        {
            return false;
        }

        let before = out.len();
        let started = Instant::now();
        let result = self.producer.produce(&self.ctx, out);
        self.telemetry.producer_latency(started.elapsed());

        match result {
            Ok(status) => {
                let delivered = out.len() - before;
                if delivered > 0 {
                    self.telemetry.fragments_delivered(delivered);
                    self.telemetry.request_resolved(DeliveryMode::Ignored);
                }
                if status == ProduceStatus::EndOfData {
                    self.state.set_buffer_depleted(true);
                }
                status == ProduceStatus::Continue || delivered > 0
            }
            Err(err) => {
                out.truncate(before);
                self.state.latch_exception(format!(
                    "{} produce failed: {}",
                    self.producer.name(),
                    err
                ));
                false
            }
        }
    }

    /// Current run-control state.
    pub fn lifecycle_state(&self) -> LifecycleState {
        *self.phase.lock()
    }

    /// Whether an exception is latched.
    pub fn exception(&self) -> bool {
        self.state.exception()
    }

    /// Message of the latched exception.
    pub fn latest_exception(&self) -> Option<String> {
        self.state.latest_exception()
    }

    /// Next sequence id the consumer expects.
    pub fn ev_counter(&self) -> SequenceId {
        self.counter.get()
    }

    /// Current run number.
    pub fn run_number(&self) -> u64 {
        self.state.run_number()
    }

    /// Current subrun.
    pub fn subrun(&self) -> u64 {
        self.state.subrun()
    }

    /// Configured fragment ids.
    pub fn fragment_ids(&self) -> &[FragmentId] {
        self.ctx.fragment_ids()
    }

    /// The only configured fragment id, or `InvalidConfiguration` for multi-id readouts.
    pub fn single_fragment_id(&self) -> AppResult<FragmentId> {
        producer::single_fragment_id(self.ctx.fragment_ids())
    }

    /// Configuration this readout was built with.
    pub fn config(&self) -> &ReadoutConfig {
        &self.config
    }

    /// Current buffer depth.
    pub fn buffer_stats(&self) -> BufferStats {
        self.buffer.stats()
    }

    /// Snapshot of the readout. Waits at most one poll interval for an in-progress
    /// `fetch_next`.
    pub fn stats(&self) -> ReadoutStatus {
        let out_of_order = self.control.lock().engine.out_of_order_pending();
        let buffer = self.buffer.stats();
        ReadoutStatus {
            state: self.lifecycle_state(),
            mode: self.config.request_mode,
            run_number: self.state.run_number(),
            subrun: self.state.subrun(),
            ev_counter: self.counter.get(),
            buffer_fragments: buffer.fragments,
            buffer_bytes: buffer.bytes,
            pending_requests: self.ledger.pending_count(),
            out_of_order,
            producer_running: self.state.producer_running(),
            hardware_ok: self.state.hardware_ok(),
            exception: self.state.latest_exception(),
        }
    }

    /// One-line human-readable status.
    pub fn report(&self) -> String {
        self.stats().to_string()
    }

    fn require(&self, command: &'static str, allowed: &[LifecycleState]) -> AppResult<()> {
        let current = self.lifecycle_state();
        if allowed.contains(&current) {
            Ok(())
        } else {
            Err(ReadoutError::InvalidTransition {
                command,
                state: current.as_str(),
            })
        }
    }

    fn set_phase(&self, next: LifecycleState) {
        let mut phase = self.phase.lock();
        let from = *phase;
        debug!(%from, to = %next, "Lifecycle transition");
        *phase = next;
    }

    fn hook_failed(&self, operation: &'static str, source: ProducerError) -> ReadoutError {
        self.state.latch_exception(format!(
            "{} {} failed: {}",
            self.producer.name(),
            operation,
            source
        ));
        ReadoutError::Producer {
            producer: self.producer.name().to_string(),
            operation,
            source,
        }
    }

    fn spawn_producer(&self, control: &mut Control) -> AppResult<()> {
        if !self.config.separate_data_thread {
            return Ok(());
        }
        self.state.set_buffer_depleted(false);
        self.state.set_producer_running(true);
        let handle = ProducerLoop::new(
            &self.config,
            Arc::clone(&self.producer),
            self.ctx.clone(),
            Arc::clone(&self.buffer),
            Arc::clone(&self.state),
            self.telemetry.clone(),
        )
        .spawn()
        .map_err(|err| {
            self.state.set_producer_running(false);
            err
        })?;
        control.producer_thread = Some(handle);
        Ok(())
    }

    fn spawn_monitor(&self, control: &mut Control) -> AppResult<()> {
        if !self.config.separate_monitoring_thread || self.config.hardware_poll_interval.is_zero()
        {
            return Ok(());
        }
        let handle = MonitorLoop::new(
            Arc::clone(&self.producer),
            Arc::clone(&self.state),
            self.config.hardware_poll_interval,
        )
        .spawn()?;
        control.monitor_thread = Some(handle);
        Ok(())
    }

    fn join_threads(&self, control: &mut Control) {
        if let Some(handle) = control.producer_thread.take() {
            self.join_thread("producer", handle);
        }
        if let Some(handle) = control.monitor_thread.take() {
            self.join_thread("monitor", handle);
        }
        self.state.set_producer_running(false);
    }

    fn join_thread(&self, role: &str, handle: JoinHandle<()>) {
        if handle.join().is_err() {
            self.state
                .latch_exception(format!("{} thread panicked", role));
        }
    }
}

impl Drop for Readout {
    fn drop(&mut self) {
        let control = self.control.get_mut();
        if control.producer_thread.is_none() && control.monitor_thread.is_none() {
            return;
        }
        warn!("Readout dropped while running, forcing stop");
        self.state.set_force_stop(true);
        self.state.set_stop(true);
        self.buffer.notify();
        for handle in [control.producer_thread.take(), control.monitor_thread.take()]
            .into_iter()
            .flatten()
        {
            let _ = handle.join();
        }
    }
}

impl fmt::Debug for Readout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Readout")
            .field("producer", &self.producer.name())
            .field("mode", &self.config.request_mode)
            .field("state", &self.lifecycle_state())
            .field("ev_counter", &self.counter.get())
            .finish()
    }
}
