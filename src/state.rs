//! Lock-free run state shared by the coordinator and its threads.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::error;

/// Flags and run identifiers readable from any thread.
#[derive(Debug)]
pub(crate) struct RunState {
    stop: AtomicBool,
    force_stop: AtomicBool,
    exception: AtomicBool,
    hardware_ok: AtomicBool,
    producer_running: AtomicBool,
    buffer_depleted: AtomicBool,
    run_number: AtomicU64,
    subrun: AtomicU64,
    latest_exception: Mutex<Option<String>>,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            stop: AtomicBool::new(false),
            force_stop: AtomicBool::new(false),
            exception: AtomicBool::new(false),
            hardware_ok: AtomicBool::new(true),
            producer_running: AtomicBool::new(false),
            buffer_depleted: AtomicBool::new(false),
            run_number: AtomicU64::new(0),
            subrun: AtomicU64::new(0),
            latest_exception: Mutex::new(None),
        }
    }
}

impl RunState {
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn set_stop(&self, value: bool) {
        self.stop.store(value, Ordering::Release);
    }

    pub fn force_stop_requested(&self) -> bool {
        self.force_stop.load(Ordering::Acquire)
    }

    pub fn set_force_stop(&self, value: bool) {
        self.force_stop.store(value, Ordering::Release);
    }

    pub fn exception(&self) -> bool {
        self.exception.load(Ordering::Acquire)
    }

    pub fn latest_exception(&self) -> Option<String> {
        self.latest_exception.lock().clone()
    }

    /// Latch a failure. The first message since the last clear is kept.
    pub fn latch_exception(&self, message: String) {
        error!(%message, "Readout exception latched");
        let mut latest = self.latest_exception.lock();
        if latest.is_none() {
            *latest = Some(message);
        }
        self.exception.store(true, Ordering::Release);
    }

    pub fn hardware_ok(&self) -> bool {
        self.hardware_ok.load(Ordering::Acquire)
    }

    pub fn set_hardware_ok(&self, value: bool) {
        self.hardware_ok.store(value, Ordering::Release);
    }

    pub fn producer_running(&self) -> bool {
        self.producer_running.load(Ordering::Acquire)
    }

    pub fn set_producer_running(&self, value: bool) {
        self.producer_running.store(value, Ordering::Release);
    }

    pub fn buffer_depleted(&self) -> bool {
        self.buffer_depleted.load(Ordering::Acquire)
    }

    pub fn set_buffer_depleted(&self, value: bool) {
        self.buffer_depleted.store(value, Ordering::Release);
    }

    pub fn run_number(&self) -> u64 {
        self.run_number.load(Ordering::Acquire)
    }

    pub fn subrun(&self) -> u64 {
        self.subrun.load(Ordering::Acquire)
    }

    pub fn begin_run(&self, run_number: u64) {
        self.run_number.store(run_number, Ordering::Release);
        self.subrun.store(1, Ordering::Release);
        self.stop.store(false, Ordering::Release);
        self.force_stop.store(false, Ordering::Release);
        self.exception.store(false, Ordering::Release);
        self.hardware_ok.store(true, Ordering::Release);
        self.buffer_depleted.store(false, Ordering::Release);
        *self.latest_exception.lock() = None;
    }

    pub fn next_subrun(&self) -> u64 {
        self.subrun.fetch_add(1, Ordering::AcqRel) + 1
    }
}
