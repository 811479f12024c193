//! Hardware health monitoring.
//!
//! With `separate_monitoring_thread` the readout runs a [`MonitorLoop`] that polls
//! [`Producer::poll_health`] every `hardware_poll_interval`. Otherwise the producer
//! loop calls [`poll_health`] itself between `produce` calls.

use crate::error::{AppResult, ReadoutError};
use crate::producer::Producer;
use crate::state::RunState;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, info_span, warn};

/// Longest uninterrupted sleep, so stop and pause are noticed promptly.
const CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// Poll the producer once and record the outcome.
///
/// Returns `false` when the source is unhealthy. An error also latches the exception.
pub(crate) fn poll_health(producer: &dyn Producer, state: &RunState) -> bool {
    match producer.poll_health() {
        Ok(true) => true,
        Ok(false) => {
            warn!(producer = producer.name(), "Hardware reported unhealthy");
            state.set_hardware_ok(false);
            false
        }
        Err(err) => {
            state.set_hardware_ok(false);
            state.latch_exception(format!(
                "{} health check failed: {}",
                producer.name(),
                err
            ));
            false
        }
    }
}

/// Dedicated health polling thread.
pub(crate) struct MonitorLoop {
    producer: Arc<dyn Producer>,
    state: Arc<RunState>,
    interval: Duration,
}

impl MonitorLoop {
    pub(crate) fn new(
        producer: Arc<dyn Producer>,
        state: Arc<RunState>,
        interval: Duration,
    ) -> Self {
        Self {
            producer,
            state,
            interval,
        }
    }

    pub(crate) fn spawn(self) -> AppResult<JoinHandle<()>> {
        let span = info_span!(
            "monitor_loop",
            producer = %self.producer.name(),
            run = self.state.run_number()
        );
        thread::Builder::new()
            .name("daq-monitor".to_string())
            .spawn(move || {
                let _entered = span.enter();
                self.run();
            })
            .map_err(|source| ReadoutError::ThreadSpawn {
                thread: "monitor",
                source,
            })
    }

    fn run(self) {
        info!(interval_ms = self.interval.as_millis() as u64, "Monitor loop started");
        'poll: loop {
            if self.stopping() {
                break;
            }
            if !poll_health(self.producer.as_ref(), &self.state) {
                break;
            }

            let mut slept = Duration::ZERO;
            while slept < self.interval {
                if self.stopping() {
                    break 'poll;
                }
                let nap = CHECK_INTERVAL.min(self.interval - slept);
                thread::sleep(nap);
                slept += nap;
            }
        }
        debug!(hardware_ok = self.state.hardware_ok(), "Monitor loop exited");
    }

    fn stopping(&self) -> bool {
        self.state.stop_requested() || self.state.force_stop_requested()
    }
}
