//! Simulated data source.
//!
//! [`Simulator`] emits one fragment per configured fragment id every tick, with
//! timestamps advancing by a fixed step. Payloads come from a seeded ChaCha RNG so
//! runs are reproducible. An event limit and an injected failure make it useful for
//! exercising end-of-data and exception handling.

use crate::error::ProducerError;
use crate::fragment::{Fragment, Timestamp};
use crate::producer::{ProduceStatus, Producer, ProducerContext};
use parking_lot::Mutex;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

/// Simulator settings (`[simulator]` section).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// Time spent in each `produce` call
    #[serde(default = "default_tick_period", with = "humantime_serde")]
    pub tick_period: Duration,
    /// Payload size of each generated fragment
    #[serde(default = "default_payload_bytes")]
    pub payload_bytes: usize,
    /// Timestamp increment per tick
    #[serde(default = "default_timestamp_step")]
    pub timestamp_step: u64,
    /// Report end of data after this many events
    #[serde(default)]
    pub max_events: Option<u64>,
    /// Fail the produce call after this many events
    #[serde(default)]
    pub fail_after: Option<u64>,
    /// RNG seed (unset = OS entropy)
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_tick_period() -> Duration {
    Duration::from_millis(1)
}

fn default_payload_bytes() -> usize {
    64
}

fn default_timestamp_step() -> u64 {
    10
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            tick_period: default_tick_period(),
            payload_bytes: default_payload_bytes(),
            timestamp_step: default_timestamp_step(),
            max_events: None,
            fail_after: None,
            seed: None,
        }
    }
}

/// Producer generating synthetic events.
pub struct Simulator {
    config: SimulatorConfig,
    rng: Mutex<ChaCha8Rng>,
    events: AtomicU64,
    timestamp: AtomicU64,
}

impl Simulator {
    /// Create a simulator.
    pub fn new(config: SimulatorConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            config,
            rng: Mutex::new(rng),
            events: AtomicU64::new(0),
            timestamp: AtomicU64::new(0),
        }
    }

    /// Events generated in the current run.
    pub fn events(&self) -> u64 {
        self.events.load(Ordering::Acquire)
    }

    /// Timestamp of the most recent event.
    pub fn last_timestamp(&self) -> Timestamp {
        self.timestamp.load(Ordering::Acquire)
    }

    fn payload(&self) -> Vec<u8> {
        let mut payload = vec![0u8; self.config.payload_bytes];
        self.rng.lock().fill_bytes(&mut payload);
        payload
    }
}

impl Producer for Simulator {
    fn name(&self) -> &str {
        "simulator"
    }

    fn produce(
        &self,
        ctx: &ProducerContext,
        out: &mut Vec<Fragment>,
    ) -> Result<ProduceStatus, ProducerError> {
        if ctx.should_stop() {
            return Ok(ProduceStatus::EndOfData);
        }

        let events = self.events();
        if self.config.max_events.is_some_and(|max| events >= max) {
            info!(events, "Simulator reached its event limit");
            return Ok(ProduceStatus::EndOfData);
        }
        if let Some(limit) = self.config.fail_after.filter(|limit| events >= *limit) {
            return Err(ProducerError::new(format!(
                "simulated failure after {limit} events"
            )));
        }

        if !self.config.tick_period.is_zero() {
            std::thread::sleep(self.config.tick_period);
        }

        let sequence_id = ctx.ev_counter();
        let step = self.config.timestamp_step;
        let timestamp = self.timestamp.fetch_add(step, Ordering::AcqRel) + step;
        for &fragment_id in ctx.fragment_ids() {
            out.push(Fragment::data(
                sequence_id,
                fragment_id,
                timestamp,
                self.payload(),
            ));
        }
        ctx.advance_counter();
        self.events.fetch_add(1, Ordering::AcqRel);
        Ok(ProduceStatus::Continue)
    }

    fn on_start(&self, ctx: &ProducerContext) -> Result<(), ProducerError> {
        self.events.store(0, Ordering::Release);
        self.timestamp.store(0, Ordering::Release);
        info!(
            run = ctx.run_number(),
            fragment_ids = ?ctx.fragment_ids(),
            "Simulator started"
        );
        Ok(())
    }

    fn on_stop(&self) -> Result<(), ProducerError> {
        info!(events = self.events(), "Simulator stopped");
        Ok(())
    }

    fn on_resume(&self, ctx: &ProducerContext) -> Result<(), ProducerError> {
        debug!(subrun = ctx.subrun(), "Simulator resumed");
        Ok(())
    }
}

impl std::fmt::Debug for Simulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulator")
            .field("config", &self.config)
            .field("events", &self.events())
            .finish()
    }
}
