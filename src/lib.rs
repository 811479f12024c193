//! # DAQ Readout Library
//!
//! Readout front-end for a data-acquisition pipeline. A [`Producer`] (hardware driver or
//! the bundled [`Simulator`]) is polled on a dedicated thread; produced fragments are
//! held in a bounded, time-aware buffer and handed to a single consumer through
//! [`Readout::fetch_next`], either as fast as they arrive or in answer to
//! `(sequence id, timestamp)` requests.
//!
//! ## Crate Structure
//!
//! - **`fragment`**: The `Fragment` record and its kinds (data, empty, container, end of data).
//! - **`buffer`**: `FragmentBuffer` with count/byte accounting, and the lock + condition
//!   variable wrapper shared by the producer and consumer.
//! - **`ledger`**: The `RequestLedger` interface and the in-memory `RequestBuffer`.
//! - **`counter`**: The monotonic delivery counter.
//! - **`out_of_order`**: Reconciles window completions that arrive ahead of the counter.
//! - **`delivery`**: The four delivery policies (ignored, single, buffer, window).
//! - **`producer`**: The `Producer` trait and the `ProducerContext` handed to it.
//! - **`producer_loop`** / **`monitor`**: The producer and health-monitor threads.
//! - **`lifecycle`**: `Readout`, the start/stop/pause/resume state machine.
//! - **`config`**: Figment-based configuration (TOML + `DAQ_READOUT_` environment).
//! - **`telemetry`**: Optional metrics sink and the atomic `ReadoutMetrics`.
//! - **`logging`**: `tracing-subscriber` setup for binaries.
//! - **`simulator`**: Synthetic producer for demos and tests.
//! - **`error`**: `ReadoutError` and `ProducerError`.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use daq_readout::{
//!     DeliveryMode, ReadoutConfig, Readout, RequestBuffer, Simulator, SimulatorConfig,
//!     Telemetry,
//! };
//!
//! # fn main() -> Result<(), daq_readout::ReadoutError> {
//! let config = ReadoutConfig {
//!     request_mode: DeliveryMode::Ignored,
//!     fragment_id: Some(0),
//!     ..Default::default()
//! };
//! let producer = Arc::new(Simulator::new(SimulatorConfig::default()));
//! let readout = Readout::new(config, producer, Arc::new(RequestBuffer::new()), Telemetry::disabled())?;
//!
//! readout.start(1, Duration::from_secs(1), 0)?;
//! let mut fragments = Vec::new();
//! while fragments.len() < 100 && readout.fetch_next(&mut fragments) {}
//! readout.stop(Duration::from_secs(1), 0)?;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod config;
pub mod counter;
pub mod delivery;
pub mod error;
pub mod fragment;
pub mod ledger;
pub mod lifecycle;
pub mod logging;
pub mod out_of_order;
pub mod producer;
pub mod simulator;
pub mod telemetry;

mod monitor;
mod producer_loop;
mod state;

pub use buffer::{BufferLimits, BufferStats, FragmentBuffer};
pub use config::{AppConfig, DeliveryMode, ReadoutConfig};
pub use error::{AppResult, ProducerError, ReadoutError};
pub use fragment::{Fragment, FragmentId, FragmentKind, SequenceId, Timestamp};
pub use ledger::{RequestBuffer, RequestLedger};
pub use lifecycle::{LifecycleState, Readout, ReadoutStatus};
pub use producer::{ProduceStatus, Producer, ProducerContext};
pub use simulator::{Simulator, SimulatorConfig};
pub use telemetry::{MetricsSnapshot, ReadoutMetrics, Telemetry, TelemetrySink};
