//! Producer collaborator interface.
//!
//! A [`Producer`] wraps the hardware or simulated data source. The readout calls
//! [`Producer::produce`] repeatedly from its producer thread and the lifecycle hooks
//! from the control thread, so implementations take `&self` and use interior
//! mutability for their own state.
//!
//! # Example
//!
//! ```rust
//! use daq_readout::error::ProducerError;
//! use daq_readout::fragment::Fragment;
//! use daq_readout::producer::{ProduceStatus, Producer, ProducerContext};
//!
//! struct Pulser;
//!
//! impl Producer for Pulser {
//!     fn produce(
//!         &self,
//!         ctx: &ProducerContext,
//!         out: &mut Vec<Fragment>,
//!     ) -> Result<ProduceStatus, ProducerError> {
//!         if ctx.should_stop() {
//!             return Ok(ProduceStatus::EndOfData);
//!         }
//!         let seq = ctx.ev_counter();
//!         for &id in ctx.fragment_ids() {
//!             out.push(Fragment::data(seq, id, seq * 10, vec![0u8; 16]));
//!         }
//!         ctx.advance_counter();
//!         Ok(ProduceStatus::Continue)
//!     }
//!
//!     fn on_start(&self, _ctx: &ProducerContext) -> Result<(), ProducerError> {
//!         Ok(())
//!     }
//!
//!     fn on_stop(&self) -> Result<(), ProducerError> {
//!         Ok(())
//!     }
//! }
//! ```

use crate::config::DeliveryMode;
use crate::counter::DeliveryCounter;
use crate::error::{AppResult, ProducerError, ReadoutError};
use crate::fragment::{Fragment, FragmentId, SequenceId};
use crate::state::RunState;
use std::sync::Arc;

/// Outcome of one `produce` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProduceStatus {
    /// More data may follow
    Continue,
    /// The source is permanently exhausted
    EndOfData,
}

/// Data source driven by the readout.
pub trait Producer: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str {
        "producer"
    }

    /// Append newly available fragments to `out`.
    ///
    /// May block for a bounded time. Should return promptly once
    /// [`ProducerContext::should_stop`] is true.
    fn produce(
        &self,
        ctx: &ProducerContext,
        out: &mut Vec<Fragment>,
    ) -> Result<ProduceStatus, ProducerError>;

    /// Prepare for a new run.
    fn on_start(&self, ctx: &ProducerContext) -> Result<(), ProducerError>;

    /// Unblock a pending read before the stop transition takes the state lock.
    fn on_stop_no_mutex(&self) -> Result<(), ProducerError> {
        Ok(())
    }

    /// Finish the run, under the state lock.
    fn on_stop(&self) -> Result<(), ProducerError>;

    /// Unblock a pending read before the pause transition takes the state lock.
    fn on_pause_no_mutex(&self) -> Result<(), ProducerError> {
        Ok(())
    }

    /// Pause, under the state lock.
    fn on_pause(&self) -> Result<(), ProducerError> {
        Ok(())
    }

    /// Resume; `ctx.subrun()` already reports the new subrun.
    fn on_resume(&self, _ctx: &ProducerContext) -> Result<(), ProducerError> {
        Ok(())
    }

    /// Poll source health. Returning `false` ends the producer thread.
    fn poll_health(&self) -> Result<bool, ProducerError> {
        Ok(true)
    }
}

/// Run information and counter access handed to every producer call.
#[derive(Debug, Clone)]
pub struct ProducerContext {
    state: Arc<RunState>,
    counter: Arc<DeliveryCounter>,
    fragment_ids: Arc<[FragmentId]>,
}

impl ProducerContext {
    pub(crate) fn new(
        state: Arc<RunState>,
        counter: Arc<DeliveryCounter>,
        fragment_ids: Arc<[FragmentId]>,
    ) -> Self {
        Self {
            state,
            counter,
            fragment_ids,
        }
    }

    /// Context detached from any readout, for driving a producer directly.
    pub fn standalone(fragment_ids: Vec<FragmentId>, mode: DeliveryMode) -> Self {
        Self::new(
            Arc::new(RunState::default()),
            Arc::new(DeliveryCounter::new(mode)),
            fragment_ids.into(),
        )
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
        &self.fragment_ids
    }

    /// The only configured fragment id.
    pub fn single_fragment_id(&self) -> AppResult<FragmentId> {
        single_fragment_id(&self.fragment_ids)
    }

    /// Next sequence id the consumer expects; stamp new fragments with it.
    pub fn ev_counter(&self) -> SequenceId {
        self.counter.get()
    }

    /// Advance the delivery counter unless delivery is request-gated.
    pub fn advance_counter(&self) -> Option<SequenceId> {
        self.counter.advance(1)
    }

    /// Whether the producer should wind down.
    pub fn should_stop(&self) -> bool {
        self.state.stop_requested() || self.state.force_stop_requested()
    }

    /// Request a stop from inside the producer (standalone use and tests).
    pub fn request_stop(&self) {
        self.state.set_stop(true);
    }
}

pub(crate) fn single_fragment_id(ids: &[FragmentId]) -> AppResult<FragmentId> {
    match ids {
        [id] => Ok(*id),
        _ => Err(ReadoutError::InvalidConfiguration(format!(
            "single fragment id requested but {} are configured",
            ids.len()
        ))),
    }
}
