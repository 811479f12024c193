//! Custom error types for the readout engine.
//!
//! This module defines the primary error type, `ReadoutError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the failures that can escape the engine: configuration problems found at
//! construction, lifecycle misuse, and failures reported by the producer collaborator.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically TOML syntax or type mismatches.
//! - **`Configuration`**: Semantic configuration errors (conflicting fragment id options,
//!   request mode without a producer thread). Fatal at construction.
//! - **`InvalidConfiguration`**: Accessor misuse, such as asking for the single fragment id
//!   of a multi-id readout.
//! - **`InvalidTransition`**: A lifecycle command issued from a state that does not accept it.
//! - **`Producer`**: A hook or `produce` call failed. The same failure is also latched in the
//!   readout's exception flag.
//! - **`ThreadSpawn`**: The OS refused to spawn the producer or monitor thread.
//!
//! Buffer operations never fail and therefore have no variant here.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, ReadoutError>;

/// Error reported by a [`Producer`](crate::producer::Producer) implementation.
///
/// Producers own their failure taxonomy; the engine only needs a message to latch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ProducerError {
    /// Human-readable description of the failure
    pub message: String,
}

impl ProducerError {
    /// Create a producer error from any displayable message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for ProducerError {
    fn from(err: std::io::Error) -> Self {
        Self::new(format!("I/O error: {err}"))
    }
}

/// Primary error type for the readout engine.
#[derive(Error, Debug)]
pub enum ReadoutError {
    /// Configuration source could not be parsed or extracted.
    ///
    /// **Error Type**: Permanent - requires fixing the configuration file or environment.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration values parsed but are inconsistent.
    ///
    /// **Error Type**: Permanent - the readout refuses to be constructed.
    ///
    /// # Example
    ///
    /// ```rust
    /// use daq_readout::error::ReadoutError;
    ///
    /// fn validate_ids(ids: &[u16]) -> Result<(), ReadoutError> {
    ///     if ids.is_empty() {
    ///         return Err(ReadoutError::Configuration(
    ///             "at least one fragment id is required".into(),
    ///         ));
    ///     }
    ///     Ok(())
    /// }
    /// ```
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// An accessor was used in a way the configuration does not support.
    #[error("Invalid configuration for this operation: {0}")]
    InvalidConfiguration(String),

    /// Lifecycle command issued from a state that does not accept it.
    #[error("Cannot {command} while {state}")]
    InvalidTransition {
        /// Command that was rejected
        command: &'static str,
        /// State the readout was in
        state: &'static str,
    },

    /// Producer hook or data call failed.
    ///
    /// **Recovery Strategy**: The failure is latched; inspect
    /// `Readout::latest_exception()` and restart the run.
    #[error("Producer '{producer}' failed during {operation}: {source}")]
    Producer {
        /// Producer name
        producer: String,
        /// Hook or call that failed
        operation: &'static str,
        /// Underlying producer error
        #[source]
        source: ProducerError,
    },

    /// A worker thread could not be spawned.
    #[error("Failed to spawn {thread} thread: {source}")]
    ThreadSpawn {
        /// Role of the thread
        thread: &'static str,
        /// OS error
        #[source]
        source: std::io::Error,
    },
}

impl From<figment::Error> for ReadoutError {
    fn from(err: figment::Error) -> Self {
        ReadoutError::Config(Box::new(err))
    }
}
