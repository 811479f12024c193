//! Readout configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `DAQ_READOUT_` (nested keys use `__`)
//!
//! Durations are written in humantime form (`"250ms"`, `"2s"`).
//!
//! # Example
//! ```no_run
//! use daq_readout::config::AppConfig;
//!
//! let config = AppConfig::load_from("config/readout.toml")?;
//! config.validate()?;
//! println!("Delivery mode: {}", config.readout.request_mode);
//! # Ok::<(), daq_readout::error::ReadoutError>(())
//! ```

use crate::buffer::BufferLimits;
use crate::error::{AppResult, ReadoutError};
use crate::fragment::FragmentId;
use crate::simulator::SimulatorConfig;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "DAQ_READOUT_";

/// Per-request delivery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Push mode: deliver everything as fast as it is produced
    #[default]
    Ignored,
    /// Answer each request with a copy of the latest event
    Single,
    /// Answer each request with the whole buffer
    Buffer,
    /// Answer each request with the fragments inside its time window
    Window,
}

impl DeliveryMode {
    /// Whether delivery is driven by requests (every mode except `Ignored`).
    pub fn is_request_driven(self) -> bool {
        !matches!(self, DeliveryMode::Ignored)
    }
}

impl std::fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DeliveryMode::Ignored => "ignored",
            DeliveryMode::Single => "single",
            DeliveryMode::Buffer => "buffer",
            DeliveryMode::Window => "window",
        };
        write!(f, "{}", label)
    }
}

impl FromStr for DeliveryMode {
    type Err = ReadoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ignored" => Ok(DeliveryMode::Ignored),
            "single" => Ok(DeliveryMode::Single),
            "buffer" => Ok(DeliveryMode::Buffer),
            "window" => Ok(DeliveryMode::Window),
            _ => Err(ReadoutError::Configuration(format!(
                "Invalid request_mode '{}'. Must be one of: ignored, single, buffer, window",
                s
            ))),
        }
    }
}

/// Top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Buffering and delivery engine settings
    #[serde(default)]
    pub readout: ReadoutConfig,
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingSection,
    /// Simulated producer settings (demo binary)
    #[serde(default)]
    pub simulator: SimulatorConfig,
}

/// Logging configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Buffering and delivery engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadoutConfig {
    /// Delivery policy
    #[serde(default)]
    pub request_mode: DeliveryMode,
    /// Window start offset before the request timestamp, in timestamp ticks
    #[serde(default)]
    pub request_window_offset: u64,
    /// Window width, in timestamp ticks
    #[serde(default)]
    pub request_window_width: u64,
    /// Drop buffered fragments older than newest minus this many ticks (unset = never)
    #[serde(default)]
    pub stale_fragment_timeout: Option<u64>,
    /// Remove fragments from the buffer once assigned to a window
    #[serde(default = "default_true")]
    pub request_windows_are_unique: bool,
    /// How long an out-of-order window may hold back the delivery counter
    #[serde(default = "default_missing_request_window_timeout", with = "humantime_serde")]
    pub missing_request_window_timeout: Duration,
    /// How long a window may wait for data past its end before being sent incomplete
    #[serde(default = "default_window_close_timeout", with = "humantime_serde")]
    pub window_close_timeout: Duration,
    /// Run the producer on a dedicated thread (required unless mode is ignored)
    #[serde(default = "default_true")]
    pub separate_data_thread: bool,
    /// Run the hardware monitor on a dedicated thread
    #[serde(default)]
    pub separate_monitoring_thread: bool,
    /// Interval between hardware health polls
    #[serde(default = "default_hardware_poll_interval", with = "humantime_serde")]
    pub hardware_poll_interval: Duration,
    /// Sleep after a produce call that returned no fragments (0 = no sleep)
    #[serde(default, with = "humantime_serde")]
    pub sleep_on_no_data: Duration,
    /// Evict the oldest data instead of blocking the producer when full
    #[serde(default)]
    pub circular_buffer_mode: bool,
    /// Maximum buffered fragments (0 = unbounded)
    #[serde(default = "default_buffer_depth_fragments")]
    pub data_buffer_depth_fragments: usize,
    /// Maximum buffered megabytes (0 = unbounded)
    #[serde(default = "default_buffer_depth_mbytes")]
    pub data_buffer_depth_mbytes: usize,
    /// Single fragment id emitted by this readout
    #[serde(default)]
    pub fragment_id: Option<FragmentId>,
    /// Fragment ids emitted by this readout
    #[serde(default)]
    pub fragment_ids: Vec<FragmentId>,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_true() -> bool {
    true
}

fn default_missing_request_window_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_window_close_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_hardware_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_buffer_depth_fragments() -> usize {
    1000
}

fn default_buffer_depth_mbytes() -> usize {
    1000
}

impl Default for ReadoutConfig {
    fn default() -> Self {
        Self {
            request_mode: DeliveryMode::default(),
            request_window_offset: 0,
            request_window_width: 0,
            stale_fragment_timeout: None,
            request_windows_are_unique: true,
            missing_request_window_timeout: default_missing_request_window_timeout(),
            window_close_timeout: default_window_close_timeout(),
            separate_data_thread: true,
            separate_monitoring_thread: false,
            hardware_poll_interval: default_hardware_poll_interval(),
            sleep_on_no_data: Duration::ZERO,
            circular_buffer_mode: false,
            data_buffer_depth_fragments: default_buffer_depth_fragments(),
            data_buffer_depth_mbytes: default_buffer_depth_mbytes(),
            fragment_id: None,
            fragment_ids: Vec::new(),
        }
    }
}

impl ReadoutConfig {
    /// Validate the option combinations that cannot be defaulted.
    pub fn validate(&self) -> AppResult<()> {
        match (self.fragment_id, self.fragment_ids.is_empty()) {
            (Some(_), false) => {
                return Err(ReadoutError::Configuration(
                    "fragment_id and fragment_ids are mutually exclusive".into(),
                ))
            }
            (None, true) => {
                return Err(ReadoutError::Configuration(
                    "one of fragment_id or fragment_ids must be set".into(),
                ))
            }
            _ => {}
        }

        let mut seen = HashSet::new();
        for id in &self.fragment_ids {
            if !seen.insert(id) {
                return Err(ReadoutError::Configuration(format!(
                    "Duplicate fragment id: {}",
                    id
                )));
            }
        }

        if self.request_mode.is_request_driven() && !self.separate_data_thread {
            return Err(ReadoutError::Configuration(format!(
                "request_mode '{}' requires separate_data_thread = true",
                self.request_mode
            )));
        }

        Ok(())
    }

    /// Configured fragment ids, in configuration order.
    pub fn resolved_fragment_ids(&self) -> Vec<FragmentId> {
        match self.fragment_id {
            Some(id) => vec![id],
            None => self.fragment_ids.clone(),
        }
    }

    /// Buffer bounds derived from the depth settings.
    pub fn buffer_limits(&self) -> BufferLimits {
        BufferLimits {
            max_fragments: self.data_buffer_depth_fragments,
            max_bytes: self.data_buffer_depth_mbytes.saturating_mul(1024 * 1024),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file and environment overrides
    ///
    /// Example override: `DAQ_READOUT_READOUT__REQUEST_MODE=window`
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Self::figment(path).extract()?)
    }

    /// Figment used by [`AppConfig::load_from`], exposed for layering extra providers.
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate every section.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ReadoutError::Configuration(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }
        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.logging.format.to_lowercase().as_str()) {
            return Err(ReadoutError::Configuration(format!(
                "Invalid log format '{}'. Must be one of: {}",
                self.logging.format,
                valid_formats.join(", ")
            )));
        }
        self.readout.validate()
    }
}
