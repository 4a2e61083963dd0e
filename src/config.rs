//! Acquisition settings.
//!
//! The driver does not own configuration storage. Callers build an
//! [`AcquisitionConfig`] in code or deserialize one from TOML, e.g.:
//!
//! ```toml
//! device_id = 1
//! max_events_per_batch = 4096
//! max_batch_interval_us = 5000
//! backpressure = "drop-oldest"
//!
//! [serial]
//! port = "/dev/ttyUSB0"
//! baud_rate = 4000000
//! ```

use std::path::Path;

use log::LevelFilter;
use serde::{Deserialize, Serialize};

use crate::errors::{DriverError, Result};
use crate::logging;

/// Sensor array width of the eDVS.
pub const EDVS_ARRAY_SIZE_X: u16 = 128;
/// Sensor array height of the eDVS.
pub const EDVS_ARRAY_SIZE_Y: u16 = 128;

/// Bytes in one raw event frame.
pub const EDVS_EVENT_SIZE: usize = 4;

/// Baud rates the eDVS firmware accepts.
pub const SUPPORTED_BAUD_RATES: [u32; 4] = [12_000_000, 8_000_000, 4_000_000, 2_000_000];

/// What the producer does when the hand-off queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backpressure {
    /// Wait for the consumer to make room.
    #[default]
    Block,
    /// Evict the oldest queued batch to make room.
    DropOldest,
    /// Discard the batch being pushed.
    DropNewest,
}

/// Serial link parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: SUPPORTED_BAUD_RATES[0],
        }
    }
}

/// Packet, queue and thread settings for one acquisition session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    pub device_id: u16,
    pub size_x: u16,
    pub size_y: u16,
    /// Seal a batch once any per-type buffer holds this many events. 0 disables.
    pub max_events_per_batch: usize,
    /// Seal a batch once this many microseconds have passed since its first
    /// timestamp. 0 disables.
    pub max_batch_interval_us: u32,
    pub queue_capacity: usize,
    pub backpressure: Backpressure,
    /// Make [`crate::Edvs::next_batch`] wait for data instead of returning `None`.
    pub blocking_pop: bool,
    /// Upper bound on bytes fetched per transport read.
    pub read_size: usize,
    /// Send the start-streaming command when acquisition starts.
    pub auto_run: bool,
    /// Send the stop-streaming command when acquisition stops.
    pub auto_stop: bool,
    /// Session log level; falls back to `EDVS_LOG`/`RUST_LOG`.
    pub log_level: Option<String>,
    pub serial: SerialConfig,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            device_id: 0,
            size_x: EDVS_ARRAY_SIZE_X,
            size_y: EDVS_ARRAY_SIZE_Y,
            max_events_per_batch: 8192,
            max_batch_interval_us: 10_000,
            queue_capacity: 64,
            backpressure: Backpressure::Block,
            blocking_pop: false,
            read_size: 1024,
            auto_run: true,
            auto_stop: true,
            log_level: None,
            serial: SerialConfig::default(),
        }
    }
}

impl AcquisitionConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(DriverError::Config("queue_capacity must be at least 1".into()));
        }
        if self.read_size < EDVS_EVENT_SIZE {
            return Err(DriverError::Config(format!(
                "read_size must hold at least one {EDVS_EVENT_SIZE}-byte frame, got {}",
                self.read_size
            )));
        }
        if !(1..=EDVS_ARRAY_SIZE_X).contains(&self.size_x)
            || !(1..=EDVS_ARRAY_SIZE_Y).contains(&self.size_y)
        {
            return Err(DriverError::Config(format!(
                "resolution {}x{} outside sensor array {}x{}",
                self.size_x, self.size_y, EDVS_ARRAY_SIZE_X, EDVS_ARRAY_SIZE_Y
            )));
        }
        if let Some(level) = &self.log_level {
            if logging::parse_level(Some(level)).is_none() {
                return Err(DriverError::Config(format!("unknown log level '{level}'")));
            }
        }
        Ok(())
    }

    /// Effective session log level.
    pub fn log_filter(&self) -> LevelFilter {
        logging::parse_level(self.log_level.as_deref()).unwrap_or_else(logging::env_level)
    }
}
