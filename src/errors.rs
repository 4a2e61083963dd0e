use std::collections::TryReserveError;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
    #[error("allocation failed: {0}")]
    Allocation(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("command failed: {0}")]
    Command(String),
    #[error("device not ready: {0}")]
    NotReady(String),
    #[error("acquisition already running")]
    AlreadyRunning,
}

impl From<TryReserveError> for DriverError {
    fn from(e: TryReserveError) -> Self {
        DriverError::Allocation(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;
