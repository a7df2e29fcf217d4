//! Capture tuning: ring size and chunk size, with environment overrides.

use apicap_file::{FileError, FileOptions};
use thiserror::Error;

/// Overrides [`CaptureConfig::ring_capacity`] (decimal bytes).
pub const RING_CAPACITY_ENV: &str = "APICAP_RING_CAPACITY";
/// Overrides the trace file chunk size (decimal bytes).
pub const CHUNK_SIZE_ENV: &str = "APICAP_CHUNK_SIZE";

pub const DEFAULT_RING_CAPACITY: usize = 4 * 1024 * 1024;

/// The producer keeps one byte of slack, so a ring must hold at least two.
pub const MIN_RING_CAPACITY: usize = 2;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} must be a decimal byte count, got {value:?}")]
    InvalidNumber { name: &'static str, value: String },

    #[error("ring capacity must be at least {min} bytes, got {0}", min = MIN_RING_CAPACITY)]
    RingCapacity(usize),

    #[error(transparent)]
    File(#[from] FileError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Bytes buffered between the capturing thread and the writer thread.
    pub ring_capacity: usize,
    pub file: FileOptions,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            ring_capacity: DEFAULT_RING_CAPACITY,
            file: FileOptions::default(),
        }
    }
}

impl CaptureConfig {
    /// Defaults, overridden by [`RING_CAPACITY_ENV`] and [`CHUNK_SIZE_ENV`]
    /// when set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`Self::from_env`] with a caller-supplied variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(raw) = lookup(RING_CAPACITY_ENV) {
            config.ring_capacity = parse_bytes(RING_CAPACITY_ENV, &raw)?;
        }
        if let Some(raw) = lookup(CHUNK_SIZE_ENV) {
            config.file.chunk_size = parse_bytes(CHUNK_SIZE_ENV, &raw)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ring_capacity < MIN_RING_CAPACITY {
            return Err(ConfigError::RingCapacity(self.ring_capacity));
        }
        self.file.validate()?;
        Ok(())
    }
}

fn parse_bytes(name: &'static str, raw: &str) -> Result<usize, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::InvalidNumber {
            name,
            value: raw.to_owned(),
        })
}
