//! Link configuration
//!
//! Timing knobs for a link session, loadable from a JSON file. The baud rate
//! and frame delimiter are protocol constants, not settings.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::protocol::{
    DEFAULT_CLOSE_TIMEOUT_MS, DEFAULT_EVENT_CAPACITY, DEFAULT_HANDSHAKE_DELAY_MS,
    DEFAULT_POLL_INTERVAL_MS, DEFAULT_READ_CHUNK_SIZE,
};

/// Errors loading or saving a configuration file
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Reading or writing the file failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The file is not valid configuration JSON
    #[error("Invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Session timing configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Sleep between empty reads in milliseconds
    pub poll_interval_ms: u64,
    /// Bytes requested per read
    pub read_chunk_size: usize,
    /// Upper bound on waiting for the reader during close, in milliseconds
    pub close_timeout_ms: u64,
    /// Pause between the two handshake commands in milliseconds
    pub handshake_delay_ms: u64,
    /// Capacity of the event queue
    pub event_capacity: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            close_timeout_ms: DEFAULT_CLOSE_TIMEOUT_MS,
            handshake_delay_ms: DEFAULT_HANDSHAKE_DELAY_MS,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl LinkConfig {
    /// Load from a JSON file; missing fields take their defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Write as pretty JSON, creating parent directories
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Poll interval, at least 1 ms so an idle reader never spins
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Read chunk size, at least one byte
    pub fn read_chunk_size(&self) -> usize {
        self.read_chunk_size.max(1)
    }

    /// Close timeout
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// Handshake delay
    pub fn handshake_delay(&self) -> Duration {
        Duration::from_millis(self.handshake_delay_ms)
    }

    /// Event queue capacity, at least one slot
    pub fn event_capacity(&self) -> usize {
        self.event_capacity.max(1)
    }
}
