//! # Serving Configuration
//!
//! Options controlling a dispatcher: batch limit, accumulation timeout,
//! partition count, allowed batch keys, shutdown grace window and output
//! mode. Values are serde-friendly so deployments can load them from
//! configuration files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::batch::DEFAULT_KEY;
use crate::error::{BatchlineError, Result};

/// Output mode a dispatcher operates in, fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServingMode {
    /// Waiters receive complete sliced replies; the client reassembles a
    /// concrete value.
    Execute,
    /// Same wire protocol as `Execute`, but the client exposes a stream so
    /// the caller reacts per batch.
    Batches,
    /// The compute function emits named hook events mid-execution. Input
    /// must be a single batch no larger than the batch limit.
    Hooks,
}

impl ServingMode {
    pub fn is_streaming(&self) -> bool {
        matches!(self, ServingMode::Batches | ServingMode::Hooks)
    }
}

/// Configuration for one named dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServingOptions {
    /// Dispatcher identity, globally unique within the process.
    pub name: String,
    /// Maximum number of items accumulated per key before sealing.
    pub batch_size: usize,
    /// How long a partially filled accumulator may wait before sealing.
    pub batch_timeout_ms: u64,
    /// Number of worker partitions.
    pub partitions: usize,
    /// Keys clients may submit under.
    pub batch_keys: Vec<String>,
    /// Grace window for in-flight batches at shutdown.
    pub shutdown_ms: u64,
    /// Output mode.
    pub mode: ServingMode,
    /// Buffer size of the dispatcher command channel.
    pub command_buffer_size: usize,
}

impl Default for ServingOptions {
    fn default() -> Self {
        Self {
            name: String::new(),
            batch_size: 1,
            batch_timeout_ms: 100,
            partitions: 1,
            batch_keys: vec![DEFAULT_KEY.to_string()],
            shutdown_ms: 30_000,
            mode: ServingMode::Execute,
            command_buffer_size: 1024,
        }
    }
}

impl ServingOptions {
    /// Options with a name and defaults for everything else.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Test-friendly options with a short accumulation timeout.
    pub fn for_test(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            batch_timeout_ms: 20,
            shutdown_ms: 1_000,
            ..Self::default()
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_batch_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.batch_timeout_ms = timeout_ms;
        self
    }

    pub fn with_partitions(mut self, partitions: usize) -> Self {
        self.partitions = partitions;
        self
    }

    pub fn with_batch_keys(mut self, keys: Vec<String>) -> Self {
        self.batch_keys = keys;
        self
    }

    pub fn with_shutdown_ms(mut self, shutdown_ms: u64) -> Self {
        self.shutdown_ms = shutdown_ms;
        self
    }

    pub fn with_mode(mut self, mode: ServingMode) -> Self {
        self.mode = mode;
        self
    }

    /// Accumulation timeout as a Duration
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    /// Shutdown grace window as a Duration
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_ms)
    }

    /// Validate the options, raising a configuration error on the first
    /// violated constraint.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(BatchlineError::configuration(
                "serving options require a non-empty name",
            ));
        }
        if self.batch_size == 0 {
            return Err(BatchlineError::configuration(
                "batch_size must be a positive integer",
            ));
        }
        if self.partitions == 0 {
            return Err(BatchlineError::configuration(
                "partitions must be a positive integer",
            ));
        }
        if self.batch_keys.is_empty() {
            return Err(BatchlineError::configuration(
                "batch_keys must name at least one key",
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for key in &self.batch_keys {
            if !seen.insert(key.as_str()) {
                return Err(BatchlineError::configuration(format!(
                    "duplicate batch key '{key}'"
                )));
            }
        }
        if self.command_buffer_size == 0 {
            return Err(BatchlineError::configuration(
                "command_buffer_size must be a positive integer",
            ));
        }
        Ok(())
    }
}
