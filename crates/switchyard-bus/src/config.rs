use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use switchyard_core::{SwitchyardError, SwitchyardResult};

/// Tunables for the [`MessageBus`](crate::MessageBus).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Maximum queued messages before the lowest-priority oldest is evicted.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Maximum dead letters retained for inspection.
    #[serde(default = "default_dead_letter_capacity")]
    pub dead_letter_capacity: usize,
    /// Largest accepted message, serialized, in bytes.
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    /// How many recently published ids are remembered for correlation checks.
    #[serde(default = "default_correlation_window")]
    pub correlation_window: usize,
    /// Per-handler deadline; a handler exceeding it counts as failed.
    #[serde(default = "default_handler_timeout_ms")]
    pub handler_timeout_ms: u64,
    /// Directory for the queue and dead-letter snapshot. In-memory only when unset.
    #[serde(default)]
    pub persist_dir: Option<PathBuf>,
}

fn default_capacity() -> usize {
    10_000
}

fn default_dead_letter_capacity() -> usize {
    1_000
}

fn default_max_message_bytes() -> usize {
    1024 * 1024
}

fn default_correlation_window() -> usize {
    65_536
}

fn default_handler_timeout_ms() -> u64 {
    30_000
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            dead_letter_capacity: default_dead_letter_capacity(),
            max_message_bytes: default_max_message_bytes(),
            correlation_window: default_correlation_window(),
            handler_timeout_ms: default_handler_timeout_ms(),
            persist_dir: None,
        }
    }
}

impl BusConfig {
    /// Reject values the bus cannot run with.
    pub fn validate(&self) -> SwitchyardResult<()> {
        if self.capacity == 0 {
            return Err(SwitchyardError::Config(
                "bus.capacity must be greater than 0".into(),
            ));
        }
        if self.correlation_window == 0 {
            return Err(SwitchyardError::Config(
                "bus.correlation_window must be greater than 0".into(),
            ));
        }
        if self.handler_timeout_ms == 0 {
            return Err(SwitchyardError::Config(
                "bus.handler_timeout_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}
