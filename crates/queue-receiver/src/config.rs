//! Receiver and in-memory broker configuration.
//!
//! `ReceiverConfig` can be built in code or loaded from an optional file plus
//! environment variables:
//!
//! 1. the file passed to [`ReceiverConfig::load`] (format from its extension)
//! 2. variables prefixed `QUEUE_RECEIVER__`, with `__` between nested keys,
//!    e.g. `QUEUE_RECEIVER__PREFETCH_COUNT=32`
//!
//! Later sources override earlier ones. Every field has a default, so only
//! `entity_path` has to be supplied.

use crate::error::ConfigurationError;
use crate::message::{EntityPath, ReceiveMode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

/// Prefix for environment variable overrides
pub const ENV_PREFIX: &str = "QUEUE_RECEIVER";

/// Configuration for a message receiver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiverConfig {
    /// Queue or subscription path the receiver is linked to
    #[serde(default)]
    pub entity_path: String,

    #[serde(default)]
    pub receive_mode: ReceiveMode,

    /// Messages fetched ahead of demand; 0 disables prefetching
    #[serde(default)]
    pub prefetch_count: u32,

    /// Deadline for every broker round trip
    #[serde(default = "default_operation_timeout_seconds")]
    pub operation_timeout_seconds: u64,

    /// Server wait time used by receives that do not pass one
    #[serde(default = "default_wait_time_seconds")]
    pub default_wait_time_seconds: u64,

    /// Largest batch a single receive or peek may ask for
    #[serde(default = "default_max_receive_batch")]
    pub max_receive_batch: u32,

    /// How long settled and expired lock entries stay visible
    #[serde(default = "default_terminal_entry_grace_seconds")]
    pub terminal_entry_grace_seconds: u64,

    /// Period of the background lock eviction sweep
    #[serde(default = "default_eviction_interval_seconds")]
    pub eviction_interval_seconds: u64,

    /// Auto-renewal fires this long before a lock expires
    #[serde(default = "default_auto_renew_margin_seconds")]
    pub auto_renew_margin_seconds: u64,

    /// Upper bound on how long auto-renewal keeps a lock alive
    #[serde(default = "default_max_auto_renew_seconds")]
    pub max_auto_renew_seconds: u64,
}

fn default_operation_timeout_seconds() -> u64 {
    60
}

fn default_wait_time_seconds() -> u64 {
    60
}

fn default_max_receive_batch() -> u32 {
    256
}

fn default_terminal_entry_grace_seconds() -> u64 {
    30
}

fn default_eviction_interval_seconds() -> u64 {
    10
}

fn default_auto_renew_margin_seconds() -> u64 {
    10
}

fn default_max_auto_renew_seconds() -> u64 {
    300
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            entity_path: String::new(),
            receive_mode: ReceiveMode::default(),
            prefetch_count: 0,
            operation_timeout_seconds: default_operation_timeout_seconds(),
            default_wait_time_seconds: default_wait_time_seconds(),
            max_receive_batch: default_max_receive_batch(),
            terminal_entry_grace_seconds: default_terminal_entry_grace_seconds(),
            eviction_interval_seconds: default_eviction_interval_seconds(),
            auto_renew_margin_seconds: default_auto_renew_margin_seconds(),
            max_auto_renew_seconds: default_max_auto_renew_seconds(),
        }
    }
}

impl ReceiverConfig {
    /// Create configuration for `entity_path` with defaults
    pub fn new(entity_path: &EntityPath) -> Self {
        Self {
            entity_path: entity_path.as_str().to_string(),
            ..Default::default()
        }
    }

    /// Load configuration from an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })?
            .try_deserialize::<ReceiverConfig>()
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the receiver cannot work with
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.entity_path.is_empty() {
            return Err(ConfigurationError::Missing {
                key: "entity_path".to_string(),
            });
        }

        EntityPath::new(self.entity_path.clone()).map_err(|e| ConfigurationError::Invalid {
            message: e.to_string(),
        })?;

        let non_zero = [
            ("operation_timeout_seconds", self.operation_timeout_seconds),
            ("max_receive_batch", u64::from(self.max_receive_batch)),
            ("eviction_interval_seconds", self.eviction_interval_seconds),
            ("auto_renew_margin_seconds", self.auto_renew_margin_seconds),
        ];
        for (key, value) in non_zero {
            if value == 0 {
                return Err(ConfigurationError::Invalid {
                    message: format!("{} must be greater than zero", key),
                });
            }
        }

        Ok(())
    }

    /// Validated entity path
    pub fn entity_path(&self) -> Result<EntityPath, ConfigurationError> {
        EntityPath::new(self.entity_path.clone()).map_err(|e| ConfigurationError::Invalid {
            message: e.to_string(),
        })
    }

    pub fn with_receive_mode(mut self, mode: ReceiveMode) -> Self {
        self.receive_mode = mode;
        self
    }

    pub fn with_prefetch_count(mut self, prefetch_count: u32) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    /// Set the broker round-trip deadline.
    ///
    /// The timeout is stored in whole seconds; a fractional part rounds up,
    /// so 500ms becomes 1s and 1.5s becomes 2s.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout_seconds = whole_seconds_rounded_up(timeout).max(1);
        self
    }

    /// Set the wait time used by receives that do not pass one.
    ///
    /// Stored in whole seconds, rounding a fractional part up; zero stays zero.
    pub fn with_default_wait_time(mut self, wait_time: Duration) -> Self {
        self.default_wait_time_seconds = whole_seconds_rounded_up(wait_time);
        self
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_seconds)
    }

    pub fn default_wait_time(&self) -> Duration {
        Duration::from_secs(self.default_wait_time_seconds)
    }

    pub fn terminal_entry_grace(&self) -> Duration {
        Duration::from_secs(self.terminal_entry_grace_seconds)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_seconds)
    }

    pub fn auto_renew_margin(&self) -> Duration {
        Duration::from_secs(self.auto_renew_margin_seconds)
    }

    pub fn max_auto_renew(&self) -> Duration {
        Duration::from_secs(self.max_auto_renew_seconds)
    }
}

fn whole_seconds_rounded_up(duration: Duration) -> u64 {
    let seconds = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        seconds.saturating_add(1)
    } else {
        seconds
    }
}

/// In-memory broker configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InMemoryConfig {
    /// Lock duration granted on receive and on every renewal
    pub lock_duration: Duration,
    /// Deliveries after which a message is dead-lettered instead of delivered
    pub max_delivery_count: u32,
    /// Longest accepted dead-letter reason or description
    pub max_dead_letter_reason_length: usize,
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            lock_duration: Duration::from_secs(30),
            max_delivery_count: 10,
            max_dead_letter_reason_length: 4096,
        }
    }
}

impl InMemoryConfig {
    pub fn with_lock_duration(mut self, lock_duration: Duration) -> Self {
        self.lock_duration = lock_duration;
        self
    }

    pub fn with_max_delivery_count(mut self, max_delivery_count: u32) -> Self {
        self.max_delivery_count = max_delivery_count;
        self
    }
}
