//! Engine configuration types.
//!
//! `EngineConfig` represents the `config.toml` in the data directory. Every
//! field has a default so a missing or partial file is valid.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    /// SQLite URL. Defaults to `sqlite://{data_dir}/cairn.db` when unset.
    #[serde(default)]
    pub database_url: Option<String>,

    #[serde(default)]
    pub lock: LockConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub events: EventConfig,
}

/// Running-status recompute lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_wait_secs")]
    pub wait_secs: u64,
    #[serde(default = "default_lock_lease_secs")]
    pub lease_secs: u64,
    #[serde(default = "default_lock_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_lock_wait_secs() -> u64 {
    10
}

fn default_lock_lease_secs() -> u64 {
    30
}

fn default_lock_poll_interval_ms() -> u64 {
    100
}

impl LockConfig {
    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_secs)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            wait_secs: default_lock_wait_secs(),
            lease_secs: default_lock_lease_secs(),
            poll_interval_ms: default_lock_poll_interval_ms(),
        }
    }
}

/// Bounded retry applied to persistence writes and deletes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    2_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// TTL assigned to new plan executions and the purge batch size.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_ttl_days")]
    pub ttl_days: u32,
    #[serde(default = "default_purge_batch_size")]
    pub purge_batch_size: usize,
}

fn default_ttl_days() -> u32 {
    180
}

fn default_purge_batch_size() -> usize {
    500
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            ttl_days: default_ttl_days(),
            purge_batch_size: default_purge_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_channel_capacity() -> usize {
    1024
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}
