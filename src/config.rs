// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the resilience layer.
//!
//! # Example
//!
//! ```
//! use offline_resilience::ResilienceConfig;
//!
//! // Minimal config (uses defaults)
//! let config = ResilienceConfig::default();
//! assert_eq!(config.memory_max_items, 50);
//! assert_eq!(config.sync_interval_secs, 300);
//!
//! // Partial override from JSON
//! let config = ResilienceConfig::from_json_str(r#"{"queue_max_retries": 3}"#).unwrap();
//! assert_eq!(config.queue_max_retries, 3);
//! assert_eq!(config.queue_domain, "mutations");
//! ```

use std::time::Duration;
use serde::Deserialize;
use thiserror::Error;

use crate::resilience::circuit_breaker::CircuitConfig;
use crate::resilience::retry::RetryConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Configuration for the resilience layer.
///
/// All fields have sensible defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct ResilienceConfig {
    /// Item ceiling of the Memory tier (FIFO eviction beyond it)
    #[serde(default = "default_memory_max_items")]
    pub memory_max_items: usize,

    /// Item ceiling of the emergency map used while degradation is Full
    #[serde(default = "default_emergency_max_items")]
    pub emergency_max_items: usize,

    /// Queue namespace; persisted under `queue:<domain>`
    #[serde(default = "default_queue_domain")]
    pub queue_domain: String,

    /// Failed replays before an item is evicted
    #[serde(default = "default_queue_max_retries")]
    pub queue_max_retries: u32,

    /// Ceiling of the persisted conflict and failed-item lists (oldest dropped first)
    #[serde(default = "default_operator_list_max_items")]
    pub operator_list_max_items: usize,

    /// Queued items older than this are evicted without replay
    #[serde(default = "default_queue_max_age_secs")]
    pub queue_max_age_secs: u64,

    /// Queue depth above which the layer reports Partial degradation
    #[serde(default = "default_deep_queue_threshold")]
    pub deep_queue_threshold: usize,

    /// Periodic sync cadence while online
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,

    /// Per-call timeout for remote API calls
    #[serde(default = "default_remote_timeout_ms")]
    pub remote_timeout_ms: u64,

    /// Attempts for a collection fetch before falling back to cache
    #[serde(default = "default_fetch_attempts")]
    pub fetch_attempts: usize,

    /// Cached collection lifetime
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Bump to invalidate every cached collection on upgrade
    #[serde(default = "default_cache_schema_version")]
    pub cache_schema_version: u32,

    /// Field that identifies a record inside a collection
    #[serde(default = "default_record_id_field")]
    pub record_id_field: String,

    /// Circuit breaker: failure rate (0.0 - 1.0) that trips the breaker
    #[serde(default = "default_circuit_failure_rate")]
    pub circuit_failure_rate: f32,
    /// Circuit breaker: calls observed before the rate is evaluated
    #[serde(default = "default_circuit_window")]
    pub circuit_window: usize,
    /// Circuit breaker: trial calls while half-open
    #[serde(default = "default_circuit_half_open_calls")]
    pub circuit_half_open_calls: usize,
    /// Circuit breaker: time open before trying again
    #[serde(default = "default_circuit_recovery_secs")]
    pub circuit_recovery_secs: u64,

    /// Backoff between sync passes that left failures behind
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
}

fn default_memory_max_items() -> usize { 50 }
fn default_emergency_max_items() -> usize { 100 }
fn default_queue_domain() -> String { "mutations".to_string() }
fn default_queue_max_retries() -> u32 { 5 }
fn default_queue_max_age_secs() -> u64 { 7 * 24 * 60 * 60 } // 7 days
fn default_operator_list_max_items() -> usize { 200 }
fn default_deep_queue_threshold() -> usize { 10 }
fn default_sync_interval_secs() -> u64 { 300 } // 5 minutes
fn default_remote_timeout_ms() -> u64 { 5_000 }
fn default_fetch_attempts() -> usize { 2 }
fn default_cache_ttl_secs() -> u64 { 60 * 60 } // 1 hour
fn default_cache_schema_version() -> u32 { 1 }
fn default_record_id_field() -> String { "id".to_string() }
fn default_circuit_failure_rate() -> f32 { 0.5 }
fn default_circuit_window() -> usize { 10 }
fn default_circuit_half_open_calls() -> usize { 2 }
fn default_circuit_recovery_secs() -> u64 { 30 }
fn default_backoff_initial_ms() -> u64 { 1_000 }
fn default_backoff_max_secs() -> u64 { 300 }

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            memory_max_items: default_memory_max_items(),
            emergency_max_items: default_emergency_max_items(),
            queue_domain: default_queue_domain(),
            queue_max_retries: default_queue_max_retries(),
            operator_list_max_items: default_operator_list_max_items(),
            queue_max_age_secs: default_queue_max_age_secs(),
            deep_queue_threshold: default_deep_queue_threshold(),
            sync_interval_secs: default_sync_interval_secs(),
            remote_timeout_ms: default_remote_timeout_ms(),
            fetch_attempts: default_fetch_attempts(),
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_schema_version: default_cache_schema_version(),
            record_id_field: default_record_id_field(),
            circuit_failure_rate: default_circuit_failure_rate(),
            circuit_window: default_circuit_window(),
            circuit_half_open_calls: default_circuit_half_open_calls(),
            circuit_recovery_secs: default_circuit_recovery_secs(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_secs: default_backoff_max_secs(),
        }
    }
}

impl ResilienceConfig {
    /// Parse a (possibly partial) JSON document and validate it.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_max_retries == 0 {
            return Err(ConfigError::Invalid {
                field: "queue_max_retries",
                reason: "must be at least 1".into(),
            });
        }
        if self.operator_list_max_items == 0 {
            return Err(ConfigError::Invalid {
                field: "operator_list_max_items",
                reason: "must be at least 1".into(),
            });
        }
        if self.queue_domain.is_empty() {
            return Err(ConfigError::Invalid {
                field: "queue_domain",
                reason: "must not be empty".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.circuit_failure_rate) {
            return Err(ConfigError::Invalid {
                field: "circuit_failure_rate",
                reason: format!("{} is outside 0.0..=1.0", self.circuit_failure_rate),
            });
        }
        if self.remote_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "remote_timeout_ms",
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn queue_max_age(&self) -> Duration {
        Duration::from_secs(self.queue_max_age_secs)
    }

    #[must_use]
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    #[must_use]
    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    #[must_use]
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    #[must_use]
    pub fn circuit(&self) -> CircuitConfig {
        CircuitConfig {
            failure_rate: self.circuit_failure_rate,
            window: self.circuit_window,
            half_open_calls: self.circuit_half_open_calls,
            recovery_timeout: Duration::from_secs(self.circuit_recovery_secs),
        }
    }

    /// Quick retry for collection fetches.
    #[must_use]
    pub fn fetch_retry(&self) -> RetryConfig {
        RetryConfig {
            max_retries: Some(self.fetch_attempts.max(1)),
            ..RetryConfig::query()
        }
    }

    /// Backoff between failing sync passes.
    #[must_use]
    pub fn sync_backoff(&self) -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(self.backoff_initial_ms),
            max_delay: Duration::from_secs(self.backoff_max_secs),
            factor: 2.0,
            max_retries: None,
        }
    }
}
