// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Stored value envelope and per-write options.

use std::time::Duration;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The envelope every tier stores, JSON-serialized.
///
/// # Example
///
/// ```
/// use offline_resilience::StorageItem;
/// use serde_json::json;
///
/// let item = StorageItem::new(json!({"ta": 5}), 1_000, Some(2_000));
/// assert!(!item.is_expired(1_999));
/// assert!(item.is_expired(2_000)); // expiry is inclusive of `now == expires_at`
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageItem {
    pub value: Value,
    /// Epoch millis
    pub created_at: i64,
    /// Epoch millis; `None` never expires
    #[serde(default)]
    pub expires_at: Option<i64>,
}

impl StorageItem {
    #[must_use]
    pub fn new(value: Value, created_at: i64, expires_at: Option<i64>) -> Self {
        Self {
            value,
            created_at,
            expires_at,
        }
    }

    /// An item is logically absent once `now >= expires_at`.
    #[must_use]
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Options for [`TieredStore::set`](super::TieredStore::set).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetOptions {
    /// Time-to-live from the moment of the write
    pub expiry: Option<Duration>,
    /// Whether a failing durable tier may spill this key into the Memory tier
    pub allow_memory_fallback: bool,
}

impl Default for SetOptions {
    fn default() -> Self {
        Self {
            expiry: None,
            allow_memory_fallback: true,
        }
    }
}

impl SetOptions {
    /// Expire the value after `ttl`.
    #[must_use]
    pub fn expiring(ttl: Duration) -> Self {
        Self {
            expiry: Some(ttl),
            ..Default::default()
        }
    }

    /// Absolute expiry for a write made at `now`, saturating at `i64::MAX`.
    #[must_use]
    pub fn expires_at(&self, now: i64) -> Option<i64> {
        self.expiry
            .map(|ttl| now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)))
    }

    /// Fail the write instead of spilling to memory.
    #[must_use]
    pub fn durable_only(mut self) -> Self {
        self.allow_memory_fallback = false;
        self
    }
}
