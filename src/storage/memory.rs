// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use dashmap::DashMap;
use super::traits::{StorageBackend, StorageError};

/// In-process keyed string storage.
///
/// Emulates a host's session-scoped storage and doubles as a failure
/// injection point: it can be switched unavailable at runtime and given a
/// byte quota (`key.len() + value.len()` per entry).
pub struct InMemoryBackend {
    data: DashMap<String, String>,
    used_bytes: AtomicUsize,
    quota_bytes: Option<usize>,
    available: AtomicBool,
}

impl InMemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
            used_bytes: AtomicUsize::new(0),
            quota_bytes: None,
            available: AtomicBool::new(true),
        }
    }

    /// Create a backend that rejects writes once `quota_bytes` would be exceeded.
    #[must_use]
    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            quota_bytes: Some(quota_bytes),
            ..Self::new()
        }
    }

    /// Flip availability; while unavailable every call fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Get current entry count
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(StorageError::Unavailable("in-memory backend disabled".into()))
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBackend for InMemoryBackend {
    fn read(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.check_available()?;
        Ok(self.data.get(key).map(|r| r.value().clone()))
    }

    fn write(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.check_available()?;
        let new_size = key.len() + value.len();
        let old_size = self.data.get(key).map_or(0, |r| key.len() + r.value().len());

        if let Some(limit) = self.quota_bytes {
            let used = self.used_bytes.load(Ordering::Acquire);
            if used - old_size + new_size > limit {
                return Err(StorageError::QuotaExceeded {
                    used,
                    requested: new_size,
                    limit,
                });
            }
        }

        self.data.insert(key.to_string(), value.to_string());
        self.used_bytes.fetch_add(new_size, Ordering::AcqRel);
        self.used_bytes.fetch_sub(old_size, Ordering::AcqRel);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.check_available()?;
        if let Some((k, v)) = self.data.remove(key) {
            self.used_bytes.fetch_sub(k.len() + v.len(), Ordering::AcqRel);
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        self.check_available()?;
        Ok(self.data.iter().map(|r| r.key().clone()).collect())
    }

    fn clear(&self) -> Result<(), StorageError> {
        self.check_available()?;
        self.data.clear();
        self.used_bytes.store(0, Ordering::Release);
        Ok(())
    }

    fn used_bytes(&self) -> Option<usize> {
        Some(self.used_bytes.load(Ordering::Acquire))
    }
}
