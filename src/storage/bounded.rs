// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Item-capped FIFO map.
//!
//! Backs the Memory tier and the emergency store. When full, inserting a new
//! key evicts the oldest-*inserted* key. Reads and overwrites do not change
//! a key's position (FIFO, not LRU).

use std::collections::{HashMap, VecDeque};
use parking_lot::Mutex;
use tracing::debug;

use super::traits::{StorageBackend, StorageError};

#[derive(Debug, Clone)]
pub struct BoundedMap<V> {
    entries: HashMap<String, V>,
    order: VecDeque<String>,
    max_items: usize,
    evictions: u64,
}

impl<V> BoundedMap<V> {
    /// `max_items` is clamped to at least 1.
    #[must_use]
    pub fn new(max_items: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            max_items: max_items.max(1),
            evictions: 0,
        }
    }

    /// Insert or overwrite. Returns the evicted entry, if the insert pushed
    /// the map over its ceiling.
    pub fn insert(&mut self, key: String, value: V) -> Option<(String, V)> {
        if let Some(slot) = self.entries.get_mut(&key) {
            *slot = value;
            return None;
        }

        let evicted = if self.entries.len() >= self.max_items {
            self.pop_oldest()
        } else {
            None
        };

        self.order.push_back(key.clone());
        self.entries.insert(key, value);
        evicted
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<V> {
        let removed = self.entries.remove(key)?;
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        Some(removed)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Keys, oldest insertion first.
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.order.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn max_items(&self) -> usize {
        self.max_items
    }

    /// Total entries evicted by the ceiling since creation.
    #[must_use]
    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    /// Remove and return every entry, oldest insertion first.
    pub fn drain(&mut self) -> Vec<(String, V)> {
        let mut out = Vec::with_capacity(self.entries.len());
        while let Some(key) = self.order.pop_front() {
            if let Some(value) = self.entries.remove(&key) {
                out.push((key, value));
            }
        }
        out
    }

    fn pop_oldest(&mut self) -> Option<(String, V)> {
        let key = self.order.pop_front()?;
        let value = self.entries.remove(&key)?;
        self.evictions += 1;
        Some((key, value))
    }
}

/// The Memory tier: a [`BoundedMap`] behind the [`StorageBackend`] contract.
/// Always available.
pub struct BoundedMemoryBackend {
    inner: Mutex<BoundedMap<String>>,
}

impl BoundedMemoryBackend {
    #[must_use]
    pub fn new(max_items: usize) -> Self {
        Self {
            inner: Mutex::new(BoundedMap::new(max_items)),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    #[must_use]
    pub fn evictions(&self) -> u64 {
        self.inner.lock().evictions()
    }
}

impl StorageBackend for BoundedMemoryBackend {
    fn read(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.inner.lock().get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let evicted = self.inner.lock().insert(key.to_string(), value.to_string());
        if let Some((evicted_key, _)) = evicted {
            debug!(key = %evicted_key, "Memory tier full, evicted oldest entry");
            crate::metrics::record_eviction("memory", 1);
        }
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inner.lock().remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.inner.lock().keys().cloned().collect())
    }

    fn clear(&self) -> Result<(), StorageError> {
        self.inner.lock().clear();
        Ok(())
    }
}
