// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Tiered key/value store.
//!
//! Three backends ranked by durability: Persistent → Session → Memory. The
//! store writes to the *current* tier and reads from every tier, current
//! first, so nothing written before a downgrade disappears.
//!
//! ```text
//!   set ──► current tier ──(error)──► purge expired, retry once
//!                                        │
//!                                     (error)──► Memory tier for this key
//!                                                (+ StoreEvent::FallbackWrite)
//!
//!   get ──► current ──miss──► Persistent ──miss──► Session ──miss──► Memory
//! ```
//!
//! Tier switches happen in [`TieredStore::apply_capabilities`]: the store
//! moves to the most durable tier the capabilities allow and migrates the
//! keys of the tier it leaves (plus anything spilled to memory) into it.
//!
//! A `remove` that an unreachable non-current tier refuses leaves a
//! tombstone: the key reads as absent and the delete is retried whenever
//! tiers change or expired items are swept.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use offline_resilience::{Capabilities, InMemoryBackend, SetOptions, StorageTier, SystemClock, TieredStore};
//! use serde_json::json;
//!
//! let session = Arc::new(InMemoryBackend::new());
//! let caps = Capabilities { session_store: true, ..Default::default() };
//! let store = TieredStore::new(None, Some(session), 50, &caps, Arc::new(SystemClock));
//!
//! assert_eq!(store.current_tier(), StorageTier::Session);
//! assert!(store.set("x", json!(1), SetOptions::default()));
//! assert_eq!(store.get("x"), Some(json!(1)));
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::capability::{Capabilities, PROBE_KEY};
use crate::clock::Clock;

use super::bounded::BoundedMemoryBackend;
use super::item::{SetOptions, StorageItem};
use super::traits::{StorageBackend, StorageError, StorageTier};

/// Something the degradation coordinator should know about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// A write missed its tier and landed in memory
    FallbackWrite { key: String, from: StorageTier },
    /// A tier reported it is full
    QuotaExceeded { tier: StorageTier },
    /// A write failed outright
    WriteFailed { key: String, tier: StorageTier },
    /// The current tier changed
    TierChanged {
        from: StorageTier,
        to: StorageTier,
        migrated: usize,
    },
}

/// Outcome of moving keys between tiers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub moved: usize,
    /// Keys that stayed behind because the target refused them
    pub failed: Vec<String>,
    /// Keys dropped because they had already expired
    pub expired: usize,
}

impl MigrationReport {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    fn absorb(&mut self, other: MigrationReport) {
        self.moved += other.moved;
        self.expired += other.expired;
        self.failed.extend(other.failed);
    }
}

/// A tier switch performed by [`TieredStore::apply_capabilities`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierChange {
    pub from: StorageTier,
    pub to: StorageTier,
    pub migration: MigrationReport,
}

/// Point-in-time view for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    pub current_tier: StorageTier,
    /// Raw key counts per tier (including not-yet-purged expired items)
    pub keys_per_tier: Vec<(StorageTier, usize)>,
    pub used_bytes: Option<usize>,
    pub fallback_writes: u64,
    pub memory_evictions: u64,
}

struct TierState {
    current: StorageTier,
    capabilities: Capabilities,
    fallback_writes: u64,
}

pub struct TieredStore {
    persistent: Option<Arc<dyn StorageBackend>>,
    session: Option<Arc<dyn StorageBackend>>,
    memory: Arc<BoundedMemoryBackend>,
    state: Mutex<TierState>,
    events: Mutex<Vec<StoreEvent>>,
    /// Removed keys that some tier still holds
    tombstones: Mutex<HashSet<String>>,
    clock: Arc<dyn Clock>,
}

impl TieredStore {
    /// Build the store and select the most durable tier that `capabilities`
    /// allows *and* has a backend.
    pub fn new(
        persistent: Option<Arc<dyn StorageBackend>>,
        session: Option<Arc<dyn StorageBackend>>,
        memory_max_items: usize,
        capabilities: &Capabilities,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let store = Self {
            persistent,
            session,
            memory: Arc::new(BoundedMemoryBackend::new(memory_max_items)),
            state: Mutex::new(TierState {
                current: StorageTier::Memory,
                capabilities: *capabilities,
                fallback_writes: 0,
            }),
            events: Mutex::new(Vec::new()),
            tombstones: Mutex::new(HashSet::new()),
            clock,
        };

        let initial = store.best_tier(capabilities);
        store.state.lock().current = initial;
        crate::metrics::set_current_tier(initial as u8);
        info!(tier = %initial, "Tiered store initialized");
        store
    }

    #[must_use]
    pub fn current_tier(&self) -> StorageTier {
        self.state.lock().current
    }

    /// Capabilities last applied, with the quota flag raised by failed writes.
    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        self.state.lock().capabilities
    }

    /// Write `value` under `key`. Returns `false` only if no tier took it.
    pub fn set(&self, key: &str, value: Value, opts: SetOptions) -> bool {
        let now = self.clock.now_millis();
        let expires_at = opts.expires_at(now);
        let raw = match StorageItem::new(value, now, expires_at).to_json() {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key, error = %e, "Value could not be serialized");
                return false;
            }
        };

        let written = self.write_current(key, &raw, opts);
        if written {
            // The new copy sits in the current tier and shadows any stale one
            self.tombstones.lock().remove(key);
        }
        written
    }

    fn write_current(&self, key: &str, raw: &str, opts: SetOptions) -> bool {
        let tier = self.current_tier();
        let Some(backend) = self.backend(tier) else {
            return self.spill_to_memory(key, raw, tier, opts);
        };

        let first = match backend.write(key, raw) {
            Ok(()) => {
                crate::metrics::record_tier_operation(tier.as_str(), "set", "success");
                return true;
            }
            Err(e) => e,
        };

        self.note_write_error(tier, &first);
        let purged = self.cleanup_tier(tier);
        debug!(key, %tier, purged, error = %first, "Write failed, retrying after cleanup");

        match backend.write(key, raw) {
            Ok(()) => {
                crate::metrics::record_tier_operation(tier.as_str(), "set", "success");
                true
            }
            Err(second) => {
                self.note_write_error(tier, &second);
                self.spill_to_memory(key, raw, tier, opts)
            }
        }
    }

    /// Read `key`, checking the current tier first and then every other tier
    /// in durability order. Expired items are purged and read as absent.
    pub fn get(&self, key: &str) -> Option<Value> {
        if self.is_tombstoned(key) {
            self.retry_delete(key);
            return None;
        }
        let now = self.clock.now_millis();
        for tier in self.read_order() {
            let Some(backend) = self.backend(tier) else {
                continue;
            };
            let raw = match backend.read(key) {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) => {
                    debug!(key, %tier, error = %e, "Tier unreadable, trying next");
                    continue;
                }
            };
            let item = match StorageItem::from_json(&raw) {
                Ok(item) => item,
                Err(e) => {
                    debug!(key, %tier, error = %e, "Foreign or corrupt entry ignored");
                    continue;
                }
            };
            if item.is_expired(now) {
                // Freshest copy expired: the key is gone
                let _ = backend.delete(key);
                crate::metrics::record_expired(1);
                return None;
            }
            crate::metrics::record_tier_operation(tier.as_str(), "get", "success");
            return Some(item.value);
        }
        None
    }

    /// Typed read; `None` on miss or when the value has a different shape.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| serde_json::from_value(v).ok())
    }

    /// Remove `key` from every tier. Returns `false` if the current tier
    /// refused the delete. A refusal from any other tier leaves a tombstone.
    pub fn remove(&self, key: &str) -> bool {
        let current = self.current_tier();
        let mut ok = true;
        let mut left_behind = false;
        for tier in StorageTier::BY_DURABILITY {
            let Some(backend) = self.backend(tier) else {
                continue;
            };
            if let Err(e) = backend.delete(key) {
                if tier == current {
                    debug!(key, %tier, error = %e, "Delete failed");
                    ok = false;
                } else {
                    warn!(key, %tier, error = %e, "Delete refused by inactive tier, key tombstoned");
                    left_behind = true;
                }
            }
        }
        if ok && left_behind {
            self.tombstones.lock().insert(key.to_string());
        }
        crate::metrics::record_tier_operation(current.as_str(), "remove", if ok { "success" } else { "error" });
        ok
    }

    /// Remove every key from every reachable tier.
    pub fn clear(&self) {
        for tier in StorageTier::BY_DURABILITY {
            if let Some(backend) = self.backend(tier) {
                if let Err(e) = backend.clear() {
                    warn!(%tier, error = %e, "Failed to clear tier");
                }
            }
        }
    }

    /// Live keys across all tiers, current tier's first. Expired entries are
    /// purged on the way.
    pub fn keys(&self) -> Vec<String> {
        let now = self.clock.now_millis();
        let mut seen = HashSet::new();
        let mut keys = Vec::new();

        for tier in self.read_order() {
            let Some(backend) = self.backend(tier) else {
                continue;
            };
            let Ok(tier_keys) = backend.keys() else {
                continue;
            };
            for key in tier_keys {
                if key == PROBE_KEY || seen.contains(&key) || self.is_tombstoned(&key) {
                    continue;
                }
                let Ok(Some(raw)) = backend.read(&key) else {
                    continue;
                };
                let Ok(item) = StorageItem::from_json(&raw) else {
                    continue;
                };
                seen.insert(key.clone());
                if item.is_expired(now) {
                    let _ = backend.delete(&key);
                    crate::metrics::record_expired(1);
                } else {
                    keys.push(key);
                }
            }
        }
        keys
    }

    /// Purge expired items from every tier and retry tombstoned deletes.
    pub fn cleanup_expired(&self) -> usize {
        self.retry_tombstones();
        StorageTier::BY_DURABILITY
            .iter()
            .map(|tier| self.cleanup_tier(*tier))
            .sum()
    }

    /// Move every live key from `from` into `to`. Keys are deleted from the
    /// source only after the target accepted them.
    pub fn migrate(&self, from: StorageTier, to: StorageTier) -> MigrationReport {
        let mut report = MigrationReport::default();
        let (Some(source), Some(target)) = (self.backend(from), self.backend(to)) else {
            return report;
        };
        if from == to {
            return report;
        }

        let keys = match source.keys() {
            Ok(keys) => keys,
            Err(e) => {
                warn!(%from, %to, error = %e, "Source tier unreadable, nothing migrated");
                return report;
            }
        };

        let now = self.clock.now_millis();
        for key in keys {
            if key == PROBE_KEY || self.is_tombstoned(&key) {
                continue;
            }
            let Ok(Some(raw)) = source.read(&key) else {
                report.failed.push(key);
                continue;
            };
            match StorageItem::from_json(&raw) {
                Ok(item) if item.is_expired(now) => {
                    let _ = source.delete(&key);
                    report.expired += 1;
                    continue;
                }
                Ok(_) => {}
                Err(_) => continue,
            }
            match target.write(&key, &raw) {
                Ok(()) => {
                    let _ = source.delete(&key);
                    report.moved += 1;
                }
                Err(e) => {
                    debug!(key, %from, %to, error = %e, "Key left behind during migration");
                    if e.is_quota() {
                        self.note_write_error(to, &e);
                    }
                    report.failed.push(key);
                }
            }
        }

        crate::metrics::record_migration(from.as_str(), to.as_str(), report.moved);
        info!(
            %from,
            %to,
            moved = report.moved,
            failed = report.failed.len(),
            expired = report.expired,
            "Tier migration complete"
        );
        report
    }

    /// Adopt new capabilities and switch tiers if the best available tier
    /// changed, migrating data into the new tier first.
    pub fn apply_capabilities(&self, capabilities: &Capabilities) -> Option<TierChange> {
        let from = {
            let mut state = self.state.lock();
            state.capabilities = *capabilities;
            state.current
        };
        self.retry_tombstones();
        let to = self.best_tier(capabilities);
        if to == from {
            return None;
        }

        let mut migration = self.migrate(from, to);
        if from != StorageTier::Memory && to != StorageTier::Memory {
            // Pick up anything that spilled into memory meanwhile
            migration.absorb(self.migrate(StorageTier::Memory, to));
        }

        self.state.lock().current = to;
        crate::metrics::set_current_tier(to as u8);
        self.push_event(StoreEvent::TierChanged {
            from,
            to,
            migrated: migration.moved,
        });

        if to < from {
            warn!(%from, %to, moved = migration.moved, "Storage tier downgraded");
        } else {
            info!(%from, %to, moved = migration.moved, "Storage tier upgraded");
        }

        Some(TierChange { from, to, migration })
    }

    /// Keys removed while some tier refused the delete.
    #[must_use]
    pub fn tombstoned(&self) -> usize {
        self.tombstones.lock().len()
    }

    /// Drain events accumulated since the last call.
    pub fn take_events(&self) -> Vec<StoreEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    #[must_use]
    pub fn stats(&self) -> StoreStats {
        let (current_tier, fallback_writes) = {
            let state = self.state.lock();
            (state.current, state.fallback_writes)
        };
        let keys_per_tier = StorageTier::BY_DURABILITY
            .iter()
            .filter_map(|tier| {
                let backend = self.backend(*tier)?;
                backend.keys().ok().map(|k| (*tier, k.len()))
            })
            .collect();
        let used_bytes = self.backend(current_tier).and_then(|b| b.used_bytes());

        StoreStats {
            current_tier,
            keys_per_tier,
            used_bytes,
            fallback_writes,
            memory_evictions: self.memory.evictions(),
        }
    }

    fn is_tombstoned(&self, key: &str) -> bool {
        self.tombstones.lock().contains(key)
    }

    /// Delete `key` everywhere; the tombstone goes once every tier agreed.
    fn retry_delete(&self, key: &str) -> bool {
        let cleared = StorageTier::BY_DURABILITY
            .into_iter()
            .filter_map(|tier| self.backend(tier))
            .fold(true, |cleared, backend| backend.delete(key).is_ok() && cleared);
        if cleared {
            self.tombstones.lock().remove(key);
            debug!(key, "Tombstoned key deleted");
        }
        cleared
    }

    fn retry_tombstones(&self) {
        let keys: Vec<String> = self.tombstones.lock().iter().cloned().collect();
        for key in keys {
            self.retry_delete(&key);
        }
    }

    fn backend(&self, tier: StorageTier) -> Option<&dyn StorageBackend> {
        match tier {
            StorageTier::Persistent => self.persistent.as_deref(),
            StorageTier::Session => self.session.as_deref(),
            StorageTier::Memory => Some(self.memory.as_ref() as &dyn StorageBackend),
            StorageTier::None => None,
        }
    }

    fn best_tier(&self, capabilities: &Capabilities) -> StorageTier {
        StorageTier::BY_DURABILITY
            .into_iter()
            .find(|tier| capabilities.supports(*tier) && self.backend(*tier).is_some())
            .unwrap_or(StorageTier::Memory)
    }

    fn read_order(&self) -> Vec<StorageTier> {
        let current = self.current_tier();
        std::iter::once(current)
            .chain(StorageTier::BY_DURABILITY.into_iter().filter(|t| *t != current))
            .collect()
    }

    fn cleanup_tier(&self, tier: StorageTier) -> usize {
        let Some(backend) = self.backend(tier) else {
            return 0;
        };
        let Ok(keys) = backend.keys() else {
            return 0;
        };
        let now = self.clock.now_millis();
        let mut purged = 0;
        for key in keys {
            let Ok(Some(raw)) = backend.read(&key) else {
                continue;
            };
            if StorageItem::from_json(&raw).is_ok_and(|item| item.is_expired(now))
                && backend.delete(&key).is_ok()
            {
                purged += 1;
            }
        }
        if purged > 0 {
            crate::metrics::record_expired(purged);
        }
        purged
    }

    fn spill_to_memory(&self, key: &str, raw: &str, from: StorageTier, opts: SetOptions) -> bool {
        if from == StorageTier::Memory || !opts.allow_memory_fallback {
            crate::metrics::record_tier_operation(from.as_str(), "set", "error");
            self.push_event(StoreEvent::WriteFailed {
                key: key.to_string(),
                tier: from,
            });
            return false;
        }

        if self.memory.write(key, raw).is_err() {
            return false;
        }
        // A stale copy in the failing tier would shadow the new value on read
        if let Some(backend) = self.backend(from) {
            let _ = backend.delete(key);
        }

        self.state.lock().fallback_writes += 1;
        crate::metrics::record_fallback_write(from.as_str());
        crate::metrics::record_tier_operation(StorageTier::Memory.as_str(), "set", "fallback");
        warn!(key, %from, "Write fell back to memory tier");
        self.push_event(StoreEvent::FallbackWrite {
            key: key.to_string(),
            from,
        });
        true
    }

    fn note_write_error(&self, tier: StorageTier, error: &StorageError) {
        if !error.is_quota() {
            return;
        }
        {
            let mut state = self.state.lock();
            state.capabilities = state.capabilities.with_quota_exceeded(true);
        }
        crate::metrics::record_quota_exceeded(tier.as_str());
        self.push_event(StoreEvent::QuotaExceeded { tier });
    }

    fn push_event(&self, event: StoreEvent) {
        let mut events = self.events.lock();
        // Coalesce repeats so a burst of failures stays small
        if events.last() != Some(&event) {
            events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::memory::InMemoryBackend;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        persistent: Arc<InMemoryBackend>,
        session: Arc<InMemoryBackend>,
        clock: Arc<ManualClock>,
        store: TieredStore,
    }

    fn all_caps() -> Capabilities {
        Capabilities {
            persistent_store: true,
            session_store: true,
            online: true,
            ..Default::default()
        }
    }

    fn fixture_with(persistent: InMemoryBackend, caps: Capabilities) -> Fixture {
        let persistent = Arc::new(persistent);
        let session = Arc::new(InMemoryBackend::new());
        let clock = Arc::new(ManualClock::default());
        let store = TieredStore::new(
            Some(persistent.clone()),
            Some(session.clone()),
            50,
            &caps,
            clock.clone(),
        );
        Fixture {
            persistent,
            session,
            clock,
            store,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(InMemoryBackend::new(), all_caps())
    }

    #[test]
    fn test_selects_most_durable_tier() {
        let f = fixture();
        assert_eq!(f.store.current_tier(), StorageTier::Persistent);

        let f = fixture_with(
            InMemoryBackend::new(),
            Capabilities { session_store: true, ..Default::default() },
        );
        assert_eq!(f.store.current_tier(), StorageTier::Session);

        let f = fixture_with(InMemoryBackend::new(), Capabilities::default());
        assert_eq!(f.store.current_tier(), StorageTier::Memory);
    }

    #[test]
    fn test_capability_without_backend_is_ignored() {
        let clock = Arc::new(ManualClock::default());
        let store = TieredStore::new(None, None, 50, &all_caps(), clock);
        assert_eq!(store.current_tier(), StorageTier::Memory);
    }

    #[test]
    fn test_set_get_roundtrip_in_current_tier() {
        let f = fixture();
        assert!(f.store.set("x", json!({"a": 1}), SetOptions::default()));
        assert_eq!(f.store.get("x"), Some(json!({"a": 1})));
        assert!(f.persistent.read("x").unwrap().is_some());
        assert!(f.session.read("x").unwrap().is_none());
    }

    #[test]
    fn test_get_as_typed() {
        let f = fixture();
        f.store.set("n", json!(7), SetOptions::default());
        assert_eq!(f.store.get_as::<u32>("n"), Some(7));
        assert_eq!(f.store.get_as::<String>("n"), None);
    }

    #[test]
    fn test_ttl_expiry_is_inclusive() {
        let f = fixture();
        f.store.set("t", json!("v"), SetOptions::expiring(Duration::from_secs(10)));

        f.clock.advance(Duration::from_millis(9_999));
        assert_eq!(f.store.get("t"), Some(json!("v")));

        f.clock.advance(Duration::from_millis(1));
        assert_eq!(f.store.get("t"), None);
        // Purged lazily
        assert!(f.persistent.read("t").unwrap().is_none());
    }

    #[test]
    fn test_huge_ttl_is_effectively_forever() {
        let f = fixture();
        assert!(f.store.set("k", json!(1), SetOptions::expiring(Duration::from_secs(u64::MAX))));
        assert_eq!(f.store.get("k"), Some(json!(1)));

        f.clock.advance(Duration::from_secs(10 * 365 * 24 * 3600));
        assert_eq!(f.store.get("k"), Some(json!(1)));
        assert_eq!(f.store.keys(), vec!["k".to_string()]);
    }

    #[test]
    fn test_keys_excludes_and_purges_expired() {
        let f = fixture();
        f.store.set("keep", json!(1), SetOptions::default());
        f.store.set("gone", json!(2), SetOptions::expiring(Duration::from_secs(1)));
        f.clock.advance(Duration::from_secs(1));

        assert_eq!(f.store.keys(), vec!["keep".to_string()]);
        assert!(f.persistent.read("gone").unwrap().is_none());
    }

    #[test]
    fn test_quota_failure_falls_back_to_memory() {
        let f = fixture_with(InMemoryBackend::with_quota(120), all_caps());
        assert!(f.store.set("small", json!(1), SetOptions::default()));

        let big = json!("x".repeat(200));
        assert!(f.store.set("big", big.clone(), SetOptions::default()));
        assert_eq!(f.store.get("big"), Some(big));
        assert!(f.persistent.read("big").unwrap().is_none());

        let events = f.store.take_events();
        assert!(events.contains(&StoreEvent::QuotaExceeded { tier: StorageTier::Persistent }));
        assert!(events.contains(&StoreEvent::FallbackWrite {
            key: "big".into(),
            from: StorageTier::Persistent
        }));
        assert!(f.store.capabilities().quota_exceeded);
        assert_eq!(f.store.stats().fallback_writes, 1);
        // Events are drained
        assert!(f.store.take_events().is_empty());
    }

    #[test]
    fn test_cleanup_then_retry_succeeds() {
        let f = fixture_with(InMemoryBackend::with_quota(150), all_caps());
        let filler = json!("y".repeat(60));
        assert!(f.store.set("old", filler.clone(), SetOptions::expiring(Duration::from_secs(1))));
        f.clock.advance(Duration::from_secs(2));

        // Only fits once the expired entry is purged
        assert!(f.store.set("new", filler.clone(), SetOptions::default()));
        assert!(f.persistent.read("new").unwrap().is_some());
        assert!(f.persistent.read("old").unwrap().is_none());
        assert_eq!(f.store.stats().fallback_writes, 0);
    }

    #[test]
    fn test_durable_only_write_fails_instead_of_spilling() {
        let f = fixture();
        f.persistent.set_available(false);
        assert!(!f.store.set("k", json!(1), SetOptions::default().durable_only()));
        assert_eq!(f.store.get("k"), None);
        assert!(f
            .store
            .take_events()
            .contains(&StoreEvent::WriteFailed { key: "k".into(), tier: StorageTier::Persistent }));
    }

    #[test]
    fn test_fallback_write_shadows_stale_copy() {
        // Room for the short value only
        let f = fixture_with(InMemoryBackend::with_quota(60), all_caps());
        assert!(f.store.set("k", json!("old"), SetOptions::default()));

        let long = json!("a much longer replacement value that will not fit");
        assert!(f.store.set("k", long.clone(), SetOptions::default()));
        assert!(f.persistent.read("k").unwrap().is_none());
        assert_eq!(f.store.get("k"), Some(long));
    }

    #[test]
    fn test_get_falls_through_tiers_after_downgrade() {
        let f = fixture();
        f.store.set("before", json!(1), SetOptions::default());

        // Persistent goes read-only-unreachable: downgrade without migration
        f.persistent.set_available(false);
        let change = f
            .store
            .apply_capabilities(&all_caps().without(StorageTier::Persistent))
            .unwrap();
        assert_eq!(change.to, StorageTier::Session);
        assert_eq!(change.migration.moved, 0);

        f.store.set("after", json!(2), SetOptions::default());
        assert_eq!(f.store.get("after"), Some(json!(2)));

        // Persistent readable again: old data is still visible
        f.persistent.set_available(true);
        assert_eq!(f.store.get("before"), Some(json!(1)));
    }

    #[test]
    fn test_downgrade_migrates_readable_keys() {
        let f = fixture();
        for i in 0..5 {
            f.store.set(&format!("k{}", i), json!(i), SetOptions::default());
        }

        let change = f
            .store
            .apply_capabilities(&all_caps().without(StorageTier::Persistent))
            .unwrap();
        assert_eq!(change.from, StorageTier::Persistent);
        assert_eq!(change.to, StorageTier::Session);
        assert_eq!(change.migration.moved, 5);
        assert!(change.migration.is_complete());

        for i in 0..5 {
            assert_eq!(f.store.get(&format!("k{}", i)), Some(json!(i)));
        }
        assert!(f.persistent.is_empty());
        assert_eq!(f.session.len(), 5);
    }

    #[test]
    fn test_upgrade_migrates_into_more_durable_tier() {
        let f = fixture_with(
            InMemoryBackend::new(),
            Capabilities { session_store: true, ..Default::default() },
        );
        f.store.set("a", json!("A"), SetOptions::default());
        assert_eq!(f.store.current_tier(), StorageTier::Session);

        let change = f.store.apply_capabilities(&all_caps()).unwrap();
        assert_eq!(change.to, StorageTier::Persistent);
        assert_eq!(f.store.current_tier(), StorageTier::Persistent);
        assert!(f.persistent.read("a").unwrap().is_some());
        assert!(f.session.read("a").unwrap().is_none());
        assert!(matches!(
            f.store.take_events().last(),
            Some(StoreEvent::TierChanged { to: StorageTier::Persistent, migrated: 1, .. })
        ));
    }

    #[test]
    fn test_upgrade_also_recovers_memory_spills() {
        let f = fixture_with(
            InMemoryBackend::new(),
            Capabilities { session_store: true, ..Default::default() },
        );
        f.session.set_available(false);
        assert!(f.store.set("spilled", json!(1), SetOptions::default()));
        f.session.set_available(true);

        f.store.apply_capabilities(&all_caps());
        assert!(f.persistent.read("spilled").unwrap().is_some());
        assert_eq!(f.store.get("spilled"), Some(json!(1)));
    }

    #[test]
    fn test_same_capabilities_is_noop() {
        let f = fixture();
        assert!(f.store.apply_capabilities(&all_caps()).is_none());
    }

    #[test]
    fn test_migration_drops_expired() {
        let f = fixture();
        f.store.set("short", json!(1), SetOptions::expiring(Duration::from_secs(1)));
        f.store.set("long", json!(2), SetOptions::default());
        f.clock.advance(Duration::from_secs(5));

        let report = f.store.migrate(StorageTier::Persistent, StorageTier::Session);
        assert_eq!(report.moved, 1);
        assert_eq!(report.expired, 1);
    }

    #[test]
    fn test_remove_clears_all_tiers() {
        let f = fixture();
        f.store.set("k", json!(1), SetOptions::default());
        f.session.write("k", &StorageItem::new(json!(0), 0, None).to_json().unwrap()).unwrap();

        assert!(f.store.remove("k"));
        assert_eq!(f.store.get("k"), None);
        assert!(f.session.read("k").unwrap().is_none());
    }

    #[test]
    fn test_remove_reports_current_tier_failure() {
        let f = fixture();
        f.persistent.set_available(false);
        assert!(!f.store.remove("k"));
        assert_eq!(f.store.tombstoned(), 0);
    }

    #[test]
    fn test_remove_refused_by_inactive_tier_stays_removed() {
        let f = fixture();
        f.store.set("k", json!(1), SetOptions::default());
        f.session.write("k", &StorageItem::new(json!(0), 0, None).to_json().unwrap()).unwrap();
        f.session.set_available(false);

        assert!(f.store.remove("k"));
        assert_eq!(f.store.tombstoned(), 1);

        // The stale session copy must not resurface once it is readable again
        f.session.set_available(true);
        assert!(f.session.read("k").unwrap().is_some());
        assert!(!f.store.keys().contains(&"k".to_string()));
        assert_eq!(f.store.get("k"), None);
        assert!(f.session.read("k").unwrap().is_none());
        assert_eq!(f.store.tombstoned(), 0);
    }

    #[test]
    fn test_tombstone_retried_on_sweep_and_cleared_by_set() {
        let f = fixture();
        f.session.write("a", &StorageItem::new(json!(0), 0, None).to_json().unwrap()).unwrap();
        f.session.write("b", &StorageItem::new(json!(0), 0, None).to_json().unwrap()).unwrap();
        f.session.set_available(false);
        assert!(f.store.remove("a"));
        assert!(f.store.remove("b"));
        assert_eq!(f.store.tombstoned(), 2);

        f.session.set_available(true);
        f.store.cleanup_expired();
        assert!(f.session.is_empty());
        assert_eq!(f.store.tombstoned(), 0);

        f.session.set_available(false);
        assert!(f.store.remove("a"));
        assert!(f.store.set("a", json!(2), SetOptions::default()));
        assert_eq!(f.store.tombstoned(), 0);
        assert_eq!(f.store.get("a"), Some(json!(2)));
    }

    #[test]
    fn test_clear_and_keys() {
        let f = fixture();
        f.store.set("a", json!(1), SetOptions::default());
        f.store.set("b", json!(2), SetOptions::default());
        let mut keys = f.store.keys();
        keys.sort();
        assert_eq!(keys, vec!["a", "b"]);

        f.store.clear();
        assert!(f.store.keys().is_empty());
    }

    #[test]
    fn test_memory_tier_fifo_ceiling() {
        let f = fixture_with(InMemoryBackend::new(), Capabilities::default());
        for i in 0..51 {
            f.store.set(&format!("k{}", i), json!(i), SetOptions::default());
        }
        assert_eq!(f.store.get("k0"), None);
        assert_eq!(f.store.get("k1"), Some(json!(1)));
        assert_eq!(f.store.keys().len(), 50);
        assert_eq!(f.store.stats().memory_evictions, 1);
    }

    #[test]
    fn test_foreign_entries_are_ignored() {
        let f = fixture();
        f.persistent.write("foreign", "not json").unwrap();
        assert_eq!(f.store.get("foreign"), None);
        assert!(f.store.keys().is_empty());
    }

    #[test]
    fn test_stats() {
        let f = fixture();
        f.store.set("a", json!(1), SetOptions::default());
        let stats = f.store.stats();
        assert_eq!(stats.current_tier, StorageTier::Persistent);
        assert!(stats.keys_per_tier.contains(&(StorageTier::Persistent, 1)));
        assert!(stats.used_bytes.unwrap() > 0);
    }
}
