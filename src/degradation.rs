// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Degradation handling: one discrete signal for "how much fallback is
//! active right now", plus the emergency path of last resort.
//!
//! The level is never set directly. It is re-derived from capabilities,
//! the store's current tier and the pending queue depth every time one of
//! them changes.
//!
//! # Example
//!
//! ```
//! use offline_resilience::{Capabilities, DegradationLevel, StorageTier};
//!
//! let healthy = Capabilities {
//!     persistent_store: true,
//!     online: true,
//!     ..Default::default()
//! };
//! assert_eq!(DegradationLevel::derive(&healthy, StorageTier::Persistent, 0, 10), DegradationLevel::None);
//!
//! // Working, but from a less durable tier
//! assert_eq!(DegradationLevel::derive(&healthy, StorageTier::Session, 0, 10), DegradationLevel::Partial);
//!
//! // Nothing to store into at all
//! assert_eq!(
//!     DegradationLevel::derive(&Capabilities::default(), StorageTier::Memory, 0, 10),
//!     DegradationLevel::Full
//! );
//! ```

use std::sync::Arc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::capability::{Capabilities, CapabilityProbe};
use crate::clock::Clock;
use crate::storage::{BoundedMap, SetOptions, StorageItem, StorageTier, StoreEvent, TieredStore};
use crate::sync::SyncStatus;

/// Aggregate health signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DegradationLevel {
    /// Durable storage, online, queue short
    None = 0,
    /// Working, but something is falling back
    Partial = 1,
    /// No usable storage; emergency map only
    Full = 2,
}

impl DegradationLevel {
    /// Pure: same inputs, same level, regardless of history.
    #[must_use]
    pub fn derive(
        capabilities: &Capabilities,
        tier: StorageTier,
        pending: usize,
        deep_queue_threshold: usize,
    ) -> Self {
        if !capabilities.available() {
            return Self::Full;
        }
        if tier == StorageTier::Persistent
            && capabilities.online
            && pending <= deep_queue_threshold
            && !capabilities.quota_exceeded
        {
            return Self::None;
        }
        Self::Partial
    }

    #[must_use]
    pub fn uses_emergency_storage(&self) -> bool {
        matches!(self, Self::Full)
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::None => "Normal operation",
            Self::Partial => "Degraded - some fallback active",
            Self::Full => "Emergency - in-memory storage only",
        }
    }
}

impl std::fmt::Display for DegradationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

struct Inputs {
    capabilities: Capabilities,
    pending: usize,
    /// Connectivity as last reported by the sync status; wins over probes
    synced_online: Option<bool>,
}

pub struct DegradationCoordinator {
    store: Arc<TieredStore>,
    probe: CapabilityProbe,
    clock: Arc<dyn Clock>,
    deep_queue_threshold: usize,
    inputs: Mutex<Inputs>,
    level: watch::Sender<DegradationLevel>,
    emergency: Mutex<BoundedMap<StorageItem>>,
}

impl DegradationCoordinator {
    pub fn new(
        store: Arc<TieredStore>,
        probe: CapabilityProbe,
        clock: Arc<dyn Clock>,
        capabilities: Capabilities,
        emergency_max_items: usize,
        deep_queue_threshold: usize,
    ) -> Self {
        let initial = DegradationLevel::derive(&capabilities, store.current_tier(), 0, deep_queue_threshold);
        crate::metrics::set_degradation_level(initial as u8);
        if initial == DegradationLevel::Full {
            warn!("No usable storage at startup, emergency storage active");
        }
        let (level, _) = watch::channel(initial);

        Self {
            store,
            probe,
            clock,
            deep_queue_threshold,
            inputs: Mutex::new(Inputs {
                capabilities,
                pending: 0,
                synced_online: None,
            }),
            level,
            emergency: Mutex::new(BoundedMap::new(emergency_max_items)),
        }
    }

    #[must_use]
    pub fn level(&self) -> DegradationLevel {
        *self.level.borrow()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<DegradationLevel> {
        self.level.subscribe()
    }

    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        self.inputs.lock().capabilities
    }

    /// Adopt new capabilities: switch the store's tier (migrating data) and
    /// re-derive the level.
    pub fn on_capabilities(&self, capabilities: Capabilities) -> DegradationLevel {
        if let Some(change) = self.store.apply_capabilities(&capabilities) {
            if !change.migration.is_complete() {
                warn!(
                    from = %change.from,
                    to = %change.to,
                    left_behind = change.migration.failed.len(),
                    "Some keys could not be migrated"
                );
            }
        }
        {
            let mut inputs = self.inputs.lock();
            inputs.capabilities = match inputs.synced_online {
                Some(online) => capabilities.with_online(online),
                None => capabilities,
            };
        }
        self.rederive()
    }

    /// Probe the host again and adopt the result.
    pub fn reprobe(&self) -> DegradationLevel {
        let capabilities = self.probe.probe();
        self.on_capabilities(capabilities)
    }

    /// Consume store events; storage trouble triggers a fresh probe.
    pub fn refresh(&self) -> DegradationLevel {
        let events = self.store.take_events();
        let storage_trouble = events.iter().any(|e| {
            matches!(
                e,
                StoreEvent::FallbackWrite { .. }
                    | StoreEvent::QuotaExceeded { .. }
                    | StoreEvent::WriteFailed { .. }
            )
        });
        if storage_trouble {
            info!(events = events.len(), "Storage trouble reported, re-probing");
            return self.reprobe();
        }
        self.rederive()
    }

    /// Fold a sync status change into the inputs.
    pub fn on_sync_status(&self, status: &SyncStatus) -> DegradationLevel {
        {
            let mut inputs = self.inputs.lock();
            inputs.capabilities = inputs.capabilities.with_online(status.is_online);
            inputs.synced_online = Some(status.is_online);
            inputs.pending = status.pending_count;
        }
        self.rederive()
    }

    /// Re-derive on every status change until the sender goes away.
    pub async fn watch_sync_status(&self, mut status: watch::Receiver<SyncStatus>) {
        let initial = status.borrow_and_update().clone();
        self.on_sync_status(&initial);
        while status.changed().await.is_ok() {
            let current = status.borrow_and_update().clone();
            self.on_sync_status(&current);
        }
    }

    /// Human-readable guidance for the current state.
    #[must_use]
    pub fn recommendations(&self) -> Vec<String> {
        let (capabilities, pending) = {
            let inputs = self.inputs.lock();
            (inputs.capabilities, inputs.pending)
        };
        let level = self.level();
        let mut out = Vec::new();

        if level == DegradationLevel::Full {
            out.push("Storage is unavailable: changes are kept in memory only and will be lost when the app closes.".to_string());
            out.push("Keep this window open until storage becomes available again.".to_string());
        } else {
            match self.store.current_tier() {
                StorageTier::Session => {
                    out.push("Data will not persist after this session ends.".to_string())
                }
                StorageTier::Memory => {
                    out.push("Data will not persist if the app is closed or reloaded.".to_string())
                }
                StorageTier::Persistent | StorageTier::None => {}
            }
        }
        if capabilities.quota_exceeded {
            out.push("Storage is full: clear old data to free up space.".to_string());
        }
        if !capabilities.online {
            out.push("You are offline: changes are saved locally and will sync when the connection returns.".to_string());
        }
        if pending > self.deep_queue_threshold {
            out.push(format!("{} changes are waiting to sync.", pending));
        }
        out
    }

    // ═══════════════════════════════════════════════════════════════════════
    // KEY/VALUE ROUTING
    // ═══════════════════════════════════════════════════════════════════════

    /// Write through the store, or into the emergency map while Full.
    pub fn set(&self, key: &str, value: Value, opts: SetOptions) -> bool {
        if self.level() == DegradationLevel::Full {
            let now = self.clock.now_millis();
            let expires_at = opts.expires_at(now);
            if let Some((evicted, _)) = self
                .emergency
                .lock()
                .insert(key.to_string(), StorageItem::new(value, now, expires_at))
            {
                warn!(key = %evicted, "Emergency storage full, dropped oldest entry");
                crate::metrics::record_eviction("emergency", 1);
            }
            return true;
        }
        let ok = self.store.set(key, value, opts);
        self.refresh();
        ok
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        if self.level() == DegradationLevel::Full {
            return self.emergency_get(key).or_else(|| self.store.get(key));
        }
        // Entries that could not be flushed stay readable
        self.store.get(key).or_else(|| self.emergency_get(key))
    }

    pub fn remove(&self, key: &str) -> bool {
        let in_emergency = self.emergency.lock().remove(key).is_some();
        if self.level() == DegradationLevel::Full {
            return in_emergency;
        }
        self.store.remove(key) || in_emergency
    }

    pub fn keys(&self) -> Vec<String> {
        let now = self.clock.now_millis();
        let emergency: Vec<String> = {
            let map = self.emergency.lock();
            map.keys()
                .filter(|k| map.get(k).is_some_and(|item| !item.is_expired(now)))
                .cloned()
                .collect()
        };
        if self.level() == DegradationLevel::Full {
            return emergency;
        }
        let mut keys = self.store.keys();
        for key in emergency {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }

    #[must_use]
    pub fn emergency_len(&self) -> usize {
        self.emergency.lock().len()
    }

    fn emergency_get(&self, key: &str) -> Option<Value> {
        let now = self.clock.now_millis();
        let mut map = self.emergency.lock();
        let expired = map.get(key)?.is_expired(now);
        if expired {
            map.remove(key);
            return None;
        }
        map.get(key).map(|item| item.value.clone())
    }

    fn rederive(&self) -> DegradationLevel {
        let next = {
            let inputs = self.inputs.lock();
            DegradationLevel::derive(
                &inputs.capabilities,
                self.store.current_tier(),
                inputs.pending,
                self.deep_queue_threshold,
            )
        };
        let previous = self.level();
        if next == previous {
            return next;
        }

        if next == DegradationLevel::Full {
            warn!(from = %previous, "Entering full degradation, emergency storage active");
        }
        self.level.send_replace(next);
        crate::metrics::set_degradation_level(next as u8);
        info!(from = %previous, to = %next, "Degradation level changed");

        if previous == DegradationLevel::Full {
            self.flush_emergency();
        }
        next
    }

    /// Move emergency entries into the store. Entries the store refuses stay.
    fn flush_emergency(&self) {
        let entries = self.emergency.lock().drain();
        if entries.is_empty() {
            return;
        }

        let now = self.clock.now_millis();
        let total = entries.len();
        let mut flushed = 0;
        let mut kept = Vec::new();

        for (key, item) in entries {
            if item.is_expired(now) {
                continue;
            }
            let expiry = item
                .expires_at
                .map(|at| std::time::Duration::from_millis(at.saturating_sub(now).max(0) as u64));
            let opts = SetOptions {
                expiry,
                ..SetOptions::default()
            };
            if self.store.set(&key, item.value.clone(), opts) {
                flushed += 1;
            } else {
                kept.push((key, item));
            }
        }

        if !kept.is_empty() {
            let mut map = self.emergency.lock();
            for (key, item) in kept {
                map.insert(key, item);
            }
        }
        info!(total, flushed, "Emergency storage flushed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::StaticPlatform;
    use crate::clock::ManualClock;
    use crate::storage::InMemoryBackend;
    use serde_json::json;
    use std::time::Duration;

    fn caps(persistent: bool, session: bool, online: bool) -> Capabilities {
        Capabilities {
            persistent_store: persistent,
            session_store: session,
            online,
            ..Default::default()
        }
    }

    #[test]
    fn test_derive_table() {
        let t = 10;
        assert_eq!(DegradationLevel::derive(&caps(true, true, true), StorageTier::Persistent, 0, t), DegradationLevel::None);
        assert_eq!(DegradationLevel::derive(&caps(true, true, true), StorageTier::Persistent, 10, t), DegradationLevel::None);
        assert_eq!(DegradationLevel::derive(&caps(true, true, true), StorageTier::Persistent, 11, t), DegradationLevel::Partial);
        assert_eq!(DegradationLevel::derive(&caps(true, true, false), StorageTier::Persistent, 0, t), DegradationLevel::Partial);
        assert_eq!(DegradationLevel::derive(&caps(false, true, true), StorageTier::Session, 0, t), DegradationLevel::Partial);
        assert_eq!(
            DegradationLevel::derive(&caps(true, true, true).with_quota_exceeded(true), StorageTier::Persistent, 0, t),
            DegradationLevel::Partial
        );
        assert_eq!(DegradationLevel::derive(&caps(false, false, true), StorageTier::Memory, 0, t), DegradationLevel::Full);
        // Offline does not make it worse than Full
        assert_eq!(DegradationLevel::derive(&caps(false, false, false), StorageTier::Memory, 99, t), DegradationLevel::Full);
    }

    #[test]
    fn test_level_ordering_and_display() {
        assert!(DegradationLevel::None < DegradationLevel::Partial);
        assert!(DegradationLevel::Partial < DegradationLevel::Full);
        assert_eq!(DegradationLevel::Full.to_string(), "Full");
        assert!(DegradationLevel::Full.uses_emergency_storage());
        assert_eq!(serde_json::to_value(DegradationLevel::Partial).unwrap(), json!("partial"));
    }

    struct Fixture {
        persistent: Arc<InMemoryBackend>,
        session: Arc<InMemoryBackend>,
        store: Arc<TieredStore>,
        clock: Arc<ManualClock>,
        coordinator: DegradationCoordinator,
    }

    fn fixture() -> Fixture {
        let persistent = Arc::new(InMemoryBackend::new());
        let session = Arc::new(InMemoryBackend::new());
        let clock = Arc::new(ManualClock::default());
        let probe = CapabilityProbe::new(
            Some(persistent.clone()),
            Some(session.clone()),
            Arc::new(StaticPlatform::online()),
        );
        let capabilities = probe.probe();
        let store = Arc::new(TieredStore::new(
            Some(persistent.clone()),
            Some(session.clone()),
            50,
            &capabilities,
            clock.clone(),
        ));
        let coordinator = DegradationCoordinator::new(store.clone(), probe, clock.clone(), capabilities, 3, 2);
        Fixture { persistent, session, store, clock, coordinator }
    }

    #[test]
    fn test_healthy_start() {
        let f = fixture();
        assert_eq!(f.coordinator.level(), DegradationLevel::None);
        assert!(f.coordinator.recommendations().is_empty());
    }

    #[test]
    fn test_losing_persistent_is_partial_and_migrates() {
        let f = fixture();
        f.coordinator.set("k", json!(1), SetOptions::default());

        let level = f.coordinator.on_capabilities(caps(false, true, true));
        assert_eq!(level, DegradationLevel::Partial);
        assert_eq!(f.store.current_tier(), StorageTier::Session);
        assert_eq!(f.session.len(), 1);
        assert!(f
            .coordinator
            .recommendations()
            .iter()
            .any(|r| r.contains("will not persist after this session")));
    }

    #[test]
    fn test_full_routes_to_emergency_and_flushes_on_recovery() {
        let f = fixture();
        let mut rx = f.coordinator.subscribe();

        f.persistent.set_available(false);
        f.session.set_available(false);
        assert_eq!(f.coordinator.reprobe(), DegradationLevel::Full);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), DegradationLevel::Full);

        assert!(f.coordinator.set("y", json!(2), SetOptions::default()));
        assert_eq!(f.coordinator.get("y"), Some(json!(2)));
        assert_eq!(f.coordinator.keys(), vec!["y".to_string()]);
        assert_eq!(f.coordinator.emergency_len(), 1);

        f.persistent.set_available(true);
        f.session.set_available(true);
        assert_eq!(f.coordinator.reprobe(), DegradationLevel::None);
        assert_eq!(f.coordinator.emergency_len(), 0);
        assert_eq!(f.store.current_tier(), StorageTier::Persistent);
        assert_eq!(f.store.get("y"), Some(json!(2)));
    }

    #[test]
    fn test_emergency_map_is_bounded_and_honours_ttl() {
        let f = fixture();
        f.coordinator.on_capabilities(caps(false, false, true));
        assert_eq!(f.coordinator.level(), DegradationLevel::Full);

        for i in 0..4 {
            f.coordinator.set(&format!("k{}", i), json!(i), SetOptions::default());
        }
        assert_eq!(f.coordinator.emergency_len(), 3);
        assert_eq!(f.coordinator.get("k0"), None);

        f.coordinator.set("t", json!("x"), SetOptions::expiring(Duration::from_secs(1)));
        f.clock.advance(Duration::from_secs(1));
        assert_eq!(f.coordinator.get("t"), None);

        f.coordinator.set("long", json!("y"), SetOptions::expiring(Duration::MAX));
        assert_eq!(f.coordinator.get("long"), Some(json!("y")));
    }

    #[test]
    fn test_quota_fallback_triggers_reprobe() {
        let persistent = Arc::new(InMemoryBackend::with_quota(200));
        let clock = Arc::new(ManualClock::default());
        let probe = CapabilityProbe::new(Some(persistent.clone()), None, Arc::new(StaticPlatform::online()));
        let capabilities = probe.probe();
        let store = Arc::new(TieredStore::new(Some(persistent.clone()), None, 50, &capabilities, clock.clone()));
        let coordinator = DegradationCoordinator::new(store.clone(), probe, clock, capabilities, 10, 10);

        // Fill the quota almost completely
        assert!(coordinator.set("a", json!("x".repeat(120)), SetOptions::default()));
        // Spills to memory and makes the store report trouble
        assert!(coordinator.set("b", json!("y".repeat(120)), SetOptions::default()));

        // The probe marker no longer fits: persistent is out, only memory left
        assert_eq!(coordinator.level(), DegradationLevel::Full);
        assert!(coordinator.capabilities().quota_exceeded);
        assert_eq!(coordinator.get("b"), Some(json!("y".repeat(120))));
    }

    #[test]
    fn test_sync_status_feeds_level() {
        let f = fixture();
        let mut status = SyncStatus {
            is_online: false,
            pending_count: 0,
            last_sync_at: None,
            sync_in_progress: false,
        };
        assert_eq!(f.coordinator.on_sync_status(&status), DegradationLevel::Partial);
        assert!(f.coordinator.recommendations().iter().any(|r| r.contains("offline")));

        status.is_online = true;
        status.pending_count = 3;
        assert_eq!(f.coordinator.on_sync_status(&status), DegradationLevel::Partial);
        assert!(f.coordinator.recommendations().iter().any(|r| r.starts_with("3 changes")));

        status.pending_count = 0;
        assert_eq!(f.coordinator.on_sync_status(&status), DegradationLevel::None);
    }

    #[tokio::test]
    async fn test_watch_sync_status_loop() {
        let f = Arc::new(fixture());
        let (tx, rx) = watch::channel(SyncStatus {
            is_online: true,
            ..Default::default()
        });

        let watcher = {
            let f = f.clone();
            tokio::spawn(async move { f.coordinator.watch_sync_status(rx).await })
        };

        let mut level = f.coordinator.subscribe();
        tx.send_modify(|s| s.is_online = false);
        level.changed().await.unwrap();
        assert_eq!(*level.borrow(), DegradationLevel::Partial);

        drop(tx);
        watcher.await.unwrap();
    }
}
