// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! UI-facing operations: key/value storage, collections, sync control and
//! degradation status.

use std::sync::Arc;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::cache::{CollectionRead, MutateOutcome};
use crate::capability::Capabilities;
use crate::degradation::DegradationLevel;
use crate::queue::Mutation;
use crate::storage::{SetOptions, StorageTier};
use crate::sync::{ConflictRecord, FailedItem, SyncObserver, SyncOutcome, SyncStatus};

use super::{LayerHealth, LayerState, ResilienceLayer};

impl ResilienceLayer {
    // ═══════════════════════════════════════════════════════════════════════
    // KEY/VALUE
    // ═══════════════════════════════════════════════════════════════════════

    /// Store `value` under `key`. Returns false only when nothing could hold it.
    pub fn set(&self, key: &str, value: Value, opts: SetOptions) -> bool {
        self.degradation.set(key, value, opts)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.degradation.get(key)
    }

    /// Typed read; a value that does not deserialize reads as absent.
    #[must_use]
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key)?;
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                debug!(key, error = %e, "Stored value has unexpected shape");
                None
            }
        }
    }

    pub fn remove(&self, key: &str) -> bool {
        self.degradation.remove(key)
    }

    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.degradation.keys()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // COLLECTIONS
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn get_collection(&self, name: &str) -> CollectionRead {
        self.cache.get_collection(name).await
    }

    /// Write through to the remote, or queue for later.
    pub async fn mutate(&self, mutation: Mutation) -> MutateOutcome {
        let outcome = self.cache.mutate(mutation).await;
        if matches!(outcome, MutateOutcome::Queued { .. }) {
            self.publish();
        }
        outcome
    }

    // ═══════════════════════════════════════════════════════════════════════
    // SYNC
    // ═══════════════════════════════════════════════════════════════════════

    #[must_use]
    pub fn sync_status(&self) -> SyncStatus {
        self.sync.status()
    }

    #[must_use]
    pub fn subscribe_sync_status(&self) -> watch::Receiver<SyncStatus> {
        self.sync.subscribe()
    }

    pub async fn force_sync(&self) -> SyncOutcome {
        let outcome = self.sync.force_sync().await;
        self.publish();
        outcome
    }

    /// Connectivity changed. Coming back online replays the queue.
    pub async fn set_online(&self, online: bool) -> Option<SyncOutcome> {
        let outcome = self.sync.set_online(online).await;
        self.publish();
        outcome
    }

    /// Probe the host again. A changed online signal is treated like
    /// [`Self::set_online`].
    pub async fn reprobe(&self) -> DegradationLevel {
        let online = self.platform.is_online();
        if online != self.sync.status().is_online {
            info!(online, "Probe saw a connectivity change");
            self.set_online(online).await;
        }
        self.degradation.reprobe()
    }

    pub fn add_observer(&self, observer: Arc<dyn SyncObserver>) {
        self.sync.add_observer(observer);
    }

    #[must_use]
    pub fn conflicts(&self) -> Vec<ConflictRecord> {
        self.sync.conflicts()
    }

    pub fn acknowledge_conflict(&self, id: &str) -> bool {
        self.sync.acknowledge_conflict(id)
    }

    #[must_use]
    pub fn failed_items(&self) -> Vec<FailedItem> {
        self.sync.failed_items()
    }

    pub fn dismiss_failed(&self, id: &str) -> bool {
        self.sync.dismiss_failed(id)
    }

    /// Requeue a permanently failed write; returns its new queue id.
    pub fn retry_failed(&self, id: &str) -> Option<String> {
        let queue_id = self.sync.retry_failed(id)?;
        self.publish();
        Some(queue_id)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // DEGRADATION
    // ═══════════════════════════════════════════════════════════════════════

    #[must_use]
    pub fn degradation_level(&self) -> DegradationLevel {
        self.degradation.level()
    }

    #[must_use]
    pub fn subscribe_degradation(&self) -> watch::Receiver<DegradationLevel> {
        self.degradation.subscribe()
    }

    #[must_use]
    pub fn recommendations(&self) -> Vec<String> {
        self.degradation.recommendations()
    }

    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        self.degradation.capabilities()
    }

    #[must_use]
    pub fn current_tier(&self) -> StorageTier {
        self.store.current_tier()
    }

    /// Cached-state snapshot for a diagnostics view.
    #[must_use]
    pub fn health_check(&self) -> LayerHealth {
        let state = self.state();
        let status = self.sync.status();
        let degradation = self.degradation.level();
        let remote_healthy = self.remote.health().is_healthy();

        let healthy = state == LayerState::Running
            && degradation != DegradationLevel::Full
            && (!status.is_online || remote_healthy);

        LayerHealth {
            state,
            healthy,
            online: status.is_online,
            remote_healthy,
            remote_failures: self.remote.health().failure_count(),
            circuit_failure_rate: self.remote.circuit().failure_rate(),
            current_tier: self.store.current_tier(),
            degradation,
            pending: status.pending_count,
            conflicts: self.sync.conflicts().len(),
            failed_items: self.sync.failed_items().len(),
            emergency_items: self.degradation.emergency_len(),
            last_sync_at: status.last_sync_at,
        }
    }
}
