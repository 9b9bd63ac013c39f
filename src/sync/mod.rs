// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync orchestration: when and how the offline queue gets replayed.
//!
//! ```text
//!            ┌────────── online transition ──────────┐
//!            │           interval / backoff          │
//!            │           force_sync()                │
//!            ▼                                       │
//!   Idle ──► Syncing ──(drain queue via gateway)──► Idle
//!               │
//!               ├─ applied    → observers
//!               ├─ evicted    → failed_items() + observers
//!               └─ conflicted → ConflictResolver → conflicts() / requeue / discard
//! ```
//!
//! Passes are single-flight: a trigger that arrives mid-pass is reported as
//! [`SkipReason::AlreadyRunning`] and dropped. Status changes are published
//! on a `tokio::sync::watch` channel and `last_sync_at` is persisted under
//! `status:sync`. Conflicts and permanently failed writes outlive a reload
//! under `status:conflicts` and `status:failed`.

pub mod resolver;
pub mod types;

pub use resolver::{ConflictResolver, ServerWins, SurfaceToOperator, SyncObserver};
pub use types::{
    ConflictRecord, FailedItem, Resolution, SkipReason, SyncOutcome, SyncReport, SyncStatus,
    SyncTrigger,
};

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::ResilienceConfig;
use crate::queue::{OfflineWriteQueue, ReplayError};
use crate::remote::{MutationOutcome, RemoteError, RemoteGateway};
use crate::resilience::retry::RetryConfig;
use crate::storage::{SetOptions, TieredStore};

const STATUS_KEY: &str = "status:sync";
const CONFLICTS_KEY: &str = "status:conflicts";
const FAILED_KEY: &str = "status:failed";

pub struct SyncOrchestrator {
    queue: Arc<OfflineWriteQueue>,
    remote: Arc<RemoteGateway>,
    store: Arc<TieredStore>,
    clock: Arc<dyn Clock>,
    resolver: Arc<dyn ConflictResolver>,
    observers: RwLock<Vec<Arc<dyn SyncObserver>>>,

    status: watch::Sender<SyncStatus>,
    syncing: AtomicBool,
    /// Consecutive passes that left work behind
    failed_passes: AtomicU32,

    conflicts: Mutex<Vec<ConflictRecord>>,
    failed: Mutex<Vec<FailedItem>>,
    /// Ceiling of each operator list
    list_cap: usize,

    interval: Duration,
    backoff: RetryConfig,
}

impl SyncOrchestrator {
    pub fn new(
        queue: Arc<OfflineWriteQueue>,
        remote: Arc<RemoteGateway>,
        store: Arc<TieredStore>,
        clock: Arc<dyn Clock>,
        config: &ResilienceConfig,
        online: bool,
    ) -> Self {
        let last_sync_at = store
            .get_as::<SyncStatus>(STATUS_KEY)
            .and_then(|s| s.last_sync_at);
        let initial = SyncStatus {
            is_online: online,
            pending_count: queue.len(),
            last_sync_at,
            sync_in_progress: false,
        };
        let (status, _) = watch::channel(initial);

        let list_cap = config.operator_list_max_items;
        let conflicts = restore_list::<ConflictRecord>(&store, CONFLICTS_KEY, list_cap);
        let failed = restore_list::<FailedItem>(&store, FAILED_KEY, list_cap);
        if !conflicts.is_empty() || !failed.is_empty() {
            info!(
                conflicts = conflicts.len(),
                failed = failed.len(),
                "Restored unresolved items from previous session"
            );
        }

        Self {
            queue,
            remote,
            store,
            clock,
            resolver: Arc::new(SurfaceToOperator),
            observers: RwLock::new(Vec::new()),
            status,
            syncing: AtomicBool::new(false),
            failed_passes: AtomicU32::new(0),
            conflicts: Mutex::new(conflicts),
            failed: Mutex::new(failed),
            list_cap,
            interval: config.sync_interval(),
            backoff: config.sync_backoff(),
        }
    }

    /// Replace the default [`SurfaceToOperator`] strategy.
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn add_observer(&self, observer: Arc<dyn SyncObserver>) {
        self.observers.write().push(observer);
    }

    #[must_use]
    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    #[must_use]
    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    /// Re-read the queue depth into the published status.
    pub fn refresh_pending(&self) {
        let pending = self.queue.len();
        self.status.send_if_modified(|s| {
            let changed = s.pending_count != pending;
            s.pending_count = pending;
            changed
        });
    }

    /// Connectivity changed. Going online starts a pass right away.
    pub async fn set_online(&self, online: bool) -> Option<SyncOutcome> {
        let was_online = self.status.borrow().is_online;
        self.status.send_if_modified(|s| {
            let changed = s.is_online != online;
            s.is_online = online;
            changed
        });

        match (was_online, online) {
            (false, true) => {
                info!("Connectivity restored, starting sync");
                Some(self.sync_pass(SyncTrigger::Reconnect).await)
            }
            (true, false) => {
                info!(pending = self.queue.len(), "Connectivity lost, writes will queue");
                None
            }
            _ => None,
        }
    }

    /// Run a pass now, even if the queue is empty.
    pub async fn force_sync(&self) -> SyncOutcome {
        self.sync_pass(SyncTrigger::Forced).await
    }

    /// Periodic loop: one pass per interval while online, with exponential
    /// backoff after passes that left work behind. Exits when `shutdown`
    /// flips to `true` or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.interval, "Sync loop started");
        loop {
            let delay = self.next_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    if self.status.borrow().is_online {
                        self.sync_pass(SyncTrigger::Periodic).await;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Sync loop stopped");
    }

    /// Delay before the next periodic pass.
    #[must_use]
    pub fn next_delay(&self) -> Duration {
        match self.failed_passes.load(Ordering::Acquire) {
            0 => self.interval,
            n => self.backoff.delay_for(n - 1).min(self.interval),
        }
    }

    /// Conflicts waiting for an operator.
    #[must_use]
    pub fn conflicts(&self) -> Vec<ConflictRecord> {
        self.conflicts.lock().clone()
    }

    pub fn acknowledge_conflict(&self, id: &str) -> bool {
        let removed = {
            let mut conflicts = self.conflicts.lock();
            let before = conflicts.len();
            conflicts.retain(|c| c.id != id);
            conflicts.len() != before
        };
        if removed {
            self.persist_conflicts();
        }
        removed
    }

    /// Writes that ran out of retries or aged out.
    #[must_use]
    pub fn failed_items(&self) -> Vec<FailedItem> {
        self.failed.lock().clone()
    }

    pub fn dismiss_failed(&self, id: &str) -> bool {
        let removed = {
            let mut failed = self.failed.lock();
            let before = failed.len();
            failed.retain(|f| f.item.id != id);
            failed.len() != before
        };
        if removed {
            self.persist_failed();
        }
        removed
    }

    /// Put a permanently failed write back in the queue with a fresh budget.
    pub fn retry_failed(&self, id: &str) -> Option<String> {
        let item = {
            let mut failed = self.failed.lock();
            let pos = failed.iter().position(|f| f.item.id == id)?;
            failed.remove(pos).item
        };
        self.persist_failed();
        let queue_id = self.queue.enqueue(item.operation);
        self.refresh_pending();
        Some(queue_id)
    }

    #[tracing::instrument(skip(self), fields(pending))]
    async fn sync_pass(&self, trigger: SyncTrigger) -> SyncOutcome {
        let start = Instant::now();

        if !self.status.borrow().is_online {
            crate::metrics::record_sync_pass("skipped_offline", start.elapsed());
            return SyncOutcome::Skipped(SkipReason::Offline);
        }
        if self.syncing.swap(true, Ordering::AcqRel) {
            debug!("Sync already in progress");
            return SyncOutcome::Skipped(SkipReason::AlreadyRunning);
        }
        let _guard = SyncGuard(&self.syncing);

        let pending = self.queue.len();
        tracing::Span::current().record("pending", pending);
        if pending == 0 && trigger != SyncTrigger::Forced {
            crate::metrics::record_sync_pass("skipped_empty", start.elapsed());
            return SyncOutcome::Skipped(SkipReason::NothingPending);
        }

        self.status.send_modify(|s| s.sync_in_progress = true);

        let remote = &self.remote;
        let drain = self
            .queue
            .drain(|mutation| async move {
                match remote.apply_mutation(&mutation).await {
                    Ok(MutationOutcome::Applied) => Ok(()),
                    Ok(MutationOutcome::Conflict { server_state }) => {
                        Err(ReplayError::Conflict { server_state })
                    }
                    Err(RemoteError::Unavailable(reason)) => Err(ReplayError::Unavailable(reason)),
                    Err(e) => Err(ReplayError::Failed(e.to_string())),
                }
            })
            .await;

        let now = self.clock.now_millis();
        let observers = self.observers.read().clone();

        for item in &drain.succeeded {
            for observer in &observers {
                observer.on_applied(item);
            }
        }

        for evicted in drain.evicted.iter().cloned() {
            let failed = FailedItem {
                item: evicted.item,
                reason: evicted.reason,
                failed_at: now,
            };
            warn!(
                id = %failed.item.id,
                operation = %failed.item.operation.operation_type,
                reason = %failed.reason,
                "Write permanently failed"
            );
            for observer in &observers {
                observer.on_failed(&failed);
            }
            push_capped(&mut *self.failed.lock(), failed, self.list_cap, "failed");
        }
        if !drain.evicted.is_empty() {
            self.persist_failed();
        }

        let mut surfaced = false;
        for conflicted in drain.conflicted.iter().cloned() {
            let conflict = ConflictRecord {
                id: conflicted.item.id,
                mutation: conflicted.item.operation,
                server_state: conflicted.server_state,
                detected_at: now,
            };
            let resolution = self.resolver.resolve(&conflict);
            let requeued_as = match &resolution {
                Resolution::Requeue(mutation) => Some(self.queue.enqueue(mutation.clone())),
                Resolution::Surface | Resolution::Discard => None,
            };
            info!(id = %conflict.id, ?resolution, "Conflict resolved");
            for observer in &observers {
                observer.on_conflict(&conflict, &resolution, requeued_as.as_deref());
            }
            if resolution == Resolution::Surface {
                push_capped(&mut *self.conflicts.lock(), conflict, self.list_cap, "conflicts");
                surfaced = true;
            }
        }
        if surfaced {
            self.persist_conflicts();
        }

        if drain.left_work_behind() {
            self.failed_passes.fetch_add(1, Ordering::AcqRel);
        } else {
            self.failed_passes.store(0, Ordering::Release);
        }

        let pending = self.queue.len();
        let completed = !drain.aborted;
        self.status.send_modify(|s| {
            s.sync_in_progress = false;
            s.pending_count = pending;
            if completed {
                s.last_sync_at = Some(now);
            }
        });
        if completed {
            self.persist_status();
        }

        let report = SyncReport {
            trigger,
            succeeded: drain.succeeded.len(),
            failed: drain.failed.len(),
            evicted: drain.evicted.len(),
            conflicted: drain.conflicted.len(),
            deferred: drain.deferred,
            aborted: drain.aborted,
            duration: start.elapsed(),
        };
        crate::metrics::record_sync_pass(if report.is_clean() { "clean" } else { "partial" }, report.duration);
        info!(
            %trigger,
            succeeded = report.succeeded,
            failed = report.failed,
            evicted = report.evicted,
            conflicted = report.conflicted,
            pending,
            "Sync pass complete"
        );

        SyncOutcome::Completed(report)
    }

    fn persist_status(&self) {
        let status = self.status();
        match serde_json::to_value(&status) {
            Ok(value) => {
                if !self.store.set(STATUS_KEY, value, SetOptions::default()) {
                    warn!("Sync status could not be persisted");
                }
            }
            Err(e) => warn!(error = %e, "Sync status could not be serialized"),
        }
    }

    fn persist_conflicts(&self) {
        let conflicts = self.conflicts.lock().clone();
        persist_list(&self.store, CONFLICTS_KEY, &conflicts);
    }

    fn persist_failed(&self) {
        let failed = self.failed.lock().clone();
        persist_list(&self.store, FAILED_KEY, &failed);
    }
}

fn restore_list<T: DeserializeOwned>(store: &TieredStore, key: &str, cap: usize) -> Vec<T> {
    let mut items = store.get_as::<Vec<T>>(key).unwrap_or_default();
    if items.len() > cap {
        items.drain(..items.len() - cap);
    }
    items
}

fn persist_list<T: Serialize>(store: &TieredStore, key: &str, items: &[T]) {
    if items.is_empty() {
        store.remove(key);
        return;
    }
    match serde_json::to_value(items) {
        Ok(value) => {
            if !store.set(key, value, SetOptions::default()) {
                warn!(key, "Operator list could not be persisted");
            }
        }
        Err(e) => warn!(key, error = %e, "Operator list could not be serialized"),
    }
}

/// Append, dropping the oldest entries beyond `cap`.
fn push_capped<T>(list: &mut Vec<T>, item: T, cap: usize, name: &str) {
    list.push(item);
    if list.len() > cap {
        let dropped = list.len() - cap;
        list.drain(..dropped);
        warn!(list = name, dropped, "Operator list full, dropped oldest entries");
    }
}

/// RAII guard to reset syncing flag
struct SyncGuard<'a>(&'a AtomicBool);

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
