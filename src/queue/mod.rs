// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Offline write queue.
//!
//! Writes that could not reach the remote API wait here until the sync
//! orchestrator replays them. The queue lives in the tiered store under
//! `queue:<domain>` and is re-persisted after every change, so it survives
//! restarts whenever the active tier does.
//!
//! This is NOT a retry loop. [`OfflineWriteQueue::drain`] makes exactly one
//! attempt per item per pass; scheduling passes is the orchestrator's job.

pub mod mutation;

pub use mutation::{Mutation, MutationAction, QueueItem, RecordRef};

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::storage::{SetOptions, TieredStore};

/// Why a single replay did not go through.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReplayError {
    /// Connectivity is gone; the pass stops and nobody is charged a retry
    #[error("remote unavailable: {0}")]
    Unavailable(String),
    /// The attempt failed; counts against the item's retry budget
    #[error("replay failed: {0}")]
    Failed(String),
    /// The server holds a different version; never replayed blindly
    #[error("conflict with server state")]
    Conflict { server_state: Option<Value> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EvictionReason {
    MaxRetries,
    MaxAge,
}

impl std::fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MaxRetries => write!(f, "max retries"),
            Self::MaxAge => write!(f, "max age"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvictedItem {
    pub item: QueueItem,
    pub reason: EvictionReason,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConflictedItem {
    pub item: QueueItem,
    pub server_state: Option<Value>,
}

/// Result of one drain pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    pub succeeded: Vec<QueueItem>,
    /// Charged a retry and still queued
    pub failed: Vec<QueueItem>,
    pub evicted: Vec<EvictedItem>,
    pub conflicted: Vec<ConflictedItem>,
    /// Skipped because an earlier item for the same record failed
    pub deferred: usize,
    /// The pass stopped early on [`ReplayError::Unavailable`]
    pub aborted: bool,
}

impl DrainReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.succeeded.is_empty()
            && self.failed.is_empty()
            && self.evicted.is_empty()
            && self.conflicted.is_empty()
            && self.deferred == 0
    }

    /// Anything that will need another pass.
    #[must_use]
    pub fn left_work_behind(&self) -> bool {
        !self.failed.is_empty() || self.deferred > 0 || self.aborted
    }
}

/// Queue state for observability
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub domain: String,
    pub pending: usize,
    /// Epoch millis of the oldest pending item
    pub oldest_enqueued_at: Option<i64>,
    pub total_enqueued: u64,
    pub total_replayed: u64,
    pub total_evicted: u64,
    pub draining: bool,
}

pub struct OfflineWriteQueue {
    domain: String,
    storage_key: String,
    store: Arc<TieredStore>,
    clock: Arc<dyn Clock>,
    max_retries: u32,
    max_age: Duration,
    items: Mutex<Vec<QueueItem>>,
    draining: AtomicBool,
    total_enqueued: AtomicU64,
    total_replayed: AtomicU64,
    total_evicted: AtomicU64,
}

impl OfflineWriteQueue {
    /// Open the queue for `domain`, reloading anything persisted earlier.
    pub fn new(
        store: Arc<TieredStore>,
        domain: impl Into<String>,
        clock: Arc<dyn Clock>,
        max_retries: u32,
        max_age: Duration,
    ) -> Self {
        let domain = domain.into();
        let storage_key = format!("queue:{}", domain);
        let items: Vec<QueueItem> = store.get_as(&storage_key).unwrap_or_default();

        if !items.is_empty() {
            warn!(domain = %domain, pending = items.len(), "Queue has items from previous run, will replay");
        }
        crate::metrics::set_queue_depth(&domain, items.len());

        Self {
            domain,
            storage_key,
            store,
            clock,
            max_retries: max_retries.max(1),
            max_age,
            items: Mutex::new(items),
            draining: AtomicBool::new(false),
            total_enqueued: AtomicU64::new(0),
            total_replayed: AtomicU64::new(0),
            total_evicted: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Append `operation` and return the queue id.
    pub fn enqueue(&self, operation: Mutation) -> String {
        let item = QueueItem::new(operation, self.clock.now_millis());
        let id = item.id.clone();

        debug!(
            domain = %self.domain,
            id = %id,
            operation = %item.operation.operation_type,
            "Mutation queued"
        );

        {
            let mut items = self.items.lock();
            items.push(item);
            self.persist(&items);
        }
        self.total_enqueued.fetch_add(1, Ordering::Relaxed);
        id
    }

    /// Pending items in FIFO order.
    #[must_use]
    pub fn list(&self) -> Vec<QueueItem> {
        self.items.lock().clone()
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<QueueItem> {
        self.items.lock().iter().find(|i| i.id == id).cloned()
    }

    pub fn remove(&self, id: &str) -> bool {
        self.take(id).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Drop every pending item.
    pub fn clear(&self) -> usize {
        let mut items = self.items.lock();
        let dropped = items.len();
        items.clear();
        self.persist(&items);
        if dropped > 0 {
            warn!(domain = %self.domain, dropped, "Queue cleared");
        }
        dropped
    }

    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let items = self.items.lock();
        QueueStats {
            domain: self.domain.clone(),
            pending: items.len(),
            oldest_enqueued_at: items.iter().map(|i| i.enqueued_at).min(),
            total_enqueued: self.total_enqueued.load(Ordering::Relaxed),
            total_replayed: self.total_replayed.load(Ordering::Relaxed),
            total_evicted: self.total_evicted.load(Ordering::Relaxed),
            draining: self.draining.load(Ordering::Acquire),
        }
    }

    /// Replay pending items in enqueue order, one attempt each.
    ///
    /// A concurrent call returns an empty report instead of double-replaying.
    pub async fn drain<F, Fut>(&self, mut execute: F) -> DrainReport
    where
        F: FnMut(Mutation) -> Fut,
        Fut: Future<Output = Result<(), ReplayError>>,
    {
        if self.draining.swap(true, Ordering::AcqRel) {
            debug!(domain = %self.domain, "Drain already in progress");
            return DrainReport::default();
        }
        let _guard = DrainGuard(&self.draining);

        let snapshot = self.list();
        if snapshot.is_empty() {
            return DrainReport::default();
        }
        info!(domain = %self.domain, pending = snapshot.len(), "Starting queue drain");

        let max_age_millis = i64::try_from(self.max_age.as_millis()).unwrap_or(i64::MAX);
        let mut report = DrainReport::default();
        let mut blocked = HashSet::new();

        for item in snapshot {
            let now = self.clock.now_millis();

            if item.age_millis(now) > max_age_millis {
                if let Some(item) = self.take(&item.id) {
                    warn!(domain = %self.domain, id = %item.id, "Queued mutation too old, evicted");
                    report.evicted.push(EvictedItem {
                        item,
                        reason: EvictionReason::MaxAge,
                    });
                }
                continue;
            }

            if let Some(target) = &item.operation.target {
                if blocked.contains(target) {
                    report.deferred += 1;
                    continue;
                }
            }

            match execute(item.operation.clone()).await {
                Ok(()) => {
                    if let Some(item) = self.take(&item.id) {
                        report.succeeded.push(item);
                    }
                }
                Err(ReplayError::Conflict { server_state }) => {
                    if let Some(item) = self.take(&item.id) {
                        warn!(domain = %self.domain, id = %item.id, "Replay hit a conflict");
                        report.conflicted.push(ConflictedItem { item, server_state });
                    }
                }
                Err(ReplayError::Unavailable(reason)) => {
                    info!(domain = %self.domain, reason = %reason, "Remote unavailable, pausing drain");
                    report.aborted = true;
                    break;
                }
                Err(ReplayError::Failed(reason)) => {
                    if let Some(target) = &item.operation.target {
                        blocked.insert(target.clone());
                    }
                    match self.charge_retry(&item.id, now, reason) {
                        Some((updated, true)) => report.evicted.push(EvictedItem {
                            item: updated,
                            reason: EvictionReason::MaxRetries,
                        }),
                        Some((updated, false)) => report.failed.push(updated),
                        None => {}
                    }
                }
            }
        }

        self.total_replayed
            .fetch_add(report.succeeded.len() as u64, Ordering::Relaxed);
        self.total_evicted
            .fetch_add(report.evicted.len() as u64, Ordering::Relaxed);
        crate::metrics::record_drain(
            &self.domain,
            report.succeeded.len(),
            report.failed.len(),
            report.evicted.len(),
            report.conflicted.len(),
        );

        info!(
            domain = %self.domain,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            evicted = report.evicted.len(),
            conflicted = report.conflicted.len(),
            deferred = report.deferred,
            aborted = report.aborted,
            "Queue drain complete"
        );
        report
    }

    /// Record a failed attempt. Returns the updated item and whether it was
    /// evicted for running out of retries.
    fn charge_retry(&self, id: &str, now: i64, reason: String) -> Option<(QueueItem, bool)> {
        let mut items = self.items.lock();
        let pos = items.iter().position(|i| i.id == id)?;

        let item = &mut items[pos];
        item.retry_count += 1;
        item.last_attempt_at = Some(now);
        item.last_error = Some(reason);

        let result = if item.retry_count >= self.max_retries {
            let evicted = items.remove(pos);
            warn!(
                domain = %self.domain,
                id = %evicted.id,
                retries = evicted.retry_count,
                error = evicted.last_error.as_deref().unwrap_or_default(),
                "Queued mutation exhausted retries, evicted"
            );
            (evicted, true)
        } else {
            debug!(domain = %self.domain, id, retries = item.retry_count, "Replay failed, will retry");
            (item.clone(), false)
        };

        self.persist(&items);
        Some(result)
    }

    fn take(&self, id: &str) -> Option<QueueItem> {
        let mut items = self.items.lock();
        let pos = items.iter().position(|i| i.id == id)?;
        let item = items.remove(pos);
        self.persist(&items);
        Some(item)
    }

    fn persist(&self, items: &[QueueItem]) {
        crate::metrics::set_queue_depth(&self.domain, items.len());
        let value = match serde_json::to_value(items) {
            Ok(value) => value,
            Err(e) => {
                warn!(domain = %self.domain, error = %e, "Queue could not be serialized");
                return;
            }
        };
        if !self.store.set(&self.storage_key, value, SetOptions::default()) {
            warn!(domain = %self.domain, "Queue could not be persisted, kept in process only");
        }
    }
}

/// RAII guard to reset draining flag
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
