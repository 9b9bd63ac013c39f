// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Read-through collection cache with optimistic offline writes.
//!
//! Collections are cached in the tiered store under `cache:<name>` with the
//! configured TTL and a schema version. Reads prefer the remote API while
//! online and fall back to the cache; writes that cannot reach the remote are
//! queued and applied to the cached copy immediately, tagged so the UI can
//! show them as unsynced:
//!
//! ```json
//! { "id": "m1", "score": 9, "_sync": { "status": "pending", "op": "<queue id>" } }
//! ```
//!
//! The cache is a [`SyncObserver`]: when the orchestrator replays a queued
//! write the tag is cleared, or switched to `failed` / `conflict`.

use std::sync::Arc;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::queue::mutation::record_id_of;
use crate::queue::{Mutation, OfflineWriteQueue, QueueItem, RecordRef};
use crate::remote::{MutationOutcome, RemoteError, RemoteGateway};
use crate::resilience::retry::{retry_if, RetryConfig};
use crate::storage::{SetOptions, TieredStore};
use crate::sync::{ConflictRecord, FailedItem, Resolution, SyncObserver, SyncStatus};

/// Field carrying the optimistic sync state of a cached record.
pub const SYNC_TAG: &str = "_sync";

const KEY_PREFIX: &str = "cache:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    Remote,
    Cache,
    /// Neither the remote nor a valid cached copy could answer
    Unavailable,
}

impl ReadSource {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Remote => "remote",
            Self::Cache => "cache",
            Self::Unavailable => "unavailable",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectionRead {
    pub records: Vec<Value>,
    pub source: ReadSource,
    /// Not confirmed by the server during this read
    pub stale: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MutateOutcome {
    /// The remote accepted the write
    Applied,
    /// Stored for later replay and applied to the cache optimistically
    Queued { queue_id: String },
    Conflict { server_state: Option<Value> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CachedCollection {
    records: Vec<Value>,
    /// Epoch millis
    fetched_at: i64,
    schema_version: u32,
}

pub struct ReadThroughCache {
    store: Arc<TieredStore>,
    queue: Arc<OfflineWriteQueue>,
    remote: Arc<RemoteGateway>,
    clock: Arc<dyn Clock>,
    status: watch::Receiver<SyncStatus>,
    ttl: Duration,
    schema_version: u32,
    id_field: String,
    fetch_retry: RetryConfig,
}

impl ReadThroughCache {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<TieredStore>,
        queue: Arc<OfflineWriteQueue>,
        remote: Arc<RemoteGateway>,
        clock: Arc<dyn Clock>,
        status: watch::Receiver<SyncStatus>,
        ttl: Duration,
        schema_version: u32,
        id_field: impl Into<String>,
        fetch_retry: RetryConfig,
    ) -> Self {
        Self {
            store,
            queue,
            remote,
            clock,
            status,
            ttl,
            schema_version,
            id_field: id_field.into(),
            fetch_retry,
        }
    }

    fn is_online(&self) -> bool {
        self.status.borrow().is_online
    }

    /// Read a collection: remote while online (refreshing the cache), cache
    /// when offline or when the remote fails.
    pub async fn get_collection(&self, name: &str) -> CollectionRead {
        if !self.is_online() {
            debug!(collection = name, "Offline, serving from cache");
            return self.from_cache(name);
        }

        let remote = &self.remote;
        let fetched = retry_if(
            "get_collection",
            &self.fetch_retry,
            || remote.get_collection(name),
            RemoteError::is_transport,
        )
        .await;

        match fetched {
            Ok(mut records) => {
                self.reapply_pending(name, &mut records);
                self.write_cache(
                    name,
                    &CachedCollection {
                        records: records.clone(),
                        fetched_at: self.clock.now_millis(),
                        schema_version: self.schema_version,
                    },
                );
                crate::metrics::record_cache_read(ReadSource::Remote.as_str());
                CollectionRead {
                    records,
                    source: ReadSource::Remote,
                    stale: false,
                }
            }
            Err(e) => {
                warn!(collection = name, error = %e, "Remote read failed, falling back to cache");
                self.from_cache(name)
            }
        }
    }

    /// Send `mutation` to the remote, or queue it and apply it locally.
    pub async fn mutate(&self, mutation: Mutation) -> MutateOutcome {
        // Later edits must not overtake queued ones for the same record
        let must_queue = !self.is_online() || self.has_pending_for(&mutation);

        if !must_queue {
            match self.remote.apply_mutation(&mutation).await {
                Ok(MutationOutcome::Applied) => {
                    self.apply_locally(&mutation, None);
                    return MutateOutcome::Applied;
                }
                Ok(MutationOutcome::Conflict { server_state }) => {
                    if let (Some(target), Some(state)) = (&mutation.target, &server_state) {
                        self.replace_record(target, state.clone());
                    }
                    return MutateOutcome::Conflict { server_state };
                }
                Err(e) => {
                    info!(operation = %mutation.operation_type, error = %e, "Write not confirmed, queuing");
                }
            }
        }

        let queue_id = self.queue.enqueue(mutation.clone());
        self.apply_locally(&mutation, Some(&queue_id));
        MutateOutcome::Queued { queue_id }
    }

    /// Drop the cached copy of `name`.
    pub fn invalidate(&self, name: &str) -> bool {
        self.store.remove(&cache_key(name))
    }

    /// Names of collections with a live cached copy.
    #[must_use]
    pub fn cached_collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .store
            .keys()
            .into_iter()
            .filter_map(|k| k.strip_prefix(KEY_PREFIX).map(str::to_string))
            .collect();
        names.sort();
        names
    }

    fn from_cache(&self, name: &str) -> CollectionRead {
        match self.read_cache(name) {
            Some(cached) => {
                crate::metrics::record_cache_read(ReadSource::Cache.as_str());
                CollectionRead {
                    records: cached.records,
                    source: ReadSource::Cache,
                    stale: true,
                }
            }
            None => {
                crate::metrics::record_cache_read(ReadSource::Unavailable.as_str());
                CollectionRead {
                    records: Vec::new(),
                    source: ReadSource::Unavailable,
                    stale: false,
                }
            }
        }
    }

    fn read_cache(&self, name: &str) -> Option<CachedCollection> {
        let cached: CachedCollection = self.store.get_as(&cache_key(name))?;
        if cached.schema_version != self.schema_version {
            debug!(
                collection = name,
                cached = cached.schema_version,
                current = self.schema_version,
                "Cached collection from another schema version, dropping"
            );
            self.store.remove(&cache_key(name));
            return None;
        }
        Some(cached)
    }

    /// Store with whatever lifetime the copy has left.
    fn write_cache(&self, name: &str, cached: &CachedCollection) {
        let age = self.clock.now_millis().saturating_sub(cached.fetched_at).max(0) as u64;
        let Some(remaining) = self.ttl.checked_sub(Duration::from_millis(age)) else {
            return;
        };
        if remaining.is_zero() {
            return;
        }
        match serde_json::to_value(cached) {
            Ok(value) => {
                if !self.store.set(&cache_key(name), value, SetOptions::expiring(remaining)) {
                    warn!(collection = name, "Collection could not be cached");
                }
            }
            Err(e) => warn!(collection = name, error = %e, "Collection could not be serialized"),
        }
    }

    /// Edit one cached collection in place. No-op when nothing is cached.
    fn update_cached<F>(&self, name: &str, edit: F)
    where
        F: FnOnce(&mut Vec<Value>),
    {
        let Some(mut cached) = self.read_cache(name) else {
            return;
        };
        edit(&mut cached.records);
        self.write_cache(name, &cached);
    }

    fn has_pending_for(&self, mutation: &Mutation) -> bool {
        let Some(target) = &mutation.target else {
            return false;
        };
        self.queue
            .list()
            .iter()
            .any(|item| item.operation.target.as_ref() == Some(target))
    }

    fn apply_locally(&self, mutation: &Mutation, pending_op: Option<&str>) {
        let Some(collection) = mutation.collection() else {
            return;
        };
        let id_field = self.id_field.clone();
        self.update_cached(collection, |records| {
            if let Some(pos) = mutation.apply_to(records, &id_field) {
                match pending_op {
                    Some(op) => set_tag(&mut records[pos], json!({ "status": "pending", "op": op })),
                    None => clear_tag(&mut records[pos]),
                }
            }
        });
    }

    /// Layer still-queued edits for `name` over freshly fetched records.
    fn reapply_pending(&self, name: &str, records: &mut Vec<Value>) {
        for item in self.queue.list() {
            if item.operation.collection() != Some(name) {
                continue;
            }
            if let Some(pos) = item.operation.apply_to(records, &self.id_field) {
                set_tag(&mut records[pos], json!({ "status": "pending", "op": item.id }));
            }
        }
    }

    fn replace_record(&self, target: &RecordRef, state: Value) {
        let id_field = self.id_field.clone();
        self.update_cached(&target.collection, |records| {
            let pos = records
                .iter()
                .position(|r| record_id_of(r, &id_field).as_deref() == Some(target.record_id.as_str()));
            match pos {
                Some(pos) => records[pos] = state,
                None => records.push(state),
            }
        });
    }

    /// Run `edit` on the cached record `target` if it is still tagged with `op`.
    fn with_tagged_record<F>(&self, target: &RecordRef, op: &str, edit: F)
    where
        F: FnOnce(&mut Value),
    {
        let id_field = self.id_field.clone();
        self.update_cached(&target.collection, |records| {
            let record = records.iter_mut().find(|r| {
                record_id_of(r, &id_field).as_deref() == Some(target.record_id.as_str())
                    && r.get(SYNC_TAG).and_then(|t| t.get("op")).and_then(Value::as_str) == Some(op)
            });
            if let Some(record) = record {
                edit(record);
            }
        });
    }
}

impl SyncObserver for ReadThroughCache {
    fn on_applied(&self, item: &QueueItem) {
        if let Some(target) = &item.operation.target {
            self.with_tagged_record(target, &item.id, clear_tag);
        }
    }

    fn on_failed(&self, failed: &FailedItem) {
        if let Some(target) = &failed.item.operation.target {
            let tag = json!({
                "status": "failed",
                "op": failed.item.id,
                "error": failed.item.last_error,
            });
            self.with_tagged_record(target, &failed.item.id, |record| set_tag(record, tag));
        }
    }

    fn on_conflict(&self, conflict: &ConflictRecord, resolution: &Resolution, requeued_as: Option<&str>) {
        let Some(target) = &conflict.mutation.target else {
            return;
        };
        match resolution {
            Resolution::Surface => {
                let tag = json!({ "status": "conflict", "op": conflict.id });
                self.with_tagged_record(target, &conflict.id, |record| set_tag(record, tag));
            }
            Resolution::Requeue(_) => {
                if let Some(new_op) = requeued_as {
                    let tag = json!({ "status": "pending", "op": new_op });
                    self.with_tagged_record(target, &conflict.id, |record| set_tag(record, tag));
                }
            }
            Resolution::Discard => match &conflict.server_state {
                Some(state) => self.replace_record(target, state.clone()),
                None => {
                    self.invalidate(&target.collection);
                }
            },
        }
    }
}

fn cache_key(name: &str) -> String {
    format!("{}{}", KEY_PREFIX, name)
}

fn set_tag(record: &mut Value, tag: Value) {
    if let Value::Object(map) = record {
        map.insert(SYNC_TAG.to_string(), tag);
    }
}

fn clear_tag(record: &mut Value) {
    if let Value::Object(map) = record {
        map.remove(SYNC_TAG);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Capabilities;
    use crate::clock::ManualClock;
    use crate::config::ResilienceConfig;
    use crate::queue::EvictionReason;
    use crate::remote::InMemoryRemote;
    use crate::resilience::circuit_breaker::CircuitConfig;
    use crate::storage::InMemoryBackend;

    struct Fixture {
        remote: Arc<InMemoryRemote>,
        queue: Arc<OfflineWriteQueue>,
        clock: Arc<ManualClock>,
        status: watch::Sender<SyncStatus>,
        cache: ReadThroughCache,
    }

    fn fixture_with(schema_version: u32, store: Option<Arc<TieredStore>>) -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let store = store.unwrap_or_else(|| {
            let caps = Capabilities {
                persistent_store: true,
                ..Default::default()
            };
            Arc::new(TieredStore::new(
                Some(Arc::new(InMemoryBackend::new())),
                None,
                50,
                &caps,
                clock.clone(),
            ))
        });
        let config = ResilienceConfig::default();
        let queue = Arc::new(OfflineWriteQueue::new(
            store.clone(),
            "mutations",
            clock.clone(),
            3,
            config.queue_max_age(),
        ));
        let remote = Arc::new(InMemoryRemote::new("id").with_collection(
            "marks",
            vec![json!({"id": "m1", "score": 1}), json!({"id": "m2", "score": 2})],
        ));
        let gateway = Arc::new(RemoteGateway::new(
            remote.clone(),
            Duration::from_secs(5),
            CircuitConfig::lenient(),
        ));
        let (status, rx) = watch::channel(SyncStatus {
            is_online: true,
            ..Default::default()
        });
        let retry = RetryConfig {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            factor: 2.0,
            max_retries: Some(2),
        };
        let cache = ReadThroughCache::new(
            store,
            queue.clone(),
            gateway,
            clock.clone(),
            rx,
            Duration::from_secs(3600),
            schema_version,
            "id",
            retry,
        );
        Fixture { remote, queue, clock, status, cache }
    }

    fn fixture() -> Fixture {
        fixture_with(1, None)
    }

    impl Fixture {
        fn go_offline(&self) {
            self.status.send_modify(|s| s.is_online = false);
            self.remote.set_online(false);
        }

        fn go_online(&self) {
            self.status.send_modify(|s| s.is_online = true);
            self.remote.set_online(true);
        }
    }

    #[tokio::test]
    async fn test_online_read_populates_cache() {
        let f = fixture();
        let read = f.cache.get_collection("marks").await;
        assert_eq!(read.source, ReadSource::Remote);
        assert!(!read.stale);
        assert_eq!(read.records.len(), 2);
        assert_eq!(f.cache.cached_collections(), vec!["marks".to_string()]);

        f.go_offline();
        let read = f.cache.get_collection("marks").await;
        assert_eq!(read.source, ReadSource::Cache);
        assert!(read.stale);
        assert_eq!(read.records.len(), 2);
    }

    #[tokio::test]
    async fn test_offline_without_cache_is_unavailable() {
        let f = fixture();
        f.go_offline();
        let read = f.cache.get_collection("marks").await;
        assert_eq!(read.source, ReadSource::Unavailable);
        assert!(read.records.is_empty());
    }

    #[tokio::test]
    async fn test_remote_failure_falls_back_to_cache() {
        let f = fixture();
        f.cache.get_collection("marks").await;

        // Platform says online, remote disagrees
        f.remote.set_online(false);
        let read = f.cache.get_collection("marks").await;
        assert_eq!(read.source, ReadSource::Cache);
    }

    #[tokio::test]
    async fn test_expired_cache_is_not_served() {
        let f = fixture();
        f.cache.get_collection("marks").await;
        f.clock.advance(Duration::from_secs(3600));
        f.go_offline();
        assert_eq!(f.cache.get_collection("marks").await.source, ReadSource::Unavailable);
    }

    #[tokio::test]
    async fn test_schema_version_mismatch_drops_cache() {
        let f = fixture();
        f.cache.get_collection("marks").await;
        let store = f.cache.store.clone();

        let upgraded = fixture_with(2, Some(store));
        upgraded.go_offline();
        assert_eq!(upgraded.cache.get_collection("marks").await.source, ReadSource::Unavailable);
        assert!(upgraded.cache.cached_collections().is_empty());
    }

    #[tokio::test]
    async fn test_online_mutation_applies_and_updates_cache() {
        let f = fixture();
        f.cache.get_collection("marks").await;

        let outcome = f
            .cache
            .mutate(Mutation::upsert("updateMark", "marks", "m1", json!({"score": 5})))
            .await;
        assert_eq!(outcome, MutateOutcome::Applied);
        assert_eq!(f.remote.collection("marks")[0]["score"], json!(5));

        f.go_offline();
        let read = f.cache.get_collection("marks").await;
        assert_eq!(read.records[0], json!({"id": "m1", "score": 5}));
    }

    #[tokio::test]
    async fn test_offline_mutation_is_queued_and_tagged() {
        let f = fixture();
        f.cache.get_collection("marks").await;
        f.go_offline();

        let outcome = f
            .cache
            .mutate(Mutation::upsert("updateMark", "marks", "m1", json!({"score": 9})))
            .await;
        let MutateOutcome::Queued { queue_id } = outcome else {
            panic!("expected queued, got {:?}", outcome);
        };
        assert_eq!(f.queue.len(), 1);

        let read = f.cache.get_collection("marks").await;
        assert_eq!(read.records[0]["score"], json!(9));
        assert_eq!(read.records[0][SYNC_TAG], json!({"status": "pending", "op": queue_id}));
    }

    #[tokio::test]
    async fn test_refresh_reapplies_queued_edits() {
        let f = fixture();
        f.cache.get_collection("marks").await;
        f.go_offline();
        f.cache
            .mutate(Mutation::upsert("updateMark", "marks", "m2", json!({"score": 7})))
            .await;

        // Back online but not yet synced
        f.go_online();
        let read = f.cache.get_collection("marks").await;
        assert_eq!(read.source, ReadSource::Remote);
        assert_eq!(read.records[1]["score"], json!(7));
        assert_eq!(read.records[1][SYNC_TAG]["status"], json!("pending"));
    }

    #[tokio::test]
    async fn test_queued_edits_block_direct_writes_to_same_record() {
        let f = fixture();
        f.cache.get_collection("marks").await;
        f.go_offline();
        f.cache
            .mutate(Mutation::upsert("updateMark", "marks", "m1", json!({"score": 3})))
            .await;
        f.go_online();

        let outcome = f
            .cache
            .mutate(Mutation::upsert("updateMark", "marks", "m1", json!({"score": 4})))
            .await;
        assert!(matches!(outcome, MutateOutcome::Queued { .. }));

        // A different record goes straight through
        let outcome = f
            .cache
            .mutate(Mutation::upsert("updateMark", "marks", "m2", json!({"score": 4})))
            .await;
        assert_eq!(outcome, MutateOutcome::Applied);
    }

    #[tokio::test]
    async fn test_rejected_online_write_is_queued() {
        let f = fixture();
        f.remote.fail_next(RemoteError::Rejected("503".into()));
        let outcome = f
            .cache
            .mutate(Mutation::untargeted("sendMessage", json!({"body": "hi"})))
            .await;
        assert!(matches!(outcome, MutateOutcome::Queued { .. }));
    }

    #[tokio::test]
    async fn test_online_conflict_adopts_server_state() {
        let f = fixture();
        f.cache.get_collection("marks").await;
        f.remote.conflict_on("m1", json!({"id": "m1", "score": 42}));

        let outcome = f
            .cache
            .mutate(Mutation::upsert("updateMark", "marks", "m1", json!({"score": 1})))
            .await;
        assert_eq!(
            outcome,
            MutateOutcome::Conflict {
                server_state: Some(json!({"id": "m1", "score": 42}))
            }
        );
        f.go_offline();
        assert_eq!(f.cache.get_collection("marks").await.records[0]["score"], json!(42));
    }

    async fn queued_edit(f: &Fixture) -> QueueItem {
        f.cache.get_collection("marks").await;
        f.go_offline();
        f.cache
            .mutate(Mutation::upsert("updateMark", "marks", "m1", json!({"score": 9})))
            .await;
        f.queue.list().remove(0)
    }

    #[tokio::test]
    async fn test_observer_clears_tag_on_apply() {
        let f = fixture();
        let item = queued_edit(&f).await;

        f.cache.on_applied(&item);
        let read = f.cache.get_collection("marks").await;
        assert_eq!(read.records[0], json!({"id": "m1", "score": 9}));
    }

    #[tokio::test]
    async fn test_observer_marks_failed() {
        let f = fixture();
        let mut item = queued_edit(&f).await;
        item.last_error = Some("422".into());

        f.cache.on_failed(&FailedItem {
            item: item.clone(),
            reason: EvictionReason::MaxRetries,
            failed_at: 0,
        });
        let read = f.cache.get_collection("marks").await;
        assert_eq!(read.records[0][SYNC_TAG]["status"], json!("failed"));
        assert_eq!(read.records[0][SYNC_TAG]["error"], json!("422"));
    }

    #[tokio::test]
    async fn test_observer_conflict_resolutions() {
        let f = fixture();
        let item = queued_edit(&f).await;
        let conflict = ConflictRecord {
            id: item.id.clone(),
            mutation: item.operation.clone(),
            server_state: Some(json!({"id": "m1", "score": 100})),
            detected_at: 0,
        };

        f.cache.on_conflict(&conflict, &Resolution::Surface, None);
        let read = f.cache.get_collection("marks").await;
        assert_eq!(read.records[0][SYNC_TAG]["status"], json!("conflict"));

        f.cache.on_conflict(&conflict, &Resolution::Discard, None);
        let read = f.cache.get_collection("marks").await;
        assert_eq!(read.records[0], json!({"id": "m1", "score": 100}));
    }

    #[tokio::test]
    async fn test_invalidate() {
        let f = fixture();
        f.cache.get_collection("marks").await;
        assert!(f.cache.invalidate("marks"));
        assert!(f.cache.cached_collections().is_empty());
    }
}
