// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;

use super::{MutationOutcome, RemoteApi, RemoteError};
use crate::queue::Mutation;

/// In-process remote API.
///
/// Holds collections in memory and applies mutations to them. Connectivity,
/// latency, one-shot failures and per-record conflicts can be scripted at
/// runtime, which makes it the stand-in for the real service in tests and
/// demos.
pub struct InMemoryRemote {
    collections: DashMap<String, Vec<Value>>,
    id_field: String,
    online: AtomicBool,
    latency: Mutex<Option<Duration>>,
    scripted_failures: Mutex<VecDeque<RemoteError>>,
    /// record_id -> server state reported on the next write to it
    conflicts: DashMap<String, Value>,
    applied: Mutex<Vec<Mutation>>,
    calls: AtomicU64,
}

impl InMemoryRemote {
    pub fn new(id_field: impl Into<String>) -> Self {
        Self {
            collections: DashMap::new(),
            id_field: id_field.into(),
            online: AtomicBool::new(true),
            latency: Mutex::new(None),
            scripted_failures: Mutex::new(VecDeque::new()),
            conflicts: DashMap::new(),
            applied: Mutex::new(Vec::new()),
            calls: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn with_collection(self, name: impl Into<String>, records: Vec<Value>) -> Self {
        self.collections.insert(name.into(), records);
        self
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Fail the next call (of either kind) with `error`. Stacks FIFO.
    pub fn fail_next(&self, error: RemoteError) {
        self.scripted_failures.lock().push_back(error);
    }

    /// Report a conflict on the next write to `record_id`.
    pub fn conflict_on(&self, record_id: impl Into<String>, server_state: Value) {
        self.conflicts.insert(record_id.into(), server_state);
    }

    /// Mutations accepted so far, in order.
    #[must_use]
    pub fn applied(&self) -> Vec<Mutation> {
        self.applied.lock().clone()
    }

    #[must_use]
    pub fn collection(&self, name: &str) -> Vec<Value> {
        self.collections
            .get(name)
            .map(|r| r.value().clone())
            .unwrap_or_default()
    }

    /// Calls that reached this remote (including failed ones).
    #[must_use]
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    async fn enter(&self) -> Result<(), RemoteError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if !self.online.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable("offline".into()));
        }
        if let Some(error) = self.scripted_failures.lock().pop_front() {
            return Err(error);
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteApi for InMemoryRemote {
    async fn get_collection(&self, name: &str) -> Result<Vec<Value>, RemoteError> {
        self.enter().await?;
        Ok(self.collection(name))
    }

    async fn apply_mutation(&self, mutation: &Mutation) -> Result<MutationOutcome, RemoteError> {
        self.enter().await?;

        if let Some(target) = &mutation.target {
            if let Some((_, server_state)) = self.conflicts.remove(&target.record_id) {
                return Ok(MutationOutcome::Conflict {
                    server_state: Some(server_state),
                });
            }
            let mut records = self.collections.entry(target.collection.clone()).or_default();
            mutation.apply_to(&mut records, &self.id_field);
        }

        self.applied.lock().push(mutation.clone());
        Ok(MutationOutcome::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_applies_mutations_to_collections() {
        let remote = InMemoryRemote::new("id").with_collection("marks", vec![json!({"id": "a", "score": 1})]);

        let outcome = remote
            .apply_mutation(&Mutation::upsert("updateMark", "marks", "a", json!({"score": 2})))
            .await
            .unwrap();
        assert_eq!(outcome, MutationOutcome::Applied);
        assert_eq!(remote.collection("marks"), vec![json!({"id": "a", "score": 2})]);
        assert_eq!(remote.applied().len(), 1);
    }

    #[tokio::test]
    async fn test_offline_and_scripted_failures() {
        let remote = InMemoryRemote::new("id");
        remote.set_online(false);
        assert!(matches!(remote.get_collection("x").await, Err(RemoteError::Unavailable(_))));

        remote.set_online(true);
        remote.fail_next(RemoteError::Rejected("bad".into()));
        assert_eq!(
            remote.get_collection("x").await,
            Err(RemoteError::Rejected("bad".into()))
        );
        assert!(remote.get_collection("x").await.is_ok());
        assert_eq!(remote.calls(), 3);
    }

    #[tokio::test]
    async fn test_conflict_fires_once() {
        let remote = InMemoryRemote::new("id");
        remote.conflict_on("a", json!({"id": "a", "score": 9}));
        let m = Mutation::upsert("updateMark", "marks", "a", json!({"score": 1}));

        assert!(matches!(
            remote.apply_mutation(&m).await.unwrap(),
            MutationOutcome::Conflict { server_state: Some(_) }
        ));
        assert_eq!(remote.apply_mutation(&m).await.unwrap(), MutationOutcome::Applied);
        assert!(remote.applied().len() == 1);
    }
}
