// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Layer lifecycle: start the background tasks, stop them again.

use tracing::{info, warn};

use super::{LayerState, ResilienceLayer};

impl ResilienceLayer {
    /// Start the sync loop and the degradation watcher.
    ///
    /// Startup flow:
    /// 1. Sweep expired items out of the active tier
    /// 2. Publish the recovered queue depth
    /// 3. Replay writes left over from a previous run (if online)
    /// 4. Spawn the periodic sync loop and the status → degradation watcher
    ///
    /// Returns false if the layer was already started.
    #[tracing::instrument(skip(self), fields(pending, online))]
    pub async fn start(&self) -> bool {
        if self.state() != LayerState::Created {
            warn!(state = %self.state(), "Layer already started");
            return false;
        }
        let startup_start = std::time::Instant::now();
        info!("Starting resilience layer...");

        let purged = self.store.cleanup_expired();
        if purged > 0 {
            info!(purged, "Expired items removed at startup");
        }

        self.publish();
        let status = self.sync.status();
        tracing::Span::current().record("pending", status.pending_count);
        tracing::Span::current().record("online", status.is_online);

        if status.is_online && status.pending_count > 0 {
            info!(pending = status.pending_count, "Replaying writes from previous session");
            self.sync.force_sync().await;
            self.publish();
        }

        let mut tasks = Vec::with_capacity(2);

        let sync = self.sync.clone();
        let shutdown = self.shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            sync.run(shutdown).await;
        }));

        let degradation = self.degradation.clone();
        let status_rx = self.sync.subscribe();
        let mut shutdown = self.shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            tokio::select! {
                _ = degradation.watch_sync_status(status_rx) => {}
                _ = shutdown.wait_for(|stop| *stop) => {}
            }
        }));

        self.tasks.lock().extend(tasks);
        self.state.send_replace(LayerState::Running);

        info!(
            tier = %self.store.current_tier(),
            level = %self.degradation.level(),
            elapsed = ?startup_start.elapsed(),
            "Resilience layer running"
        );
        true
    }

    /// Stop the background tasks and wait for them to finish.
    ///
    /// A pass already in flight completes first; queued writes stay
    /// persisted for the next run.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        if matches!(self.state(), LayerState::ShuttingDown | LayerState::Stopped) {
            return;
        }
        info!("Initiating resilience layer shutdown...");
        self.state.send_replace(LayerState::ShuttingDown);
        self.shutdown.send_replace(true);

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        let pending = self.queue.len();
        if pending > 0 {
            info!(pending, "Writes still queued, will replay on next start");
        }
        self.state.send_replace(LayerState::Stopped);
        info!("Resilience layer shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;
    use serde_json::json;

    use crate::capability::StaticPlatform;
    use crate::clock::ManualClock;
    use crate::config::ResilienceConfig;
    use crate::layer::{HostBindings, LayerState, ResilienceLayer};
    use crate::queue::{Mutation, OfflineWriteQueue};
    use crate::remote::InMemoryRemote;
    use crate::storage::{InMemoryBackend, StorageBackend, TieredStore};
    use crate::capability::Capabilities;

    fn layer_on(persistent: Arc<InMemoryBackend>, remote: Arc<InMemoryRemote>) -> ResilienceLayer {
        let host = HostBindings {
            persistent: Some(persistent),
            session: None,
            platform: Arc::new(StaticPlatform::online()),
        };
        ResilienceLayer::new(
            ResilienceConfig::default(),
            host,
            remote,
            Arc::new(ManualClock::default()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let layer = layer_on(Arc::new(InMemoryBackend::new()), Arc::new(InMemoryRemote::new("id")));
        let mut states = layer.state_receiver();

        assert!(layer.start().await);
        assert_eq!(layer.state(), LayerState::Running);
        assert!(!layer.start().await);
        assert!(layer.health_check().healthy);

        tokio::time::timeout(Duration::from_secs(5), layer.shutdown())
            .await
            .expect("shutdown should not hang");
        assert_eq!(layer.state(), LayerState::Stopped);
        assert!(states.has_changed().unwrap());

        // Idempotent
        layer.shutdown().await;
    }

    #[tokio::test]
    async fn test_state_tracked_without_subscribers() {
        let remote = Arc::new(InMemoryRemote::new("id"));
        let layer = layer_on(Arc::new(InMemoryBackend::new()), remote);

        assert!(layer.start().await);
        assert_eq!(layer.state(), LayerState::Running);
        assert!(layer.health_check().healthy);

        // Second start must not spawn a second set of tasks
        assert!(!layer.start().await);
        assert_eq!(layer.tasks.lock().len(), 2);

        layer.shutdown().await;
        assert_eq!(layer.state(), LayerState::Stopped);
        assert!(!layer.start().await);
    }

    #[tokio::test]
    async fn test_start_replays_previous_session() {
        let persistent = Arc::new(InMemoryBackend::new());
        let clock = Arc::new(ManualClock::default());

        // A previous run left one write behind
        {
            let caps = Capabilities {
                persistent_store: true,
                ..Default::default()
            };
            let backend: Arc<dyn StorageBackend> = persistent.clone();
            let store = Arc::new(TieredStore::new(Some(backend), None, 50, &caps, clock.clone()));
            let queue = OfflineWriteQueue::new(store, "mutations", clock, 5, Duration::from_secs(3600));
            queue.enqueue(Mutation::upsert("updateMark", "marks", "m1", json!({"score": 8})));
        }

        let remote = Arc::new(InMemoryRemote::new("id"));
        let layer = layer_on(persistent, remote.clone());
        assert_eq!(layer.sync_status().pending_count, 1);

        layer.start().await;
        assert_eq!(layer.sync_status().pending_count, 0);
        assert_eq!(remote.collection("marks"), vec![json!({"id": "m1", "score": 8})]);
        layer.shutdown().await;
    }
}
