// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The resilience layer: composition root for every component.
//!
//! [`ResilienceLayer`] probes the host, builds the tiered store, the offline
//! queue, the remote gateway, the sync orchestrator, the degradation
//! coordinator and the read-through cache, wires them together and exposes
//! the surface the UI talks to.
//!
//! ```text
//!   UI ──► ResilienceLayer ──► ReadThroughCache ──► RemoteGateway ──► RemoteApi
//!              │                     │ (write fails)
//!              │                     ▼
//!              │               OfflineWriteQueue ◄── SyncOrchestrator (reconnect / timer / force)
//!              │                     │                    │ SyncStatus (watch)
//!              ▼                     ▼                    ▼
//!      DegradationCoordinator ──► TieredStore ◄── CapabilityProbe
//! ```
//!
//! # Lifecycle
//!
//! ```text
//! Created → Running → ShuttingDown → Stopped
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use offline_resilience::{
//!     HostBindings, InMemoryBackend, InMemoryRemote, ResilienceConfig, ResilienceLayer,
//!     StaticPlatform, SystemClock,
//! };
//!
//! # #[tokio::main]
//! # async fn main() {
//! let host = HostBindings {
//!     persistent: Some(Arc::new(InMemoryBackend::new())),
//!     session: None,
//!     platform: Arc::new(StaticPlatform::online()),
//! };
//! let remote = Arc::new(InMemoryRemote::new("id"));
//! let layer = ResilienceLayer::new(ResilienceConfig::default(), host, remote, Arc::new(SystemClock))
//!     .expect("valid config");
//!
//! layer.start().await;
//! let marks = layer.get_collection("marks").await;
//! println!("{} records from {:?}", marks.records.len(), marks.source);
//! layer.shutdown().await;
//! # }
//! ```

mod api;
mod lifecycle;
mod types;

pub use types::{HostBindings, LayerHealth, LayerState};

use std::sync::Arc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::cache::ReadThroughCache;
use crate::capability::{CapabilityProbe, Platform};
use crate::clock::Clock;
use crate::config::{ConfigError, ResilienceConfig};
use crate::degradation::DegradationCoordinator;
use crate::queue::OfflineWriteQueue;
use crate::remote::{RemoteApi, RemoteGateway};
use crate::storage::TieredStore;
use crate::sync::{ConflictResolver, SurfaceToOperator, SyncOrchestrator};

pub struct ResilienceLayer {
    config: ResilienceConfig,
    platform: Arc<dyn Platform>,

    store: Arc<TieredStore>,
    queue: Arc<OfflineWriteQueue>,
    remote: Arc<RemoteGateway>,
    sync: Arc<SyncOrchestrator>,
    degradation: Arc<DegradationCoordinator>,
    cache: Arc<ReadThroughCache>,

    state: watch::Sender<LayerState>,
    state_rx: watch::Receiver<LayerState>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ResilienceLayer {
    /// Build the layer with the default [`SurfaceToOperator`] conflict strategy.
    pub fn new(
        config: ResilienceConfig,
        host: HostBindings,
        remote: Arc<dyn RemoteApi>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        Self::with_resolver(config, host, remote, clock, Arc::new(SurfaceToOperator))
    }

    pub fn with_resolver(
        config: ResilienceConfig,
        host: HostBindings,
        remote: Arc<dyn RemoteApi>,
        clock: Arc<dyn Clock>,
        resolver: Arc<dyn ConflictResolver>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let HostBindings {
            persistent,
            session,
            platform,
        } = host;

        let probe = CapabilityProbe::new(persistent.clone(), session.clone(), platform.clone());
        let capabilities = probe.probe();

        let store = Arc::new(TieredStore::new(
            persistent,
            session,
            config.memory_max_items,
            &capabilities,
            clock.clone(),
        ));
        let queue = Arc::new(OfflineWriteQueue::new(
            store.clone(),
            config.queue_domain.clone(),
            clock.clone(),
            config.queue_max_retries,
            config.queue_max_age(),
        ));
        let gateway = Arc::new(RemoteGateway::new(
            remote,
            config.remote_timeout(),
            config.circuit(),
        ));
        let sync = Arc::new(
            SyncOrchestrator::new(
                queue.clone(),
                gateway.clone(),
                store.clone(),
                clock.clone(),
                &config,
                capabilities.online,
            )
            .with_resolver(resolver),
        );
        let degradation = Arc::new(DegradationCoordinator::new(
            store.clone(),
            probe,
            clock.clone(),
            capabilities,
            config.emergency_max_items,
            config.deep_queue_threshold,
        ));
        let cache = Arc::new(ReadThroughCache::new(
            store.clone(),
            queue.clone(),
            gateway.clone(),
            clock,
            sync.subscribe(),
            config.cache_ttl(),
            config.cache_schema_version,
            config.record_id_field.clone(),
            config.fetch_retry(),
        ));
        sync.add_observer(cache.clone());
        degradation.on_sync_status(&sync.status());

        info!(
            tier = %store.current_tier(),
            level = %degradation.level(),
            online = capabilities.online,
            pending = queue.len(),
            "Resilience layer constructed"
        );

        let (state, state_rx) = watch::channel(LayerState::Created);
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            platform,
            store,
            queue,
            remote: gateway,
            sync,
            degradation,
            cache,
            state,
            state_rx,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn state(&self) -> LayerState {
        *self.state_rx.borrow()
    }

    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<LayerState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    // Component access for hosts that need more than the UI surface.

    #[must_use]
    pub fn store(&self) -> &Arc<TieredStore> {
        &self.store
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<OfflineWriteQueue> {
        &self.queue
    }

    #[must_use]
    pub fn sync(&self) -> &Arc<SyncOrchestrator> {
        &self.sync
    }

    #[must_use]
    pub fn degradation(&self) -> &Arc<DegradationCoordinator> {
        &self.degradation
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<ReadThroughCache> {
        &self.cache
    }

    /// Push the queue depth into the sync status and the degradation level.
    fn publish(&self) {
        self.sync.refresh_pending();
        self.degradation.on_sync_status(&self.sync.status());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::StaticPlatform;
    use crate::clock::ManualClock;
    use crate::degradation::DegradationLevel;
    use crate::remote::InMemoryRemote;
    use crate::storage::{InMemoryBackend, StorageTier};

    fn host(platform: Arc<StaticPlatform>) -> HostBindings {
        HostBindings {
            persistent: Some(Arc::new(InMemoryBackend::new())),
            session: Some(Arc::new(InMemoryBackend::new())),
            platform,
        }
    }

    #[test]
    fn test_construction_picks_best_tier() {
        let layer = ResilienceLayer::new(
            ResilienceConfig::default(),
            host(Arc::new(StaticPlatform::online())),
            Arc::new(InMemoryRemote::new("id")),
            Arc::new(ManualClock::default()),
        )
        .unwrap();

        assert_eq!(layer.state(), LayerState::Created);
        assert_eq!(layer.store().current_tier(), StorageTier::Persistent);
        assert_eq!(layer.degradation().level(), DegradationLevel::None);
        assert!(layer.sync().status().is_online);
    }

    #[test]
    fn test_memory_only_host_is_full() {
        let layer = ResilienceLayer::new(
            ResilienceConfig::default(),
            HostBindings::memory_only(Arc::new(StaticPlatform::online())),
            Arc::new(InMemoryRemote::new("id")),
            Arc::new(ManualClock::default()),
        )
        .unwrap();
        assert_eq!(layer.store().current_tier(), StorageTier::Memory);
        assert_eq!(layer.degradation().level(), DegradationLevel::Full);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = ResilienceConfig {
            queue_max_retries: 0,
            ..Default::default()
        };
        let result = ResilienceLayer::new(
            config,
            host(Arc::new(StaticPlatform::online())),
            Arc::new(InMemoryRemote::new("id")),
            Arc::new(ManualClock::default()),
        );
        assert!(matches!(result, Err(ConfigError::Invalid { field: "queue_max_retries", .. })));
    }

    #[test]
    fn test_offline_platform_starts_offline() {
        let layer = ResilienceLayer::new(
            ResilienceConfig::default(),
            host(Arc::new(StaticPlatform::offline())),
            Arc::new(InMemoryRemote::new("id")),
            Arc::new(ManualClock::default()),
        )
        .unwrap();
        assert!(!layer.sync().status().is_online);
        assert_eq!(layer.degradation().level(), DegradationLevel::Partial);
    }
}
