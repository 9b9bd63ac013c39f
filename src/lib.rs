//! # Offline Resilience
//!
//! A client-side resilience layer that keeps a data-entry application usable
//! when storage or connectivity disappears.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ResilienceLayer                        │
//! │  • get/set/remove/keys, get_collection/mutate              │
//! │  • sync status, degradation level, recommendations         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    ReadThroughCache                         │
//! │  • Remote first while online, cached copy otherwise        │
//! │  • Failed writes queued and applied optimistically         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!              (writes that could not reach the remote)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │            OfflineWriteQueue + SyncOrchestrator             │
//! │  • FIFO replay on reconnect, timer or force_sync()         │
//! │  • Bounded retries, max-age eviction, conflict routing     │
//! │  • RemoteGateway: timeout + circuit breaker + health       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       TieredStore                           │
//! │  • Persistent → Session → Memory, chosen by capabilities   │
//! │  • TTL, fallback writes, migration on tier change          │
//! │  • DegradationCoordinator: emergency map while Full        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use offline_resilience::{
//!     FileBackend, HostBindings, InMemoryBackend, InMemoryRemote, Mutation, MutateOutcome,
//!     ResilienceConfig, ResilienceLayer, StaticPlatform, SystemClock,
//! };
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() {
//!     let host = HostBindings {
//!         persistent: Some(Arc::new(FileBackend::open("./resilience.json").expect("open store"))),
//!         session: Some(Arc::new(InMemoryBackend::new())),
//!         platform: Arc::new(StaticPlatform::online()),
//!     };
//!     let remote = Arc::new(InMemoryRemote::new("id"));
//!     let layer = ResilienceLayer::new(ResilienceConfig::default(), host, remote, Arc::new(SystemClock))
//!         .expect("valid config");
//!
//!     layer.start().await;
//!
//!     // Served remotely, cached for later
//!     let marks = layer.get_collection("marks").await;
//!     println!("{} marks ({:?})", marks.records.len(), marks.source);
//!
//!     // Applied now, or queued and replayed when the connection returns
//!     match layer.mutate(Mutation::upsert("updateMark", "marks", "m1", json!({"score": 7}))).await {
//!         MutateOutcome::Queued { queue_id } => println!("queued as {}", queue_id),
//!         other => println!("{:?}", other),
//!     }
//!
//!     layer.shutdown().await;
//! }
//! ```
//!
//! ## Features
//!
//! - **Tiered Storage**: Persistent → Session → Memory with transparent fallback
//! - **TTL**: Expired items read as absent and are swept on demand
//! - **Offline Queue**: Ordered, persisted, bounded retries and max age
//! - **Sync**: Single-flight passes with backoff and pluggable conflict resolution
//! - **Degradation**: None / Partial / Full levels with an emergency map
//! - **Read-Through Cache**: Offline collection reads with optimistic writes
//! - **Circuit Breakers**: Stop hammering a remote that is down
//!
//! ## Configuration
//!
//! See [`ResilienceConfig`] for all configuration options.
//!
//! ## Modules
//!
//! - [`layer`]: The [`ResilienceLayer`] composing all components
//! - [`storage`]: Backends and the [`TieredStore`]
//! - [`capability`]: Host capability detection
//! - [`queue`]: The offline write queue
//! - [`sync`]: Sync orchestration and conflict resolution
//! - [`degradation`]: Degradation levels and emergency storage
//! - [`cache`]: Read-through collection cache
//! - [`remote`]: The consumed remote API and its gateway
//! - [`resilience`]: Circuit breakers and retry logic

pub mod cache;
pub mod capability;
pub mod clock;
pub mod config;
pub mod degradation;
pub mod layer;
pub mod metrics;
pub mod queue;
pub mod remote;
pub mod resilience;
pub mod storage;
pub mod sync;

pub use cache::{CollectionRead, MutateOutcome, ReadSource, ReadThroughCache, SYNC_TAG};
pub use capability::{Capabilities, CapabilityProbe, Platform, StaticPlatform};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, ResilienceConfig};
pub use degradation::{DegradationCoordinator, DegradationLevel};
pub use layer::{HostBindings, LayerHealth, LayerState, ResilienceLayer};
pub use queue::{Mutation, MutationAction, OfflineWriteQueue, QueueItem, RecordRef};
pub use remote::{InMemoryRemote, MutationOutcome, RemoteApi, RemoteError, RemoteGateway};
pub use resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};
pub use resilience::retry::RetryConfig;
pub use storage::{
    BoundedMap, FileBackend, InMemoryBackend, SetOptions, StorageBackend, StorageError,
    StorageItem, StorageTier, TieredStore,
};
pub use sync::{
    ConflictRecord, ConflictResolver, FailedItem, Resolution, ServerWins, SurfaceToOperator,
    SyncObserver, SyncOutcome, SyncStatus, SyncOrchestrator,
};
pub use metrics::LatencyTimer;
