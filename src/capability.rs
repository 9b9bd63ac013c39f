// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Capability detection.
//!
//! [`CapabilityProbe`] answers "which primitives work right now?" with an
//! immutable [`Capabilities`] value. Storage backends are exercised with a
//! short write/read/delete cycle on a reserved key; everything else comes
//! from the host's [`Platform`]. Probing never fails and never retries.
//!
//! A backend that fails the cycle for lack of space is reported as unusable,
//! so tier selection skips it, and raises `quota_exceeded`. It becomes
//! selectable again on the first probe that finds room.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use offline_resilience::{CapabilityProbe, InMemoryBackend, StaticPlatform};
//!
//! let session = Arc::new(InMemoryBackend::new());
//! let probe = CapabilityProbe::new(None, Some(session), Arc::new(StaticPlatform::online()));
//!
//! let caps = probe.probe();
//! assert!(!caps.persistent_store);
//! assert!(caps.session_store);
//! assert!(caps.available());
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::storage::traits::{StorageBackend, StorageError, StorageTier};

/// Reserved key used by the probe cycle.
pub const PROBE_KEY: &str = "__resilience_probe__";

/// Snapshot of usable primitives. Recomputed on demand, never mutated in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub persistent_store: bool,
    pub session_store: bool,
    pub cache_store: bool,
    pub background_sync: bool,
    pub notifications: bool,
    pub quota_exceeded: bool,
    /// Online signal at probe time
    pub online: bool,
}

impl Capabilities {
    /// Whether any real storage tier works. Memory doesn't count.
    #[must_use]
    pub fn available(&self) -> bool {
        self.persistent_store || self.session_store
    }

    /// Most durable tier these capabilities allow. Memory is always possible.
    #[must_use]
    pub fn best_tier(&self) -> StorageTier {
        if self.persistent_store {
            StorageTier::Persistent
        } else if self.session_store {
            StorageTier::Session
        } else {
            StorageTier::Memory
        }
    }

    #[must_use]
    pub fn supports(&self, tier: StorageTier) -> bool {
        match tier {
            StorageTier::Persistent => self.persistent_store,
            StorageTier::Session => self.session_store,
            StorageTier::Memory => true,
            StorageTier::None => false,
        }
    }

    #[must_use]
    pub fn with_quota_exceeded(mut self, exceeded: bool) -> Self {
        self.quota_exceeded = exceeded;
        self
    }

    #[must_use]
    pub fn with_online(mut self, online: bool) -> Self {
        self.online = online;
        self
    }

    /// Mark a tier unusable (e.g. after a write failed on it).
    #[must_use]
    pub fn without(mut self, tier: StorageTier) -> Self {
        match tier {
            StorageTier::Persistent => self.persistent_store = false,
            StorageTier::Session => self.session_store = false,
            StorageTier::Memory | StorageTier::None => {}
        }
        self
    }
}

/// Host signals that are not keyed storage.
pub trait Platform: Send + Sync {
    fn is_online(&self) -> bool;

    fn cache_store(&self) -> bool {
        false
    }

    fn background_sync(&self) -> bool {
        false
    }

    fn notifications(&self) -> bool {
        false
    }
}

/// A [`Platform`] driven by flags the host flips.
#[derive(Debug, Default)]
pub struct StaticPlatform {
    online: AtomicBool,
    pub cache_store: bool,
    pub background_sync: bool,
    pub notifications: bool,
}

impl StaticPlatform {
    #[must_use]
    pub fn online() -> Self {
        Self {
            online: AtomicBool::new(true),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn offline() -> Self {
        Self::default()
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

impl Platform for StaticPlatform {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn cache_store(&self) -> bool {
        self.cache_store
    }

    fn background_sync(&self) -> bool {
        self.background_sync
    }

    fn notifications(&self) -> bool {
        self.notifications
    }
}

/// Result of probing one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendProbe {
    Usable,
    /// Reachable but full; not selectable until space frees up
    QuotaExceeded,
    Unavailable,
    /// No backend supplied for this tier
    Absent,
}

impl BackendProbe {
    #[must_use]
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Usable)
    }
}

pub struct CapabilityProbe {
    persistent: Option<Arc<dyn StorageBackend>>,
    session: Option<Arc<dyn StorageBackend>>,
    platform: Arc<dyn Platform>,
}

impl CapabilityProbe {
    pub fn new(
        persistent: Option<Arc<dyn StorageBackend>>,
        session: Option<Arc<dyn StorageBackend>>,
        platform: Arc<dyn Platform>,
    ) -> Self {
        Self {
            persistent,
            session,
            platform,
        }
    }

    #[must_use]
    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    /// Probe every primitive once.
    #[must_use]
    pub fn probe(&self) -> Capabilities {
        let persistent = Self::probe_backend(StorageTier::Persistent, self.persistent.as_deref());
        let session = Self::probe_backend(StorageTier::Session, self.session.as_deref());

        let caps = Capabilities {
            persistent_store: persistent.is_usable(),
            session_store: session.is_usable(),
            cache_store: self.platform.cache_store(),
            background_sync: self.platform.background_sync(),
            notifications: self.platform.notifications(),
            quota_exceeded: persistent == BackendProbe::QuotaExceeded
                || session == BackendProbe::QuotaExceeded,
            online: self.platform.is_online(),
        };

        debug!(?caps, "Capability probe complete");
        crate::metrics::record_probe(&caps);
        caps
    }

    /// Write/read/delete cycle against a single backend.
    pub fn probe_backend(tier: StorageTier, backend: Option<&dyn StorageBackend>) -> BackendProbe {
        let Some(backend) = backend else {
            return BackendProbe::Absent;
        };

        let marker = format!("probe-{}", uuid::Uuid::new_v4());
        let cycle = || -> Result<bool, StorageError> {
            backend.write(PROBE_KEY, &marker)?;
            let read_back = backend.read(PROBE_KEY)?;
            backend.delete(PROBE_KEY)?;
            Ok(read_back.as_deref() == Some(marker.as_str()))
        };

        match cycle() {
            Ok(true) => BackendProbe::Usable,
            Ok(false) => {
                warn!(%tier, "Probe read-back mismatch, treating tier as unavailable");
                BackendProbe::Unavailable
            }
            Err(e) if e.is_quota() => {
                warn!(%tier, error = %e, "Probe hit storage quota");
                BackendProbe::QuotaExceeded
            }
            Err(e) => {
                debug!(%tier, error = %e, "Probe failed, tier unavailable");
                BackendProbe::Unavailable
            }
        }
    }
}
