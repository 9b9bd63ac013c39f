// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the resilience layer.

use std::sync::Arc;
use serde::Serialize;

use crate::capability::Platform;
use crate::degradation::DegradationLevel;
use crate::storage::{StorageBackend, StorageTier};

/// Layer lifecycle state.
///
/// Use [`super::ResilienceLayer::state()`] to check the current state or
/// [`super::ResilienceLayer::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LayerState {
    /// Constructed, background tasks not running
    Created,
    /// Sync loop and degradation watcher running
    Running,
    /// Graceful shutdown in progress
    ShuttingDown,
    Stopped,
}

impl std::fmt::Display for LayerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// What the host environment provides.
///
/// Missing backends are simply unusable tiers; the layer still works on
/// the Memory tier.
#[derive(Clone)]
pub struct HostBindings {
    pub persistent: Option<Arc<dyn StorageBackend>>,
    pub session: Option<Arc<dyn StorageBackend>>,
    pub platform: Arc<dyn Platform>,
}

impl HostBindings {
    /// No storage at all; everything lives in the Memory tier.
    pub fn memory_only(platform: Arc<dyn Platform>) -> Self {
        Self {
            persistent: None,
            session: None,
            platform,
        }
    }
}

/// Snapshot of the layer for diagnostics screens.
///
/// Gathered from cached state only: no probes, no remote calls.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerHealth {
    pub state: LayerState,
    /// Running, storage available and the remote answering
    pub healthy: bool,
    pub online: bool,
    pub remote_healthy: bool,
    pub remote_failures: u64,
    pub circuit_failure_rate: f64,
    pub current_tier: StorageTier,
    pub degradation: DegradationLevel,
    pub pending: usize,
    pub conflicts: usize,
    pub failed_items: usize,
    pub emergency_items: usize,
    pub last_sync_at: Option<i64>,
}
