// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Conflict resolution strategies and the sync observer hook.

use super::types::{ConflictRecord, FailedItem, Resolution};
use crate::queue::QueueItem;

/// Decides what happens to a replay the server answered with a conflict.
pub trait ConflictResolver: Send + Sync {
    fn resolve(&self, conflict: &ConflictRecord) -> Resolution;
}

/// Default: never merge automatically, let an operator look at it.
#[derive(Debug, Clone, Copy, Default)]
pub struct SurfaceToOperator;

impl ConflictResolver for SurfaceToOperator {
    fn resolve(&self, _conflict: &ConflictRecord) -> Resolution {
        Resolution::Surface
    }
}

/// Drop the local write and keep what the server has.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerWins;

impl ConflictResolver for ServerWins {
    fn resolve(&self, _conflict: &ConflictRecord) -> Resolution {
        Resolution::Discard
    }
}

/// Receives per-item results of each pass.
pub trait SyncObserver: Send + Sync {
    fn on_applied(&self, _item: &QueueItem) {}

    fn on_failed(&self, _failed: &FailedItem) {}

    /// `requeued_as` is the new queue id when the resolution requeued.
    fn on_conflict(&self, _conflict: &ConflictRecord, _resolution: &Resolution, _requeued_as: Option<&str>) {}
}
