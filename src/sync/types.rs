// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the sync orchestrator.

use std::time::Duration;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::queue::{EvictionReason, Mutation, QueueItem};

/// What the UI shows in its sync indicator.
///
/// One instance per orchestrator; watch it with
/// [`super::SyncOrchestrator::subscribe()`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_online: bool,
    pub pending_count: usize,
    /// Epoch millis of the last completed pass
    pub last_sync_at: Option<i64>,
    pub sync_in_progress: bool,
}

/// Why a pass started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// Offline → online transition
    Reconnect,
    /// Interval timer (or backoff retry)
    Periodic,
    /// Explicit `force_sync()`
    Forced,
}

impl std::fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reconnect => write!(f, "reconnect"),
            Self::Periodic => write!(f, "periodic"),
            Self::Forced => write!(f, "forced"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Offline,
    AlreadyRunning,
    NothingPending,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Offline => write!(f, "offline"),
            Self::AlreadyRunning => write!(f, "already running"),
            Self::NothingPending => write!(f, "nothing pending"),
        }
    }
}

/// Counts for one completed pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub trigger: SyncTrigger,
    pub succeeded: usize,
    /// Charged a retry and still queued
    pub failed: usize,
    pub evicted: usize,
    pub conflicted: usize,
    pub deferred: usize,
    /// Stopped early because the remote went away
    pub aborted: bool,
    pub duration: Duration,
}

impl SyncReport {
    /// Everything pending at the start of the pass was settled.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.deferred == 0 && !self.aborted
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    Skipped(SkipReason),
}

impl SyncOutcome {
    #[must_use]
    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            Self::Completed(report) => Some(report),
            Self::Skipped(_) => None,
        }
    }
}

/// A replay the server refused because it holds a different version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    /// Queue id of the conflicting item
    pub id: String,
    pub mutation: Mutation,
    pub server_state: Option<Value>,
    /// Epoch millis
    pub detected_at: i64,
}

/// A queued write that will not be replayed again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedItem {
    pub item: QueueItem,
    pub reason: EvictionReason,
    /// Epoch millis
    pub failed_at: i64,
}

/// What to do with a conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Keep it in the operator-visible conflict list
    Surface,
    /// Queue this mutation instead (e.g. a merged version)
    Requeue(Mutation),
    /// Server wins; forget the local write
    Discard,
}
