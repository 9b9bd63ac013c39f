// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the resilience layer.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host application is responsible for choosing the exporter.
//!
//! # Metric Naming Convention
//! - `resilience_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `tier`: persistent, session, memory, emergency
//! - `operation`: get, set, remove, apply_mutation, get_collection
//! - `status`: success, error, fallback, timeout, rejected

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

use crate::capability::Capabilities;

/// Record a store operation against a tier
pub fn record_tier_operation(tier: &str, operation: &str, status: &str) {
    counter!(
        "resilience_storage_operations_total",
        "tier" => tier.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Set the active tier (0 = none … 3 = persistent)
pub fn set_current_tier(tier: u8) {
    gauge!("resilience_storage_current_tier").set(tier as f64);
}

/// Record a write that spilled into the Memory tier
pub fn record_fallback_write(from_tier: &str) {
    counter!(
        "resilience_storage_fallback_writes_total",
        "tier" => from_tier.to_string()
    )
    .increment(1);
}

/// Record a quota error
pub fn record_quota_exceeded(tier: &str) {
    counter!(
        "resilience_storage_quota_exceeded_total",
        "tier" => tier.to_string()
    )
    .increment(1);
}

/// Record a tier-to-tier migration
pub fn record_migration(from: &str, to: &str, moved: usize) {
    counter!(
        "resilience_storage_migrated_keys_total",
        "from" => from.to_string(),
        "to" => to.to_string()
    )
    .increment(moved as u64);
}

/// Record expired items purged
pub fn record_expired(count: usize) {
    counter!("resilience_storage_expired_total").increment(count as u64);
}

/// Record eviction event
pub fn record_eviction(tier: &str, count: usize) {
    counter!(
        "resilience_evictions_total",
        "tier" => tier.to_string()
    )
    .increment(count as u64);
}

/// Record the outcome of a capability probe
pub fn record_probe(caps: &Capabilities) {
    counter!("resilience_probes_total").increment(1);
    gauge!("resilience_capability_persistent").set(if caps.persistent_store { 1.0 } else { 0.0 });
    gauge!("resilience_capability_session").set(if caps.session_store { 1.0 } else { 0.0 });
    gauge!("resilience_capability_online").set(if caps.online { 1.0 } else { 0.0 });
}

// ═══════════════════════════════════════════════════════════════════════════
// QUEUE & SYNC
// ═══════════════════════════════════════════════════════════════════════════

/// Set pending queue depth
pub fn set_queue_depth(domain: &str, depth: usize) {
    gauge!(
        "resilience_queue_depth",
        "domain" => domain.to_string()
    )
    .set(depth as f64);
}

/// Record queue drain results
pub fn record_drain(domain: &str, succeeded: usize, failed: usize, evicted: usize, conflicted: usize) {
    let domain = domain.to_string();
    counter!("resilience_queue_replayed_total", "domain" => domain.clone(), "status" => "success")
        .increment(succeeded as u64);
    counter!("resilience_queue_replayed_total", "domain" => domain.clone(), "status" => "error")
        .increment(failed as u64);
    counter!("resilience_queue_replayed_total", "domain" => domain.clone(), "status" => "evicted")
        .increment(evicted as u64);
    counter!("resilience_queue_replayed_total", "domain" => domain, "status" => "conflict")
        .increment(conflicted as u64);
}

/// Record a sync pass (completed or skipped with reason)
pub fn record_sync_pass(outcome: &str, duration: Duration) {
    counter!(
        "resilience_sync_passes_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!("resilience_sync_pass_seconds").record(duration.as_secs_f64());
}

/// Set degradation level (0 = None, 1 = Partial, 2 = Full)
pub fn set_degradation_level(level: u8) {
    gauge!("resilience_degradation_level").set(level as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// REMOTE
// ═══════════════════════════════════════════════════════════════════════════

/// Record a remote API call outcome
pub fn record_remote_call(operation: &str, status: &str) {
    counter!(
        "resilience_remote_calls_total",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record remote call latency
pub fn record_latency(operation: &str, duration: Duration) {
    histogram!(
        "resilience_remote_call_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record circuit breaker call
pub fn record_circuit_breaker_call(circuit: &str, outcome: &str) {
    counter!(
        "resilience_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record where a collection read was served from
pub fn record_cache_read(source: &str) {
    counter!(
        "resilience_cache_reads_total",
        "source" => source.to_string()
    )
    .increment(1);
}

/// Timer guard that records remote latency on drop
pub struct LatencyTimer {
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    #[must_use]
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.operation, self.start.elapsed());
    }
}
