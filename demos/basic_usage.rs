// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic offline-resilience usage example.
//!
//! Demonstrates:
//! 1. Building the layer over a file-backed persistent store
//! 2. Reading a collection while online (and caching it)
//! 3. Losing the connection and editing offline
//! 4. Reconnecting and watching the queue drain
//! 5. A conflict surfaced to the operator
//! 6. Displaying metrics and a clean shutdown
//!
//! Everything runs in-process; the "server" is an `InMemoryRemote`.
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::sync::Arc;
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::json;

use offline_resilience::{
    FileBackend, HostBindings, InMemoryBackend, InMemoryRemote, MutateOutcome, Mutation,
    ResilienceConfig, ResilienceLayer, SetOptions, StaticPlatform, SystemClock,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║         offline-resilience: Basic Usage Example               ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Build the layer
    // ─────────────────────────────────────────────────────────────────────────
    let store_path = std::env::temp_dir().join("offline-resilience-demo.json");
    let _ = std::fs::remove_file(&store_path);

    let platform = Arc::new(StaticPlatform::online());
    let remote = Arc::new(InMemoryRemote::new("id").with_collection(
        "marks",
        vec![
            json!({"id": "m1", "student": "ana", "ta": 3, "ce": 4}),
            json!({"id": "m2", "student": "ben", "ta": 5, "ce": 2}),
        ],
    ));
    let host = HostBindings {
        persistent: Some(Arc::new(FileBackend::open(&store_path)?)),
        session: Some(Arc::new(InMemoryBackend::new())),
        platform: platform.clone(),
    };
    let layer = ResilienceLayer::new(ResilienceConfig::default(), host, remote.clone(), Arc::new(SystemClock))?;
    layer.start().await;

    println!("📦 Storage tier: {}", layer.current_tier());
    println!("   Degradation:  {}\n", layer.degradation_level());

    layer.set("draft:report", json!({"text": "Term 1 notes"}), SetOptions::default());
    println!("📝 Draft saved: {:?}\n", layer.get("draft:report"));

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Online read
    // ─────────────────────────────────────────────────────────────────────────
    let marks = layer.get_collection("marks").await;
    println!("🌐 Read {} marks from {:?}", marks.records.len(), marks.source);

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Offline edits
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📴 Connection lost");
    platform.set_online(false);
    remote.set_online(false);
    layer.set_online(false).await;

    for (record, ta) in [("m1", 5), ("m2", 6)] {
        let outcome = layer
            .mutate(Mutation::upsert("updateMark", "marks", record, json!({"ta": ta})))
            .await;
        if let MutateOutcome::Queued { queue_id } = outcome {
            println!("   ├─ {} queued as {}", record, queue_id);
        }
    }

    let marks = layer.get_collection("marks").await;
    println!("   ├─ Cached view ({:?}, stale={}):", marks.source, marks.stale);
    for record in &marks.records {
        println!("   │  └─ {}", record);
    }
    println!("   ├─ Pending: {}", layer.sync_status().pending_count);
    println!("   └─ Level:   {}", layer.degradation_level());
    for advice in layer.recommendations() {
        println!("      💡 {}", advice);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Reconnect
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📶 Connection restored");
    remote.conflict_on("m2", json!({"id": "m2", "student": "ben", "ta": 7, "ce": 2}));
    platform.set_online(true);
    remote.set_online(true);
    if let Some(report) = layer.set_online(true).await.as_ref().and_then(|o| o.report()) {
        println!(
            "   ├─ Sync pass: {} applied, {} conflicted, {} failed in {:?}",
            report.succeeded, report.conflicted, report.failed, report.duration
        );
    }
    let status = layer.sync_status();
    println!("   ├─ Pending: {}", status.pending_count);
    println!("   └─ Last sync: {:?}", status.last_sync_at);

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Conflicts
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n⚠️  Conflicts waiting for an operator:");
    for conflict in layer.conflicts() {
        println!(
            "   └─ {} {:?}: server has {}",
            conflict.mutation.operation_type,
            conflict.mutation.target.as_ref().map(|t| t.to_string()),
            conflict.server_state.unwrap_or_default()
        );
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Health, metrics, shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🩺 Health: {}", serde_json::to_string_pretty(&layer.health_check())?);

    println!("\n📊 Metrics:");
    dump_metrics(&snapshotter);

    layer.shutdown().await;
    let _ = std::fs::remove_file(&store_path);
    println!("\n✅ Done");
    Ok(())
}

/// Dump all captured metrics, grouped by kind
fn dump_metrics(snapshotter: &Snapshotter) {
    let snapshot = snapshotter.snapshot();

    let mut counters: Vec<_> = vec![];
    let mut gauges: Vec<_> = vec![];
    let mut histograms: Vec<_> = vec![];

    for (composite_key, _, _, value) in snapshot.into_vec() {
        let (_, key) = composite_key.into_parts();
        let name = key.name().to_string();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };

        match value {
            DebugValue::Counter(v) => counters.push((name, label_str, v)),
            DebugValue::Gauge(v) => gauges.push((name, label_str, v.into_inner())),
            DebugValue::Histogram(samples) => {
                let count = samples.len();
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                histograms.push((name, label_str, count, sum));
            }
        }
    }

    counters.sort_by(|a, b| a.0.cmp(&b.0));
    gauges.sort_by(|a, b| a.0.cmp(&b.0));
    histograms.sort_by(|a, b| a.0.cmp(&b.0));

    if !counters.is_empty() {
        println!("   ┌─ Counters");
        for (name, labels, value) in &counters {
            println!("   │  └─ {}{} = {}", name, labels, value);
        }
    }
    if !gauges.is_empty() {
        println!("   ├─ Gauges");
        for (name, labels, value) in &gauges {
            println!("   │  └─ {}{} = {:.2}", name, labels, value);
        }
    }
    if !histograms.is_empty() {
        println!("   └─ Histograms");
        for (name, labels, count, sum) in &histograms {
            println!("      └─ {}{} count={} sum={:.4}", name, labels, count, sum);
        }
    }
    if counters.is_empty() && gauges.is_empty() && histograms.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
}
