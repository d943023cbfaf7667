// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic cmdb-cache usage example.
//!
//! Demonstrates:
//! 1. Building a service over in-memory stores
//! 2. Seeding a small business hierarchy
//! 3. Reading entities and base lists through the cache
//! 4. Following a change through the reflectors
//! 5. Resolving ancestor paths and searching the topology
//! 6. Displaying metrics
//! 7. Clean shutdown
//!
//! # Run
//!
//! ```bash
//! RUST_LOG=cmdb_cache=debug cargo run --example basic_usage
//! ```

use std::sync::Arc;
use std::time::Duration;

use cmdb_cache::{
    CacheError, CacheService, CacheServiceConfig, EntityKind, InMemoryDocumentStore, InMemoryKv, NameFilter,
    NodeRef, SearchOption, TreeNode,
};
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install metrics recorder
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cmdb_cache=info")))
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║             cmdb-cache: Basic Usage Example                   ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Seed the document store
    // ─────────────────────────────────────────────────────────────────────────
    println!("📦 Seeding the document store...");
    let docs = Arc::new(InMemoryDocumentStore::new());
    for (object, parent) in [("region", "biz"), ("set", "region"), ("module", "set"), ("host", "module")] {
        docs.insert(
            "cc_ObjAsst",
            json!({"bk_obj_id": object, "bk_asst_obj_id": parent, "bk_asst_id": "bk_mainline"}),
        );
    }
    docs.insert("cc_ApplicationBase", json!({"bk_biz_id": 5, "bk_biz_name": "shop"}));
    docs.insert(
        "cc_ObjectBase",
        json!({"bk_obj_id": "region", "bk_inst_id": 30, "bk_inst_name": "east", "bk_parent_id": 5, "bk_biz_id": 5}),
    );
    docs.insert(
        "cc_SetBase",
        json!({"bk_set_id": 100, "bk_set_name": "set-a", "bk_parent_id": 30, "bk_biz_id": 5}),
    );
    let set_b = docs.insert(
        "cc_SetBase",
        json!({"bk_set_id": 101, "bk_set_name": "set-b", "bk_parent_id": 30, "bk_biz_id": 5}),
    );
    docs.insert(
        "cc_ModuleBase",
        json!({"bk_module_id": 200, "bk_module_name": "web", "bk_set_id": 100, "bk_biz_id": 5}),
    );
    docs.insert(
        "cc_HostBase",
        json!({"bk_host_id": 1, "bk_host_innerip": "10.0.0.1,10.0.0.2", "bk_cloud_id": 0}),
    );

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Build and start the service
    // ─────────────────────────────────────────────────────────────────────────
    let kv = Arc::new(InMemoryKv::new());
    let service = CacheService::new(CacheServiceConfig::default(), kv.clone(), docs.clone(), docs.clone())?;
    service.start().await?;
    println!("   ✅ State: {}", service.state());
    println!("   └─ Mainline: {}", service.get_mainline_topology().await?.join(" → "));

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Reads
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔍 Reading through the cache...");
    let name = ["bk_set_name".to_string()];
    let set = service.get_entity(&EntityKind::Set, 100, &name).await?;
    println!("   └─ set 100: {}", set);

    let sets = service.get_entity_base_list(&EntityKind::Set, 5).await?;
    for entry in &sets {
        println!("   └─ base list: {} '{}' (parent {})", entry.id, entry.name, entry.parent_id);
    }

    let host = service
        .get_host_by_inner_ip("10.0.0.2", 0, &["bk_host_id".to_string()])
        .await?;
    println!("   └─ host 10.0.0.2@0: {}", host);

    match service.get_entity(&EntityKind::Module, 999, &[]).await {
        Err(CacheError::NotFound { entity, id }) => println!("   └─ {} {} not found", entity, id),
        other => println!("   └─ unexpected: {:?}", other),
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Changes flow in through the reflectors
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📝 Renaming set 101...");
    docs.update(
        "cc_SetBase",
        &set_b,
        json!({"bk_set_id": 101, "bk_set_name": "set-b-renamed", "bk_parent_id": 30, "bk_biz_id": 5}),
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    let renamed = service.get_entity(&EntityKind::Set, 101, &name).await?;
    println!("   └─ set 101: {}", renamed);

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Topology
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🌳 Topology...");
    let paths = service
        .resolve_ancestor_path(5, &[NodeRef::new("module", 200)])
        .await?;
    for path in &paths {
        let ancestors: Vec<String> = path
            .path
            .iter()
            .map(|node| format!("{}:{}", node.object, node.name))
            .collect();
        println!("   └─ {} '{}' ← {}", path.object, path.name, ancestors.join(" ← "));
    }

    let tree = service
        .search_topology(&SearchOption {
            biz_id: 5,
            filters: vec![NameFilter::new("set", "^set-")],
        })
        .await?;
    print_tree(&tree, 1);

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📊 Metrics...");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 7. Clean shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    service.shutdown().await;
    println!("   ✅ Shutdown complete! State: {}", service.state());
    println!("   └─ {} keys left in the KV store", kv.len());

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

fn print_tree(node: &TreeNode, depth: usize) {
    println!("{}└─ {} {} '{}'", "   ".repeat(depth), node.object, node.id, node.name);
    for child in &node.children {
        print_tree(child, depth + 1);
    }
}

/// Dump all captured metrics
fn dump_metrics(snapshotter: &Snapshotter) {
    let snapshot = snapshotter.snapshot();

    let mut counters: Vec<_> = vec![];
    let mut gauges: Vec<_> = vec![];
    let mut histograms: Vec<_> = vec![];

    for (composite_key, _, _, value) in snapshot.into_vec() {
        let (_kind, key) = composite_key.into_parts();
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

    counters.sort();
    gauges.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
    histograms.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));

    for (name, labels, value) in counters {
        println!("   └─ counter   {}{} = {}", name, labels, value);
    }
    for (name, labels, value) in gauges {
        println!("   └─ gauge     {}{} = {}", name, labels, value);
    }
    for (name, labels, count, sum) in histograms {
        println!("   └─ histogram {}{} count={} sum={:.3}", name, labels, count, sum);
    }
}
