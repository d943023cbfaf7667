// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the cache layer.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `cmdb_cache_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `entity`: biz, set, module, custom.{object}, host, biz_set, …
//! - `kind`: detail, list, id_list
//! - `outcome`: hit, miss, placeholder, error, fresh, busy, refreshed, removed

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record the outcome of a cache lookup
pub fn record_lookup(entity: &str, outcome: &str) {
    counter!(
        "cmdb_cache_lookups_total",
        "entity" => entity.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a read served by the document store instead of the cache
pub fn record_fallback(entity: &str, reason: &str) {
    counter!(
        "cmdb_cache_fallbacks_total",
        "entity" => entity.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record how a background refresh ended
pub fn record_refresh(kind: &str, outcome: &str) {
    counter!(
        "cmdb_cache_refreshes_total",
        "kind" => kind.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record members added and removed by one list reconciliation
pub fn record_reconcile(added: usize, removed: usize) {
    counter!("cmdb_cache_reconcile_members_total", "change" => "added").increment(added as u64);
    counter!("cmdb_cache_reconcile_members_total", "change" => "removed").increment(removed as u64);
}

/// Record a malformed cache entry that was repaired
pub fn record_self_heal(entity: &str) {
    counter!(
        "cmdb_cache_self_heals_total",
        "entity" => entity.to_string()
    )
    .increment(1);
}

/// Record a change feed event handled by an entity cache
pub fn record_event(entity: &str, op: &str, status: &str) {
    counter!(
        "cmdb_cache_events_total",
        "entity" => entity.to_string(),
        "op" => op.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Set the number of running change feed watchers
pub fn set_active_watchers(count: usize) {
    gauge!("cmdb_cache_active_watchers").set(count as f64);
}

/// Record a topology search rejected by the overhead guard
pub fn record_overhead_rejection(object: &str) {
    counter!(
        "cmdb_cache_overhead_rejections_total",
        "object" => object.to_string()
    )
    .increment(1);
}

/// Record circuit breaker call outcome
pub fn record_circuit_call(circuit: &str, outcome: &str) {
    counter!(
        "cmdb_cache_circuit_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record backend operation latency
pub fn record_latency(backend: &str, operation: &str, duration: Duration) {
    histogram!(
        "cmdb_cache_operation_seconds",
        "backend" => backend.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a lifecycle phase duration
pub fn record_startup_phase(phase: &str, duration: Duration) {
    histogram!(
        "cmdb_cache_startup_phase_seconds",
        "phase" => phase.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Publish the service lifecycle state
pub fn set_service_state(state: &str) {
    for known in ["Created", "Starting", "Running", "ShuttingDown", "Stopped"] {
        gauge!("cmdb_cache_service_state", "state" => known).set(if known == state { 1.0 } else { 0.0 });
    }
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    backend: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    pub fn new(backend: &'static str, operation: &'static str) -> Self {
        Self {
            backend,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.backend, self.operation, self.start.elapsed());
    }
}
