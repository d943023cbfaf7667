// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Entity caches.
//!
//! Each cache owns one key namespace and is the only writer to it:
//!
//! ```text
//! ┌──────────────────┬──────────────────────────┬──────────────────────────────┐
//! │ cache            │ namespaces               │ collections                  │
//! ├──────────────────┼──────────────────────────┼──────────────────────────────┤
//! │ InstanceCache    │ biz, set, module,        │ cc_ApplicationBase,          │
//! │                  │ custom.{object}          │ cc_SetBase, cc_ModuleBase,   │
//! │                  │                          │ cc_ObjectBase                │
//! │ MainlineCache    │ mainline, obj_asst       │ cc_ObjAsst                   │
//! │ GeneralCache     │ host, biz_set,           │ cc_HostBase, cc_BizSetBase,  │
//! │                  │ cloud_area, project      │ cc_PlatBase, cc_Project      │
//! └──────────────────┴──────────────────────────┴──────────────────────────────┘
//! ```
//!
//! Reads consult the KV store first and fall back to the document store;
//! KV failures on either path are logged and absorbed.

pub mod general;
pub mod instance;
pub mod mainline;

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::config::CacheServiceConfig;
use crate::keys::KeyGen;
use crate::refresh::RefreshCoordinator;
use crate::storage::traits::{DeleteArchive, DocumentStore, KvBatch, KvStore};

pub use general::{GeneralCache, GeneralResource};
pub use instance::{InstanceCache, InstanceSchema};
pub use mainline::MainlineCache;

/// Shared collaborators of every entity cache.
#[derive(Clone)]
pub struct CacheContext {
    pub kv: Arc<dyn KvStore>,
    pub docs: Arc<dyn DocumentStore>,
    pub archive: Arc<dyn DeleteArchive>,
    pub refresh: Arc<RefreshCoordinator>,
    pub keys: KeyGen,
    pub config: Arc<CacheServiceConfig>,
}

/// Parse a cached detail record. A corrupt record is deleted so the next
/// read repopulates it.
async fn parse_cached(kv: &dyn KvStore, entity: &str, key: &str, raw: &str) -> Option<Value> {
    match serde_json::from_str(raw) {
        Ok(doc) => Some(doc),
        Err(e) => {
            warn!(entity, key, error = %e, "Corrupt cache entry, dropping it");
            crate::metrics::record_self_heal(entity);
            if let Err(e) = kv.del(key).await {
                warn!(entity, key, error = %e, "Failed to drop corrupt cache entry");
            }
            None
        }
    }
}

/// Best-effort cache write; the cache is never the source of truth.
async fn write_quietly(kv: &dyn KvStore, entity: &str, operation: &str, batch: KvBatch) {
    if batch.is_empty() {
        return;
    }
    if let Err(e) = kv.execute(batch).await {
        warn!(entity, operation, error = %e, "Cache write failed, skipping");
    }
}

/// Reject empty or oversized id batches.
fn check_id_batch<T>(ids: &[T], max: usize) -> Result<(), crate::error::CacheError> {
    if ids.is_empty() || ids.len() > max {
        return Err(crate::error::CacheError::InvalidInput(format!(
            "expected between 1 and {} ids, got {}",
            max,
            ids.len()
        )));
    }
    Ok(())
}
