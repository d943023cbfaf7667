// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Service lifecycle: start and shutdown.
//!
//! Every reflector runs on the service's [`TaskTracker`] under a child of the
//! root [`CancellationToken`]; shutdown cancels the root and waits for the
//! tracker and the refresh coordinator to drain.
//!
//! [`TaskTracker`]: tokio_util::task::TaskTracker
//! [`CancellationToken`]: tokio_util::sync::CancellationToken

use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::error::CacheError;
use crate::reflector::{EventHandler, WatchOptions};

use super::{CacheService, ServiceState};

impl CacheService {
    /// Start watching every collection.
    ///
    /// Startup flow:
    /// 1. Spawn the reflectors of businesses, sets, modules and the general
    ///    resources
    /// 2. Spawn the mainline association reflector
    /// 3. Load the mainline chain and start a watch per custom level
    ///    (a restarted instance skips the bulk list, so no list-done event
    ///    would start them)
    ///
    /// Reflectors retry on their own; a document store outage at startup
    /// delays change ingestion but does not fail `start`.
    #[tracing::instrument(skip(self))]
    pub async fn start(&self) -> Result<(), CacheError> {
        if self.state() != ServiceState::Created {
            return Err(CacheError::InvalidInput(format!(
                "cannot start a service in state {}",
                self.state()
            )));
        }
        let startup_start = Instant::now();
        self.set_state(ServiceState::Starting);

        let phase_start = Instant::now();
        for cache in [&self.biz, &self.set, &self.module] {
            self.spawn_reflector(cache.watch_options(), cache.clone());
        }
        for cache in self.general.values() {
            self.spawn_reflector(cache.watch_options(), cache.clone());
        }
        self.spawn_reflector(self.mainline.watch_options(), self.mainline.clone());
        crate::metrics::record_startup_phase("reflectors", phase_start.elapsed());

        let phase_start = Instant::now();
        match self.mainline.get_topology().await {
            Ok(chain) => {
                self.mainline.sync_custom_watches(&chain);
                info!(chain = %chain.join(","), "Mainline loaded");
            }
            Err(e) => {
                warn!(error = %e, "Cannot load mainline yet, custom levels start with its list");
            }
        }
        crate::metrics::record_startup_phase("mainline", phase_start.elapsed());

        self.set_state(ServiceState::Running);
        info!(
            startup_ms = startup_start.elapsed().as_millis() as u64,
            custom_levels = self.mainline.watched_levels().len(),
            "Cache service running"
        );
        Ok(())
    }

    /// Cancel every reflector and background refresh and wait for them.
    ///
    /// Idempotent; reads keep working against the stores afterwards.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        if matches!(self.state(), ServiceState::ShuttingDown | ServiceState::Stopped) {
            return;
        }
        info!("Shutting down cache service...");
        self.set_state(ServiceState::ShuttingDown);

        self.root.cancel();
        self.ctx.refresh.shutdown().await;
        self.tracker.close();
        self.tracker.wait().await;

        self.set_state(ServiceState::Stopped);
        info!("Cache service stopped");
    }

    fn spawn_reflector(&self, options: WatchOptions, handler: Arc<dyn EventHandler>) {
        let reflector = Arc::clone(&self.reflector);
        let cancel = self.root.child_token();
        self.tracker.spawn(async move {
            reflector.run(options, handler, cancel).await;
        });
    }

    fn set_state(&self, state: ServiceState) {
        let _ = self.state.send(state);
        crate::metrics::set_service_state(state.as_str());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use crate::config::CacheServiceConfig;
    use crate::service::{CacheService, EntityKind, ServiceState};
    use crate::storage::memory::{InMemoryDocumentStore, InMemoryKv};
    use crate::storage::traits::KvStore;

    fn build() -> (CacheService, Arc<InMemoryDocumentStore>) {
        let docs = Arc::new(InMemoryDocumentStore::new());
        let service = CacheService::new(
            CacheServiceConfig::default(),
            Arc::new(InMemoryKv::new()),
            docs.clone(),
            docs.clone(),
        )
        .unwrap();
        (service, docs)
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_start_and_shutdown_states() {
        let (service, _docs) = build();
        let mut states = service.state_receiver();

        service.start().await.unwrap();
        assert_eq!(service.state(), ServiceState::Running);
        assert!(states.has_changed().unwrap());

        service.shutdown().await;
        assert_eq!(service.state(), ServiceState::Stopped);
        assert!(service.tracker.is_empty());

        // Second shutdown is a no-op
        service.shutdown().await;
        assert_eq!(service.state(), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let (service, _docs) = build();
        service.start().await.unwrap();
        assert!(service.start().await.is_err());
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_running_service_follows_changes() {
        let (service, docs) = build();
        docs.insert("cc_ApplicationBase", json!({"bk_biz_id": 5, "bk_biz_name": "shop"}));
        docs.insert("cc_ObjAsst", json!({"bk_obj_id": "set", "bk_asst_obj_id": "biz", "bk_asst_id": "bk_mainline"}));
        docs.insert("cc_ObjAsst", json!({"bk_obj_id": "module", "bk_asst_obj_id": "set", "bk_asst_id": "bk_mainline"}));
        service.start().await.unwrap();

        let set_oid = docs.insert("cc_SetBase", json!({"bk_set_id": 100, "bk_set_name": "set-a", "bk_parent_id": 5, "bk_biz_id": 5}));
        let cache = service.instance_cache(&EntityKind::Set).unwrap();
        let kv = service.ctx.kv.clone();
        let oid_key = cache.keys().oid(&set_oid);
        let list_key = cache.keys().list(5);

        // The reflector records the oid once it has seen the set
        eventually(|| {
            let kv = kv.clone();
            let oid_key = oid_key.clone();
            async move { kv.exists(&oid_key).await.unwrap_or(false) }
        })
        .await;
        let sets = service.get_entity_base_list(&EntityKind::Set, 5).await.unwrap();
        assert_eq!(sets.len(), 1);

        docs.delete("cc_SetBase", &set_oid);
        eventually(|| {
            let kv = kv.clone();
            let list_key = list_key.clone();
            async move { kv.smembers(&list_key).await.map(|m| m.is_empty()).unwrap_or(false) }
        })
        .await;

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_custom_levels_watched_after_start() {
        let (service, docs) = build();
        for (object, parent) in [("region", "biz"), ("set", "region"), ("module", "set")] {
            docs.insert("cc_ObjAsst", json!({"bk_obj_id": object, "bk_asst_obj_id": parent, "bk_asst_id": "bk_mainline"}));
        }
        service.start().await.unwrap();
        assert_eq!(service.mainline_cache().watched_levels(), vec!["region".to_string()]);
        service.shutdown().await;
        assert!(service.tracker.is_empty());
    }
}
