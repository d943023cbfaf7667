// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache service composition root.
//!
//! [`CacheService`] owns every entity cache, the refresh coordinator, the
//! reflectors and the topology engine. Nothing in the crate is global: two
//! services built over the same KV store behave like two instances of a
//! fleet.
//!
//! # Lifecycle
//!
//! ```text
//! Created → Starting → Running → ShuttingDown → Stopped
//! ```
//!
//! Reads work in every state. Before `start()` nothing is watched, so the
//! caches behave as plain read-through caches.
//!
//! # Example
//!
//! ```rust,no_run
//! use cmdb_cache::{CacheService, CacheServiceConfig, EntityKind, ServiceState};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), cmdb_cache::CacheError> {
//! let service = CacheService::connect(CacheServiceConfig::default()).await?;
//! assert_eq!(service.state(), ServiceState::Created);
//!
//! service.start().await?;
//! let biz = service.get_entity(&EntityKind::Biz, 5, &[]).await;
//! service.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod api;
mod lifecycle;
mod types;

pub use types::{EntityKind, ServiceState};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use crate::cache::mainline::ASSOCIATION_ENTITY;
use crate::cache::{CacheContext, GeneralCache, GeneralResource, InstanceCache, InstanceSchema, MainlineCache};
use crate::config::CacheServiceConfig;
use crate::error::CacheError;
use crate::keys::{KeyGen, NamespaceRegistry, MAINLINE_ENTITY};
use crate::reflector::Reflector;
use crate::refresh::RefreshCoordinator;
use crate::storage::memory::{InMemoryDocumentStore, InMemoryKv};
use crate::storage::redis::RedisKv;
use crate::storage::sql::SqlDocumentStore;
use crate::storage::traits::{DeleteArchive, DocumentStore, KvStore};
use crate::topo::{CacheTopologySource, TopoTree};

/// Change-driven read-through cache of the CMDB hierarchy.
///
/// # Thread Safety
///
/// Read methods take `&self` and are safe to call from many tasks; share the
/// service behind an `Arc` once it is started.
pub struct CacheService {
    pub(super) config: Arc<CacheServiceConfig>,

    /// Shared collaborators handed to every cache
    pub(super) ctx: CacheContext,

    pub(super) reflector: Arc<Reflector>,

    pub(super) biz: Arc<InstanceCache>,
    pub(super) set: Arc<InstanceCache>,
    pub(super) module: Arc<InstanceCache>,

    /// Mainline chain and custom level caches
    pub(super) mainline: Arc<MainlineCache>,

    pub(super) general: HashMap<GeneralResource, Arc<GeneralCache>>,

    pub(super) topo: TopoTree,

    /// Reflectors, including custom level watches
    pub(super) tracker: TaskTracker,

    /// Parent of every reflector and refresh token
    pub(super) root: CancellationToken,

    /// Service state (broadcast to watchers)
    pub(super) state: watch::Sender<ServiceState>,

    /// Service state receiver (for internal use)
    pub(super) state_rx: watch::Receiver<ServiceState>,
}

impl CacheService {
    /// Build a service over existing backends.
    ///
    /// Fails with [`CacheError::Config`] when the configuration is invalid
    /// or two caches would share a key namespace.
    pub fn new(
        config: CacheServiceConfig,
        kv: Arc<dyn KvStore>,
        docs: Arc<dyn DocumentStore>,
        archive: Arc<dyn DeleteArchive>,
    ) -> Result<Self, CacheError> {
        config.validate()?;
        let config = Arc::new(config);
        let keys = KeyGen::new(config.key_prefix.clone())?;
        Self::register_namespaces()?;

        let root = CancellationToken::new();
        let tracker = TaskTracker::new();
        let refresh = Arc::new(RefreshCoordinator::new(kv.clone(), config.lock_ttl(), root.child_token()));
        let reflector = Arc::new(Reflector::new(kv.clone(), docs.clone()));

        let ctx = CacheContext {
            kv,
            docs,
            archive,
            refresh,
            keys,
            config: config.clone(),
        };

        let biz = Arc::new(InstanceCache::new(ctx.clone(), InstanceSchema::biz()));
        let set = Arc::new(InstanceCache::new(ctx.clone(), InstanceSchema::set()));
        let module = Arc::new(InstanceCache::new(ctx.clone(), InstanceSchema::module()));
        let mainline = Arc::new(MainlineCache::new(
            ctx.clone(),
            reflector.clone(),
            tracker.clone(),
            root.clone(),
        ));
        let general = GeneralResource::ALL
            .iter()
            .map(|resource| (*resource, Arc::new(GeneralCache::new(ctx.clone(), *resource))))
            .collect();

        let source = CacheTopologySource {
            mainline: mainline.clone(),
            biz: biz.clone(),
            set: set.clone(),
            module: module.clone(),
        };
        let topo = TopoTree::new(Arc::new(source), config.topo_search_ceiling);

        let (state, state_rx) = watch::channel(ServiceState::Created);

        info!(prefix = %ctx.keys.prefix(), "Cache service created");
        Ok(Self {
            config,
            ctx,
            reflector,
            biz,
            set,
            module,
            mainline,
            general,
            topo,
            tracker,
            root,
            state,
            state_rx,
        })
    }

    /// Connect the configured backends and build the service.
    ///
    /// Unset URLs select the in-memory stores; the in-memory document store
    /// doubles as the delete archive.
    #[tracing::instrument(skip_all, fields(has_redis = config.redis_url.is_some(), has_sql = config.sql_url.is_some()))]
    pub async fn connect(config: CacheServiceConfig) -> Result<Self, CacheError> {
        config.validate()?;

        let phase_start = Instant::now();
        let kv: Arc<dyn KvStore> = match &config.redis_url {
            Some(url) => {
                info!("Connecting to Redis...");
                Arc::new(RedisKv::connect(url).await?)
            }
            None => Arc::new(InMemoryKv::new()),
        };
        crate::metrics::record_startup_phase("kv_connect", phase_start.elapsed());

        let phase_start = Instant::now();
        let (docs, archive): (Arc<dyn DocumentStore>, Arc<dyn DeleteArchive>) = match &config.sql_url {
            Some(url) => {
                info!("Connecting to SQL document store...");
                let store = Arc::new(
                    SqlDocumentStore::connect(url)
                        .await?
                        .with_watch_settings(config.watch_poll_interval(), config.watch_channel_capacity),
                );
                (store.clone(), store)
            }
            None => {
                let store = Arc::new(InMemoryDocumentStore::new());
                (store.clone(), store)
            }
        };
        crate::metrics::record_startup_phase("docs_connect", phase_start.elapsed());

        Self::new(config, kv, docs, archive)
    }

    /// Every fixed namespace, claimed once. A collision is a build defect.
    fn register_namespaces() -> Result<NamespaceRegistry, CacheError> {
        let mut registry = NamespaceRegistry::new();
        registry.register("biz", "biz")?;
        registry.register("set", "set")?;
        registry.register("module", "module")?;
        registry.register(ASSOCIATION_ENTITY, MAINLINE_ENTITY)?;
        for resource in GeneralResource::ALL {
            registry.register(resource.entity(), "general")?;
        }
        Ok(registry)
    }

    /// Get current service state.
    #[must_use]
    pub fn state(&self) -> ServiceState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ServiceState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == ServiceState::Running
    }

    #[must_use]
    pub fn config(&self) -> &CacheServiceConfig {
        &self.config
    }

    #[must_use]
    pub fn key_gen(&self) -> &KeyGen {
        &self.ctx.keys
    }

    #[must_use]
    pub fn refresh_coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.ctx.refresh
    }

    #[must_use]
    pub fn mainline_cache(&self) -> &Arc<MainlineCache> {
        &self.mainline
    }

    /// Cache of a hierarchy entity, `None` for general resources.
    pub fn instance_cache(&self, kind: &EntityKind) -> Option<Arc<InstanceCache>> {
        match kind {
            EntityKind::Biz => Some(self.biz.clone()),
            EntityKind::Set => Some(self.set.clone()),
            EntityKind::Module => Some(self.module.clone()),
            EntityKind::Custom(object) => Some(self.mainline.custom_cache(object)),
            EntityKind::General(_) => None,
        }
    }

    pub fn general_cache(&self, resource: GeneralResource) -> Option<&Arc<GeneralCache>> {
        self.general.get(&resource)
    }
}
