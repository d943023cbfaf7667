// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Mainline topology: the ranked object chain from `biz` down to `host`.
//!
//! The chain is stitched from flat `bk_mainline` association records, each
//! naming a child object and its parent:
//!
//! ```text
//! {set → region}  {region → biz}  {module → set}  {host → module}
//!
//! biz ──► region ──► set ──► module ──► host
//! ```
//!
//! It is cached as a comma-joined list under the topology key and rebuilt from
//! the document store on every association change. Each rebuild also
//! reconciles the watches of custom levels: objects that joined the chain get
//! a reflector, objects that left it have theirs cancelled.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::{CacheContext, InstanceCache, InstanceSchema};
use crate::document::{Filter, FindOptions};
use crate::error::CacheError;
use crate::event::{Decoded, MainlineAssociation, MAINLINE_ASSOCIATION};
use crate::keys::{is_builtin_object, EntityKeys};
use crate::reflector::{EventHandler, Reflector, ReflectorEvent, WatchOptions};
use crate::refresh::unix_now;

pub const ASSOCIATION_COLLECTION: &str = "cc_ObjAsst";

/// Namespace of the association reflector's bookkeeping keys.
pub const ASSOCIATION_ENTITY: &str = "obj_asst";

/// Order association edges into a chain starting at `biz`.
///
/// Each step takes the edge whose parent is the current tail. Edges that do
/// not connect to the chain are ignored; a repeated object ends the chain.
#[must_use]
pub fn rank_mainline(associations: &[MainlineAssociation]) -> Vec<String> {
    let mut chain = vec!["biz".to_string()];
    let mut seen: HashSet<&str> = HashSet::from(["biz"]);

    while chain.len() <= associations.len() {
        let Some(tail) = chain.last() else { break };
        let Some(next) = associations.iter().find(|a| a.parent == *tail) else {
            break;
        };
        if !seen.insert(next.object.as_str()) {
            warn!(object = %next.object, "Mainline association cycle, truncating chain");
            break;
        }
        chain.push(next.object.clone());
    }
    chain
}

fn association_filter() -> Filter {
    Filter::eq("bk_asst_id", MAINLINE_ASSOCIATION)
}

/// Owner of the topology key and of the custom level caches.
pub struct MainlineCache {
    ctx: CacheContext,
    keys: EntityKeys,
    reflector: Arc<Reflector>,
    tracker: TaskTracker,
    root: CancellationToken,
    /// Running custom level watches by object id.
    watches: Mutex<HashMap<String, CancellationToken>>,
    customs: DashMap<String, Arc<InstanceCache>>,
}

impl MainlineCache {
    /// `tracker` and `root` are the service's; custom level reflectors run on
    /// the tracker under child tokens of `root`.
    pub fn new(ctx: CacheContext, reflector: Arc<Reflector>, tracker: TaskTracker, root: CancellationToken) -> Self {
        let keys = ctx.keys.entity(ASSOCIATION_ENTITY);
        Self {
            ctx,
            keys,
            reflector,
            tracker,
            root,
            watches: Mutex::new(HashMap::new()),
            customs: DashMap::new(),
        }
    }

    #[must_use]
    pub fn watch_options(&self) -> WatchOptions {
        WatchOptions {
            collection: ASSOCIATION_COLLECTION.to_string(),
            filter: association_filter(),
            page_size: self.ctx.config.list_page_size,
            list_done_key: self.keys.list_done(),
            token_key: self.keys.watch_token(),
        }
    }

    /// The ranked chain, rebuilt from the document store on a miss.
    pub async fn get_topology(&self) -> Result<Vec<String>, CacheError> {
        let key = self.ctx.keys.topology();
        match self.ctx.kv.get(&key).await {
            Ok(Some(raw)) => {
                let chain: Vec<String> = raw.split(',').filter(|s| !s.is_empty()).map(String::from).collect();
                if chain.first().map(String::as_str) == Some("biz") {
                    crate::metrics::record_lookup(ASSOCIATION_ENTITY, "hit");
                    return Ok(chain);
                }
                warn!(key, value = %raw, "Corrupt mainline topology, rebuilding");
                crate::metrics::record_self_heal(ASSOCIATION_ENTITY);
            }
            Ok(None) => crate::metrics::record_lookup(ASSOCIATION_ENTITY, "miss"),
            Err(e) => {
                warn!(key, error = %e, "Cannot read mainline topology, rebuilding");
                crate::metrics::record_fallback(ASSOCIATION_ENTITY, "kv_error");
            }
        }
        self.rebuild().await
    }

    /// Re-derive the chain from the association records and cache it.
    pub async fn rebuild(&self) -> Result<Vec<String>, CacheError> {
        let docs = self
            .ctx
            .docs
            .find(ASSOCIATION_COLLECTION, &association_filter(), &FindOptions::new())
            .await?;
        let associations: Vec<MainlineAssociation> = docs
            .iter()
            .filter_map(|doc| match MainlineAssociation::decode(doc) {
                Decoded::Ok(association) => Some(association),
                Decoded::Skip(reason) => {
                    debug!(%reason, "Skipping association record");
                    None
                }
            })
            .collect();

        let chain = rank_mainline(&associations);
        let key = self.ctx.keys.topology();
        if let Err(e) = self.ctx.kv.set(&key, &chain.join(","), None).await {
            warn!(key, error = %e, "Failed to cache mainline topology");
        }
        debug!(chain = %chain.join(","), "Mainline topology rebuilt");
        Ok(chain)
    }

    /// Cache of one custom level, created on first use.
    pub fn custom_cache(&self, object: &str) -> Arc<InstanceCache> {
        self.customs
            .entry(object.to_string())
            .or_insert_with(|| Arc::new(InstanceCache::new(self.ctx.clone(), InstanceSchema::custom(object))))
            .clone()
    }

    /// Objects with a running custom level watch, sorted.
    #[must_use]
    pub fn watched_levels(&self) -> Vec<String> {
        let mut levels: Vec<String> = self.watches.lock().keys().cloned().collect();
        levels.sort();
        levels
    }

    /// Start watches for custom levels of `chain` and cancel the rest.
    pub fn sync_custom_watches(&self, chain: &[String]) {
        if self.root.is_cancelled() {
            return;
        }
        let wanted: HashSet<&str> = chain
            .iter()
            .map(String::as_str)
            .filter(|object| !is_builtin_object(object))
            .collect();

        let mut watches = self.watches.lock();
        watches.retain(|object, token| {
            if wanted.contains(object.as_str()) {
                return true;
            }
            info!(object = %object, "Custom level left the mainline, stopping its watch");
            token.cancel();
            false
        });

        for object in wanted {
            if watches.contains_key(object) {
                continue;
            }
            let cache = self.custom_cache(object);
            let options = cache.watch_options();
            let token = self.root.child_token();
            let reflector = Arc::clone(&self.reflector);
            let cancel = token.clone();
            self.tracker.spawn(async move {
                reflector.run(options, cache, cancel).await;
            });
            info!(object, "Custom level joined the mainline, watching it");
            watches.insert(object.to_string(), token);
        }
    }

    async fn on_change(&self) -> Result<(), CacheError> {
        let chain = self.rebuild().await?;
        self.sync_custom_watches(&chain);
        Ok(())
    }
}

#[async_trait]
impl EventHandler for MainlineCache {
    fn entity(&self) -> &str {
        ASSOCIATION_ENTITY
    }

    async fn handle(&self, event: ReflectorEvent) -> Result<(), CacheError> {
        match event {
            ReflectorEvent::Upsert { oid, document } => {
                if let Decoded::Skip(reason) = MainlineAssociation::decode(&document) {
                    debug!(oid, %reason, "Ignoring association change");
                    return Ok(());
                }
                self.on_change().await
            }
            ReflectorEvent::Delete { .. } => self.on_change().await,
            ReflectorEvent::ListDone => {
                self.ctx.kv.set(&self.keys.list_done(), &unix_now().to_string(), None).await?;
                self.on_change().await
            }
        }
    }
}
