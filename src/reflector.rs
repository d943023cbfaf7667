// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! List+watch ingestion of one collection.
//!
//! # Phases
//!
//! ```text
//!                 ┌──────────────────────────┐
//!   start ──────► │ list_done marker in KV?  │
//!                 └──────┬────────────┬──────┘
//!                    no  │            │ yes
//!                        ▼            ▼
//!   Phase A: token = head         Phase B: token = persisted token
//!            subscribe(token)              (head when missing)
//!            page by _id ──► Upsert        subscribe(token)
//!            ListDone                            │
//!                        └──────┬────────────────┘
//!                               ▼
//!                 consume: Insert/Update/Replace ─► Upsert
//!                          Delete ─────────────────► Delete
//!                          persist event token
//! ```
//!
//! The subscription is opened before the bulk list starts, so writes racing
//! the list show up as events afterwards; handlers are idempotent upserts, so
//! seeing a document twice is harmless.
//!
//! Handler errors are logged and the event is skipped. A closed feed or a
//! failed subscription is retried with daemon backoff until the cancellation
//! token fires.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::document::{Filter, FindOptions, OID_FIELD};
use crate::error::CacheError;
use crate::event::{document_oid, ChangeEvent, ChangeOp, ResumeToken};
use crate::resilience::retry::{retry_until_cancelled, RetryConfig};
use crate::storage::traits::{ChangeStream, DocumentStore, KvStore};

/// What an entity cache is asked to do.
#[derive(Debug, Clone, PartialEq)]
pub enum ReflectorEvent {
    /// Document created or changed; carries the full body.
    Upsert { oid: String, document: Value },
    /// Document removed; carries only its id.
    Delete { oid: String },
    /// The bulk list of Phase A is complete.
    ListDone,
}

impl ReflectorEvent {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ReflectorEvent::Upsert { .. } => "upsert",
            ReflectorEvent::Delete { .. } => "delete",
            ReflectorEvent::ListDone => "list_done",
        }
    }

    /// Convert a feed event. Upserts without a body are dropped.
    #[must_use]
    pub fn from_change(event: ChangeEvent) -> Option<Self> {
        match event.op {
            ChangeOp::Delete => Some(ReflectorEvent::Delete { oid: event.oid }),
            ChangeOp::Insert | ChangeOp::Update | ChangeOp::Replace => event
                .document
                .map(|document| ReflectorEvent::Upsert { oid: event.oid, document }),
        }
    }
}

/// One entity cache's side of ingestion.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Entity name used in logs and metrics.
    fn entity(&self) -> &str;

    async fn handle(&self, event: ReflectorEvent) -> Result<(), CacheError>;
}

/// Where and what one reflector watches.
#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub collection: String,
    pub filter: Filter,
    pub page_size: usize,
    /// Marker written by the handler on `ListDone`.
    pub list_done_key: String,
    /// Where the last handled feed position is kept.
    pub token_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    ListWatch,
    WatchOnly,
}

enum StreamEnd {
    Cancelled,
    Closed,
}

static ACTIVE_WATCHERS: AtomicUsize = AtomicUsize::new(0);

/// Number of reflectors currently running in this process.
#[must_use]
pub fn active_watchers() -> usize {
    ACTIVE_WATCHERS.load(Ordering::Relaxed)
}

struct WatcherCount;

impl WatcherCount {
    fn enter() -> Self {
        let now = ACTIVE_WATCHERS.fetch_add(1, Ordering::Relaxed) + 1;
        crate::metrics::set_active_watchers(now);
        WatcherCount
    }
}

impl Drop for WatcherCount {
    fn drop(&mut self) {
        let now = ACTIVE_WATCHERS.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        crate::metrics::set_active_watchers(now);
    }
}

/// Drives one collection into one [`EventHandler`].
pub struct Reflector {
    kv: Arc<dyn KvStore>,
    docs: Arc<dyn DocumentStore>,
    retry: RetryConfig,
}

impl Reflector {
    pub fn new(kv: Arc<dyn KvStore>, docs: Arc<dyn DocumentStore>) -> Self {
        Self {
            kv,
            docs,
            retry: RetryConfig::daemon(),
        }
    }

    /// Backoff of re-subscription.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Run until `cancel` fires.
    #[tracing::instrument(skip_all, fields(collection = %options.collection, entity = handler.entity()))]
    pub async fn run(&self, options: WatchOptions, handler: Arc<dyn EventHandler>, cancel: CancellationToken) {
        let _active = WatcherCount::enter();
        let operation = format!("reflector_{}", options.collection);
        info!("Reflector started");

        loop {
            let established = retry_until_cancelled(&operation, &self.retry, &cancel, || {
                self.establish(&options, handler.as_ref())
            })
            .await;

            let stream = match established {
                None => break,
                Some(Ok(stream)) => stream,
                // Unbounded retry only gives up on cancellation.
                Some(Err(e)) => {
                    warn!(error = %e, "Reflector gave up subscribing");
                    break;
                }
            };

            match self.consume(stream, &options, handler.as_ref(), &cancel).await {
                StreamEnd::Cancelled => break,
                StreamEnd::Closed => {
                    warn!("Change feed closed, resubscribing");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.retry.initial_delay) => {}
                    }
                }
            }
        }

        info!("Reflector stopped");
    }

    async fn phase(&self, options: &WatchOptions) -> Phase {
        match self.kv.exists(&options.list_done_key).await {
            Ok(true) => Phase::WatchOnly,
            Ok(false) => Phase::ListWatch,
            Err(e) => {
                warn!(key = %options.list_done_key, error = %e, "Cannot read list marker, listing again");
                Phase::ListWatch
            }
        }
    }

    /// Open the feed, running the bulk list first when the marker is absent.
    async fn establish(&self, options: &WatchOptions, handler: &dyn EventHandler) -> Result<ChangeStream, CacheError> {
        match self.phase(options).await {
            Phase::WatchOnly => {
                let token = self.resume_token(options).await?;
                debug!(token = %token, "Watching from persisted position");
                Ok(self.docs.watch(&options.collection, &options.filter, token).await?)
            }
            Phase::ListWatch => {
                let token = self.docs.current_token(&options.collection).await?;
                let stream = self
                    .docs
                    .watch(&options.collection, &options.filter, token.clone())
                    .await?;

                let listed = self.list_all(options, handler).await?;
                dispatch(handler, ReflectorEvent::ListDone).await;
                self.persist_token(options, &token).await;
                info!(documents = listed, "Bulk list done, watching");
                Ok(stream)
            }
        }
    }

    async fn resume_token(&self, options: &WatchOptions) -> Result<ResumeToken, CacheError> {
        match self.kv.get(&options.token_key).await {
            Ok(Some(token)) => Ok(ResumeToken::new(token)),
            Ok(None) => {
                warn!(key = %options.token_key, "No resume token, watching from the current head");
                Ok(self.docs.current_token(&options.collection).await?)
            }
            Err(e) => {
                warn!(key = %options.token_key, error = %e, "Cannot read resume token, watching from the current head");
                Ok(self.docs.current_token(&options.collection).await?)
            }
        }
    }

    /// Page the collection by `_id`, dispatching each document as an upsert.
    async fn list_all(&self, options: &WatchOptions, handler: &dyn EventHandler) -> Result<usize, CacheError> {
        let page_size = options.page_size.max(1);
        let mut last_oid: Option<String> = None;
        let mut listed = 0;

        loop {
            let filter = match &last_oid {
                Some(oid) => options.filter.clone().and(Filter::gt(OID_FIELD, oid.clone())),
                None => options.filter.clone(),
            };
            let page = self
                .docs
                .find(
                    &options.collection,
                    &filter,
                    &FindOptions::new().sort_asc(OID_FIELD).limit(page_size as u64),
                )
                .await?;
            let exhausted = page.len() < page_size;

            for document in page {
                let Some(oid) = document_oid(&document) else {
                    debug!("Listed document without _id, skipping");
                    continue;
                };
                last_oid = Some(oid.clone());
                listed += 1;
                dispatch(handler, ReflectorEvent::Upsert { oid, document }).await;
            }

            if exhausted || last_oid.is_none() {
                return Ok(listed);
            }
        }
    }

    async fn consume(
        &self,
        mut stream: ChangeStream,
        options: &WatchOptions,
        handler: &dyn EventHandler,
        cancel: &CancellationToken,
    ) -> StreamEnd {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return StreamEnd::Cancelled,
                event = stream.recv() => event,
            };
            let Some(event) = event else {
                return StreamEnd::Closed;
            };

            let token = event.token.clone();
            match ReflectorEvent::from_change(event) {
                Some(event) => dispatch(handler, event).await,
                None => debug!("Upsert event without document, skipping"),
            }
            self.persist_token(options, &token).await;
        }
    }

    async fn persist_token(&self, options: &WatchOptions, token: &ResumeToken) {
        if let Err(e) = self.kv.set(&options.token_key, token.as_str(), None).await {
            warn!(key = %options.token_key, error = %e, "Failed to persist resume token");
        }
    }
}

async fn dispatch(handler: &dyn EventHandler, event: ReflectorEvent) {
    let kind = event.kind();
    match handler.handle(event).await {
        Ok(()) => crate::metrics::record_event(handler.entity(), kind, "ok"),
        Err(e) => {
            crate::metrics::record_event(handler.entity(), kind, "error");
            warn!(entity = handler.entity(), event = kind, error = %e, "Event handler failed, skipping event");
        }
    }
}
