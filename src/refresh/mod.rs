// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Refresh coordination: at most one refresh per key across the fleet, and
//! never on the caller's time.
//!
//! # Protocol
//!
//! ```text
//! reader ──► try_refresh(keys, ttl, fetcher)
//!              │
//!              ├─ local flag held? ──────────────► return (no task)
//!              └─ claim flag, spawn task, return
//!
//! task:  expire fresh? ──────────────► Fresh
//!        SET lock NX PX lock_ttl fails ► Busy   (another instance owns it)
//!        expire fresh now? ───────────► Fresh  (release lock)
//!        fetcher.fetch()
//!          Some(v) ─► pipeline { SET target v ; SET expire now } ► Refreshed
//!          None    ─► pipeline { DEL target ; DEL expire }       ► Removed
//!        DEL lock (best effort, the TTL is the real safety net)
//!        drop guard ─► local flag cleared
//! ```
//!
//! Tasks run on a [`TaskTracker`] and stop at the service shutdown token. A
//! refresher that dies between writing the target and deleting its lock only
//! delays the next refresh by the lock TTL.

pub mod lock;
pub mod reconcile;

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

pub use lock::{RefreshGuard, RefreshingLock};
pub use reconcile::{diff_members, reconcile_list, ReconcileOutcome};

use crate::error::CacheError;
use crate::storage::traits::{KvBatch, KvStore};

/// Loads the authoritative value of one cache entry.
///
/// Detail fetchers produce `Option<String>` (`None` when the source record
/// is gone); list fetchers produce the desired member set.
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
    type Output: Send;

    async fn fetch(&self) -> Result<Self::Output, CacheError>;
}

/// Keys of one refreshable cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshKeys {
    /// Detail key or list key.
    pub target: String,
    pub expire: String,
    pub lock: String,
    /// KV expiry of a refreshed detail and its expire key; `None` keeps them
    /// until the next write.
    pub retention: Option<Duration>,
}

impl RefreshKeys {
    pub fn new(target: impl Into<String>, expire: impl Into<String>, lock: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            expire: expire.into(),
            lock: lock.into(),
            retention: None,
        }
    }

    #[must_use]
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshKind {
    Detail,
    List,
    /// Whole-key rebuild, e.g. a sorted id list.
    Rebuild,
}

impl RefreshKind {
    fn as_str(&self) -> &'static str {
        match self {
            RefreshKind::Detail => "detail",
            RefreshKind::List => "list",
            RefreshKind::Rebuild => "rebuild",
        }
    }
}

/// How one refresh attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The entry was refreshed recently enough.
    Fresh,
    /// Another refresher holds the lock.
    Busy,
    Refreshed,
    /// The source record is gone; the entry was dropped.
    Removed,
}

impl RefreshOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshOutcome::Fresh => "fresh",
            RefreshOutcome::Busy => "busy",
            RefreshOutcome::Refreshed => "refreshed",
            RefreshOutcome::Removed => "removed",
        }
    }
}

/// Current unix time in seconds.
#[must_use]
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Whether an entry stamped `expire` (unix seconds) is older than `ttl`.
/// A missing or unreadable stamp counts as stale.
#[must_use]
pub fn is_stale(expire: Option<&str>, ttl: Duration, now: i64) -> bool {
    match expire.and_then(|raw| raw.trim().parse::<i64>().ok()) {
        Some(stamp) => now.saturating_sub(stamp) > ttl.as_secs() as i64,
        None => true,
    }
}

/// Spawns and supervises background refreshes.
pub struct RefreshCoordinator {
    kv: Arc<dyn KvStore>,
    local: RefreshingLock,
    lock_ttl: Duration,
    /// Value written into distributed locks, identifies this instance.
    owner: String,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl RefreshCoordinator {
    pub fn new(kv: Arc<dyn KvStore>, lock_ttl: Duration, shutdown: CancellationToken) -> Self {
        Self {
            kv,
            local: RefreshingLock::new(),
            lock_ttl,
            owner: uuid::Uuid::new_v4().to_string(),
            tasks: TaskTracker::new(),
            shutdown,
        }
    }

    #[must_use]
    pub fn local_lock(&self) -> &RefreshingLock {
        &self.local
    }

    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Kick off a background detail refresh. Returns whether a task was spawned.
    pub fn try_refresh_detail<F>(&self, keys: RefreshKeys, ttl: Duration, fetcher: F) -> bool
    where
        F: Fetcher<Output = Option<String>>,
    {
        self.spawn(RefreshKind::Detail, keys, ttl, move |kv, keys, lock_ttl, owner| async move {
            run_detail(kv.as_ref(), &keys, ttl, lock_ttl, &owner, &fetcher).await
        })
    }

    /// Kick off a background list reconciliation. Returns whether a task was spawned.
    pub fn try_refresh_list<F>(&self, keys: RefreshKeys, ttl: Duration, fetcher: F) -> bool
    where
        F: Fetcher<Output = Vec<String>>,
    {
        self.spawn(RefreshKind::List, keys, ttl, move |kv, keys, lock_ttl, owner| async move {
            run_list(kv.as_ref(), &keys, ttl, lock_ttl, &owner, &fetcher).await
        })
    }

    /// Kick off a background rebuild. The fetcher writes the target itself;
    /// the coordinator stamps the expire key afterwards. `force` skips the
    /// staleness check, for targets that vanished while their stamp is fresh.
    pub fn try_rebuild<F>(&self, keys: RefreshKeys, ttl: Duration, lock_ttl: Duration, force: bool, fetcher: F) -> bool
    where
        F: Fetcher<Output = ()>,
    {
        self.spawn(RefreshKind::Rebuild, keys, ttl, move |kv, keys, _, owner| async move {
            run_rebuild(kv.as_ref(), &keys, ttl, lock_ttl, &owner, force, &fetcher).await
        })
    }

    /// Run a rebuild on the caller's task, under the same two locks.
    pub async fn rebuild_now<F>(
        &self,
        keys: &RefreshKeys,
        ttl: Duration,
        lock_ttl: Duration,
        force: bool,
        fetcher: &F,
    ) -> Result<RefreshOutcome, CacheError>
    where
        F: Fetcher<Output = ()>,
    {
        let Some(_guard) = self.local.try_acquire(&keys.target) else {
            return Ok(RefreshOutcome::Busy);
        };
        let outcome = run_rebuild(self.kv.as_ref(), keys, ttl, lock_ttl, &self.owner, force, fetcher).await;
        record(RefreshKind::Rebuild, &keys.target, &outcome);
        outcome
    }

    /// Run a detail refresh on the caller's task, under the same two locks.
    pub async fn refresh_detail_now<F>(&self, keys: &RefreshKeys, ttl: Duration, fetcher: &F) -> Result<RefreshOutcome, CacheError>
    where
        F: Fetcher<Output = Option<String>>,
    {
        let Some(_guard) = self.local.try_acquire(&keys.target) else {
            return Ok(RefreshOutcome::Busy);
        };
        let outcome = run_detail(self.kv.as_ref(), keys, ttl, self.lock_ttl, &self.owner, fetcher).await;
        record(RefreshKind::Detail, &keys.target, &outcome);
        outcome
    }

    /// Run a list reconciliation on the caller's task, under the same two locks.
    pub async fn refresh_list_now<F>(&self, keys: &RefreshKeys, ttl: Duration, fetcher: &F) -> Result<RefreshOutcome, CacheError>
    where
        F: Fetcher<Output = Vec<String>>,
    {
        let Some(_guard) = self.local.try_acquire(&keys.target) else {
            return Ok(RefreshOutcome::Busy);
        };
        let outcome = run_list(self.kv.as_ref(), keys, ttl, self.lock_ttl, &self.owner, fetcher).await;
        record(RefreshKind::List, &keys.target, &outcome);
        outcome
    }

    fn spawn<T, Fut>(&self, kind: RefreshKind, keys: RefreshKeys, ttl: Duration, task: T) -> bool
    where
        T: FnOnce(Arc<dyn KvStore>, RefreshKeys, Duration, String) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<RefreshOutcome, CacheError>> + Send + 'static,
    {
        if self.shutdown.is_cancelled() {
            return false;
        }
        let Some(guard) = self.local.try_acquire(&keys.target) else {
            debug!(key = %keys.target, kind = kind.as_str(), "Refresh already running locally");
            return false;
        };

        let kv = Arc::clone(&self.kv);
        let lock_ttl = self.lock_ttl;
        let owner = self.owner.clone();
        let shutdown = self.shutdown.clone();
        debug!(key = %keys.target, kind = kind.as_str(), ttl_secs = ttl.as_secs(), "Spawning refresh");

        self.tasks.spawn(async move {
            let _guard = guard;
            let target = keys.target.clone();
            let outcome = tokio::select! {
                _ = shutdown.cancelled() => return,
                outcome = task(kv, keys, lock_ttl, owner) => outcome,
            };
            record(kind, &target, &outcome);
        });
        true
    }

    /// Wait until every refresh spawned so far has finished.
    pub async fn wait_idle(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    /// Cancel running refreshes and wait for their tasks to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

fn record(kind: RefreshKind, target: &str, outcome: &Result<RefreshOutcome, CacheError>) {
    match outcome {
        Ok(outcome) => {
            crate::metrics::record_refresh(kind.as_str(), outcome.as_str());
            debug!(key = target, kind = kind.as_str(), outcome = outcome.as_str(), "Refresh finished");
        }
        Err(e) => {
            crate::metrics::record_refresh(kind.as_str(), "error");
            warn!(key = target, kind = kind.as_str(), error = %e, "Refresh failed");
        }
    }
}

/// Staleness check plus distributed lock. `Ok(None)` means the lock is ours.
async fn claim(
    kv: &dyn KvStore,
    keys: &RefreshKeys,
    ttl: Duration,
    lock_ttl: Duration,
    owner: &str,
) -> Result<Option<RefreshOutcome>, CacheError> {
    let expire = kv.get(&keys.expire).await?;
    if !is_stale(expire.as_deref(), ttl, unix_now()) {
        return Ok(Some(RefreshOutcome::Fresh));
    }
    if !kv.set_nx(&keys.lock, owner, lock_ttl).await? {
        return Ok(Some(RefreshOutcome::Busy));
    }
    // A refresh may have completed between the first check and the lock.
    let expire = kv.get(&keys.expire).await?;
    if !is_stale(expire.as_deref(), ttl, unix_now()) {
        release(kv, &keys.lock).await;
        return Ok(Some(RefreshOutcome::Fresh));
    }
    Ok(None)
}

async fn release(kv: &dyn KvStore, lock: &str) {
    if let Err(e) = kv.del(lock).await {
        debug!(lock, error = %e, "Failed to release refresh lock, it will expire");
    }
}

async fn run_detail<F>(
    kv: &dyn KvStore,
    keys: &RefreshKeys,
    ttl: Duration,
    lock_ttl: Duration,
    owner: &str,
    fetcher: &F,
) -> Result<RefreshOutcome, CacheError>
where
    F: Fetcher<Output = Option<String>>,
{
    if let Some(outcome) = claim(kv, keys, ttl, lock_ttl, owner).await? {
        return Ok(outcome);
    }

    let written = async {
        let fetched = fetcher.fetch().await?;
        let mut batch = KvBatch::new();
        let outcome = match fetched {
            Some(value) => {
                batch
                    .set(&keys.target, value, keys.retention)
                    .set(&keys.expire, unix_now().to_string(), keys.retention);
                RefreshOutcome::Refreshed
            }
            None => {
                batch.del(&keys.target).del(&keys.expire);
                RefreshOutcome::Removed
            }
        };
        kv.execute(batch).await?;
        Ok::<_, CacheError>(outcome)
    }
    .await;

    release(kv, &keys.lock).await;
    written
}

async fn run_list<F>(
    kv: &dyn KvStore,
    keys: &RefreshKeys,
    ttl: Duration,
    lock_ttl: Duration,
    owner: &str,
    fetcher: &F,
) -> Result<RefreshOutcome, CacheError>
where
    F: Fetcher<Output = Vec<String>>,
{
    if let Some(outcome) = claim(kv, keys, ttl, lock_ttl, owner).await? {
        return Ok(outcome);
    }

    let written = async {
        let desired = fetcher.fetch().await?;
        reconcile_list(kv, &keys.target, &keys.expire, &desired, unix_now()).await?;
        Ok::<_, CacheError>(RefreshOutcome::Refreshed)
    }
    .await;

    release(kv, &keys.lock).await;
    written
}

async fn run_rebuild<F>(
    kv: &dyn KvStore,
    keys: &RefreshKeys,
    ttl: Duration,
    lock_ttl: Duration,
    owner: &str,
    force: bool,
    fetcher: &F,
) -> Result<RefreshOutcome, CacheError>
where
    F: Fetcher<Output = ()>,
{
    if force {
        if !kv.set_nx(&keys.lock, owner, lock_ttl).await? {
            return Ok(RefreshOutcome::Busy);
        }
    } else if let Some(outcome) = claim(kv, keys, ttl, lock_ttl, owner).await? {
        return Ok(outcome);
    }

    let written = async {
        fetcher.fetch().await?;
        kv.set(&keys.expire, &unix_now().to_string(), None).await?;
        Ok::<_, CacheError>(RefreshOutcome::Refreshed)
    }
    .await;

    release(kv, &keys.lock).await;
    written
}
