//! Set-membership reconciliation of base lists.

use std::collections::HashSet;

use tracing::debug;

use crate::storage::traits::{KvBatch, KvStore, StorageError};

/// Membership change applied by one reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl ReconcileOutcome {
    /// Whether the list already matched.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Members to add and to remove so that `actual` becomes `desired`.
///
/// Output order follows the input order; duplicates collapse.
#[must_use]
pub fn diff_members(desired: &[String], actual: &[String]) -> (Vec<String>, Vec<String>) {
    let want: HashSet<&str> = desired.iter().map(String::as_str).collect();
    let have: HashSet<&str> = actual.iter().map(String::as_str).collect();

    let mut seen = HashSet::new();
    let add = desired
        .iter()
        .filter(|m| !have.contains(m.as_str()) && seen.insert(m.as_str()))
        .cloned()
        .collect();
    let mut seen = HashSet::new();
    let remove = actual
        .iter()
        .filter(|m| !want.contains(m.as_str()) && seen.insert(m.as_str()))
        .cloned()
        .collect();
    (add, remove)
}

/// Make the set at `list_key` equal `desired` and stamp `expire_key` with
/// `now`, all in one pipeline.
pub async fn reconcile_list(
    kv: &dyn KvStore,
    list_key: &str,
    expire_key: &str,
    desired: &[String],
    now: i64,
) -> Result<ReconcileOutcome, StorageError> {
    let actual = kv.smembers(list_key).await?;
    let (added, removed) = diff_members(desired, &actual);

    let mut batch = KvBatch::new();
    batch
        .sadd(list_key, added.clone())
        .srem(list_key, removed.clone())
        .set(expire_key, now.to_string(), None);
    kv.execute(batch).await?;

    crate::metrics::record_reconcile(added.len(), removed.len());
    debug!(list = list_key, added = added.len(), removed = removed.len(), "Base list reconciled");
    Ok(ReconcileOutcome { added, removed })
}
