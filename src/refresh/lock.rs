// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Process-local "refresh in flight" flags.
//!
//! The first and cheapest of the two exclusion levels: a hot read path that
//! sees a stale key many times per second spawns one refresh task, not one per
//! read. The flag lives exactly as long as its [`RefreshGuard`].

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Set of keys with a refresh running in this process.
#[derive(Debug, Clone, Default)]
pub struct RefreshingLock {
    flags: Arc<DashMap<String, ()>>,
}

impl RefreshingLock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key`. `None` when a refresh of it is already running here.
    #[must_use]
    pub fn try_acquire(&self, key: &str) -> Option<RefreshGuard> {
        match self.flags.entry(key.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(RefreshGuard {
                    flags: Arc::clone(&self.flags),
                    key: key.to_string(),
                })
            }
        }
    }

    #[must_use]
    pub fn is_refreshing(&self, key: &str) -> bool {
        self.flags.contains_key(key)
    }

    /// Number of keys currently flagged.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.flags.len()
    }
}

/// Clears its flag on drop, whichever way the refresh ended.
#[derive(Debug)]
pub struct RefreshGuard {
    flags: Arc<DashMap<String, ()>>,
    key: String,
}

impl RefreshGuard {
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        self.flags.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_is_refused() {
        let lock = RefreshingLock::new();
        let guard = lock.try_acquire("cc:biz:detail:5").unwrap();
        assert_eq!(guard.key(), "cc:biz:detail:5");
        assert!(lock.try_acquire("cc:biz:detail:5").is_none());
        assert!(lock.try_acquire("cc:biz:detail:6").is_some());
    }

    #[test]
    fn test_drop_clears_flag() {
        let lock = RefreshingLock::new();
        {
            let _guard = lock.try_acquire("k").unwrap();
            assert!(lock.is_refreshing("k"));
            assert_eq!(lock.in_flight(), 1);
        }
        assert!(!lock.is_refreshing("k"));
        assert!(lock.try_acquire("k").is_some());
    }

    #[test]
    fn test_clones_share_flags() {
        let lock = RefreshingLock::new();
        let other = lock.clone();
        let _guard = lock.try_acquire("k").unwrap();
        assert!(other.try_acquire("k").is_none());
    }

    #[test]
    fn test_flag_cleared_when_task_panics() {
        let lock = RefreshingLock::new();
        let guard = lock.try_acquire("k").unwrap();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = guard;
            panic!("refresh blew up");
        }));
        assert!(result.is_err());
        assert!(!lock.is_refreshing("k"));
    }
}
