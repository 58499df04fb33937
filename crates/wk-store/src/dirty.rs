//! Dirty-user tracking for the write-behind sync workers.

use std::sync::Arc;

use wk_core::types::{SyncClass, UserNo};

use crate::cache::CacheStore;
use crate::keys;

/// Marks users whose cached state has diverged from persistence, one set
/// per entity class. Sync workers drain a snapshot each cycle; a failed
/// flush re-marks the user so convergence is eventual.
#[derive(Clone)]
pub struct DirtyTracker {
    cache: Arc<CacheStore>,
}

impl DirtyTracker {
    pub fn new(cache: Arc<CacheStore>) -> Self {
        Self { cache }
    }

    pub fn mark(&self, class: SyncClass, user_no: UserNo) {
        self.cache
            .sadd(&keys::sync_pending(class), user_no.to_string());
    }

    /// Snapshot-pop every pending user for the class. Users marked after
    /// the pop land in the next cycle.
    pub fn drain(&self, class: SyncClass) -> Vec<UserNo> {
        let mut users: Vec<UserNo> = self
            .cache
            .spop_all(&keys::sync_pending(class))
            .into_iter()
            .filter_map(|s| s.parse().ok())
            .collect();
        users.sort_unstable();
        users
    }

    pub fn pending(&self, class: SyncClass) -> usize {
        self.cache.scard(&keys::sync_pending(class))
    }
}
