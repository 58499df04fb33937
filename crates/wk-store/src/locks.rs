//! Named async locks for users and alliances.
//!
//! Every write path (player command or timed completion) takes the user's
//! lock for the whole logical operation; alliance mutations take the
//! alliance lock as well, always user first. Acquisition is bounded — a
//! holder stuck past the deadline surfaces as `LockTimeout` to the waiter
//! instead of wedging the request task.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use wk_core::types::{AllianceId, UserNo};
use wk_core::{GameError, GameResult};

/// Held for the duration of a logical operation; released on drop.
#[derive(Debug)]
pub struct LockGuard {
    _guard: OwnedMutexGuard<()>,
}

pub struct LockManager {
    locks: DashMap<String, Arc<Mutex<()>>>,
    timeout: Duration,
}

impl LockManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: DashMap::new(),
            timeout,
        }
    }

    pub async fn lock_user(&self, user_no: UserNo) -> GameResult<LockGuard> {
        self.acquire(format!("user:{user_no}")).await
    }

    pub async fn lock_alliance(&self, alliance_id: AllianceId) -> GameResult<LockGuard> {
        self.acquire(format!("alliance:{alliance_id}")).await
    }

    async fn acquire(&self, name: String) -> GameResult<LockGuard> {
        let mutex = self
            .locks
            .entry(name.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        match tokio::time::timeout(self.timeout, mutex.lock_owned()).await {
            Ok(guard) => Ok(LockGuard { _guard: guard }),
            Err(_) => {
                tracing::warn!(lock = %name, "lock acquisition timed out");
                Err(GameError::LockTimeout(name))
            }
        }
    }
}
