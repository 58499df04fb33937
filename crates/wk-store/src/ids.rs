//! Unique id issuance for users and alliances.
//!
//! The live counter is an atomic integer field in the cache, seeded from the
//! persistent store at startup. Every allocated value is committed to the
//! `counters` table before it is handed to the caller, so a restart can
//! never re-issue an id even if the row itself was not yet written back.

use std::sync::Arc;

use wk_core::GameResult;

use crate::cache::CacheStore;
use crate::keys;
use crate::persist::PersistentStore;

pub const COUNTER_USER: &str = "user_no";
pub const COUNTER_ALLIANCE: &str = "alliance_id";

#[derive(Clone)]
pub struct IdAllocator {
    cache: Arc<CacheStore>,
    db: Arc<PersistentStore>,
}

impl IdAllocator {
    pub fn new(cache: Arc<CacheStore>, db: Arc<PersistentStore>) -> Self {
        Self { cache, db }
    }

    /// Seed the in-cache counters from persistence. The committed counter
    /// value wins over `MAX(id)` when both exist, covering ids that were
    /// issued but whose rows never made it through write-behind.
    pub async fn seed(&self) -> GameResult<()> {
        let user_seed = match self.db.counter_value(COUNTER_USER).await? {
            Some(v) => v.max(self.db.max_user_no().await?),
            None => self.db.max_user_no().await?.max(1000),
        };
        let alliance_seed = match self.db.counter_value(COUNTER_ALLIANCE).await? {
            Some(v) => v.max(self.db.max_alliance_id().await?),
            None => self.db.max_alliance_id().await?,
        };
        self.cache.hset_many(
            &keys::counters(),
            [
                (COUNTER_USER.to_string(), user_seed.to_string()),
                (COUNTER_ALLIANCE.to_string(), alliance_seed.to_string()),
            ],
            None,
        );
        tracing::info!(user_seed, alliance_seed, "id counters seeded");
        Ok(())
    }

    pub async fn next_user_no(&self) -> GameResult<i64> {
        self.allocate(COUNTER_USER).await
    }

    pub async fn next_alliance_id(&self) -> GameResult<i64> {
        self.allocate(COUNTER_ALLIANCE).await
    }

    async fn allocate(&self, name: &str) -> GameResult<i64> {
        let id = self.cache.hincrby(&keys::counters(), name, 1, None);
        self.db.commit_counter(name, id).await?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ids_are_monotonic_and_committed() {
        let cache = Arc::new(CacheStore::new());
        let db = Arc::new(PersistentStore::open_in_memory().await.unwrap());
        let ids = IdAllocator::new(cache, db.clone());
        ids.seed().await.unwrap();

        let a = ids.next_user_no().await.unwrap();
        let b = ids.next_user_no().await.unwrap();
        assert_eq!(b, a + 1);
        assert!(a > 1000);
        assert_eq!(db.counter_value(COUNTER_USER).await.unwrap(), Some(b));
    }

    #[tokio::test]
    async fn reseed_resumes_from_committed_counter() {
        let cache = Arc::new(CacheStore::new());
        let db = Arc::new(PersistentStore::open_in_memory().await.unwrap());
        db.commit_counter(COUNTER_ALLIANCE, 41).await.unwrap();

        let ids = IdAllocator::new(cache, db);
        ids.seed().await.unwrap();
        assert_eq!(ids.next_alliance_id().await.unwrap(), 42);
    }
}
