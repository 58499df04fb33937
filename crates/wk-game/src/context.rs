//! Shared dependencies and request plumbing for the domain services.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use wk_core::catalog::GameCatalog;
use wk_core::config::ServerConfig;
use wk_core::types::{TaskClass, UserNo};
use wk_core::{GameError, GameResult};
use wk_store::{CacheStore, DirtyTracker, IdAllocator, LockManager, PersistentStore, TaskQueue};

/// One completion queue per task class.
pub struct TaskQueues {
    pub building: TaskQueue,
    pub unit: TaskQueue,
    pub research: TaskQueue,
    pub buff: TaskQueue,
}

impl TaskQueues {
    pub fn new(cache: Arc<CacheStore>) -> Self {
        Self {
            building: TaskQueue::new(cache.clone(), TaskClass::Building),
            unit: TaskQueue::new(cache.clone(), TaskClass::UnitTraining),
            research: TaskQueue::new(cache.clone(), TaskClass::Research),
            buff: TaskQueue::new(cache, TaskClass::Buff),
        }
    }

    pub fn for_class(&self, class: TaskClass) -> &TaskQueue {
        match class {
            TaskClass::Building => &self.building,
            TaskClass::UnitTraining => &self.unit,
            TaskClass::Research => &self.research,
            TaskClass::Buff => &self.buff,
        }
    }
}

/// Everything a domain service needs, shared across requests and workers.
pub struct Deps {
    pub cache: Arc<CacheStore>,
    pub db: Arc<PersistentStore>,
    pub catalog: Arc<GameCatalog>,
    pub config: Arc<ServerConfig>,
    pub locks: Arc<LockManager>,
    pub dirty: DirtyTracker,
    pub ids: IdAllocator,
    pub queues: TaskQueues,
}

impl Deps {
    /// Wire the full dependency graph over an already-opened store pair and
    /// seed the id counters.
    pub async fn wire(
        cache: Arc<CacheStore>,
        db: Arc<PersistentStore>,
        catalog: Arc<GameCatalog>,
        config: Arc<ServerConfig>,
    ) -> GameResult<Arc<Deps>> {
        let locks = Arc::new(LockManager::new(Duration::from_secs(
            config.worker.lock_timeout_secs,
        )));
        let dirty = DirtyTracker::new(cache.clone());
        let ids = IdAllocator::new(cache.clone(), db.clone());
        ids.seed().await?;
        Ok(Arc::new(Deps {
            queues: TaskQueues::new(cache.clone()),
            cache,
            db,
            catalog,
            config,
            locks,
            dirty,
            ids,
        }))
    }

    /// Fully in-memory dependency graph, used by tests.
    pub async fn in_memory(catalog: GameCatalog, config: ServerConfig) -> GameResult<Arc<Deps>> {
        let cache = Arc::new(CacheStore::new());
        let db = Arc::new(PersistentStore::open_in_memory().await?);
        Self::wire(cache, db, Arc::new(catalog), Arc::new(config)).await
    }

    /// TTL applied to per-user entity hashes.
    pub fn user_ttl(&self) -> Duration {
        Duration::from_secs(self.config.cache.user_ttl_secs)
    }

    /// TTL applied to alliance hashes.
    pub fn alliance_ttl(&self) -> Duration {
        Duration::from_secs(self.config.cache.alliance_ttl_secs)
    }
}

/// A completion produced by a finish handler. The task worker turns these
/// into push messages after the queue entry is deleted.
#[derive(Debug, Clone)]
pub struct CompletionEvent {
    pub event: &'static str,
    pub user_no: UserNo,
    pub data: Value,
}

// ---------------------------------------------------------------------------
// Payload helpers
// ---------------------------------------------------------------------------

/// Required integer field of a command payload.
pub fn req_i64(data: &Value, field: &str) -> GameResult<i64> {
    data.get(field)
        .and_then(Value::as_i64)
        .ok_or_else(|| GameError::Validation(format!("missing field '{field}'")))
}

pub fn opt_i64(data: &Value, field: &str) -> Option<i64> {
    data.get(field).and_then(Value::as_i64)
}

pub fn req_str<'a>(data: &'a Value, field: &str) -> GameResult<&'a str> {
    data.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| GameError::Validation(format!("missing field '{field}'")))
}

pub fn opt_str<'a>(data: &'a Value, field: &str) -> Option<&'a str> {
    data.get(field).and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_field_extraction() {
        let data = json!({"building_idx": 201, "name": "x"});
        assert_eq!(req_i64(&data, "building_idx").unwrap(), 201);
        assert!(matches!(
            req_i64(&data, "missing"),
            Err(GameError::Validation(_))
        ));
        assert_eq!(req_str(&data, "name").unwrap(), "x");
        assert_eq!(opt_i64(&data, "nope"), None);
    }
}
