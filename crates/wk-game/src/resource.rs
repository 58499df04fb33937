//! Resource ledger — atomic add / consume / check of the five scalars.
//!
//! All mutation goes through the cache's atomic integer fields; application
//! code never read-modify-writes a resource. `consume` walks the cost in
//! declared order and reverse-applies partial decrements when a field comes
//! up short, so a failed spend leaves the wallet exactly as it found it.

use std::sync::Arc;

use serde_json::{json, Value};

use wk_core::types::{ResourceBundle, ResourceKind, SyncClass, UserNo};
use wk_core::{GameError, GameResult};
use wk_store::keys;

use crate::context::Deps;

pub struct ResourceService {
    deps: Arc<Deps>,
    user_no: UserNo,
}

impl ResourceService {
    pub fn new(deps: Arc<Deps>, user_no: UserNo) -> Self {
        Self { deps, user_no }
    }

    /// Fill the resource hash from persistence on a cache miss.
    pub async fn ensure_cached(&self) -> GameResult<()> {
        let key = keys::resources(self.user_no);
        if self.deps.cache.exists(&key) {
            return Ok(());
        }
        let loaded = self
            .deps
            .db
            .load_resources(self.user_no)
            .await?
            .ok_or_else(|| GameError::NotFound(format!("resources for user {}", self.user_no)))?;
        self.deps.cache.hset_many(
            &key,
            ResourceKind::ALL
                .iter()
                .map(|k| (k.as_str().to_string(), loaded.get(*k).to_string())),
            Some(self.deps.user_ttl()),
        );
        Ok(())
    }

    /// Current wallet snapshot.
    pub async fn snapshot(&self) -> GameResult<ResourceBundle> {
        self.ensure_cached().await?;
        let fields = self.deps.cache.hgetall(&keys::resources(self.user_no));
        let mut out = ResourceBundle::default();
        for kind in ResourceKind::ALL {
            let v = fields
                .get(kind.as_str())
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            out.set(kind, v);
        }
        Ok(out)
    }

    pub async fn info(&self) -> GameResult<Value> {
        let snapshot = self.snapshot().await?;
        Ok(json!({ "user_no": self.user_no, "resources": snapshot }))
    }

    /// Verify the wallet covers `costs` without mutating it.
    pub async fn check(&self, costs: &ResourceBundle) -> GameResult<()> {
        let have = self.snapshot().await?;
        for (kind, amount) in costs.iter() {
            if have.get(kind) < amount {
                return Err(GameError::InsufficientResources(kind));
            }
        }
        Ok(())
    }

    /// Deduct `costs`, all or nothing. On the first field that would go
    /// negative, the failed decrement and every earlier one are reversed
    /// before the error is returned.
    pub async fn consume(&self, costs: &ResourceBundle) -> GameResult<()> {
        self.ensure_cached().await?;
        let key = keys::resources(self.user_no);
        let ttl = Some(self.deps.user_ttl());
        let mut applied: Vec<(ResourceKind, i64)> = Vec::new();

        for (kind, amount) in costs.iter() {
            if amount < 0 {
                return Err(GameError::Validation(format!(
                    "negative cost for {kind}"
                )));
            }
            let after = self.deps.cache.hincrby(&key, kind.as_str(), -amount, ttl);
            if after < 0 {
                self.deps.cache.hincrby(&key, kind.as_str(), amount, ttl);
                for (k, a) in applied.iter().rev() {
                    self.deps.cache.hincrby(&key, k.as_str(), *a, ttl);
                }
                return Err(GameError::InsufficientResources(kind));
            }
            applied.push((kind, amount));
        }

        if !applied.is_empty() {
            self.deps.dirty.mark(SyncClass::Resources, self.user_no);
        }
        Ok(())
    }

    /// Credit `gains`.
    pub async fn produce(&self, gains: &ResourceBundle) -> GameResult<()> {
        self.ensure_cached().await?;
        let key = keys::resources(self.user_no);
        let ttl = Some(self.deps.user_ttl());
        let mut touched = false;
        for (kind, amount) in gains.iter() {
            if amount < 0 {
                return Err(GameError::Validation(format!(
                    "negative gain for {kind}"
                )));
            }
            self.deps.cache.hincrby(&key, kind.as_str(), amount, ttl);
            touched = true;
        }
        if touched {
            self.deps.dirty.mark(SyncClass::Resources, self.user_no);
        }
        Ok(())
    }

    /// Deduct a single resource kind, compensating on shortfall.
    pub async fn atomic_consume(&self, kind: ResourceKind, amount: i64) -> GameResult<()> {
        if amount <= 0 {
            return Err(GameError::Validation(format!(
                "non-positive amount for {kind}"
            )));
        }
        self.ensure_cached().await?;
        let key = keys::resources(self.user_no);
        let ttl = Some(self.deps.user_ttl());
        let after = self.deps.cache.hincrby(&key, kind.as_str(), -amount, ttl);
        if after < 0 {
            self.deps.cache.hincrby(&key, kind.as_str(), amount, ttl);
            return Err(GameError::InsufficientResources(kind));
        }
        self.deps.dirty.mark(SyncClass::Resources, self.user_no);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use wk_core::catalog::GameCatalog;
    use wk_core::config::ServerConfig;
    use wk_core::types::UserProfile;

    async fn deps_with_user(user_no: i64, wallet: ResourceBundle) -> Arc<Deps> {
        let deps = Deps::in_memory(GameCatalog::default(), ServerConfig::default())
            .await
            .unwrap();
        let profile = UserProfile {
            user_no,
            account_id: format!("acct-{user_no}"),
            nickname: "tester".into(),
            level: 1,
            power: 0,
            alliance_id: None,
            alliance_position: None,
            created_at: Utc::now(),
        };
        deps.db.create_user(&profile, &wallet).await.unwrap();
        deps
    }

    #[tokio::test]
    async fn consume_then_produce_round_trips() {
        let deps = deps_with_user(
            1001,
            ResourceBundle {
                food: 5000,
                wood: 5000,
                ..ResourceBundle::default()
            },
        )
        .await;
        let svc = ResourceService::new(deps, 1001);
        let cost = ResourceBundle {
            food: 500,
            wood: 500,
            ..ResourceBundle::default()
        };
        svc.consume(&cost).await.unwrap();
        assert_eq!(svc.snapshot().await.unwrap().food, 4500);
        svc.produce(&cost).await.unwrap();
        let after = svc.snapshot().await.unwrap();
        assert_eq!(after.food, 5000);
        assert_eq!(after.wood, 5000);
    }

    #[tokio::test]
    async fn failed_consume_restores_prior_state() {
        let deps = deps_with_user(
            1,
            ResourceBundle {
                food: 1000,
                wood: 100,
                ..ResourceBundle::default()
            },
        )
        .await;
        let svc = ResourceService::new(deps, 1);
        // Food is covered, wood is short: the food decrement must be undone.
        let err = svc
            .consume(&ResourceBundle {
                food: 800,
                wood: 500,
                ..ResourceBundle::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GameError::InsufficientResources(ResourceKind::Wood)
        ));
        let after = svc.snapshot().await.unwrap();
        assert_eq!(after.food, 1000);
        assert_eq!(after.wood, 100);
    }

    #[tokio::test]
    async fn check_does_not_mutate() {
        let deps = deps_with_user(
            1,
            ResourceBundle {
                food: 100,
                ..ResourceBundle::default()
            },
        )
        .await;
        let svc = ResourceService::new(deps, 1);
        let err = svc
            .check(&ResourceBundle {
                food: 500,
                ..ResourceBundle::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GameError::InsufficientResources(ResourceKind::Food)
        ));
        assert_eq!(svc.snapshot().await.unwrap().food, 100);
    }

    #[tokio::test]
    async fn atomic_consume_single_field() {
        let deps = deps_with_user(
            1,
            ResourceBundle {
                ruby: 10,
                ..ResourceBundle::default()
            },
        )
        .await;
        let svc = ResourceService::new(deps, 1);
        svc.atomic_consume(ResourceKind::Ruby, 4).await.unwrap();
        assert_eq!(svc.snapshot().await.unwrap().ruby, 6);
        assert!(svc.atomic_consume(ResourceKind::Ruby, 7).await.is_err());
        assert_eq!(svc.snapshot().await.unwrap().ruby, 6);
    }

    #[tokio::test]
    async fn unknown_user_is_not_found() {
        let deps = Deps::in_memory(GameCatalog::default(), ServerConfig::default())
            .await
            .unwrap();
        let svc = ResourceService::new(deps, 404);
        assert!(matches!(
            svc.snapshot().await,
            Err(GameError::NotFound(_))
        ));
    }
}
