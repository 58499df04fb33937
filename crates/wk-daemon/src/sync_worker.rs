//! Write-behind sync workers.
//!
//! One worker per entity class, each on its own cadence. A cycle pops the
//! whole dirty-user snapshot and flushes each user's cached class state
//! into persistence; a user whose flush fails is re-marked dirty so the
//! next cycle retries them. A write that lands mid-cycle re-dirties the
//! user, which is what makes cache and persistence eventually converge.

use std::sync::Arc;
use std::time::Duration;

use wk_bridge::HealthRegistry;
use wk_core::types::{
    BuildingState, ItemStack, MissionProgress, ResearchState, ResourceBundle, ResourceKind,
    SyncClass, UnitStack, UnitTask, UserNo,
};
use wk_core::GameResult;
use wk_game::Deps;
use wk_store::keys;

use crate::shutdown::ShutdownSignal;

pub struct SyncWorker {
    deps: Arc<Deps>,
    class: SyncClass,
    interval: Duration,
    health: Arc<HealthRegistry>,
}

impl SyncWorker {
    pub fn new(deps: Arc<Deps>, class: SyncClass, health: Arc<HealthRegistry>) -> Self {
        let interval = deps.config.sync.interval_for(class);
        Self {
            deps,
            class,
            interval,
            health,
        }
    }

    /// Flush on the class cadence until shutdown, then run one final
    /// forced drain.
    pub async fn run(&self, shutdown: ShutdownSignal) {
        self.health
            .register_sync_worker(self.class.as_str(), self.interval);
        let mut interval = tokio::time::interval(self.interval);
        // Consume the immediate first tick so workers don't all fire at t=0.
        interval.tick().await;
        let mut shutdown_rx = shutdown.subscribe();
        tracing::info!(
            class = self.class.as_str(),
            interval_secs = self.interval.as_secs(),
            "sync worker started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.flush_pending().await;
                    self.health.record_sync_cycle(self.class.as_str());
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!(class = self.class.as_str(), "sync worker draining");
                    self.flush_pending().await;
                    break;
                }
            }
        }
    }

    /// One cycle: snapshot the dirty set and flush each user. Returns
    /// `(succeeded, failed)`.
    pub async fn flush_pending(&self) -> (usize, usize) {
        let users = self.deps.dirty.drain(self.class);
        if users.is_empty() {
            return (0, 0);
        }

        let mut success = 0;
        let mut fail = 0;
        for user_no in users {
            match self.flush_user(user_no).await {
                Ok(()) => success += 1,
                Err(e) => {
                    fail += 1;
                    // Leave the user dirty for the next cycle.
                    self.deps.dirty.mark(self.class, user_no);
                    tracing::error!(
                        class = self.class.as_str(),
                        user_no,
                        error = %e,
                        "sync failed"
                    );
                }
            }
        }
        tracing::info!(
            class = self.class.as_str(),
            success,
            fail,
            "sync cycle complete"
        );
        (success, fail)
    }

    /// Flush one user's class snapshot. An expired cache key means the
    /// snapshot is gone — nothing is written, so persistence keeps its
    /// last-known rows.
    async fn flush_user(&self, user_no: UserNo) -> GameResult<()> {
        match self.class {
            SyncClass::Building => {
                let rows = parse_values::<BuildingState>(
                    self.deps.cache.hgetall(&keys::buildings(user_no)),
                );
                if rows.is_empty() {
                    return Ok(());
                }
                self.deps.db.save_buildings(user_no, &rows).await
            }
            SyncClass::Research => {
                let rows = parse_values::<ResearchState>(
                    self.deps.cache.hgetall(&keys::researches(user_no)),
                );
                if rows.is_empty() {
                    return Ok(());
                }
                self.deps.db.save_researches(user_no, &rows).await
            }
            SyncClass::Unit => {
                let stacks =
                    parse_values::<UnitStack>(self.deps.cache.hgetall(&keys::units(user_no)));
                if stacks.is_empty() {
                    return Ok(());
                }
                let tasks = self.deps.cache.hgetall(&keys::unit_tasks(user_no));
                let rows: Vec<(UnitStack, Option<UnitTask>)> = stacks
                    .into_iter()
                    .map(|s| {
                        let task = tasks
                            .get(&s.unit_idx.to_string())
                            .and_then(|raw| serde_json::from_str(raw).ok());
                        (s, task)
                    })
                    .collect();
                self.deps.db.save_units(user_no, &rows).await
            }
            SyncClass::Resources => {
                let fields = self.deps.cache.hgetall(&keys::resources(user_no));
                if fields.is_empty() {
                    return Ok(());
                }
                let mut bundle = ResourceBundle::default();
                for kind in ResourceKind::ALL {
                    let v = fields
                        .get(kind.as_str())
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(0);
                    bundle.set(kind, v);
                }
                self.deps.db.save_resources(user_no, &bundle).await
            }
            SyncClass::Item => {
                let fields = self.deps.cache.hgetall(&keys::items(user_no));
                let rows: Vec<ItemStack> = fields
                    .into_iter()
                    .filter_map(|(k, v)| {
                        Some(ItemStack {
                            item_idx: k.parse().ok()?,
                            quantity: v.parse().ok()?,
                        })
                    })
                    .collect();
                // An empty item hash is a valid state (everything spent),
                // so it is flushed rather than skipped.
                self.deps.db.save_items(user_no, &rows).await
            }
            SyncClass::Mission => {
                let rows = parse_values::<MissionProgress>(
                    self.deps.cache.hgetall(&keys::missions(user_no)),
                );
                if rows.is_empty() {
                    return Ok(());
                }
                self.deps.db.save_missions(user_no, &rows).await
            }
        }
    }
}

fn parse_values<T: serde::de::DeserializeOwned>(
    fields: std::collections::HashMap<String, String>,
) -> Vec<T> {
    fields
        .into_values()
        .filter_map(|raw| serde_json::from_str(&raw).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use wk_bridge::AppState;
    use wk_core::catalog::{BuildingLevel, GameCatalog};
    use wk_core::config::ServerConfig;
    use wk_core::types::UserProfile;
    use wk_game::building::BuildingService;
    use wk_game::resource::ResourceService;

    fn catalog() -> GameCatalog {
        let mut c = GameCatalog::default();
        let mut levels = std::collections::BTreeMap::new();
        levels.insert(
            1,
            BuildingLevel {
                cost: ResourceBundle {
                    food: 500,
                    ..ResourceBundle::default()
                },
                build_secs: 0,
                requires: vec![],
                power: 0,
            },
        );
        c.buildings.insert(201, levels);
        c
    }

    async fn setup() -> (Arc<Deps>, Arc<HealthRegistry>) {
        let deps = Deps::in_memory(catalog(), ServerConfig::default())
            .await
            .unwrap();
        let profile = UserProfile {
            user_no: 1,
            account_id: "a".into(),
            nickname: "n".into(),
            level: 1,
            power: 0,
            alliance_id: None,
            alliance_position: None,
            created_at: Utc::now(),
        };
        deps.db
            .create_user(
                &profile,
                &ResourceBundle {
                    food: 5000,
                    ..ResourceBundle::default()
                },
            )
            .await
            .unwrap();
        let state = AppState::new(deps.clone());
        (deps, state.health.clone())
    }

    #[tokio::test]
    async fn dirty_resources_reach_persistence() {
        let (deps, health) = setup().await;
        let resources = ResourceService::new(deps.clone(), 1);
        resources
            .consume(&ResourceBundle {
                food: 1200,
                ..ResourceBundle::default()
            })
            .await
            .unwrap();

        let worker = SyncWorker::new(deps.clone(), SyncClass::Resources, health);
        let (success, fail) = worker.flush_pending().await;
        assert_eq!((success, fail), (1, 0));

        let persisted = deps.db.load_resources(1).await.unwrap().unwrap();
        assert_eq!(persisted.food, 3800);
    }

    #[tokio::test]
    async fn drain_is_idempotent() {
        let (deps, health) = setup().await;
        BuildingService::new(deps.clone(), 1)
            .create(&json!({ "building_idx": 201 }))
            .await
            .unwrap();

        let worker = SyncWorker::new(deps.clone(), SyncClass::Building, health);
        assert_eq!(worker.flush_pending().await, (1, 0));
        let first = deps.db.load_buildings(1).await.unwrap();

        // Nothing dirty: the second drain writes nothing and changes
        // nothing.
        assert_eq!(worker.flush_pending().await, (0, 0));
        let second = deps.db.load_buildings(1).await.unwrap();
        assert_eq!(first.len(), second.len());
        assert_eq!(first[0].level, second[0].level);
    }

    #[tokio::test]
    async fn spent_out_inventory_clears_persisted_rows() {
        let (deps, health) = setup().await;
        // Persist an item row, then simulate the user spending it all.
        deps.db
            .save_items(
                1,
                &[ItemStack {
                    item_idx: 901,
                    quantity: 3,
                }],
            )
            .await
            .unwrap();
        deps.cache.hset_many(
            &keys::items(1),
            std::iter::empty::<(String, String)>(),
            Some(Duration::from_secs(60)),
        );
        deps.dirty.mark(SyncClass::Item, 1);

        let worker = SyncWorker::new(deps.clone(), SyncClass::Item, health);
        assert_eq!(worker.flush_pending().await, (1, 0));
        assert!(deps.db.load_items(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn worker_drains_on_shutdown() {
        let (deps, health) = setup().await;
        ResourceService::new(deps.clone(), 1)
            .produce(&ResourceBundle {
                gold: 10,
                ..ResourceBundle::default()
            })
            .await
            .unwrap();

        let worker = SyncWorker::new(deps.clone(), SyncClass::Resources, health);
        let shutdown = ShutdownSignal::new();
        let handle = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { worker.run(shutdown).await })
        };
        // Give the worker a moment to start, then stop it; the final
        // forced drain must flush the pending user.
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.trigger();
        handle.await.unwrap();

        let persisted = deps.db.load_resources(1).await.unwrap().unwrap();
        assert_eq!(persisted.gold, 10);
    }
}
