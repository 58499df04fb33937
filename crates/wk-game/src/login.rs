//! Login orchestration.
//!
//! On user entry the orchestrator creates the profile on first contact,
//! warms every per-user cache class from persistence, rebuilds the
//! permanent buff set from its sources (completed research levels and
//! alliance membership), and re-registers in-flight timed tasks so nothing
//! a restart interrupted is lost.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};

use wk_core::types::{ResearchStatus, ResourceBundle, UserNo, UserProfile};
use wk_core::{GameError, GameResult};
use wk_store::{ids, keys};

use crate::alliance::AllianceService;
use crate::buff::BuffService;
use crate::building::BuildingService;
use crate::context::{opt_str, Deps};
use crate::item::ItemService;
use crate::mission::MissionService;
use crate::research::ResearchService;
use crate::resource::ResourceService;
use crate::unit::UnitService;

pub struct LoginOrchestrator {
    deps: Arc<Deps>,
    user_no: UserNo,
}

impl LoginOrchestrator {
    pub fn new(deps: Arc<Deps>, user_no: UserNo) -> Self {
        Self { deps, user_no }
    }

    /// Handle user entry: create-or-load the profile, warm the caches,
    /// rebuild derived buffs, and recover in-flight tasks.
    pub async fn handle_login(&self, data: &Value) -> GameResult<Value> {
        if self.user_no <= 0 {
            return Err(GameError::Validation("user_no must be positive".into()));
        }
        let (profile, created) = self.load_or_create_profile(data).await?;

        // Warm every entity class that is cold; each loader is a no-op on
        // an already-live cache key.
        ResourceService::new(self.deps.clone(), self.user_no)
            .ensure_cached()
            .await?;
        BuildingService::new(self.deps.clone(), self.user_no)
            .ensure_cached()
            .await?;
        UnitService::new(self.deps.clone(), self.user_no)
            .ensure_cached()
            .await?;
        ResearchService::new(self.deps.clone(), self.user_no)
            .ensure_cached()
            .await?;
        ItemService::new(self.deps.clone(), self.user_no)
            .ensure_cached()
            .await?;
        MissionService::new(self.deps.clone(), self.user_no)
            .ensure_cached()
            .await?;

        self.rebuild_permanent_buffs(&profile).await?;
        self.recover_tasks().await?;

        let resources = ResourceService::new(self.deps.clone(), self.user_no)
            .snapshot()
            .await?;
        Ok(json!({
            "profile": profile,
            "resources": resources,
            "created": created,
        }))
    }

    async fn load_or_create_profile(&self, data: &Value) -> GameResult<(UserProfile, bool)> {
        let key = keys::profile(self.user_no);
        if let Some(raw) = self.deps.cache.hget(&key, "profile") {
            let profile = serde_json::from_str(&raw)
                .map_err(|e| GameError::Fatal(format!("corrupt profile: {e}")))?;
            return Ok((profile, false));
        }
        if let Some(profile) = self.deps.db.load_profile(self.user_no).await? {
            self.cache_profile(&profile);
            return Ok((profile, false));
        }

        // First entry: create the profile and starter resources. The user
        // counter is pushed past this number so allocated ids never collide
        // with an externally supplied one.
        let game = &self.deps.config.game;
        let profile = UserProfile {
            user_no: self.user_no,
            account_id: opt_str(data, "account_id")
                .map(str::to_string)
                .unwrap_or_else(|| format!("acct-{}", self.user_no)),
            nickname: opt_str(data, "nickname")
                .map(str::to_string)
                .unwrap_or_else(|| format!("player{}", self.user_no)),
            level: 1,
            power: 0,
            alliance_id: None,
            alliance_position: None,
            created_at: Utc::now(),
        };
        let starter = ResourceBundle {
            food: game.starter_food,
            wood: game.starter_wood,
            stone: game.starter_stone,
            gold: game.starter_gold,
            ruby: game.starter_ruby,
        };
        self.deps.db.create_user(&profile, &starter).await?;

        let counter = self
            .deps
            .cache
            .hget(&keys::counters(), ids::COUNTER_USER)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        if self.user_no > counter {
            self.deps.cache.hset(
                &keys::counters(),
                ids::COUNTER_USER,
                self.user_no.to_string(),
                None,
            );
            self.deps
                .db
                .commit_counter(ids::COUNTER_USER, self.user_no)
                .await?;
        }

        self.cache_profile(&profile);
        tracing::info!(user_no = self.user_no, "user created on first login");
        Ok((profile, true))
    }

    fn cache_profile(&self, profile: &UserProfile) {
        self.deps.cache.hset(
            &keys::profile(self.user_no),
            "profile",
            serde_json::to_string(profile).expect("serialize profile"),
            Some(self.deps.user_ttl()),
        );
    }

    /// Permanent buffs are derived state: rebuild them from completed
    /// research levels and the user's alliance, instead of persisting them.
    async fn rebuild_permanent_buffs(&self, profile: &UserProfile) -> GameResult<()> {
        let buffs = BuffService::new(self.deps.clone(), self.user_no);
        buffs.clear_permanent();

        let researches = self.deps.cache.hgetall(&keys::researches(self.user_no));
        for raw in researches.values() {
            let Ok(state) = serde_json::from_str::<wk_core::types::ResearchState>(raw) else {
                continue;
            };
            if state.level == 0 && state.status != ResearchStatus::Completed {
                continue;
            }
            for level in 1..=state.level {
                if let Some(cfg) = self
                    .deps
                    .catalog
                    .research_level(state.research_idx, level)
                {
                    if cfg.buff_idx != 0 {
                        buffs.grant_permanent(
                            "research",
                            &format!("{}_{level}", state.research_idx),
                            cfg.buff_idx,
                            Some(cfg.buff_value),
                        )?;
                    }
                }
            }
        }

        if let Some(alliance_id) = profile.alliance_id {
            let alliance = AllianceService::new(self.deps.clone(), self.user_no);
            match alliance.state(alliance_id).await {
                Ok(state) => {
                    alliance.grant_alliance_buff(self.user_no, alliance_id, state.level)
                }
                Err(e) => {
                    tracing::warn!(
                        user_no = self.user_no,
                        alliance_id,
                        error = %e,
                        "alliance buff rebuild skipped"
                    );
                }
            }
        }
        Ok(())
    }

    async fn recover_tasks(&self) -> GameResult<()> {
        BuildingService::new(self.deps.clone(), self.user_no)
            .recover()
            .await?;
        UnitService::new(self.deps.clone(), self.user_no)
            .recover()
            .await?;
        ResearchService::new(self.deps.clone(), self.user_no)
            .recover()
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Deps;
    use chrono::Duration as ChronoDuration;
    use std::collections::BTreeMap;
    use wk_core::catalog::{BuffSpec, GameCatalog, ResearchLevel, ResearchSpec};
    use wk_core::config::ServerConfig;
    use wk_core::types::{ResearchState, UnitStack, UnitTask, UnitTaskKind, ValueKind};

    fn catalog() -> GameCatalog {
        let mut c = GameCatalog::default();
        let mut levels = BTreeMap::new();
        levels.insert(
            1,
            ResearchLevel {
                cost: ResourceBundle::default(),
                research_secs: 30,
                buff_idx: 301,
                buff_value: 7,
            },
        );
        c.researches.insert(
            10,
            ResearchSpec {
                research_idx: 10,
                levels,
                prerequisite: None,
                repeatable: false,
            },
        );
        c.buffs.insert(
            301,
            BuffSpec {
                buff_idx: 301,
                target_type: "building".into(),
                target_sub: 0,
                stat: "build_speed".into(),
                value: 7,
                value_kind: ValueKind::Percent,
                duration_secs: 0,
                ruby_cost: 0,
            },
        );
        c
    }

    async fn deps() -> Arc<Deps> {
        Deps::in_memory(catalog(), ServerConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn first_login_creates_user_with_starter_resources() {
        let deps = deps().await;
        let login = LoginOrchestrator::new(deps.clone(), 1001);
        let out = login.handle_login(&json!({})).await.unwrap();
        assert_eq!(out["created"], true);
        assert_eq!(out["resources"]["food"], 5000);

        // Second login finds the cached profile.
        let out = login.handle_login(&json!({})).await.unwrap();
        assert_eq!(out["created"], false);

        // The profile landed in persistence too.
        assert!(deps.db.load_profile(1001).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn first_login_advances_user_counter() {
        let deps = deps().await;
        LoginOrchestrator::new(deps.clone(), 5000)
            .handle_login(&json!({}))
            .await
            .unwrap();
        let next = deps.ids.next_user_no().await.unwrap();
        assert_eq!(next, 5001);
    }

    #[tokio::test]
    async fn login_rebuilds_research_buffs() {
        let deps = deps().await;
        LoginOrchestrator::new(deps.clone(), 1)
            .handle_login(&json!({}))
            .await
            .unwrap();

        // Persist a completed research, drop the hot state, log in again.
        deps.db
            .save_researches(
                1,
                &[ResearchState {
                    research_idx: 10,
                    level: 1,
                    status: ResearchStatus::Completed,
                    start_time: None,
                    end_time: None,
                }],
            )
            .await
            .unwrap();
        deps.cache.del(&keys::researches(1));
        deps.cache.del(&keys::permanent_buffs(1));

        LoginOrchestrator::new(deps.clone(), 1)
            .handle_login(&json!({}))
            .await
            .unwrap();
        let buffs = BuffService::new(deps, 1);
        assert_eq!(buffs.totals("building", 201, "build_speed"), (7, 0));
    }

    #[tokio::test]
    async fn login_recovers_elapsed_unit_training() {
        let deps = deps().await;
        LoginOrchestrator::new(deps.clone(), 1)
            .handle_login(&json!({}))
            .await
            .unwrap();

        // Persist a training batch whose end passed during the outage.
        let mut stack = UnitStack::new(3);
        stack.training = 5;
        stack.total = 5;
        let task = UnitTask {
            kind: UnitTaskKind::Train,
            quantity: 5,
            target_idx: None,
            start_time: Utc::now() - ChronoDuration::seconds(30),
            end_time: Utc::now() - ChronoDuration::seconds(10),
        };
        deps.db.save_units(1, &[(stack, Some(task))]).await.unwrap();
        deps.cache.del(&keys::units(1));
        deps.cache.del(&keys::unit_tasks(1));

        LoginOrchestrator::new(deps.clone(), 1)
            .handle_login(&json!({}))
            .await
            .unwrap();
        let units = deps.cache.hgetall(&keys::units(1));
        let stack: UnitStack = serde_json::from_str(units.get("3").unwrap()).unwrap();
        assert_eq!(stack.ready, 5);
        assert_eq!(stack.training, 0);
    }

    #[tokio::test]
    async fn login_reenqueues_pending_unit_training() {
        let deps = deps().await;
        LoginOrchestrator::new(deps.clone(), 1)
            .handle_login(&json!({}))
            .await
            .unwrap();

        let mut stack = UnitStack::new(3);
        stack.training = 5;
        stack.total = 5;
        let end = Utc::now() + ChronoDuration::seconds(20);
        let task = UnitTask {
            kind: UnitTaskKind::Train,
            quantity: 5,
            target_idx: None,
            start_time: Utc::now(),
            end_time: end,
        };
        deps.db.save_units(1, &[(stack, Some(task))]).await.unwrap();
        deps.cache.del(&keys::units(1));
        deps.cache.del(&keys::unit_tasks(1));

        LoginOrchestrator::new(deps.clone(), 1)
            .handle_login(&json!({}))
            .await
            .unwrap();
        // The pending batch is queued at its stored end time.
        assert_eq!(deps.queues.unit.len(), 1);
        let due = deps.queues.unit.due(end + ChronoDuration::seconds(1));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].meta_i64("quantity"), 5);
    }
}
