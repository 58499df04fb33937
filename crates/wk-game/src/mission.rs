//! Mission progress tracking.
//!
//! Missions are definitions in the catalog plus a per-user progress record.
//! Completion is event-driven: building, unit, and research mutations call
//! `check_category`, which evaluates every active mission of that category
//! against the user's current state and grants rewards on success. Claiming
//! is a separate, explicit step with its own timestamp.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};

use wk_core::catalog::MissionSpec;
use wk_core::types::{
    BuildingState, MissionProgress, ResearchState, ResearchStatus, SyncClass, UnitStack, UserNo,
};
use wk_core::{GameError, GameResult};
use wk_store::keys;

use crate::context::{req_i64, Deps};
use crate::item::ItemService;

pub struct MissionService {
    deps: Arc<Deps>,
    user_no: UserNo,
}

impl MissionService {
    pub fn new(deps: Arc<Deps>, user_no: UserNo) -> Self {
        Self { deps, user_no }
    }

    // -----------------------------------------------------------------------
    // Cache plumbing
    // -----------------------------------------------------------------------

    pub async fn ensure_cached(&self) -> GameResult<()> {
        let key = keys::missions(self.user_no);
        if self.deps.cache.exists(&key) {
            return Ok(());
        }
        let rows = self.deps.db.load_missions(self.user_no).await?;
        if rows.is_empty() {
            return Ok(());
        }
        self.deps.cache.hset_many(
            &key,
            rows.iter().map(|m| {
                (
                    m.mission_idx.to_string(),
                    serde_json::to_string(m).expect("serialize mission"),
                )
            }),
            Some(self.deps.user_ttl()),
        );
        Ok(())
    }

    async fn progress(&self, mission_idx: i64) -> GameResult<Option<MissionProgress>> {
        self.ensure_cached().await?;
        let raw = self
            .deps
            .cache
            .hget(&keys::missions(self.user_no), &mission_idx.to_string());
        match raw {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| GameError::Fatal(format!("corrupt mission record: {e}"))),
            None => Ok(None),
        }
    }

    fn put(&self, progress: &MissionProgress) {
        self.deps.cache.hset(
            &keys::missions(self.user_no),
            &progress.mission_idx.to_string(),
            serde_json::to_string(progress).expect("serialize mission"),
            Some(self.deps.user_ttl()),
        );
        self.deps.dirty.mark(SyncClass::Mission, self.user_no);
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn info(&self) -> GameResult<Value> {
        self.ensure_cached().await?;
        let mut specs: Vec<&MissionSpec> = self.deps.catalog.missions.values().collect();
        specs.sort_by_key(|m| m.mission_idx);

        let mut out = Vec::with_capacity(specs.len());
        for spec in specs {
            let progress = self.progress(spec.mission_idx).await?;
            out.push(json!({
                "mission_idx": spec.mission_idx,
                "category": spec.category,
                "target_idx": spec.target_idx,
                "threshold": spec.threshold,
                "status": self.status_of(spec, progress.as_ref()).await?,
                "completed_at": progress.as_ref().and_then(|p| p.completed_at),
                "claimed_at": progress.as_ref().and_then(|p| p.claimed_at),
            }));
        }
        Ok(json!({ "missions": out }))
    }

    pub async fn detail(&self, data: &Value) -> GameResult<Value> {
        let mission_idx = req_i64(data, "mission_idx")?;
        let spec = self
            .deps
            .catalog
            .mission(mission_idx)
            .ok_or_else(|| GameError::NotFound(format!("mission {mission_idx}")))?;
        let progress = self.progress(mission_idx).await?;
        Ok(json!({
            "mission": spec,
            "status": self.status_of(spec, progress.as_ref()).await?,
            "progress": progress,
        }))
    }

    async fn status_of(
        &self,
        spec: &MissionSpec,
        progress: Option<&MissionProgress>,
    ) -> GameResult<&'static str> {
        if let Some(p) = progress {
            if p.claimed_at.is_some() {
                return Ok("claimed");
            }
            if p.completed_at.is_some() {
                return Ok("completed");
            }
        }
        if !self.prerequisite_met(spec).await? {
            return Ok("locked");
        }
        Ok("in_progress")
    }

    async fn prerequisite_met(&self, spec: &MissionSpec) -> GameResult<bool> {
        match spec.required_mission {
            Some(required) => Ok(self
                .progress(required)
                .await?
                .map(|p| p.completed_at.is_some())
                .unwrap_or(false)),
            None => Ok(true),
        }
    }

    // -----------------------------------------------------------------------
    // Claim
    // -----------------------------------------------------------------------

    /// Record the explicit reward collection for a completed mission.
    pub async fn claim(&self, data: &Value) -> GameResult<Value> {
        let mission_idx = req_i64(data, "mission_idx")?;
        self.deps
            .catalog
            .mission(mission_idx)
            .ok_or_else(|| GameError::NotFound(format!("mission {mission_idx}")))?;
        let mut progress = self
            .progress(mission_idx)
            .await?
            .filter(|p| p.completed_at.is_some())
            .ok_or_else(|| GameError::Conflict(format!("mission {mission_idx} is not completed")))?;
        if progress.claimed_at.is_some() {
            return Err(GameError::Conflict(format!(
                "mission {mission_idx} already claimed"
            )));
        }
        progress.claimed_at = Some(Utc::now());
        self.put(&progress);
        Ok(json!({ "mission_idx": mission_idx, "claimed_at": progress.claimed_at }))
    }

    // -----------------------------------------------------------------------
    // Event-driven completion
    // -----------------------------------------------------------------------

    /// Re-evaluate every active mission of `category`; returns the indices
    /// completed by this pass.
    pub async fn check_category(&self, category: &str) -> GameResult<Vec<i64>> {
        self.ensure_cached().await?;
        let mut completed = Vec::new();
        for spec in self.deps.catalog.missions_in_category(category) {
            let progress = self.progress(spec.mission_idx).await?;
            if progress
                .as_ref()
                .is_some_and(|p| p.completed_at.is_some())
            {
                continue;
            }
            if !self.prerequisite_met(spec).await? {
                continue;
            }
            if self.value_for(spec)? >= spec.threshold {
                self.complete(spec).await?;
                completed.push(spec.mission_idx);
            }
        }
        Ok(completed)
    }

    /// The measured quantity for a mission predicate: the targeted entity's
    /// level/count, or a category-wide count when `target_idx` is 0.
    fn value_for(&self, spec: &MissionSpec) -> GameResult<i64> {
        match spec.category.as_str() {
            "building" => {
                let rows = self.deps.cache.hgetall(&keys::buildings(self.user_no));
                if spec.target_idx == 0 {
                    return Ok(rows.len() as i64);
                }
                Ok(rows
                    .get(&spec.target_idx.to_string())
                    .and_then(|raw| serde_json::from_str::<BuildingState>(raw).ok())
                    .map(|b| b.level)
                    .unwrap_or(0))
            }
            "unit" => {
                let rows = self.deps.cache.hgetall(&keys::units(self.user_no));
                let stacks = rows
                    .values()
                    .filter_map(|raw| serde_json::from_str::<UnitStack>(raw).ok());
                if spec.target_idx == 0 {
                    return Ok(stacks.map(|s| s.total).sum());
                }
                Ok(stacks
                    .filter(|s| s.unit_idx == spec.target_idx)
                    .map(|s| s.total)
                    .sum())
            }
            "research" => {
                let rows = self.deps.cache.hgetall(&keys::researches(self.user_no));
                let states = rows
                    .values()
                    .filter_map(|raw| serde_json::from_str::<ResearchState>(raw).ok());
                if spec.target_idx == 0 {
                    return Ok(states
                        .filter(|r| r.status == ResearchStatus::Completed)
                        .count() as i64);
                }
                Ok(states
                    .filter(|r| r.research_idx == spec.target_idx)
                    .map(|r| r.level)
                    .sum())
            }
            other => Err(GameError::Fatal(format!(
                "unknown mission category '{other}'"
            ))),
        }
    }

    async fn complete(&self, spec: &MissionSpec) -> GameResult<()> {
        let progress = MissionProgress {
            mission_idx: spec.mission_idx,
            completed_at: Some(Utc::now()),
            claimed_at: None,
        };
        self.put(&progress);
        ItemService::new(self.deps.clone(), self.user_no)
            .grant(spec.reward_item, spec.reward_quantity)
            .await?;
        tracing::info!(
            user_no = self.user_no,
            mission_idx = spec.mission_idx,
            reward_item = spec.reward_item,
            "mission completed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::building::BuildingService;
    use crate::context::Deps;
    use wk_core::catalog::{BuildingLevel, GameCatalog, ItemCategory, ItemSpec, MissionSpec};
    use wk_core::config::ServerConfig;
    use wk_core::types::{ResourceBundle, UserProfile};

    fn catalog() -> GameCatalog {
        let mut c = GameCatalog::default();
        let mut levels = std::collections::BTreeMap::new();
        levels.insert(
            1,
            BuildingLevel {
                cost: ResourceBundle::default(),
                build_secs: 0,
                requires: vec![],
                power: 0,
            },
        );
        c.buildings.insert(201, levels);
        c.items.insert(
            901,
            ItemSpec {
                item_idx: 901,
                category: ItemCategory::Resource,
                effect_value: 0,
                gives: ResourceBundle::default(),
                name: "Reward Crate".into(),
            },
        );
        c.missions.insert(
            1,
            MissionSpec {
                mission_idx: 1,
                category: "building".into(),
                target_idx: 201,
                threshold: 1,
                required_mission: None,
                reward_item: 901,
                reward_quantity: 2,
            },
        );
        c.missions.insert(
            2,
            MissionSpec {
                mission_idx: 2,
                category: "building".into(),
                target_idx: 201,
                threshold: 5,
                required_mission: Some(1),
                reward_item: 901,
                reward_quantity: 1,
            },
        );
        c
    }

    async fn deps() -> Arc<Deps> {
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
            .create_user(&profile, &ResourceBundle::default())
            .await
            .unwrap();
        deps
    }

    #[tokio::test]
    async fn building_event_completes_matching_mission() {
        let deps = deps().await;
        BuildingService::new(deps.clone(), 1)
            .create(&json!({ "building_idx": 201 }))
            .await
            .unwrap();

        let svc = MissionService::new(deps.clone(), 1);
        let progress = svc.progress(1).await.unwrap().unwrap();
        assert!(progress.completed_at.is_some());
        // Rewards were granted through the item service.
        let items = deps.cache.hgetall(&keys::items(1));
        assert_eq!(items.get("901").map(String::as_str), Some("2"));
        // The gated mission (threshold 5) stays open.
        assert!(svc.progress(2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_requires_completion_and_is_single_shot() {
        let deps = deps().await;
        let svc = MissionService::new(deps.clone(), 1);
        assert!(matches!(
            svc.claim(&json!({ "mission_idx": 1 })).await,
            Err(GameError::Conflict(_))
        ));

        BuildingService::new(deps.clone(), 1)
            .create(&json!({ "building_idx": 201 }))
            .await
            .unwrap();
        svc.claim(&json!({ "mission_idx": 1 })).await.unwrap();
        assert!(matches!(
            svc.claim(&json!({ "mission_idx": 1 })).await,
            Err(GameError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn info_derives_statuses() {
        let deps = deps().await;
        let svc = MissionService::new(deps.clone(), 1);
        let info = svc.info().await.unwrap();
        let missions = info["missions"].as_array().unwrap();
        assert_eq!(missions[0]["status"], "in_progress");
        assert_eq!(missions[1]["status"], "locked");

        BuildingService::new(deps, 1)
            .create(&json!({ "building_idx": 201 }))
            .await
            .unwrap();
        let info = svc.info().await.unwrap();
        let missions = info["missions"].as_array().unwrap();
        assert_eq!(missions[0]["status"], "completed");
        assert_eq!(missions[1]["status"], "in_progress");
    }
}
