//! Building construction and upgrades.
//!
//! First placement is instant: the building materializes at level 1 with no
//! timer, so early-game players are never locked out of their only
//! buildable. Upgrades consume resources up front, run on the building
//! queue, and complete through the task worker.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};

use wk_core::types::{
    BuildingState, BuildingStatus, SyncClass, UserNo, MAX_BUILDING_LEVEL,
};
use wk_core::{GameError, GameResult};
use wk_store::{keys, DueTask};

use crate::buff::BuffService;
use crate::context::{req_i64, CompletionEvent, Deps};
use crate::mission::MissionService;
use crate::resource::ResourceService;

pub struct BuildingService {
    deps: Arc<Deps>,
    user_no: UserNo,
}

impl BuildingService {
    pub fn new(deps: Arc<Deps>, user_no: UserNo) -> Self {
        Self { deps, user_no }
    }

    // -----------------------------------------------------------------------
    // Cache plumbing
    // -----------------------------------------------------------------------

    pub async fn ensure_cached(&self) -> GameResult<()> {
        let key = keys::buildings(self.user_no);
        if self.deps.cache.exists(&key) {
            return Ok(());
        }
        let rows = self.deps.db.load_buildings(self.user_no).await?;
        if rows.is_empty() {
            return Ok(());
        }
        self.deps.cache.hset_many(
            &key,
            rows.iter().map(|b| {
                (
                    b.building_idx.to_string(),
                    serde_json::to_string(b).expect("serialize building"),
                )
            }),
            Some(self.deps.user_ttl()),
        );
        Ok(())
    }

    async fn get(&self, building_idx: i64) -> GameResult<Option<BuildingState>> {
        self.ensure_cached().await?;
        let raw = self
            .deps
            .cache
            .hget(&keys::buildings(self.user_no), &building_idx.to_string());
        match raw {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| GameError::Fatal(format!("corrupt building record: {e}"))),
            None => Ok(None),
        }
    }

    fn put(&self, state: &BuildingState) {
        self.deps.cache.hset(
            &keys::buildings(self.user_no),
            &state.building_idx.to_string(),
            serde_json::to_string(state).expect("serialize building"),
            Some(self.deps.user_ttl()),
        );
        self.deps.dirty.mark(SyncClass::Building, self.user_no);
    }

    pub async fn all(&self) -> GameResult<Vec<BuildingState>> {
        self.ensure_cached().await?;
        let mut out: Vec<BuildingState> = self
            .deps
            .cache
            .hgetall(&keys::buildings(self.user_no))
            .into_values()
            .filter_map(|raw| serde_json::from_str(&raw).ok())
            .collect();
        out.sort_by_key(|b| b.building_idx);
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    pub async fn info(&self) -> GameResult<Value> {
        Ok(json!({ "buildings": self.all().await? }))
    }

    /// Place a new building. Consumes the level-1 cost and creates the
    /// record at level 1, Idle — no queue entry.
    pub async fn create(&self, data: &Value) -> GameResult<Value> {
        let building_idx = req_i64(data, "building_idx")?;
        let level_cfg = self
            .deps
            .catalog
            .building_level(building_idx, 1)
            .ok_or_else(|| GameError::NotFound(format!("building config {building_idx}")))?;
        if self.get(building_idx).await?.is_some() {
            return Err(GameError::Conflict(format!(
                "building {building_idx} already exists"
            )));
        }
        self.check_requirements(&level_cfg.requires).await?;

        ResourceService::new(self.deps.clone(), self.user_no)
            .consume(&level_cfg.cost)
            .await?;

        let state = BuildingState {
            building_idx,
            level: 1,
            status: BuildingStatus::Idle,
            start_time: None,
            end_time: None,
            last_change: Utc::now(),
        };
        self.put(&state);
        MissionService::new(self.deps.clone(), self.user_no)
            .check_category("building")
            .await?;
        tracing::info!(user_no = self.user_no, building_idx, "building placed");
        Ok(json!({ "building": state }))
    }

    /// Start an upgrade from the current level to the next.
    pub async fn levelup(&self, data: &Value) -> GameResult<Value> {
        let building_idx = req_i64(data, "building_idx")?;
        let mut state = self
            .get(building_idx)
            .await?
            .ok_or_else(|| GameError::NotFound(format!("building {building_idx}")))?;

        if state.is_busy() {
            return Err(GameError::Conflict(format!(
                "building {building_idx} is already in progress"
            )));
        }
        if state.level >= MAX_BUILDING_LEVEL {
            return Err(GameError::Conflict(format!(
                "building {building_idx} is already at maximum level ({MAX_BUILDING_LEVEL})"
            )));
        }
        let target_level = state.level + 1;
        let level_cfg = self
            .deps
            .catalog
            .building_level(building_idx, target_level)
            .ok_or_else(|| {
                GameError::NotFound(format!(
                    "building config {building_idx} level {target_level}"
                ))
            })?;
        self.check_requirements(&level_cfg.requires).await?;

        ResourceService::new(self.deps.clone(), self.user_no)
            .consume(&level_cfg.cost)
            .await?;

        let buffs = BuffService::new(self.deps.clone(), self.user_no);
        let duration =
            buffs.reduced_duration("building", building_idx, "build_speed", level_cfg.build_secs);
        let now = Utc::now();
        let end = now + ChronoDuration::seconds(duration);

        state.status = BuildingStatus::Upgrading;
        state.start_time = Some(now);
        state.end_time = Some(end);
        state.last_change = now;
        self.put(&state);

        self.deps.queues.building.enqueue(
            self.user_no,
            &building_idx.to_string(),
            None,
            end,
            &[("target_level", target_level.to_string())],
        );

        tracing::info!(
            user_no = self.user_no,
            building_idx,
            target_level,
            duration_secs = duration,
            "upgrade started"
        );
        Ok(json!({ "building": state, "duration_secs": duration }))
    }

    /// Abort an in-progress upgrade, refunding the full cost.
    pub async fn cancel(&self, data: &Value) -> GameResult<Value> {
        let building_idx = req_i64(data, "building_idx")?;
        let mut state = self
            .get(building_idx)
            .await?
            .ok_or_else(|| GameError::NotFound(format!("building {building_idx}")))?;
        if !state.is_busy() {
            return Err(GameError::Conflict(format!(
                "building {building_idx} is not in progress"
            )));
        }

        self.deps
            .queues
            .building
            .remove(self.user_no, &building_idx.to_string(), None);

        let target_level = state.level + 1;
        if let Some(cfg) = self.deps.catalog.building_level(building_idx, target_level) {
            ResourceService::new(self.deps.clone(), self.user_no)
                .produce(&cfg.cost)
                .await?;
        }

        state.status = BuildingStatus::Idle;
        state.start_time = None;
        state.end_time = None;
        state.last_change = Utc::now();
        self.put(&state);
        Ok(json!({ "building": state }))
    }

    /// Pull an in-progress upgrade's completion closer by `seconds`,
    /// clamped to now. Used by speedup items and the speedup command.
    pub async fn speedup(&self, data: &Value) -> GameResult<Value> {
        let building_idx = req_i64(data, "building_idx")?;
        let seconds = req_i64(data, "seconds")?;
        if seconds <= 0 {
            return Err(GameError::Validation("seconds must be positive".into()));
        }
        let state = self.speedup_by(building_idx, seconds).await?;
        Ok(json!({ "building": state }))
    }

    pub async fn speedup_by(&self, building_idx: i64, seconds: i64) -> GameResult<BuildingState> {
        let mut state = self
            .get(building_idx)
            .await?
            .ok_or_else(|| GameError::NotFound(format!("building {building_idx}")))?;
        if !state.is_busy() {
            return Err(GameError::Conflict(format!(
                "building {building_idx} is not in progress"
            )));
        }
        let end = state
            .end_time
            .ok_or_else(|| GameError::Fatal("busy building without end_time".into()))?;
        let new_end = (end - ChronoDuration::seconds(seconds)).max(Utc::now());
        self.deps.queues.building.reschedule(
            self.user_no,
            &building_idx.to_string(),
            None,
            new_end,
        );
        state.end_time = Some(new_end);
        self.put(&state);
        Ok(state)
    }

    // -----------------------------------------------------------------------
    // Completion
    // -----------------------------------------------------------------------

    /// Finish handler invoked by the task worker on maturity.
    pub async fn finish(&self, task: &DueTask) -> GameResult<CompletionEvent> {
        let building_idx: i64 = task
            .task_id
            .parse()
            .map_err(|_| GameError::Validation(format!("bad building task id '{}'", task.task_id)))?;
        let state = self.complete(building_idx).await?;
        Ok(CompletionEvent {
            event: "building_complete",
            user_no: self.user_no,
            data: json!({ "building_idx": building_idx, "level": state.level }),
        })
    }

    /// Apply the completion mutation. Also used by the login orchestrator
    /// when an upgrade matured while the server was down.
    pub async fn complete(&self, building_idx: i64) -> GameResult<BuildingState> {
        let mut state = self
            .get(building_idx)
            .await?
            .ok_or_else(|| GameError::NotFound(format!("building {building_idx}")))?;
        if !state.is_busy() {
            // Double fire or already recovered; nothing left to apply.
            tracing::warn!(
                user_no = self.user_no,
                building_idx,
                "completion fired for an idle building"
            );
            return Ok(state);
        }
        state.level += 1;
        state.status = BuildingStatus::Idle;
        state.start_time = None;
        state.end_time = None;
        state.last_change = Utc::now();
        self.put(&state);

        MissionService::new(self.deps.clone(), self.user_no)
            .check_category("building")
            .await?;
        tracing::info!(
            user_no = self.user_no,
            building_idx,
            level = state.level,
            "upgrade complete"
        );
        Ok(state)
    }

    // -----------------------------------------------------------------------
    // Login recovery
    // -----------------------------------------------------------------------

    /// Re-register in-flight upgrades after a restart: complete the ones
    /// whose end has passed, re-enqueue the rest at their stored end time.
    pub async fn recover(&self) -> GameResult<()> {
        let now = Utc::now();
        for state in self.all().await? {
            if !state.is_busy() {
                continue;
            }
            match state.end_time {
                Some(end) if end > now => {
                    self.deps.queues.building.enqueue(
                        self.user_no,
                        &state.building_idx.to_string(),
                        None,
                        end,
                        &[("target_level", (state.level + 1).to_string())],
                    );
                }
                _ => {
                    self.complete(state.building_idx).await?;
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Prerequisite buildings must exist at or above the required level.
    async fn check_requirements(&self, requires: &[(i64, i64)]) -> GameResult<()> {
        for (idx, level) in requires {
            let ok = self
                .get(*idx)
                .await?
                .map(|b| b.level >= *level)
                .unwrap_or(false);
            if !ok {
                return Err(GameError::Conflict(format!(
                    "requires building {idx} at level {level}"
                )));
            }
        }
        Ok(())
    }
}
