//! Research lines — prerequisite gating, one-at-a-time progression, and the
//! permanent buffs granted on completion.
//!
//! A user runs at most one research at a time across every line. Finishing
//! a level grants its configured buff permanently, keyed by the research
//! and level so later levels stack alongside earlier ones, and flips any
//! dependent lines from locked to available.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};

use wk_core::catalog::ResearchSpec;
use wk_core::types::{ResearchState, ResearchStatus, ResourceKind, SyncClass, UserNo};
use wk_core::{GameError, GameResult};
use wk_store::{keys, DueTask};

use crate::buff::BuffService;
use crate::context::{req_i64, CompletionEvent, Deps};
use crate::mission::MissionService;
use crate::resource::ResourceService;

pub struct ResearchService {
    deps: Arc<Deps>,
    user_no: UserNo,
}

impl ResearchService {
    pub fn new(deps: Arc<Deps>, user_no: UserNo) -> Self {
        Self { deps, user_no }
    }

    // -----------------------------------------------------------------------
    // Cache plumbing
    // -----------------------------------------------------------------------

    pub async fn ensure_cached(&self) -> GameResult<()> {
        let key = keys::researches(self.user_no);
        if self.deps.cache.exists(&key) {
            return Ok(());
        }
        let rows = self.deps.db.load_researches(self.user_no).await?;
        if rows.is_empty() {
            return Ok(());
        }
        self.deps.cache.hset_many(
            &key,
            rows.iter().map(|r| {
                (
                    r.research_idx.to_string(),
                    serde_json::to_string(r).expect("serialize research"),
                )
            }),
            Some(self.deps.user_ttl()),
        );
        Ok(())
    }

    async fn state(&self, research_idx: i64) -> GameResult<Option<ResearchState>> {
        self.ensure_cached().await?;
        let raw = self
            .deps
            .cache
            .hget(&keys::researches(self.user_no), &research_idx.to_string());
        match raw {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| GameError::Fatal(format!("corrupt research record: {e}"))),
            None => Ok(None),
        }
    }

    fn put(&self, state: &ResearchState) {
        self.deps.cache.hset(
            &keys::researches(self.user_no),
            &state.research_idx.to_string(),
            serde_json::to_string(state).expect("serialize research"),
            Some(self.deps.user_ttl()),
        );
        self.deps.dirty.mark(SyncClass::Research, self.user_no);
    }

    async fn all(&self) -> GameResult<Vec<ResearchState>> {
        self.ensure_cached().await?;
        let mut out: Vec<ResearchState> = self
            .deps
            .cache
            .hgetall(&keys::researches(self.user_no))
            .into_values()
            .filter_map(|raw| serde_json::from_str(&raw).ok())
            .collect();
        out.sort_by_key(|r| r.research_idx);
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn info(&self) -> GameResult<Value> {
        let rows = self.all().await?;
        let mut specs: Vec<&ResearchSpec> = self.deps.catalog.researches.values().collect();
        specs.sort_by_key(|s| s.research_idx);

        let mut out = Vec::with_capacity(specs.len());
        for spec in specs {
            let state = rows.iter().find(|r| r.research_idx == spec.research_idx);
            let (level, status) = match state {
                Some(s) => (s.level, s.status),
                None if self.prerequisite_met(spec).await? => (0, ResearchStatus::Available),
                None => (0, ResearchStatus::Locked),
            };
            out.push(json!({
                "research_idx": spec.research_idx,
                "level": level,
                "max_level": spec.max_level(),
                "status": status,
                "end_time": state.and_then(|s| s.end_time),
            }));
        }
        Ok(json!({ "researches": out }))
    }

    async fn prerequisite_met(&self, spec: &ResearchSpec) -> GameResult<bool> {
        match spec.prerequisite {
            Some((idx, level)) => Ok(self
                .state(idx)
                .await?
                .map(|s| s.level >= level)
                .unwrap_or(false)),
            None => Ok(true),
        }
    }

    async fn current_researching(&self) -> GameResult<Option<ResearchState>> {
        Ok(self
            .all()
            .await?
            .into_iter()
            .find(|r| r.status == ResearchStatus::Researching))
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    pub async fn start(&self, data: &Value) -> GameResult<Value> {
        let research_idx = req_i64(data, "research_idx")?;
        let spec = self
            .deps
            .catalog
            .research(research_idx)
            .ok_or_else(|| GameError::NotFound(format!("research config {research_idx}")))?;

        if let Some(running) = self.current_researching().await? {
            return Err(GameError::Conflict(format!(
                "research {} is already in progress",
                running.research_idx
            )));
        }
        if !self.prerequisite_met(spec).await? {
            let (idx, level) = spec.prerequisite.expect("unmet implies some");
            return Err(GameError::Conflict(format!(
                "prerequisite research {idx} level {level} not completed"
            )));
        }

        let state = self.state(research_idx).await?;
        let current_level = state.as_ref().map(|s| s.level).unwrap_or(0);
        let target_level = if current_level >= spec.max_level() {
            if !spec.repeatable {
                return Err(GameError::Conflict(format!(
                    "research {research_idx} is already at maximum level"
                )));
            }
            spec.max_level()
        } else {
            current_level + 1
        };
        let level_cfg = self
            .deps
            .catalog
            .research_level(research_idx, target_level)
            .ok_or_else(|| {
                GameError::NotFound(format!(
                    "research config {research_idx} level {target_level}"
                ))
            })?;

        ResourceService::new(self.deps.clone(), self.user_no)
            .consume(&level_cfg.cost)
            .await?;

        let buffs = BuffService::new(self.deps.clone(), self.user_no);
        let duration = buffs.reduced_duration(
            "research",
            research_idx,
            "research_speed",
            level_cfg.research_secs,
        );
        let now = Utc::now();
        let end = now + ChronoDuration::seconds(duration);

        let next = ResearchState {
            research_idx,
            level: current_level,
            status: ResearchStatus::Researching,
            start_time: Some(now),
            end_time: Some(end),
        };
        self.put(&next);
        self.deps.queues.research.enqueue(
            self.user_no,
            &research_idx.to_string(),
            None,
            end,
            &[("target_level", target_level.to_string())],
        );

        tracing::info!(
            user_no = self.user_no,
            research_idx,
            target_level,
            duration_secs = duration,
            "research started"
        );
        Ok(json!({ "research": next, "duration_secs": duration }))
    }

    /// Abort the running research, refunding the configured fraction.
    pub async fn cancel(&self, data: &Value) -> GameResult<Value> {
        let research_idx = req_i64(data, "research_idx")?;
        let mut state = self
            .state(research_idx)
            .await?
            .filter(|s| s.status == ResearchStatus::Researching)
            .ok_or_else(|| {
                GameError::Conflict(format!("research {research_idx} is not in progress"))
            })?;

        self.deps
            .queues
            .research
            .remove(self.user_no, &research_idx.to_string(), None);

        let refund_percent = self.deps.config.game.research_refund_percent;
        let spec = self.deps.catalog.research(research_idx);
        let in_flight_level = spec
            .map(|s| (state.level + 1).min(s.max_level()))
            .unwrap_or(state.level + 1);
        let mut refunded = Default::default();
        if let Some(cfg) = self
            .deps
            .catalog
            .research_level(research_idx, in_flight_level)
        {
            refunded = cfg.cost.fraction(refund_percent);
            ResourceService::new(self.deps.clone(), self.user_no)
                .produce(&refunded)
                .await?;
        }

        state.status = ResearchStatus::Available;
        state.start_time = None;
        state.end_time = None;
        self.put(&state);
        Ok(json!({ "research": state, "refunded": refunded, "refund_percent": refund_percent }))
    }

    /// Finish the running research immediately for rubies: one ruby per
    /// started minute remaining, minimum one.
    pub async fn instant_complete(&self, data: &Value) -> GameResult<Value> {
        let research_idx = req_i64(data, "research_idx")?;
        let state = self
            .state(research_idx)
            .await?
            .filter(|s| s.status == ResearchStatus::Researching)
            .ok_or_else(|| {
                GameError::Conflict(format!("research {research_idx} is not in progress"))
            })?;

        let now = Utc::now();
        let remaining = state
            .end_time
            .map(|end| (end - now).num_seconds().max(0))
            .unwrap_or(0);
        let ruby_cost = (remaining / 60).max(1);
        ResourceService::new(self.deps.clone(), self.user_no)
            .atomic_consume(ResourceKind::Ruby, ruby_cost)
            .await?;

        self.deps
            .queues
            .research
            .remove(self.user_no, &research_idx.to_string(), None);
        let finished = self.complete(research_idx).await?;
        Ok(json!({ "research": finished, "ruby_cost": ruby_cost }))
    }

    pub async fn speedup_by(&self, research_idx: i64, seconds: i64) -> GameResult<ResearchState> {
        let mut state = self
            .state(research_idx)
            .await?
            .filter(|s| s.status == ResearchStatus::Researching)
            .ok_or_else(|| {
                GameError::Conflict(format!("research {research_idx} is not in progress"))
            })?;
        let end = state
            .end_time
            .ok_or_else(|| GameError::Fatal("researching without end_time".into()))?;
        let new_end = (end - ChronoDuration::seconds(seconds)).max(Utc::now());
        state.end_time = Some(new_end);
        self.put(&state);
        self.deps
            .queues
            .research
            .reschedule(self.user_no, &research_idx.to_string(), None, new_end);
        Ok(state)
    }

    // -----------------------------------------------------------------------
    // Completion
    // -----------------------------------------------------------------------

    pub async fn finish(&self, due: &DueTask) -> GameResult<CompletionEvent> {
        let research_idx: i64 = due.task_id.parse().map_err(|_| {
            GameError::Validation(format!("bad research task id '{}'", due.task_id))
        })?;
        let state = self.complete(research_idx).await?;
        Ok(CompletionEvent {
            event: "research_complete",
            user_no: self.user_no,
            data: json!({ "research_idx": research_idx, "level": state.level }),
        })
    }

    /// Apply a completion: bump the level, grant the level's permanent
    /// buff, and unlock dependents.
    pub async fn complete(&self, research_idx: i64) -> GameResult<ResearchState> {
        let mut state = self
            .state(research_idx)
            .await?
            .ok_or_else(|| GameError::NotFound(format!("research {research_idx}")))?;
        if state.status != ResearchStatus::Researching {
            tracing::warn!(
                user_no = self.user_no,
                research_idx,
                "completion fired for research that is not running"
            );
            return Ok(state);
        }

        let max_level = self
            .deps
            .catalog
            .research(research_idx)
            .map(|s| s.max_level())
            .unwrap_or(state.level + 1);
        if state.level < max_level {
            state.level += 1;
        }
        state.status = ResearchStatus::Completed;
        state.start_time = None;
        state.end_time = None;
        self.put(&state);

        if let Some(cfg) = self
            .deps
            .catalog
            .research_level(research_idx, state.level)
        {
            if cfg.buff_idx != 0 {
                BuffService::new(self.deps.clone(), self.user_no).grant_permanent(
                    "research",
                    &format!("{research_idx}_{}", state.level),
                    cfg.buff_idx,
                    Some(cfg.buff_value),
                )?;
            }
        }

        self.unlock_dependents(research_idx, state.level).await?;
        MissionService::new(self.deps.clone(), self.user_no)
            .check_category("research")
            .await?;
        tracing::info!(
            user_no = self.user_no,
            research_idx,
            level = state.level,
            "research complete"
        );
        Ok(state)
    }

    async fn unlock_dependents(&self, research_idx: i64, level: i64) -> GameResult<()> {
        for dependent in self.deps.catalog.dependents_of(research_idx, level) {
            let existing = self.state(dependent.research_idx).await?;
            let locked = match &existing {
                Some(s) => s.status == ResearchStatus::Locked,
                None => true,
            };
            if locked {
                self.put(&ResearchState {
                    research_idx: dependent.research_idx,
                    level: existing.map(|s| s.level).unwrap_or(0),
                    status: ResearchStatus::Available,
                    start_time: None,
                    end_time: None,
                });
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Login recovery
    // -----------------------------------------------------------------------

    /// Re-register the in-flight research after a restart.
    pub async fn recover(&self) -> GameResult<()> {
        let now = Utc::now();
        for state in self.all().await? {
            if state.status != ResearchStatus::Researching {
                continue;
            }
            match state.end_time {
                Some(end) if end > now => {
                    self.deps.queues.research.enqueue(
                        self.user_no,
                        &state.research_idx.to_string(),
                        None,
                        end,
                        &[],
                    );
                }
                _ => {
                    self.complete(state.research_idx).await?;
                }
            }
        }
        Ok(())
    }
}
