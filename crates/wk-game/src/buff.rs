//! Buff bookkeeping — permanent grants, temporary activations with expiry,
//! and the short-TTL aggregate used by cost/duration calculations.
//!
//! Permanent buffs live as long as their source (a research level, an
//! alliance membership) and are keyed by `(source, source_key)`. Temporary
//! buffs carry an opaque id and an expiry entry in the buff queue; the task
//! worker removes them on maturity.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};

use wk_core::types::{BuffRecord, ResourceKind, UserNo, ValueKind};
use wk_core::{GameError, GameResult};
use wk_store::{keys, DueTask};

use crate::context::{req_i64, req_str, CompletionEvent, Deps};
use crate::resource::ResourceService;

/// Duration reductions stack up to this percentage.
pub const DURATION_REDUCTION_CAP: i64 = 90;

pub struct BuffService {
    deps: Arc<Deps>,
    user_no: UserNo,
}

impl BuffService {
    pub fn new(deps: Arc<Deps>, user_no: UserNo) -> Self {
        Self { deps, user_no }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn info(&self) -> GameResult<Value> {
        let permanent = self.records(&keys::permanent_buffs(self.user_no));
        let temporary = self.records(&keys::temporary_buffs(self.user_no));
        let temp_with_expiry: Vec<Value> = temporary
            .into_iter()
            .map(|(id, record)| {
                let expires = self
                    .deps
                    .queues
                    .buff
                    .completion_of(self.user_no, &id, None);
                json!({ "buff_id": id, "record": record, "expires_at": expires })
            })
            .collect();
        Ok(json!({
            "permanent": permanent
                .into_iter()
                .map(|(key, record)| json!({ "source": key, "record": record }))
                .collect::<Vec<_>>(),
            "temporary": temp_with_expiry,
        }))
    }

    fn records(&self, key: &str) -> Vec<(String, BuffRecord)> {
        self.deps
            .cache
            .hgetall(key)
            .into_iter()
            .filter_map(|(field, raw)| {
                serde_json::from_str(&raw).ok().map(|r| (field, r))
            })
            .collect()
    }

    /// Aggregate `(percent_sum, flat_sum)` for one `(target, sub, stat)`
    /// triple. Cached with a short TTL and invalidated on any buff change.
    pub fn totals(&self, target_type: &str, target_sub: i64, stat: &str) -> (i64, i64) {
        let totals_key = keys::buff_totals(self.user_no);
        let field = format!("{target_type}:{target_sub}:{stat}");
        if let Some(raw) = self.deps.cache.hget(&totals_key, &field) {
            if let Some((pct, flat)) = raw
                .split_once('|')
                .and_then(|(p, f)| Some((p.parse().ok()?, f.parse().ok()?)))
            {
                return (pct, flat);
            }
        }

        let mut pct = 0;
        let mut flat = 0;
        for key in [
            keys::permanent_buffs(self.user_no),
            keys::temporary_buffs(self.user_no),
        ] {
            for (_, record) in self.records(&key) {
                let matches = record.target_type == target_type
                    && (record.target_sub == 0 || record.target_sub == target_sub)
                    && record.stat == stat;
                if !matches {
                    continue;
                }
                match record.value_kind {
                    ValueKind::Percent => pct += record.value,
                    ValueKind::Flat => flat += record.value,
                }
            }
        }
        self.deps.cache.hset(
            &totals_key,
            &field,
            format!("{pct}|{flat}"),
            Some(std::time::Duration::from_secs(
                self.deps.config.cache.buff_total_ttl_secs,
            )),
        );
        (pct, flat)
    }

    /// `base × (1 + Σpercent/100) + Σflat`.
    pub fn multiplied(&self, target_type: &str, target_sub: i64, stat: &str, base: i64) -> i64 {
        let (pct, flat) = self.totals(target_type, target_sub, stat);
        base * (100 + pct) / 100 + flat
    }

    /// Apply speed buffs to a base duration. The stacked percentage is
    /// capped at 90 and the result never drops below one second.
    pub fn reduced_duration(
        &self,
        target_type: &str,
        target_sub: i64,
        stat: &str,
        base_secs: i64,
    ) -> i64 {
        let (pct, _) = self.totals(target_type, target_sub, stat);
        let pct = pct.clamp(0, DURATION_REDUCTION_CAP);
        (base_secs * (100 - pct) / 100).max(1)
    }

    // -----------------------------------------------------------------------
    // Permanent buffs
    // -----------------------------------------------------------------------

    /// Grant (or re-grant) a permanent buff sourced from `source:source_key`.
    /// `value_override` replaces the catalog value when the granting object
    /// scales it (alliance levels do).
    pub fn grant_permanent(
        &self,
        source: &str,
        source_key: &str,
        buff_idx: i64,
        value_override: Option<i64>,
    ) -> GameResult<()> {
        let spec = self
            .deps
            .catalog
            .buff(buff_idx)
            .ok_or_else(|| GameError::NotFound(format!("buff {buff_idx}")))?;
        let record = BuffRecord {
            buff_idx,
            target_type: spec.target_type.clone(),
            target_sub: spec.target_sub,
            stat: spec.stat.clone(),
            value: value_override.unwrap_or(spec.value),
            value_kind: spec.value_kind,
        };
        self.deps.cache.hset(
            &keys::permanent_buffs(self.user_no),
            &format!("{source}:{source_key}"),
            serde_json::to_string(&record).expect("serialize buff"),
            Some(self.deps.user_ttl()),
        );
        self.invalidate_totals();
        Ok(())
    }

    pub fn revoke_permanent(&self, source: &str, source_key: &str) -> bool {
        let removed = self.deps.cache.hdel(
            &keys::permanent_buffs(self.user_no),
            &format!("{source}:{source_key}"),
        );
        if removed {
            self.invalidate_totals();
        }
        removed
    }

    /// Drop every permanent buff; the login orchestrator rebuilds the set
    /// from its sources.
    pub fn clear_permanent(&self) {
        self.deps.cache.del(&keys::permanent_buffs(self.user_no));
        self.invalidate_totals();
    }

    // -----------------------------------------------------------------------
    // Temporary buffs
    // -----------------------------------------------------------------------

    /// Activate a temporary buff, paying its ruby price.
    pub async fn activate(&self, data: &Value) -> GameResult<Value> {
        let buff_idx = req_i64(data, "buff_idx")?;
        self.activate_idx(buff_idx, true).await
    }

    /// Activation used by buff items: the price was already paid in items.
    pub async fn activate_from_item(&self, buff_idx: i64) -> GameResult<Value> {
        self.activate_idx(buff_idx, false).await
    }

    async fn activate_idx(&self, buff_idx: i64, charge: bool) -> GameResult<Value> {
        let spec = self
            .deps
            .catalog
            .buff(buff_idx)
            .ok_or_else(|| GameError::NotFound(format!("buff {buff_idx}")))?;
        if spec.duration_secs <= 0 {
            return Err(GameError::Validation(format!(
                "buff {buff_idx} is not activatable"
            )));
        }
        if charge && spec.ruby_cost > 0 {
            ResourceService::new(self.deps.clone(), self.user_no)
                .atomic_consume(ResourceKind::Ruby, spec.ruby_cost)
                .await?;
        }

        let now = Utc::now();
        let expires = now + ChronoDuration::seconds(spec.duration_secs);
        let seq = self
            .deps
            .cache
            .hincrby(&keys::counters(), "buff_activation", 1, None);
        let buff_id = format!("{buff_idx}-{seq}");
        let record = BuffRecord {
            buff_idx,
            target_type: spec.target_type.clone(),
            target_sub: spec.target_sub,
            stat: spec.stat.clone(),
            value: spec.value,
            value_kind: spec.value_kind,
        };
        self.deps.cache.hset(
            &keys::temporary_buffs(self.user_no),
            &buff_id,
            serde_json::to_string(&record).expect("serialize buff"),
            Some(self.deps.user_ttl()),
        );
        self.deps
            .queues
            .buff
            .enqueue(self.user_no, &buff_id, None, expires, &[]);
        self.invalidate_totals();

        Ok(json!({
            "buff_id": buff_id,
            "buff_idx": buff_idx,
            "expires_at": expires,
        }))
    }

    /// Remove a temporary buff before expiry. No refund.
    pub async fn cancel(&self, data: &Value) -> GameResult<Value> {
        let buff_id = req_str(data, "buff_id")?;
        let removed = self
            .deps
            .cache
            .hdel(&keys::temporary_buffs(self.user_no), buff_id);
        if !removed {
            return Err(GameError::NotFound(format!("buff {buff_id}")));
        }
        self.deps.queues.buff.remove(self.user_no, buff_id, None);
        self.invalidate_totals();
        Ok(json!({ "buff_id": buff_id }))
    }

    /// Expiry handler invoked by the task worker.
    pub async fn finish(&self, task: &DueTask) -> GameResult<CompletionEvent> {
        let removed = self
            .deps
            .cache
            .hdel(&keys::temporary_buffs(self.user_no), &task.task_id);
        if !removed {
            tracing::warn!(
                user_no = self.user_no,
                buff_id = %task.task_id,
                "expiry fired for a buff that is already gone"
            );
        }
        self.invalidate_totals();
        Ok(CompletionEvent {
            event: "buff_expired",
            user_no: self.user_no,
            data: json!({ "buff_id": task.task_id }),
        })
    }

    fn invalidate_totals(&self) {
        self.deps.cache.del(&keys::buff_totals(self.user_no));
    }
}
