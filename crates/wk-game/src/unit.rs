//! Unit training and tier upgrades.
//!
//! Counts live in buckets per unit index (`ready`, `training`, `upgrading`,
//! …) with an explicit `total` that always equals the bucket sum. At most
//! one production task may run per unit index; the task record is the
//! authoritative description of what completes, the queue entry only
//! schedules when.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};

use wk_core::types::{SyncClass, UnitStack, UnitTask, UnitTaskKind, UserNo};
use wk_core::{GameError, GameResult};
use wk_store::{keys, DueTask};

use crate::buff::BuffService;
use crate::context::{req_i64, CompletionEvent, Deps};
use crate::mission::MissionService;
use crate::resource::ResourceService;

pub struct UnitService {
    deps: Arc<Deps>,
    user_no: UserNo,
}

impl UnitService {
    pub fn new(deps: Arc<Deps>, user_no: UserNo) -> Self {
        Self { deps, user_no }
    }

    // -----------------------------------------------------------------------
    // Cache plumbing
    // -----------------------------------------------------------------------

    pub async fn ensure_cached(&self) -> GameResult<()> {
        let key = keys::units(self.user_no);
        if self.deps.cache.exists(&key) {
            return Ok(());
        }
        let rows = self.deps.db.load_units(self.user_no).await?;
        if rows.is_empty() {
            return Ok(());
        }
        let ttl = Some(self.deps.user_ttl());
        self.deps.cache.hset_many(
            &key,
            rows.iter().map(|(s, _)| {
                (
                    s.unit_idx.to_string(),
                    serde_json::to_string(s).expect("serialize unit"),
                )
            }),
            ttl,
        );
        self.deps.cache.hset_many(
            &keys::unit_tasks(self.user_no),
            rows.iter().filter_map(|(s, t)| {
                t.as_ref().map(|t| {
                    (
                        s.unit_idx.to_string(),
                        serde_json::to_string(t).expect("serialize task"),
                    )
                })
            }),
            ttl,
        );
        Ok(())
    }

    async fn stack(&self, unit_idx: i64) -> GameResult<UnitStack> {
        self.ensure_cached().await?;
        let raw = self
            .deps
            .cache
            .hget(&keys::units(self.user_no), &unit_idx.to_string());
        match raw {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| GameError::Fatal(format!("corrupt unit record: {e}"))),
            None => Ok(UnitStack::new(unit_idx)),
        }
    }

    fn put_stack(&self, stack: &UnitStack) {
        debug_assert_eq!(stack.total, stack.bucket_sum());
        self.deps.cache.hset(
            &keys::units(self.user_no),
            &stack.unit_idx.to_string(),
            serde_json::to_string(stack).expect("serialize unit"),
            Some(self.deps.user_ttl()),
        );
        self.deps.dirty.mark(SyncClass::Unit, self.user_no);
    }

    pub async fn task(&self, unit_idx: i64) -> GameResult<Option<UnitTask>> {
        self.ensure_cached().await?;
        let raw = self
            .deps
            .cache
            .hget(&keys::unit_tasks(self.user_no), &unit_idx.to_string());
        match raw {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| GameError::Fatal(format!("corrupt unit task: {e}"))),
            None => Ok(None),
        }
    }

    fn put_task(&self, unit_idx: i64, task: &UnitTask) {
        self.deps.cache.hset(
            &keys::unit_tasks(self.user_no),
            &unit_idx.to_string(),
            serde_json::to_string(task).expect("serialize task"),
            Some(self.deps.user_ttl()),
        );
    }

    fn del_task(&self, unit_idx: i64) {
        self.deps
            .cache
            .hdel(&keys::unit_tasks(self.user_no), &unit_idx.to_string());
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn info(&self) -> GameResult<Value> {
        self.ensure_cached().await?;
        let mut stacks: Vec<UnitStack> = self
            .deps
            .cache
            .hgetall(&keys::units(self.user_no))
            .into_values()
            .filter_map(|raw| serde_json::from_str(&raw).ok())
            .collect();
        stacks.sort_by_key(|s| s.unit_idx);

        let mut tasks = Vec::new();
        for stack in &stacks {
            if let Some(task) = self.task(stack.unit_idx).await? {
                tasks.push(json!({ "unit_idx": stack.unit_idx, "task": task }));
            }
        }
        Ok(json!({ "units": stacks, "tasks": tasks }))
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    pub async fn train(&self, data: &Value) -> GameResult<Value> {
        let unit_idx = req_i64(data, "unit_idx")?;
        let quantity = req_i64(data, "quantity")?;
        if quantity <= 0 {
            return Err(GameError::Validation("quantity must be positive".into()));
        }
        let spec = self
            .deps
            .catalog
            .unit(unit_idx)
            .ok_or_else(|| GameError::NotFound(format!("unit config {unit_idx}")))?;
        if self.task(unit_idx).await?.is_some() {
            return Err(GameError::Conflict(format!(
                "unit {unit_idx} already has an active task"
            )));
        }

        ResourceService::new(self.deps.clone(), self.user_no)
            .consume(&spec.cost.scaled(quantity))
            .await?;

        let buffs = BuffService::new(self.deps.clone(), self.user_no);
        let duration = buffs.reduced_duration(
            "unit",
            unit_idx,
            "train_speed",
            spec.train_secs * quantity,
        );
        let now = Utc::now();
        let end = now + ChronoDuration::seconds(duration);

        let mut stack = self.stack(unit_idx).await?;
        stack.training += quantity;
        stack.total += quantity;
        self.put_stack(&stack);

        let task = UnitTask {
            kind: UnitTaskKind::Train,
            quantity,
            target_idx: None,
            start_time: now,
            end_time: end,
        };
        self.put_task(unit_idx, &task);
        self.deps.queues.unit.enqueue(
            self.user_no,
            &unit_idx.to_string(),
            None,
            end,
            &[
                ("kind", "train".to_string()),
                ("quantity", quantity.to_string()),
            ],
        );

        tracing::info!(
            user_no = self.user_no,
            unit_idx,
            quantity,
            duration_secs = duration,
            "training started"
        );
        Ok(json!({ "unit": stack, "task": task }))
    }

    pub async fn upgrade(&self, data: &Value) -> GameResult<Value> {
        let source_idx = req_i64(data, "source_idx")?;
        let target_idx = req_i64(data, "target_idx")?;
        let quantity = req_i64(data, "quantity")?;
        if quantity <= 0 {
            return Err(GameError::Validation("quantity must be positive".into()));
        }
        let target_spec = self
            .deps
            .catalog
            .unit(target_idx)
            .ok_or_else(|| GameError::NotFound(format!("unit config {target_idx}")))?;
        self.deps
            .catalog
            .unit(source_idx)
            .ok_or_else(|| GameError::NotFound(format!("unit config {source_idx}")))?;
        if self.task(source_idx).await?.is_some() {
            return Err(GameError::Conflict(format!(
                "unit {source_idx} already has an active task"
            )));
        }
        let mut source = self.stack(source_idx).await?;
        if source.ready < quantity {
            return Err(GameError::Conflict(format!(
                "unit {source_idx} has {} ready, {quantity} requested",
                source.ready
            )));
        }

        ResourceService::new(self.deps.clone(), self.user_no)
            .consume(&target_spec.cost.scaled(quantity))
            .await?;

        let buffs = BuffService::new(self.deps.clone(), self.user_no);
        let duration = buffs.reduced_duration(
            "unit",
            source_idx,
            "train_speed",
            target_spec.train_secs * quantity,
        );
        let now = Utc::now();
        let end = now + ChronoDuration::seconds(duration);

        source.ready -= quantity;
        source.upgrading += quantity;
        self.put_stack(&source);

        let task = UnitTask {
            kind: UnitTaskKind::Upgrade,
            quantity,
            target_idx: Some(target_idx),
            start_time: now,
            end_time: end,
        };
        self.put_task(source_idx, &task);
        self.deps.queues.unit.enqueue(
            self.user_no,
            &source_idx.to_string(),
            None,
            end,
            &[
                ("kind", "upgrade".to_string()),
                ("quantity", quantity.to_string()),
                ("target_idx", target_idx.to_string()),
            ],
        );

        Ok(json!({ "unit": source, "task": task }))
    }

    /// Abort the active task on a unit index, refunding its full cost.
    pub async fn cancel(&self, data: &Value) -> GameResult<Value> {
        let unit_idx = req_i64(data, "unit_idx")?;
        let task = self
            .task(unit_idx)
            .await?
            .ok_or_else(|| GameError::NotFound(format!("no active task on unit {unit_idx}")))?;

        self.deps
            .queues
            .unit
            .remove(self.user_no, &unit_idx.to_string(), None);

        let mut stack = self.stack(unit_idx).await?;
        let resources = ResourceService::new(self.deps.clone(), self.user_no);
        match task.kind {
            UnitTaskKind::Train => {
                if let Some(spec) = self.deps.catalog.unit(unit_idx) {
                    resources.produce(&spec.cost.scaled(task.quantity)).await?;
                }
                stack.training -= task.quantity;
                stack.total -= task.quantity;
            }
            UnitTaskKind::Upgrade => {
                let target_idx = task
                    .target_idx
                    .ok_or_else(|| GameError::Fatal("upgrade task without target".into()))?;
                if let Some(spec) = self.deps.catalog.unit(target_idx) {
                    resources.produce(&spec.cost.scaled(task.quantity)).await?;
                }
                stack.upgrading -= task.quantity;
                stack.ready += task.quantity;
            }
        }
        self.put_stack(&stack);
        self.del_task(unit_idx);
        Ok(json!({ "unit": stack }))
    }

    pub async fn speedup(&self, data: &Value) -> GameResult<Value> {
        let unit_idx = req_i64(data, "unit_idx")?;
        let seconds = req_i64(data, "seconds")?;
        if seconds <= 0 {
            return Err(GameError::Validation("seconds must be positive".into()));
        }
        let task = self.speedup_by(unit_idx, seconds).await?;
        Ok(json!({ "task": task }))
    }

    pub async fn speedup_by(&self, unit_idx: i64, seconds: i64) -> GameResult<UnitTask> {
        let mut task = self
            .task(unit_idx)
            .await?
            .ok_or_else(|| GameError::NotFound(format!("no active task on unit {unit_idx}")))?;
        let new_end = (task.end_time - ChronoDuration::seconds(seconds)).max(Utc::now());
        task.end_time = new_end;
        self.put_task(unit_idx, &task);
        self.deps
            .queues
            .unit
            .reschedule(self.user_no, &unit_idx.to_string(), None, new_end);
        Ok(task)
    }

    // -----------------------------------------------------------------------
    // Completion
    // -----------------------------------------------------------------------

    pub async fn finish(&self, due: &DueTask) -> GameResult<CompletionEvent> {
        let unit_idx: i64 = due
            .task_id
            .parse()
            .map_err(|_| GameError::Validation(format!("bad unit task id '{}'", due.task_id)))?;
        let data = self.complete(unit_idx).await?;
        Ok(CompletionEvent {
            event: "unit_complete",
            user_no: self.user_no,
            data,
        })
    }

    /// Apply the active task's outcome to the buckets.
    pub async fn complete(&self, unit_idx: i64) -> GameResult<Value> {
        let Some(task) = self.task(unit_idx).await? else {
            tracing::warn!(
                user_no = self.user_no,
                unit_idx,
                "completion fired without a task record"
            );
            return Ok(json!({ "unit_idx": unit_idx, "applied": false }));
        };

        let mut stack = self.stack(unit_idx).await?;
        match task.kind {
            UnitTaskKind::Train => {
                stack.training -= task.quantity;
                stack.ready += task.quantity;
                self.put_stack(&stack);
            }
            UnitTaskKind::Upgrade => {
                let target_idx = task
                    .target_idx
                    .ok_or_else(|| GameError::Fatal("upgrade task without target".into()))?;
                stack.upgrading -= task.quantity;
                stack.total -= task.quantity;
                self.put_stack(&stack);

                let mut target = self.stack(target_idx).await?;
                target.ready += task.quantity;
                target.total += task.quantity;
                self.put_stack(&target);
            }
        }
        self.del_task(unit_idx);

        MissionService::new(self.deps.clone(), self.user_no)
            .check_category("unit")
            .await?;
        tracing::info!(
            user_no = self.user_no,
            unit_idx,
            quantity = task.quantity,
            kind = ?task.kind,
            "unit task complete"
        );
        Ok(json!({ "unit_idx": unit_idx, "quantity": task.quantity, "applied": true }))
    }

    // -----------------------------------------------------------------------
    // Login recovery
    // -----------------------------------------------------------------------

    /// Reconcile in-flight production after a restart: force-complete tasks
    /// whose end has passed (or whose record is missing), re-enqueue the
    /// rest at their stored end time.
    pub async fn recover(&self) -> GameResult<()> {
        self.ensure_cached().await?;
        let now = Utc::now();
        let stacks: Vec<UnitStack> = self
            .deps
            .cache
            .hgetall(&keys::units(self.user_no))
            .into_values()
            .filter_map(|raw| serde_json::from_str(&raw).ok())
            .collect();

        for mut stack in stacks {
            if stack.training == 0 && stack.upgrading == 0 {
                continue;
            }
            match self.task(stack.unit_idx).await? {
                Some(task) if task.end_time > now => {
                    let mut metadata = vec![("quantity", task.quantity.to_string())];
                    match task.kind {
                        UnitTaskKind::Train => metadata.push(("kind", "train".to_string())),
                        UnitTaskKind::Upgrade => {
                            metadata.push(("kind", "upgrade".to_string()));
                            if let Some(t) = task.target_idx {
                                metadata.push(("target_idx", t.to_string()));
                            }
                        }
                    }
                    self.deps.queues.unit.enqueue(
                        self.user_no,
                        &stack.unit_idx.to_string(),
                        None,
                        task.end_time,
                        &metadata,
                    );
                }
                Some(_) => {
                    // Matured while the server was down.
                    self.complete(stack.unit_idx).await?;
                }
                None => {
                    // No record of what was running; return the buckets to
                    // ready so no units are lost.
                    stack.ready += stack.training + stack.upgrading;
                    stack.training = 0;
                    stack.upgrading = 0;
                    self.put_stack(&stack);
                }
            }
        }
        Ok(())
    }
}
