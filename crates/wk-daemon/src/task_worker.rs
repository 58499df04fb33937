//! The completion worker.
//!
//! One multiplexed worker ticks every second, drains matured entries from
//! each class queue in `(score, member)` order, and runs the owning
//! service's finish handler under that user's lock. Success deletes the
//! entry and pushes the completion event; failure leaves the entry in
//! place with a bumped attempt count, and after three failed attempts the
//! entry moves to the dead-letter set and the user is told.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use wk_bridge::{HealthRegistry, PushChannel};
use wk_core::types::TaskClass;
use wk_core::GameError;
use wk_game::buff::BuffService;
use wk_game::building::BuildingService;
use wk_game::research::ResearchService;
use wk_game::unit::UnitService;
use wk_game::{CompletionEvent, Deps};
use wk_store::{DueTask, TaskQueue};

use crate::shutdown::ShutdownSignal;

pub struct TaskWorker {
    deps: Arc<Deps>,
    push: Arc<PushChannel>,
    health: Arc<HealthRegistry>,
    tick: Duration,
    max_attempts: i64,
}

impl TaskWorker {
    pub fn new(deps: Arc<Deps>, push: Arc<PushChannel>, health: Arc<HealthRegistry>) -> Self {
        let tick = Duration::from_millis(deps.config.worker.tick_ms);
        let max_attempts = deps.config.worker.max_attempts as i64;
        Self {
            deps,
            push,
            health,
            tick,
            max_attempts,
        }
    }

    /// Tick until shutdown. The interval runs on the monotonic clock;
    /// maturity is judged against wall-clock scores each tick, so entries
    /// scored slightly in the future simply surface on a later tick.
    pub async fn run(&self, shutdown: ShutdownSignal) {
        self.health.register_task_worker(self.tick);
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut shutdown_rx = shutdown.subscribe();
        tracing::info!(tick_ms = self.tick.as_millis() as u64, "task worker started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.process_tick(Utc::now()).await;
                    self.health.record_task_tick();
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("task worker stopping");
                    break;
                }
            }
        }
    }

    /// One pass over every class queue. Returns the number of completions
    /// applied.
    pub async fn process_tick(&self, now: DateTime<Utc>) -> usize {
        let mut completed = 0;
        for class in TaskClass::ALL {
            let queue = self.deps.queues.for_class(class);
            for task in queue.due(now) {
                if self.process_task(queue, &task).await {
                    completed += 1;
                }
            }
        }
        completed
    }

    async fn process_task(&self, queue: &TaskQueue, task: &DueTask) -> bool {
        // Completions contend with the user's own commands on this lock.
        let guard = match self.deps.locks.lock_user(task.user_no).await {
            Ok(g) => g,
            Err(_) => {
                // Contention, not a handler failure; the entry stays for
                // the next tick without burning an attempt.
                tracing::debug!(member = %task.member, "user busy, deferring completion");
                return false;
            }
        };

        let result = self.finish(task).await;
        drop(guard);

        match result {
            Ok(event) => {
                queue.remove_member(&task.member);
                self.push.send_event(&event);
                true
            }
            Err(err) => {
                let attempts = queue.bump_attempts(&task.member);
                tracing::warn!(
                    member = %task.member,
                    class = task.class.as_str(),
                    attempts,
                    error = %err,
                    "completion failed"
                );
                if attempts >= self.max_attempts {
                    queue.dead_letter(&task.member);
                    self.push.send_event(&CompletionEvent {
                        event: "task_failed",
                        user_no: task.user_no,
                        data: serde_json::json!({
                            "class": task.class.as_str(),
                            "task_id": task.task_id,
                        }),
                    });
                    tracing::error!(member = %task.member, "completion dead-lettered");
                }
                false
            }
        }
    }

    async fn finish(&self, task: &DueTask) -> Result<CompletionEvent, GameError> {
        match task.class {
            TaskClass::Building => {
                BuildingService::new(self.deps.clone(), task.user_no)
                    .finish(task)
                    .await
            }
            TaskClass::UnitTraining => {
                UnitService::new(self.deps.clone(), task.user_no)
                    .finish(task)
                    .await
            }
            TaskClass::Research => {
                ResearchService::new(self.deps.clone(), task.user_no)
                    .finish(task)
                    .await
            }
            TaskClass::Buff => {
                BuffService::new(self.deps.clone(), task.user_no)
                    .finish(task)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use wk_bridge::AppState;
    use wk_core::catalog::{BuildingLevel, GameCatalog};
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
        levels.insert(
            2,
            BuildingLevel {
                cost: ResourceBundle::default(),
                build_secs: 60,
                requires: vec![],
                power: 0,
            },
        );
        c.buildings.insert(201, levels);
        c
    }

    async fn setup() -> (Arc<Deps>, TaskWorker, Arc<PushChannel>) {
        let deps = Deps::in_memory(catalog(), ServerConfig::default())
            .await
            .unwrap();
        let profile = UserProfile {
            user_no: 1001,
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
        let state = AppState::new(deps.clone());
        let push = state.push.clone();
        let worker = TaskWorker::new(deps.clone(), push.clone(), state.health.clone());
        (deps, worker, push)
    }

    #[tokio::test]
    async fn matured_upgrade_completes_and_pushes() {
        let (deps, worker, push) = setup().await;
        let rx = push.connect(1001);

        let svc = BuildingService::new(deps.clone(), 1001);
        svc.create(&json!({ "building_idx": 201 })).await.unwrap();
        svc.levelup(&json!({ "building_idx": 201 })).await.unwrap();

        // Not yet mature.
        assert_eq!(worker.process_tick(Utc::now()).await, 0);
        // Advance past the 60 s duration.
        let applied = worker
            .process_tick(Utc::now() + ChronoDuration::seconds(61))
            .await;
        assert_eq!(applied, 1);
        assert!(deps.queues.building.is_empty());

        let pushed = rx.try_recv().unwrap();
        assert!(pushed.contains("building_complete"));

        // A later tick finds nothing.
        assert_eq!(
            worker
                .process_tick(Utc::now() + ChronoDuration::seconds(120))
                .await,
            0
        );
    }

    #[tokio::test]
    async fn failing_entry_is_dead_lettered_after_three_attempts() {
        let (deps, worker, push) = setup().await;
        let rx = push.connect(1001);

        // A queue entry for a building that does not exist keeps failing.
        deps.queues.building.enqueue(
            1001,
            "999",
            None,
            Utc::now() - ChronoDuration::seconds(1),
            &[],
        );

        for _ in 0..2 {
            worker.process_tick(Utc::now()).await;
            assert_eq!(deps.queues.building.len(), 1);
        }
        worker.process_tick(Utc::now()).await;
        assert!(deps.queues.building.is_empty());
        assert_eq!(deps.queues.building.dead_letter_members(), vec!["1001:999"]);

        let mut saw_failure = false;
        while let Ok(msg) = rx.try_recv() {
            saw_failure |= msg.contains("task_failed");
        }
        assert!(saw_failure);
    }

    // Paused time lets the 10 s lock timeout elapse instantly.
    #[tokio::test(start_paused = true)]
    async fn locked_user_defers_without_burning_attempts() {
        let (deps, worker, _push) = setup().await;
        deps.queues.building.enqueue(
            1001,
            "999",
            None,
            Utc::now() - ChronoDuration::seconds(1),
            &[],
        );

        let _held = deps.locks.lock_user(1001).await.unwrap();
        let completed = worker.process_tick(Utc::now()).await;
        assert_eq!(completed, 0);
        // The entry survives with no attempt burned.
        assert_eq!(deps.queues.building.len(), 1);
        let due = deps.queues.building.due(Utc::now());
        assert_eq!(due[0].meta_i64("attempts"), 0);
    }
}
