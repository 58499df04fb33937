//! Subsystem health tracking for the `/health` endpoint.

use std::sync::RwLock;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::{json, Value};

/// Workers report each completed cycle here; the health endpoint turns the
/// elapsed time since the last report into `ok` or a lag figure. A worker
/// is lagging once it misses two of its own cadences.
#[derive(Default)]
pub struct HealthRegistry {
    sync_workers: DashMap<String, WorkerBeat>,
    task_worker: RwLock<Option<WorkerBeat>>,
}

struct WorkerBeat {
    cadence: Duration,
    last_cycle: Instant,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_sync_worker(&self, class: &str, cadence: Duration) {
        self.sync_workers.insert(
            class.to_string(),
            WorkerBeat {
                cadence,
                last_cycle: Instant::now(),
            },
        );
    }

    pub fn record_sync_cycle(&self, class: &str) {
        if let Some(mut beat) = self.sync_workers.get_mut(class) {
            beat.last_cycle = Instant::now();
        }
    }

    pub fn register_task_worker(&self, cadence: Duration) {
        *self.task_worker.write().expect("health lock poisoned") = Some(WorkerBeat {
            cadence,
            last_cycle: Instant::now(),
        });
    }

    pub fn record_task_tick(&self) {
        if let Some(beat) = self
            .task_worker
            .write()
            .expect("health lock poisoned")
            .as_mut()
        {
            beat.last_cycle = Instant::now();
        }
    }

    fn status_of(beat: &WorkerBeat) -> Value {
        let lag = beat.last_cycle.elapsed();
        if lag < beat.cadence * 2 {
            json!("ok")
        } else {
            json!({ "lag_seconds": lag.as_secs() })
        }
    }

    pub fn task_worker_status(&self) -> Value {
        match self
            .task_worker
            .read()
            .expect("health lock poisoned")
            .as_ref()
        {
            Some(beat) => Self::status_of(beat),
            None => json!("not_started"),
        }
    }

    pub fn sync_worker_statuses(&self) -> Value {
        let mut out = serde_json::Map::new();
        for entry in self.sync_workers.iter() {
            out.insert(entry.key().clone(), Self::status_of(entry.value()));
        }
        Value::Object(out)
    }
}
