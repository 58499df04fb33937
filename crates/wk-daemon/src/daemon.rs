//! Daemon orchestration: open the stores, load the catalog, wire the
//! dependency graph, and run the API server alongside the task worker and
//! the sync workers until shutdown.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{error, info};

use wk_bridge::{api_router, AppState};
use wk_core::catalog::GameCatalog;
use wk_core::config::ServerConfig;
use wk_core::types::SyncClass;
use wk_game::Deps;
use wk_store::{CacheStore, PersistentStore};

use crate::shutdown::ShutdownSignal;
use crate::sync_worker::SyncWorker;
use crate::task_worker::TaskWorker;

pub struct Daemon {
    config: Arc<ServerConfig>,
    deps: Arc<Deps>,
    state: Arc<AppState>,
    shutdown: ShutdownSignal,
}

impl Daemon {
    /// Load the catalog, open the stores, and wire the dependency graph.
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let catalog = GameCatalog::load_dir(&config.data.game_data_dir)
            .context("failed to load game data catalog")?;
        let cache = Arc::new(CacheStore::new());
        let db = Arc::new(
            PersistentStore::open(&config.data.db_path)
                .await
                .context("failed to open persistent store")?,
        );
        let config = Arc::new(config);
        let deps = Deps::wire(cache, db, Arc::new(catalog), config.clone())
            .await
            .context("failed to wire dependencies")?;
        let state = Arc::new(AppState::new(deps.clone()));
        Ok(Self {
            config,
            deps,
            state,
            shutdown: ShutdownSignal::new(),
        })
    }

    /// Handle for triggering shutdown from another task (e.g. ctrl-c).
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Spawn the task worker and one sync worker per entity class.
    fn spawn_workers(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let task_worker = TaskWorker::new(
            self.deps.clone(),
            self.state.push.clone(),
            self.state.health.clone(),
        );
        let shutdown = self.shutdown.clone();
        handles.push(tokio::spawn(async move {
            task_worker.run(shutdown).await;
        }));

        for class in SyncClass::ALL {
            let worker = SyncWorker::new(self.deps.clone(), class, self.state.health.clone());
            let shutdown = self.shutdown.clone();
            handles.push(tokio::spawn(async move {
                worker.run(shutdown).await;
            }));
        }
        handles
    }

    /// Serve on a pre-bound listener until shutdown. New requests stop
    /// being accepted first; the sync workers then run their final drains.
    pub async fn run_with_listener(&self, listener: tokio::net::TcpListener) -> Result<()> {
        let bind_addr = listener.local_addr()?;
        let workers = self.spawn_workers();

        let router = api_router(self.state.clone());
        let shutdown = self.shutdown.clone();
        info!(%bind_addr, "API server listening");
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let mut rx = shutdown.subscribe();
                let _ = rx.recv().await;
            })
            .await
            .context("API server error")?;

        // The server is down; wait for the workers' shutdown drains.
        for handle in workers {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task panicked");
            }
        }
        info!("daemon stopped");
        Ok(())
    }

    /// Bind from config and serve until shutdown (blocking).
    pub async fn run(&self) -> Result<()> {
        let bind_addr = format!("{}:{}", self.config.server.host, self.config.server.port);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("failed to bind {bind_addr}"))?;
        self.run_with_listener(listener).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn daemon_boots_with_empty_catalog_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ServerConfig::default();
        config.data.game_data_dir = dir.path().display().to_string();
        config.data.db_path = dir.path().join("test.db").display().to_string();

        let daemon = Daemon::new(config).await.unwrap();
        assert_eq!(daemon.state().push.session_count(), 0);
    }

    #[tokio::test]
    async fn serve_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ServerConfig::default();
        config.data.game_data_dir = dir.path().display().to_string();
        config.data.db_path = dir.path().join("test.db").display().to_string();

        let daemon = Daemon::new(config).await.unwrap();
        let shutdown = daemon.shutdown_handle();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();

        let server = async move { daemon.run_with_listener(listener).await };
        let stopper = async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            shutdown.trigger();
            Ok(())
        };
        let (served, _stopped): (Result<()>, Result<()>) = tokio::join!(server, stopper);
        served.unwrap();
    }
}
