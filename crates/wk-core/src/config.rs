//! Server configuration, loaded from a TOML file with per-section defaults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::types::SyncClass;

/// Top-level configuration for the warkeep daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub data: DataSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub sync: SyncSection,
    #[serde(default)]
    pub worker: WorkerSection,
    #[serde(default)]
    pub game: GameSection,
}

impl ServerConfig {
    /// Load from a TOML file, falling back to defaults when it is absent.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        if !path.exists() {
            return Ok(ServerConfig::default());
        }
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Grace period for in-flight requests on shutdown.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    9290
}
fn default_shutdown_grace_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSection {
    /// Directory holding the tabular game-data files.
    #[serde(default = "default_game_data_dir")]
    pub game_data_dir: String,
    /// SQLite database path.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for DataSection {
    fn default() -> Self {
        Self {
            game_data_dir: default_game_data_dir(),
            db_path: default_db_path(),
        }
    }
}

fn default_game_data_dir() -> String {
    "./game_data".into()
}
fn default_db_path() -> String {
    "./warkeep.db".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSection {
    /// TTL for per-user entity hashes (seconds).
    #[serde(default = "default_user_ttl_secs")]
    pub user_ttl_secs: u64,
    /// TTL for alliance hashes (seconds).
    #[serde(default = "default_alliance_ttl_secs")]
    pub alliance_ttl_secs: u64,
    /// TTL for the buff aggregate (seconds).
    #[serde(default = "default_buff_total_ttl_secs")]
    pub buff_total_ttl_secs: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            user_ttl_secs: default_user_ttl_secs(),
            alliance_ttl_secs: default_alliance_ttl_secs(),
            buff_total_ttl_secs: default_buff_total_ttl_secs(),
        }
    }
}

fn default_user_ttl_secs() -> u64 {
    3600
}
fn default_alliance_ttl_secs() -> u64 {
    86400
}
fn default_buff_total_ttl_secs() -> u64 {
    60
}

/// Write-behind cadences, one per entity class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSection {
    #[serde(default = "default_building_secs")]
    pub building_secs: u64,
    #[serde(default = "default_research_secs")]
    pub research_secs: u64,
    #[serde(default = "default_unit_secs")]
    pub unit_secs: u64,
    #[serde(default = "default_resources_secs")]
    pub resources_secs: u64,
    #[serde(default = "default_item_secs")]
    pub item_secs: u64,
    #[serde(default = "default_mission_secs")]
    pub mission_secs: u64,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            building_secs: default_building_secs(),
            research_secs: default_research_secs(),
            unit_secs: default_unit_secs(),
            resources_secs: default_resources_secs(),
            item_secs: default_item_secs(),
            mission_secs: default_mission_secs(),
        }
    }
}

impl SyncSection {
    pub fn interval_for(&self, class: SyncClass) -> Duration {
        let secs = match class {
            SyncClass::Building => self.building_secs,
            SyncClass::Research => self.research_secs,
            SyncClass::Unit => self.unit_secs,
            SyncClass::Resources => self.resources_secs,
            SyncClass::Item => self.item_secs,
            SyncClass::Mission => self.mission_secs,
        };
        Duration::from_secs(secs)
    }
}

fn default_building_secs() -> u64 {
    10
}
fn default_research_secs() -> u64 {
    10
}
fn default_unit_secs() -> u64 {
    30
}
fn default_resources_secs() -> u64 {
    60
}
fn default_item_secs() -> u64 {
    60
}
fn default_mission_secs() -> u64 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSection {
    /// Completion-queue tick interval in milliseconds.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Attempts before a failing completion is dead-lettered.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// User/alliance lock acquisition deadline in seconds.
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            max_attempts: default_max_attempts(),
            lock_timeout_secs: default_lock_timeout_secs(),
        }
    }
}

fn default_tick_ms() -> u64 {
    1000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_lock_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameSection {
    /// Percentage of spent resources returned on research cancellation.
    #[serde(default = "default_research_refund_percent")]
    pub research_refund_percent: i64,
    /// Food-to-exp ratio for alliance donations.
    #[serde(default = "default_donate_ratio")]
    pub donate_ratio: i64,
    /// Number of shop slots rolled per user.
    #[serde(default = "default_shop_slots")]
    pub shop_slots: i64,
    /// Resources granted to a freshly created user.
    #[serde(default = "default_starter_food")]
    pub starter_food: i64,
    #[serde(default = "default_starter_wood")]
    pub starter_wood: i64,
    #[serde(default = "default_starter_stone")]
    pub starter_stone: i64,
    #[serde(default = "default_starter_gold")]
    pub starter_gold: i64,
    #[serde(default = "default_starter_ruby")]
    pub starter_ruby: i64,
}

impl Default for GameSection {
    fn default() -> Self {
        Self {
            research_refund_percent: default_research_refund_percent(),
            donate_ratio: default_donate_ratio(),
            shop_slots: default_shop_slots(),
            starter_food: default_starter_food(),
            starter_wood: default_starter_wood(),
            starter_stone: default_starter_stone(),
            starter_gold: default_starter_gold(),
            starter_ruby: default_starter_ruby(),
        }
    }
}

fn default_research_refund_percent() -> i64 {
    50
}
fn default_donate_ratio() -> i64 {
    100
}
fn default_shop_slots() -> i64 {
    6
}
fn default_starter_food() -> i64 {
    5000
}
fn default_starter_wood() -> i64 {
    5000
}
fn default_starter_stone() -> i64 {
    5000
}
fn default_starter_gold() -> i64 {
    5000
}
fn default_starter_ruby() -> i64 {
    100
}
