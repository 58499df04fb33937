//! Async SQLite system-of-record.
//!
//! The persistent store never serves steady-state reads. It exists to
//! bootstrap the cache on login, absorb write-behind flushes from the sync
//! workers, and anchor the id counters. Alliance state is the one
//! write-through exception: alliance mutations are rare and loss-sensitive,
//! so each one lands here immediately under the alliance lock.
//!
//! Write-behind savers take a full per-user snapshot of one entity class
//! and reconcile it inside a transaction: rows that vanished from the cache
//! are deleted, present rows are rewritten. Running the same snapshot twice
//! leaves the table unchanged.

use std::path::Path;

use chrono::{DateTime, Utc};
use tokio_rusqlite::Connection;

use wk_core::types::{
    AllianceApplication, AllianceId, AllianceMember, AllianceState, BuildingState, ItemStack,
    MissionProgress, ResearchState, ResourceBundle, UnitStack, UnitTask, UserNo, UserProfile,
};
use wk_core::{GameError, GameResult};

pub struct PersistentStore {
    conn: Connection,
}

// ---------------------------------------------------------------------------
// helpers — enum / timestamp <-> SQLite text
// ---------------------------------------------------------------------------

fn enum_to_sql<T: serde::Serialize>(val: &T) -> String {
    let s = serde_json::to_string(val).expect("serialize enum");
    s.trim_matches('"').to_string()
}

fn enum_from_sql<T: serde::de::DeserializeOwned>(raw: &str) -> T {
    let quoted = format!("\"{raw}\"");
    serde_json::from_str(&quoted).expect("deserialize enum")
}

fn dt_to_sql(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn dt_from_sql(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .expect("valid date")
        .with_timezone(&Utc)
}

fn opt_dt_from_sql(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.map(|s| dt_from_sql(&s))
}

fn backend(e: impl std::fmt::Display) -> GameError {
    GameError::TransientBackend(e.to_string())
}

impl PersistentStore {
    /// Open (or create) a database at the given file path.
    pub async fn open(path: impl AsRef<Path>) -> GameResult<Self> {
        let conn = Connection::open(path.as_ref()).await.map_err(backend)?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    /// Purely in-memory database (useful for tests).
    pub async fn open_in_memory() -> GameResult<Self> {
        let conn = Connection::open_in_memory().await.map_err(backend)?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    async fn init_schema(&self) -> GameResult<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;
                    PRAGMA foreign_keys=ON;

                    CREATE TABLE IF NOT EXISTS users (
                        user_no           INTEGER PRIMARY KEY,
                        account_id        TEXT NOT NULL UNIQUE,
                        nickname          TEXT NOT NULL,
                        level             INTEGER NOT NULL DEFAULT 1,
                        power             INTEGER NOT NULL DEFAULT 0,
                        alliance_id       INTEGER,
                        alliance_position TEXT,
                        created_at        TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS resources (
                        user_no INTEGER PRIMARY KEY
                                REFERENCES users(user_no) ON DELETE CASCADE,
                        food    INTEGER NOT NULL DEFAULT 0,
                        wood    INTEGER NOT NULL DEFAULT 0,
                        stone   INTEGER NOT NULL DEFAULT 0,
                        gold    INTEGER NOT NULL DEFAULT 0,
                        ruby    INTEGER NOT NULL DEFAULT 0
                    );

                    CREATE TABLE IF NOT EXISTS buildings (
                        user_no      INTEGER NOT NULL
                                     REFERENCES users(user_no) ON DELETE CASCADE,
                        building_idx INTEGER NOT NULL,
                        level        INTEGER NOT NULL,
                        status       TEXT NOT NULL,
                        start_time   TEXT,
                        end_time     TEXT,
                        last_change  TEXT NOT NULL,
                        PRIMARY KEY (user_no, building_idx)
                    );

                    CREATE TABLE IF NOT EXISTS units (
                        user_no   INTEGER NOT NULL
                                  REFERENCES users(user_no) ON DELETE CASCADE,
                        unit_idx  INTEGER NOT NULL,
                        total     INTEGER NOT NULL DEFAULT 0,
                        ready     INTEGER NOT NULL DEFAULT 0,
                        field     INTEGER NOT NULL DEFAULT 0,
                        training  INTEGER NOT NULL DEFAULT 0,
                        upgrading INTEGER NOT NULL DEFAULT 0,
                        injured   INTEGER NOT NULL DEFAULT 0,
                        wounded   INTEGER NOT NULL DEFAULT 0,
                        healing   INTEGER NOT NULL DEFAULT 0,
                        dead      INTEGER NOT NULL DEFAULT 0,
                        task      TEXT,
                        PRIMARY KEY (user_no, unit_idx)
                    );

                    CREATE TABLE IF NOT EXISTS researches (
                        user_no      INTEGER NOT NULL
                                     REFERENCES users(user_no) ON DELETE CASCADE,
                        research_idx INTEGER NOT NULL,
                        level        INTEGER NOT NULL DEFAULT 0,
                        status       TEXT NOT NULL,
                        start_time   TEXT,
                        end_time     TEXT,
                        PRIMARY KEY (user_no, research_idx)
                    );

                    CREATE TABLE IF NOT EXISTS items (
                        user_no  INTEGER NOT NULL
                                 REFERENCES users(user_no) ON DELETE CASCADE,
                        item_idx INTEGER NOT NULL,
                        quantity INTEGER NOT NULL DEFAULT 0,
                        PRIMARY KEY (user_no, item_idx)
                    );

                    CREATE TABLE IF NOT EXISTS missions (
                        user_no      INTEGER NOT NULL
                                     REFERENCES users(user_no) ON DELETE CASCADE,
                        mission_idx  INTEGER NOT NULL,
                        completed_at TEXT,
                        claimed_at   TEXT,
                        PRIMARY KEY (user_no, mission_idx)
                    );

                    CREATE TABLE IF NOT EXISTS alliances (
                        alliance_id INTEGER PRIMARY KEY,
                        name        TEXT NOT NULL UNIQUE,
                        level       INTEGER NOT NULL DEFAULT 1,
                        exp         INTEGER NOT NULL DEFAULT 0,
                        leader_no   INTEGER NOT NULL,
                        join_policy TEXT NOT NULL,
                        notice      TEXT NOT NULL DEFAULT '',
                        created_at  TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS alliance_members (
                        alliance_id INTEGER NOT NULL
                                    REFERENCES alliances(alliance_id) ON DELETE CASCADE,
                        user_no     INTEGER NOT NULL,
                        position    TEXT NOT NULL,
                        joined_at   TEXT NOT NULL,
                        donated_exp INTEGER NOT NULL DEFAULT 0,
                        PRIMARY KEY (alliance_id, user_no)
                    );

                    CREATE INDEX IF NOT EXISTS idx_alliance_members_user
                        ON alliance_members(user_no);

                    CREATE TABLE IF NOT EXISTS alliance_applications (
                        alliance_id INTEGER NOT NULL
                                    REFERENCES alliances(alliance_id) ON DELETE CASCADE,
                        user_no     INTEGER NOT NULL,
                        applied_at  TEXT NOT NULL,
                        PRIMARY KEY (alliance_id, user_no)
                    );

                    CREATE TABLE IF NOT EXISTS counters (
                        name  TEXT PRIMARY KEY,
                        value INTEGER NOT NULL
                    );
                    ",
                )?;
                Ok(())
            })
            .await
            .map_err(backend)
    }

    /// Liveness probe for the health endpoint.
    pub async fn ping(&self) -> bool {
        self.conn
            .call(|conn| {
                conn.query_row("SELECT 1", [], |r| r.get::<_, i64>(0))?;
                Ok(())
            })
            .await
            .is_ok()
    }

    // -----------------------------------------------------------------------
    // Users & resources
    // -----------------------------------------------------------------------

    /// Insert a fresh user and their starter resources in one transaction.
    pub async fn create_user(
        &self,
        profile: &UserProfile,
        starter: &ResourceBundle,
    ) -> GameResult<()> {
        let p = profile.clone();
        let starter = *starter;
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO users (user_no, account_id, nickname, level, power,
                        alliance_id, alliance_position, created_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
                    rusqlite::params![
                        p.user_no,
                        p.account_id,
                        p.nickname,
                        p.level,
                        p.power,
                        p.alliance_id,
                        p.alliance_position.as_ref().map(enum_to_sql),
                        dt_to_sql(&p.created_at),
                    ],
                )?;
                tx.execute(
                    "INSERT INTO resources (user_no, food, wood, stone, gold, ruby)
                     VALUES (?1,?2,?3,?4,?5,?6)",
                    rusqlite::params![
                        p.user_no,
                        starter.food,
                        starter.wood,
                        starter.stone,
                        starter.gold,
                        starter.ruby,
                    ],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(backend)
    }

    pub async fn save_profile(&self, profile: &UserProfile) -> GameResult<()> {
        let p = profile.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO users (user_no, account_id, nickname, level, power,
                        alliance_id, alliance_position, created_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8)
                     ON CONFLICT(user_no) DO UPDATE SET
                        nickname=excluded.nickname, level=excluded.level,
                        power=excluded.power, alliance_id=excluded.alliance_id,
                        alliance_position=excluded.alliance_position",
                    rusqlite::params![
                        p.user_no,
                        p.account_id,
                        p.nickname,
                        p.level,
                        p.power,
                        p.alliance_id,
                        p.alliance_position.as_ref().map(enum_to_sql),
                        dt_to_sql(&p.created_at),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(backend)
    }

    pub async fn load_profile(&self, user_no: UserNo) -> GameResult<Option<UserProfile>> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT user_no, account_id, nickname, level, power,
                            alliance_id, alliance_position, created_at
                     FROM users WHERE user_no = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![user_no])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_profile(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(backend)
    }

    pub async fn save_resources(
        &self,
        user_no: UserNo,
        resources: &ResourceBundle,
    ) -> GameResult<()> {
        let r = *resources;
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO resources (user_no, food, wood, stone, gold, ruby)
                     VALUES (?1,?2,?3,?4,?5,?6)
                     ON CONFLICT(user_no) DO UPDATE SET
                        food=excluded.food, wood=excluded.wood, stone=excluded.stone,
                        gold=excluded.gold, ruby=excluded.ruby",
                    rusqlite::params![user_no, r.food, r.wood, r.stone, r.gold, r.ruby],
                )?;
                Ok(())
            })
            .await
            .map_err(backend)
    }

    pub async fn load_resources(&self, user_no: UserNo) -> GameResult<Option<ResourceBundle>> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT food, wood, stone, gold, ruby FROM resources WHERE user_no = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![user_no])?;
                match rows.next()? {
                    Some(row) => Ok(Some(ResourceBundle {
                        food: row.get(0)?,
                        wood: row.get(1)?,
                        stone: row.get(2)?,
                        gold: row.get(3)?,
                        ruby: row.get(4)?,
                    })),
                    None => Ok(None),
                }
            })
            .await
            .map_err(backend)
    }

    // -----------------------------------------------------------------------
    // Buildings
    // -----------------------------------------------------------------------

    pub async fn save_buildings(
        &self,
        user_no: UserNo,
        buildings: &[BuildingState],
    ) -> GameResult<()> {
        let rows: Vec<BuildingState> = buildings.to_vec();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM buildings WHERE user_no = ?1",
                    rusqlite::params![user_no],
                )?;
                for b in &rows {
                    tx.execute(
                        "INSERT INTO buildings (user_no, building_idx, level, status,
                            start_time, end_time, last_change)
                         VALUES (?1,?2,?3,?4,?5,?6,?7)",
                        rusqlite::params![
                            user_no,
                            b.building_idx,
                            b.level,
                            enum_to_sql(&b.status),
                            b.start_time.as_ref().map(dt_to_sql),
                            b.end_time.as_ref().map(dt_to_sql),
                            dt_to_sql(&b.last_change),
                        ],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(backend)
    }

    pub async fn load_buildings(&self, user_no: UserNo) -> GameResult<Vec<BuildingState>> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT building_idx, level, status, start_time, end_time, last_change
                     FROM buildings WHERE user_no = ?1 ORDER BY building_idx",
                )?;
                let mut rows = stmt.query(rusqlite::params![user_no])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_building(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(backend)
    }

    // -----------------------------------------------------------------------
    // Units
    // -----------------------------------------------------------------------

    pub async fn save_units(
        &self,
        user_no: UserNo,
        units: &[(UnitStack, Option<UnitTask>)],
    ) -> GameResult<()> {
        let rows: Vec<(UnitStack, Option<String>)> = units
            .iter()
            .map(|(s, t)| {
                (
                    s.clone(),
                    t.as_ref()
                        .map(|t| serde_json::to_string(t).expect("serialize unit task")),
                )
            })
            .collect();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM units WHERE user_no = ?1",
                    rusqlite::params![user_no],
                )?;
                for (s, task) in &rows {
                    tx.execute(
                        "INSERT INTO units (user_no, unit_idx, total, ready, field, training,
                            upgrading, injured, wounded, healing, dead, task)
                         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
                        rusqlite::params![
                            user_no, s.unit_idx, s.total, s.ready, s.field, s.training,
                            s.upgrading, s.injured, s.wounded, s.healing, s.dead, task,
                        ],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(backend)
    }

    pub async fn load_units(
        &self,
        user_no: UserNo,
    ) -> GameResult<Vec<(UnitStack, Option<UnitTask>)>> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT unit_idx, total, ready, field, training, upgrading,
                            injured, wounded, healing, dead, task
                     FROM units WHERE user_no = ?1 ORDER BY unit_idx",
                )?;
                let mut rows = stmt.query(rusqlite::params![user_no])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_unit(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(backend)
    }

    // -----------------------------------------------------------------------
    // Researches
    // -----------------------------------------------------------------------

    pub async fn save_researches(
        &self,
        user_no: UserNo,
        researches: &[ResearchState],
    ) -> GameResult<()> {
        let rows: Vec<ResearchState> = researches.to_vec();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM researches WHERE user_no = ?1",
                    rusqlite::params![user_no],
                )?;
                for r in &rows {
                    tx.execute(
                        "INSERT INTO researches (user_no, research_idx, level, status,
                            start_time, end_time)
                         VALUES (?1,?2,?3,?4,?5,?6)",
                        rusqlite::params![
                            user_no,
                            r.research_idx,
                            r.level,
                            enum_to_sql(&r.status),
                            r.start_time.as_ref().map(dt_to_sql),
                            r.end_time.as_ref().map(dt_to_sql),
                        ],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(backend)
    }

    pub async fn load_researches(&self, user_no: UserNo) -> GameResult<Vec<ResearchState>> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT research_idx, level, status, start_time, end_time
                     FROM researches WHERE user_no = ?1 ORDER BY research_idx",
                )?;
                let mut rows = stmt.query(rusqlite::params![user_no])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_research(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(backend)
    }

    // -----------------------------------------------------------------------
    // Items & missions
    // -----------------------------------------------------------------------

    pub async fn save_items(&self, user_no: UserNo, items: &[ItemStack]) -> GameResult<()> {
        let rows: Vec<ItemStack> = items.to_vec();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM items WHERE user_no = ?1",
                    rusqlite::params![user_no],
                )?;
                for i in rows.iter().filter(|i| i.quantity > 0) {
                    tx.execute(
                        "INSERT INTO items (user_no, item_idx, quantity) VALUES (?1,?2,?3)",
                        rusqlite::params![user_no, i.item_idx, i.quantity],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(backend)
    }

    pub async fn load_items(&self, user_no: UserNo) -> GameResult<Vec<ItemStack>> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT item_idx, quantity FROM items
                     WHERE user_no = ?1 ORDER BY item_idx",
                )?;
                let mut rows = stmt.query(rusqlite::params![user_no])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(ItemStack {
                        item_idx: row.get(0)?,
                        quantity: row.get(1)?,
                    });
                }
                Ok(out)
            })
            .await
            .map_err(backend)
    }

    pub async fn save_missions(
        &self,
        user_no: UserNo,
        missions: &[MissionProgress],
    ) -> GameResult<()> {
        let rows: Vec<MissionProgress> = missions.to_vec();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM missions WHERE user_no = ?1",
                    rusqlite::params![user_no],
                )?;
                for m in &rows {
                    tx.execute(
                        "INSERT INTO missions (user_no, mission_idx, completed_at, claimed_at)
                         VALUES (?1,?2,?3,?4)",
                        rusqlite::params![
                            user_no,
                            m.mission_idx,
                            m.completed_at.as_ref().map(dt_to_sql),
                            m.claimed_at.as_ref().map(dt_to_sql),
                        ],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(backend)
    }

    pub async fn load_missions(&self, user_no: UserNo) -> GameResult<Vec<MissionProgress>> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT mission_idx, completed_at, claimed_at FROM missions
                     WHERE user_no = ?1 ORDER BY mission_idx",
                )?;
                let mut rows = stmt.query(rusqlite::params![user_no])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let completed: Option<String> = row.get(1)?;
                    let claimed: Option<String> = row.get(2)?;
                    out.push(MissionProgress {
                        mission_idx: row.get(0)?,
                        completed_at: opt_dt_from_sql(completed),
                        claimed_at: opt_dt_from_sql(claimed),
                    });
                }
                Ok(out)
            })
            .await
            .map_err(backend)
    }

    // -----------------------------------------------------------------------
    // Alliances (write-through)
    // -----------------------------------------------------------------------

    pub async fn save_alliance(
        &self,
        state: &AllianceState,
        members: &[AllianceMember],
        applications: &[AllianceApplication],
    ) -> GameResult<()> {
        let a = state.clone();
        let members: Vec<AllianceMember> = members.to_vec();
        let applications: Vec<AllianceApplication> = applications.to_vec();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO alliances (alliance_id, name, level, exp, leader_no,
                        join_policy, notice, created_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8)
                     ON CONFLICT(alliance_id) DO UPDATE SET
                        name=excluded.name, level=excluded.level, exp=excluded.exp,
                        leader_no=excluded.leader_no, join_policy=excluded.join_policy,
                        notice=excluded.notice",
                    rusqlite::params![
                        a.alliance_id,
                        a.name,
                        a.level,
                        a.exp,
                        a.leader_no,
                        enum_to_sql(&a.join_policy),
                        a.notice,
                        dt_to_sql(&a.created_at),
                    ],
                )?;
                tx.execute(
                    "DELETE FROM alliance_members WHERE alliance_id = ?1",
                    rusqlite::params![a.alliance_id],
                )?;
                for m in &members {
                    tx.execute(
                        "INSERT INTO alliance_members (alliance_id, user_no, position,
                            joined_at, donated_exp)
                         VALUES (?1,?2,?3,?4,?5)",
                        rusqlite::params![
                            a.alliance_id,
                            m.user_no,
                            enum_to_sql(&m.position),
                            dt_to_sql(&m.joined_at),
                            m.donated_exp,
                        ],
                    )?;
                }
                tx.execute(
                    "DELETE FROM alliance_applications WHERE alliance_id = ?1",
                    rusqlite::params![a.alliance_id],
                )?;
                for app in &applications {
                    tx.execute(
                        "INSERT INTO alliance_applications (alliance_id, user_no, applied_at)
                         VALUES (?1,?2,?3)",
                        rusqlite::params![a.alliance_id, app.user_no, dt_to_sql(&app.applied_at)],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(backend)
    }

    pub async fn load_alliance(
        &self,
        alliance_id: AllianceId,
    ) -> GameResult<Option<(AllianceState, Vec<AllianceMember>, Vec<AllianceApplication>)>> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT alliance_id, name, level, exp, leader_no, join_policy,
                            notice, created_at
                     FROM alliances WHERE alliance_id = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![alliance_id])?;
                let state = match rows.next()? {
                    Some(row) => row_to_alliance(row)?,
                    None => return Ok(None),
                };

                let mut stmt = conn.prepare(
                    "SELECT user_no, position, joined_at, donated_exp
                     FROM alliance_members WHERE alliance_id = ?1 ORDER BY user_no",
                )?;
                let mut rows = stmt.query(rusqlite::params![alliance_id])?;
                let mut members = Vec::new();
                while let Some(row) = rows.next()? {
                    let position: String = row.get(1)?;
                    let joined: String = row.get(2)?;
                    members.push(AllianceMember {
                        user_no: row.get(0)?,
                        position: enum_from_sql(&position),
                        joined_at: dt_from_sql(&joined),
                        donated_exp: row.get(3)?,
                    });
                }

                let mut stmt = conn.prepare(
                    "SELECT user_no, applied_at FROM alliance_applications
                     WHERE alliance_id = ?1 ORDER BY applied_at",
                )?;
                let mut rows = stmt.query(rusqlite::params![alliance_id])?;
                let mut applications = Vec::new();
                while let Some(row) = rows.next()? {
                    let applied: String = row.get(1)?;
                    applications.push(AllianceApplication {
                        user_no: row.get(0)?,
                        applied_at: dt_from_sql(&applied),
                    });
                }

                Ok(Some((state, members, applications)))
            })
            .await
            .map_err(backend)
    }

    pub async fn find_alliance_by_name(&self, name: &str) -> GameResult<Option<AllianceId>> {
        let name = name.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT alliance_id FROM alliances WHERE name = ?1")?;
                let mut rows = stmt.query(rusqlite::params![name])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row.get(0)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(backend)
    }

    /// Name-substring search for the alliance browser. This is the one read
    /// path deliberately served from persistence: the query spans all
    /// alliances, not one user's working set.
    pub async fn search_alliances(
        &self,
        pattern: &str,
        limit: i64,
    ) -> GameResult<Vec<AllianceState>> {
        let like = format!("%{pattern}%");
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT alliance_id, name, level, exp, leader_no, join_policy,
                            notice, created_at
                     FROM alliances WHERE name LIKE ?1 ORDER BY level DESC, name LIMIT ?2",
                )?;
                let mut rows = stmt.query(rusqlite::params![like, limit])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_alliance(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(backend)
    }

    pub async fn delete_alliance(&self, alliance_id: AllianceId) -> GameResult<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM alliances WHERE alliance_id = ?1",
                    rusqlite::params![alliance_id],
                )?;
                Ok(())
            })
            .await
            .map_err(backend)
    }

    // -----------------------------------------------------------------------
    // Counters
    // -----------------------------------------------------------------------

    /// Highest allocated value for a counter's backing column, used to seed
    /// the in-cache counter at startup.
    pub async fn max_user_no(&self) -> GameResult<i64> {
        self.conn
            .call(|conn| {
                let max: Option<i64> =
                    conn.query_row("SELECT MAX(user_no) FROM users", [], |r| r.get(0))?;
                Ok(max.unwrap_or(0))
            })
            .await
            .map_err(backend)
    }

    pub async fn max_alliance_id(&self) -> GameResult<i64> {
        self.conn
            .call(|conn| {
                let max: Option<i64> =
                    conn.query_row("SELECT MAX(alliance_id) FROM alliances", [], |r| r.get(0))?;
                Ok(max.unwrap_or(0))
            })
            .await
            .map_err(backend)
    }

    /// Durably record a counter value. Called before a freshly allocated id
    /// is handed to the caller.
    pub async fn commit_counter(&self, name: &str, value: i64) -> GameResult<()> {
        let name = name.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO counters (name, value) VALUES (?1,?2)
                     ON CONFLICT(name) DO UPDATE SET value=excluded.value",
                    rusqlite::params![name, value],
                )?;
                Ok(())
            })
            .await
            .map_err(backend)
    }

    pub async fn counter_value(&self, name: &str) -> GameResult<Option<i64>> {
        let name = name.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT value FROM counters WHERE name = ?1")?;
                let mut rows = stmt.query(rusqlite::params![name])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row.get(0)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(backend)
    }
}

// ---------------------------------------------------------------------------
// Row mapping helpers
// ---------------------------------------------------------------------------

fn row_to_profile(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserProfile> {
    let position: Option<String> = row.get(6)?;
    let created: String = row.get(7)?;
    Ok(UserProfile {
        user_no: row.get(0)?,
        account_id: row.get(1)?,
        nickname: row.get(2)?,
        level: row.get(3)?,
        power: row.get(4)?,
        alliance_id: row.get(5)?,
        alliance_position: position.map(|p| enum_from_sql(&p)),
        created_at: dt_from_sql(&created),
    })
}

fn row_to_building(row: &rusqlite::Row<'_>) -> rusqlite::Result<BuildingState> {
    let status: String = row.get(2)?;
    let start: Option<String> = row.get(3)?;
    let end: Option<String> = row.get(4)?;
    let last: String = row.get(5)?;
    Ok(BuildingState {
        building_idx: row.get(0)?,
        level: row.get(1)?,
        status: enum_from_sql(&status),
        start_time: opt_dt_from_sql(start),
        end_time: opt_dt_from_sql(end),
        last_change: dt_from_sql(&last),
    })
}

fn row_to_unit(row: &rusqlite::Row<'_>) -> rusqlite::Result<(UnitStack, Option<UnitTask>)> {
    let task_raw: Option<String> = row.get(10)?;
    let stack = UnitStack {
        unit_idx: row.get(0)?,
        total: row.get(1)?,
        ready: row.get(2)?,
        field: row.get(3)?,
        training: row.get(4)?,
        upgrading: row.get(5)?,
        injured: row.get(6)?,
        wounded: row.get(7)?,
        healing: row.get(8)?,
        dead: row.get(9)?,
    };
    let task = task_raw.map(|raw| serde_json::from_str(&raw).expect("valid task json"));
    Ok((stack, task))
}

fn row_to_research(row: &rusqlite::Row<'_>) -> rusqlite::Result<ResearchState> {
    let status: String = row.get(2)?;
    let start: Option<String> = row.get(3)?;
    let end: Option<String> = row.get(4)?;
    Ok(ResearchState {
        research_idx: row.get(0)?,
        level: row.get(1)?,
        status: enum_from_sql(&status),
        start_time: opt_dt_from_sql(start),
        end_time: opt_dt_from_sql(end),
    })
}

fn row_to_alliance(row: &rusqlite::Row<'_>) -> rusqlite::Result<AllianceState> {
    let policy: String = row.get(5)?;
    let created: String = row.get(7)?;
    Ok(AllianceState {
        alliance_id: row.get(0)?,
        name: row.get(1)?,
        level: row.get(2)?,
        exp: row.get(3)?,
        leader_no: row.get(4)?,
        join_policy: enum_from_sql(&policy),
        notice: row.get(6)?,
        created_at: dt_from_sql(&created),
    })
}
