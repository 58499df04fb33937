//! Domain entities and their serialized cache representations.
//!
//! Every per-user record that lives in the hot cache is stored as the JSON
//! form of one of these structs, keyed by its entity index. The persistent
//! store maps the same structs onto relational rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type UserNo = i64;
pub type AllianceId = i64;

/// Maximum building level.
pub const MAX_BUILDING_LEVEL: i64 = 10;

// ---------------------------------------------------------------------------
// Resources
// ---------------------------------------------------------------------------

/// The five resource scalars carried by every user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Food,
    Wood,
    Stone,
    Gold,
    Ruby,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 5] = [
        ResourceKind::Food,
        ResourceKind::Wood,
        ResourceKind::Stone,
        ResourceKind::Gold,
        ResourceKind::Ruby,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Food => "food",
            ResourceKind::Wood => "wood",
            ResourceKind::Stone => "stone",
            ResourceKind::Gold => "gold",
            ResourceKind::Ruby => "ruby",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bundle of resource amounts — a cost, a gain, or a wallet snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceBundle {
    #[serde(default)]
    pub food: i64,
    #[serde(default)]
    pub wood: i64,
    #[serde(default)]
    pub stone: i64,
    #[serde(default)]
    pub gold: i64,
    #[serde(default)]
    pub ruby: i64,
}

impl ResourceBundle {
    pub fn get(&self, kind: ResourceKind) -> i64 {
        match kind {
            ResourceKind::Food => self.food,
            ResourceKind::Wood => self.wood,
            ResourceKind::Stone => self.stone,
            ResourceKind::Gold => self.gold,
            ResourceKind::Ruby => self.ruby,
        }
    }

    pub fn set(&mut self, kind: ResourceKind, amount: i64) {
        match kind {
            ResourceKind::Food => self.food = amount,
            ResourceKind::Wood => self.wood = amount,
            ResourceKind::Stone => self.stone = amount,
            ResourceKind::Gold => self.gold = amount,
            ResourceKind::Ruby => self.ruby = amount,
        }
    }

    /// Non-zero components in declared resource order.
    pub fn iter(&self) -> impl Iterator<Item = (ResourceKind, i64)> + '_ {
        ResourceKind::ALL
            .iter()
            .map(|k| (*k, self.get(*k)))
            .filter(|(_, v)| *v != 0)
    }

    /// Every component multiplied by `factor`.
    pub fn scaled(&self, factor: i64) -> ResourceBundle {
        ResourceBundle {
            food: self.food * factor,
            wood: self.wood * factor,
            stone: self.stone * factor,
            gold: self.gold * factor,
            ruby: self.ruby * factor,
        }
    }

    /// Every component scaled down to `percent` (integer division).
    pub fn fraction(&self, percent: i64) -> ResourceBundle {
        ResourceBundle {
            food: self.food * percent / 100,
            wood: self.wood * percent / 100,
            stone: self.stone * percent / 100,
            gold: self.gold * percent / 100,
            ruby: self.ruby * percent / 100,
        }
    }

    pub fn is_empty(&self) -> bool {
        ResourceKind::ALL.iter().all(|k| self.get(*k) == 0)
    }
}

// ---------------------------------------------------------------------------
// Buildings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildingStatus {
    Idle,
    Constructing,
    Upgrading,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildingState {
    pub building_idx: i64,
    pub level: i64,
    pub status: BuildingStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_change: DateTime<Utc>,
}

impl BuildingState {
    pub fn is_busy(&self) -> bool {
        self.status != BuildingStatus::Idle
    }
}

// ---------------------------------------------------------------------------
// Units
// ---------------------------------------------------------------------------

/// Bucketed counts for one unit type. `total` always equals the bucket sum;
/// it is stored explicitly so the invariant is checkable after any mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitStack {
    pub unit_idx: i64,
    pub total: i64,
    pub ready: i64,
    pub field: i64,
    pub training: i64,
    pub upgrading: i64,
    pub injured: i64,
    pub wounded: i64,
    pub healing: i64,
    pub dead: i64,
}

impl UnitStack {
    pub fn new(unit_idx: i64) -> Self {
        UnitStack {
            unit_idx,
            ..UnitStack::default()
        }
    }

    pub fn bucket_sum(&self) -> i64 {
        self.ready
            + self.field
            + self.training
            + self.upgrading
            + self.injured
            + self.wounded
            + self.healing
            + self.dead
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitTaskKind {
    Train,
    Upgrade,
}

/// The single active production task allowed per unit index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitTask {
    pub kind: UnitTaskKind,
    pub quantity: i64,
    /// Upgrade target; absent for training.
    pub target_idx: Option<i64>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Research
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResearchStatus {
    Locked,
    Available,
    Researching,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchState {
    pub research_idx: i64,
    pub level: i64,
    pub status: ResearchStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Items
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemStack {
    pub item_idx: i64,
    pub quantity: i64,
}

// ---------------------------------------------------------------------------
// Buffs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Flat,
    #[default]
    Percent,
}

/// One active buff. Permanent buffs are keyed by `(target_type, source_key)`;
/// temporary buffs by an opaque id with an expiry in the buff queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuffRecord {
    pub buff_idx: i64,
    pub target_type: String,
    pub target_sub: i64,
    pub stat: String,
    pub value: i64,
    pub value_kind: ValueKind,
}

// ---------------------------------------------------------------------------
// Alliances
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlliancePosition {
    Leader,
    ViceLeader,
    Officer,
    Member,
}

impl AlliancePosition {
    /// Numeric rank, 1 = highest. Smaller outranks larger.
    pub fn rank(&self) -> u8 {
        match self {
            AlliancePosition::Leader => 1,
            AlliancePosition::ViceLeader => 2,
            AlliancePosition::Officer => 3,
            AlliancePosition::Member => 4,
        }
    }

    pub fn outranks(&self, other: AlliancePosition) -> bool {
        self.rank() < other.rank()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinPolicy {
    Open,
    Approval,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllianceState {
    pub alliance_id: AllianceId,
    pub name: String,
    pub level: i64,
    pub exp: i64,
    pub leader_no: UserNo,
    pub join_policy: JoinPolicy,
    #[serde(default)]
    pub notice: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllianceMember {
    pub user_no: UserNo,
    pub position: AlliancePosition,
    pub joined_at: DateTime<Utc>,
    pub donated_exp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllianceApplication {
    pub user_no: UserNo,
    pub applied_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Missions
// ---------------------------------------------------------------------------

/// Per-user progress; the mission definition itself lives in the catalog.
/// Completion and claim are distinct timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionProgress {
    pub mission_idx: i64,
    pub completed_at: Option<DateTime<Utc>>,
    pub claimed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Shop
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShopSlot {
    pub slot: i64,
    pub item_idx: i64,
    pub sold: bool,
}

// ---------------------------------------------------------------------------
// User profile
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_no: UserNo,
    pub account_id: String,
    pub nickname: String,
    pub level: i64,
    pub power: i64,
    pub alliance_id: Option<AllianceId>,
    pub alliance_position: Option<AlliancePosition>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Task / sync classes
// ---------------------------------------------------------------------------

/// Classes of timed completions, each with a dedicated queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskClass {
    Building,
    UnitTraining,
    Research,
    Buff,
}

impl TaskClass {
    pub const ALL: [TaskClass; 4] = [
        TaskClass::Building,
        TaskClass::UnitTraining,
        TaskClass::Research,
        TaskClass::Buff,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskClass::Building => "building",
            TaskClass::UnitTraining => "unit_training",
            TaskClass::Research => "research",
            TaskClass::Buff => "buff",
        }
    }
}

/// Entity classes flushed by the write-behind sync workers, each with its
/// own dirty-user set and cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncClass {
    Building,
    Research,
    Unit,
    Resources,
    Item,
    Mission,
}

impl SyncClass {
    pub const ALL: [SyncClass; 6] = [
        SyncClass::Building,
        SyncClass::Research,
        SyncClass::Unit,
        SyncClass::Resources,
        SyncClass::Item,
        SyncClass::Mission,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncClass::Building => "building",
            SyncClass::Research => "research",
            SyncClass::Unit => "unit",
            SyncClass::Resources => "resources",
            SyncClass::Item => "item",
            SyncClass::Mission => "mission",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundle_iter_skips_zero_components() {
        let b = ResourceBundle {
            food: 500,
            wood: 500,
            ..ResourceBundle::default()
        };
        let parts: Vec<_> = b.iter().collect();
        assert_eq!(
            parts,
            vec![(ResourceKind::Food, 500), (ResourceKind::Wood, 500)]
        );
    }

    #[test]
    fn bundle_scaling() {
        let b = ResourceBundle {
            food: 10,
            gold: 3,
            ..ResourceBundle::default()
        };
        assert_eq!(b.scaled(10).food, 100);
        assert_eq!(b.scaled(10).gold, 30);
        assert_eq!(b.fraction(50).food, 5);
        // Integer division rounds down.
        assert_eq!(b.fraction(50).gold, 1);
    }

    #[test]
    fn unit_stack_bucket_sum() {
        let mut s = UnitStack::new(5);
        s.ready = 3;
        s.training = 7;
        s.total = 10;
        assert_eq!(s.bucket_sum(), s.total);
    }

    #[test]
    fn position_ordering() {
        assert!(AlliancePosition::Leader.outranks(AlliancePosition::ViceLeader));
        assert!(AlliancePosition::Officer.outranks(AlliancePosition::Member));
        assert!(!AlliancePosition::Member.outranks(AlliancePosition::Member));
    }

    #[test]
    fn enum_wire_format_is_snake_case() {
        assert_eq!(
            serde_json::to_string(&BuildingStatus::Upgrading).unwrap(),
            "\"upgrading\""
        );
        assert_eq!(
            serde_json::to_string(&ResourceKind::Food).unwrap(),
            "\"food\""
        );
    }
}
