//! Immutable game-data catalog.
//!
//! Tabular files (one CSV per entity class) are loaded once at startup into
//! plain maps; after `GameCatalog::load_dir` returns the catalog is shared
//! read-only across every request and worker. Costs, durations, prerequisite
//! chains, buff effects, loot tables, and mission definitions all come from
//! here — domain services never hard-code balance numbers.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::types::{ResourceBundle, ValueKind};

// ---------------------------------------------------------------------------
// Catalog entries
// ---------------------------------------------------------------------------

/// One level row of a building: what it costs and how long it takes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildingLevel {
    pub cost: ResourceBundle,
    pub build_secs: i64,
    /// `(building_idx, level)` pairs that must exist before this level.
    pub requires: Vec<(i64, i64)>,
    pub power: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UnitSpec {
    pub unit_idx: i64,
    pub tier: i64,
    pub train_secs: i64,
    pub cost: ResourceBundle,
    pub attack: i64,
    pub defense: i64,
    pub health: i64,
    pub speed: i64,
    pub category: String,
}

/// One level row of a research line.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResearchLevel {
    pub cost: ResourceBundle,
    pub research_secs: i64,
    /// Buff granted permanently when this level completes.
    pub buff_idx: i64,
    pub buff_value: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResearchSpec {
    pub research_idx: i64,
    pub levels: BTreeMap<i64, ResearchLevel>,
    /// `(research_idx, level)` that must be completed first, if any.
    pub prerequisite: Option<(i64, i64)>,
    pub repeatable: bool,
}

impl ResearchSpec {
    pub fn max_level(&self) -> i64 {
        self.levels.keys().next_back().copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BuffSpec {
    pub buff_idx: i64,
    pub target_type: String,
    pub target_sub: i64,
    pub stat: String,
    pub value: i64,
    pub value_kind: ValueKind,
    /// Lifetime for temporary activation; 0 means permanent-only.
    pub duration_secs: i64,
    /// Ruby price for direct activation; 0 when only item-driven.
    pub ruby_cost: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemCategory {
    Speedup,
    Resource,
    Chest,
    Buff,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemSpec {
    pub item_idx: i64,
    pub category: ItemCategory,
    /// Category-dependent: seconds for speedups, buff_idx for buff items.
    pub effect_value: i64,
    /// Bundle granted by resource items.
    pub gives: ResourceBundle,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LootEntry {
    pub item_idx: i64,
    pub weight: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct MissionSpec {
    pub mission_idx: i64,
    pub category: String,
    /// 0 means "count entities of this category" rather than one index.
    pub target_idx: i64,
    pub threshold: i64,
    /// Mission that must be completed before this one activates.
    pub required_mission: Option<i64>,
    pub reward_item: i64,
    pub reward_quantity: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AllianceLevelSpec {
    pub level: i64,
    pub required_exp: i64,
    pub buff_idx: i64,
    pub buff_value: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShopEntry {
    pub item_idx: i64,
    pub weight: u32,
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
pub struct GameCatalog {
    pub buildings: HashMap<i64, BTreeMap<i64, BuildingLevel>>,
    pub units: HashMap<i64, UnitSpec>,
    pub researches: HashMap<i64, ResearchSpec>,
    pub buffs: HashMap<i64, BuffSpec>,
    pub items: HashMap<i64, ItemSpec>,
    pub loot_tables: HashMap<i64, Vec<LootEntry>>,
    pub missions: HashMap<i64, MissionSpec>,
    pub alliance_levels: BTreeMap<i64, AllianceLevelSpec>,
    pub shop_pool: Vec<ShopEntry>,
}

impl GameCatalog {
    /// Load every table from `dir`. Missing optional files load as empty
    /// tables; a malformed row fails the whole startup.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let dir = dir.as_ref();
        let mut catalog = GameCatalog::default();
        catalog.load_buildings(&dir.join("building_info.csv"))?;
        catalog.load_units(&dir.join("unit_info.csv"))?;
        catalog.load_researches(&dir.join("research_info.csv"))?;
        catalog.load_buffs(&dir.join("buff_info.csv"))?;
        catalog.load_items(&dir.join("item_info.csv"))?;
        catalog.load_loot(&dir.join("chest_loot.csv"))?;
        catalog.load_missions(&dir.join("mission_info.csv"))?;
        catalog.load_alliance_levels(&dir.join("alliance_level.csv"))?;
        catalog.load_shop(&dir.join("shop_info.csv"))?;
        tracing::info!(
            buildings = catalog.buildings.len(),
            units = catalog.units.len(),
            researches = catalog.researches.len(),
            buffs = catalog.buffs.len(),
            items = catalog.items.len(),
            missions = catalog.missions.len(),
            "game catalog loaded"
        );
        Ok(catalog)
    }

    // -- accessors ----------------------------------------------------------

    pub fn building_level(&self, building_idx: i64, level: i64) -> Option<&BuildingLevel> {
        self.buildings.get(&building_idx)?.get(&level)
    }

    pub fn unit(&self, unit_idx: i64) -> Option<&UnitSpec> {
        self.units.get(&unit_idx)
    }

    pub fn research(&self, research_idx: i64) -> Option<&ResearchSpec> {
        self.researches.get(&research_idx)
    }

    pub fn research_level(&self, research_idx: i64, level: i64) -> Option<&ResearchLevel> {
        self.researches.get(&research_idx)?.levels.get(&level)
    }

    pub fn buff(&self, buff_idx: i64) -> Option<&BuffSpec> {
        self.buffs.get(&buff_idx)
    }

    pub fn item(&self, item_idx: i64) -> Option<&ItemSpec> {
        self.items.get(&item_idx)
    }

    pub fn loot_table(&self, item_idx: i64) -> Option<&[LootEntry]> {
        self.loot_tables.get(&item_idx).map(|v| v.as_slice())
    }

    pub fn mission(&self, mission_idx: i64) -> Option<&MissionSpec> {
        self.missions.get(&mission_idx)
    }

    pub fn missions_in_category(&self, category: &str) -> Vec<&MissionSpec> {
        let mut out: Vec<_> = self
            .missions
            .values()
            .filter(|m| m.category == category)
            .collect();
        out.sort_by_key(|m| m.mission_idx);
        out
    }

    pub fn alliance_level(&self, level: i64) -> Option<&AllianceLevelSpec> {
        self.alliance_levels.get(&level)
    }

    /// Researches whose prerequisite is `(research_idx, level)`.
    pub fn dependents_of(&self, research_idx: i64, level: i64) -> Vec<&ResearchSpec> {
        let mut out: Vec<_> = self
            .researches
            .values()
            .filter(|r| r.prerequisite == Some((research_idx, level)))
            .collect();
        out.sort_by_key(|r| r.research_idx);
        out
    }

    // -- loaders ------------------------------------------------------------

    fn load_buildings(&mut self, path: &Path) -> Result<(), CatalogError> {
        for row in read_rows::<BuildingRow>(path)? {
            let level = BuildingLevel {
                cost: ResourceBundle {
                    food: row.food_cost,
                    wood: row.wood_cost,
                    stone: row.stone_cost,
                    gold: row.gold_cost,
                    ruby: 0,
                },
                build_secs: row.construct_time,
                requires: parse_requirements(&row.required_building)?,
                power: row.power,
            };
            self.buildings
                .entry(row.building_idx)
                .or_default()
                .insert(row.building_lv, level);
        }
        Ok(())
    }

    fn load_units(&mut self, path: &Path) -> Result<(), CatalogError> {
        for row in read_rows::<UnitRow>(path)? {
            self.units.insert(
                row.unit_idx,
                UnitSpec {
                    unit_idx: row.unit_idx,
                    tier: row.unit_tier,
                    train_secs: row.train_time,
                    cost: ResourceBundle {
                        food: row.food_cost,
                        wood: row.wood_cost,
                        stone: row.stone_cost,
                        gold: row.gold_cost,
                        ruby: 0,
                    },
                    attack: row.attack,
                    defense: row.defense,
                    health: row.health,
                    speed: row.speed,
                    category: row.category,
                },
            );
        }
        Ok(())
    }

    fn load_researches(&mut self, path: &Path) -> Result<(), CatalogError> {
        for row in read_rows::<ResearchRow>(path)? {
            let spec = self
                .researches
                .entry(row.research_idx)
                .or_insert_with(|| ResearchSpec {
                    research_idx: row.research_idx,
                    ..ResearchSpec::default()
                });
            spec.repeatable = row.repeatable != 0;
            if !row.prerequisite.trim().is_empty() {
                let mut reqs = parse_requirements(&row.prerequisite)?;
                spec.prerequisite = reqs.pop();
            }
            spec.levels.insert(
                row.research_lv,
                ResearchLevel {
                    cost: ResourceBundle {
                        food: row.food_cost,
                        wood: row.wood_cost,
                        stone: row.stone_cost,
                        gold: row.gold_cost,
                        ruby: 0,
                    },
                    research_secs: row.research_time,
                    buff_idx: row.buff_idx,
                    buff_value: row.buff_value,
                },
            );
        }
        Ok(())
    }

    fn load_buffs(&mut self, path: &Path) -> Result<(), CatalogError> {
        for row in read_rows::<BuffRow>(path)? {
            let value_kind = match row.calculate_type.as_str() {
                "flat" => ValueKind::Flat,
                "percent" => ValueKind::Percent,
                other => {
                    return Err(CatalogError::BadValue(format!(
                        "buff {}: unknown calculate_type '{other}'",
                        row.buff_idx
                    )))
                }
            };
            self.buffs.insert(
                row.buff_idx,
                BuffSpec {
                    buff_idx: row.buff_idx,
                    target_type: row.target_type,
                    target_sub: row.target_sub,
                    stat: row.stat,
                    value: row.buff_effect,
                    value_kind,
                    duration_secs: row.buff_time,
                    ruby_cost: row.ruby_cost,
                },
            );
        }
        Ok(())
    }

    fn load_items(&mut self, path: &Path) -> Result<(), CatalogError> {
        for row in read_rows::<ItemRow>(path)? {
            let category = match row.category.as_str() {
                "speedup" => ItemCategory::Speedup,
                "resource" => ItemCategory::Resource,
                "chest" => ItemCategory::Chest,
                "buff" => ItemCategory::Buff,
                other => {
                    return Err(CatalogError::BadValue(format!(
                        "item {}: unknown category '{other}'",
                        row.item_idx
                    )))
                }
            };
            self.items.insert(
                row.item_idx,
                ItemSpec {
                    item_idx: row.item_idx,
                    category,
                    effect_value: row.effect_value,
                    gives: ResourceBundle {
                        food: row.food,
                        wood: row.wood,
                        stone: row.stone,
                        gold: row.gold,
                        ruby: row.ruby,
                    },
                    name: row.name,
                },
            );
        }
        Ok(())
    }

    fn load_loot(&mut self, path: &Path) -> Result<(), CatalogError> {
        for row in read_rows::<LootRow>(path)? {
            self.loot_tables
                .entry(row.item_idx)
                .or_default()
                .push(LootEntry {
                    item_idx: row.loot_item_idx,
                    weight: row.weight,
                });
        }
        Ok(())
    }

    fn load_missions(&mut self, path: &Path) -> Result<(), CatalogError> {
        for row in read_rows::<MissionRow>(path)? {
            self.missions.insert(
                row.mission_idx,
                MissionSpec {
                    mission_idx: row.mission_idx,
                    category: row.category,
                    target_idx: row.target_idx,
                    threshold: row.threshold,
                    required_mission: (row.required_mission != 0).then_some(row.required_mission),
                    reward_item: row.reward_item,
                    reward_quantity: row.reward_quantity,
                },
            );
        }
        Ok(())
    }

    fn load_alliance_levels(&mut self, path: &Path) -> Result<(), CatalogError> {
        for row in read_rows::<AllianceLevelRow>(path)? {
            self.alliance_levels.insert(
                row.level,
                AllianceLevelSpec {
                    level: row.level,
                    required_exp: row.required_exp,
                    buff_idx: row.buff_idx,
                    buff_value: row.buff_value,
                },
            );
        }
        Ok(())
    }

    fn load_shop(&mut self, path: &Path) -> Result<(), CatalogError> {
        for row in read_rows::<ShopRow>(path)? {
            self.shop_pool.push(ShopEntry {
                item_idx: row.item_idx,
                weight: row.weight,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// CSV rows
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct BuildingRow {
    building_idx: i64,
    building_lv: i64,
    food_cost: i64,
    wood_cost: i64,
    stone_cost: i64,
    gold_cost: i64,
    construct_time: i64,
    #[serde(default)]
    required_building: String,
    #[serde(default)]
    power: i64,
}

#[derive(Debug, Deserialize)]
struct UnitRow {
    unit_idx: i64,
    unit_tier: i64,
    train_time: i64,
    food_cost: i64,
    wood_cost: i64,
    stone_cost: i64,
    gold_cost: i64,
    attack: i64,
    defense: i64,
    health: i64,
    speed: i64,
    category: String,
}

#[derive(Debug, Deserialize)]
struct ResearchRow {
    research_idx: i64,
    research_lv: i64,
    food_cost: i64,
    wood_cost: i64,
    stone_cost: i64,
    gold_cost: i64,
    research_time: i64,
    #[serde(default)]
    prerequisite: String,
    #[serde(default)]
    repeatable: i64,
    #[serde(default)]
    buff_idx: i64,
    #[serde(default)]
    buff_value: i64,
}

#[derive(Debug, Deserialize)]
struct BuffRow {
    buff_idx: i64,
    target_type: String,
    #[serde(default)]
    target_sub: i64,
    stat: String,
    calculate_type: String,
    buff_effect: i64,
    #[serde(default)]
    buff_time: i64,
    #[serde(default)]
    ruby_cost: i64,
}

#[derive(Debug, Deserialize)]
struct ItemRow {
    item_idx: i64,
    category: String,
    #[serde(default)]
    effect_value: i64,
    #[serde(default)]
    food: i64,
    #[serde(default)]
    wood: i64,
    #[serde(default)]
    stone: i64,
    #[serde(default)]
    gold: i64,
    #[serde(default)]
    ruby: i64,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct LootRow {
    item_idx: i64,
    loot_item_idx: i64,
    weight: u32,
}

#[derive(Debug, Deserialize)]
struct MissionRow {
    mission_idx: i64,
    category: String,
    #[serde(default)]
    target_idx: i64,
    threshold: i64,
    #[serde(default)]
    required_mission: i64,
    reward_item: i64,
    reward_quantity: i64,
}

#[derive(Debug, Deserialize)]
struct AllianceLevelRow {
    level: i64,
    required_exp: i64,
    #[serde(default)]
    buff_idx: i64,
    #[serde(default)]
    buff_value: i64,
}

#[derive(Debug, Deserialize)]
struct ShopRow {
    item_idx: i64,
    weight: u32,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("io reading {0}: {1}")]
    Io(String, String),
    #[error("parse error in {0}: {1}")]
    Parse(String, String),
    #[error("bad value: {0}")]
    BadValue(String),
}

fn read_rows<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>, CatalogError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut reader = csv::Reader::from_path(path)
        .map_err(|e| CatalogError::Io(path.display().to_string(), e.to_string()))?;
    let mut rows = Vec::new();
    for record in reader.deserialize() {
        let row: T =
            record.map_err(|e| CatalogError::Parse(path.display().to_string(), e.to_string()))?;
        rows.push(row);
    }
    Ok(rows)
}

/// Parse `"idx:lv,idx:lv"` requirement lists.
fn parse_requirements(raw: &str) -> Result<Vec<(i64, i64)>, CatalogError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (idx, lv) = part
            .split_once(':')
            .ok_or_else(|| CatalogError::BadValue(format!("requirement '{part}'")))?;
        let idx = idx
            .trim()
            .parse()
            .map_err(|_| CatalogError::BadValue(format!("requirement idx '{idx}'")))?;
        let lv = lv
            .trim()
            .parse()
            .map_err(|_| CatalogError::BadValue(format!("requirement level '{lv}'")))?;
        out.push((idx, lv));
    }
    Ok(out)
}
