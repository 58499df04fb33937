//! Item inventory and use-time effects.
//!
//! Quantities are integer hash fields; rows that reach zero are evicted
//! from the cache and dropped from persistence on the next flush. What an
//! item does is decided at use-time from its catalog category: speedups
//! pull a queue entry closer, resource packs credit the wallet, chests roll
//! a weighted loot table, buff items activate a temporary buff.

use std::sync::Arc;

use rand::distributions::{Distribution, WeightedIndex};
use serde_json::{json, Value};

use wk_core::catalog::{ItemCategory, ItemSpec, LootEntry};
use wk_core::types::{SyncClass, UserNo};
use wk_core::{GameError, GameResult};
use wk_store::keys;

use crate::buff::BuffService;
use crate::building::BuildingService;
use crate::context::{opt_i64, req_i64, Deps};
use crate::research::ResearchService;
use crate::resource::ResourceService;
use crate::unit::UnitService;

pub struct ItemService {
    deps: Arc<Deps>,
    user_no: UserNo,
}

impl ItemService {
    pub fn new(deps: Arc<Deps>, user_no: UserNo) -> Self {
        Self { deps, user_no }
    }

    // -----------------------------------------------------------------------
    // Cache plumbing
    // -----------------------------------------------------------------------

    pub async fn ensure_cached(&self) -> GameResult<()> {
        let key = keys::items(self.user_no);
        if self.deps.cache.exists(&key) {
            return Ok(());
        }
        let rows = self.deps.db.load_items(self.user_no).await?;
        if rows.is_empty() {
            return Ok(());
        }
        self.deps.cache.hset_many(
            &key,
            rows.iter()
                .map(|i| (i.item_idx.to_string(), i.quantity.to_string())),
            Some(self.deps.user_ttl()),
        );
        Ok(())
    }

    pub async fn quantity(&self, item_idx: i64) -> GameResult<i64> {
        self.ensure_cached().await?;
        Ok(self
            .deps
            .cache
            .hget(&keys::items(self.user_no), &item_idx.to_string())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn info(&self) -> GameResult<Value> {
        self.ensure_cached().await?;
        let mut rows: Vec<(i64, i64)> = self
            .deps
            .cache
            .hgetall(&keys::items(self.user_no))
            .into_iter()
            .filter_map(|(k, v)| Some((k.parse().ok()?, v.parse().ok()?)))
            .collect();
        rows.sort_unstable();
        let items: Vec<Value> = rows
            .into_iter()
            .map(|(item_idx, quantity)| json!({ "item_idx": item_idx, "quantity": quantity }))
            .collect();
        Ok(json!({ "items": items }))
    }

    pub async fn detail(&self, data: &Value) -> GameResult<Value> {
        let item_idx = req_i64(data, "item_idx")?;
        let spec = self
            .deps
            .catalog
            .item(item_idx)
            .ok_or_else(|| GameError::NotFound(format!("item {item_idx}")))?;
        Ok(json!({
            "item": spec,
            "quantity": self.quantity(item_idx).await?,
        }))
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Credit items without a payload — used by missions, chests, the shop.
    pub async fn grant(&self, item_idx: i64, quantity: i64) -> GameResult<i64> {
        if quantity <= 0 {
            return Err(GameError::Validation("quantity must be positive".into()));
        }
        self.deps
            .catalog
            .item(item_idx)
            .ok_or_else(|| GameError::NotFound(format!("item {item_idx}")))?;
        self.ensure_cached().await?;
        let after = self.deps.cache.hincrby(
            &keys::items(self.user_no),
            &item_idx.to_string(),
            quantity,
            Some(self.deps.user_ttl()),
        );
        self.deps.dirty.mark(SyncClass::Item, self.user_no);
        Ok(after)
    }

    pub async fn add(&self, data: &Value) -> GameResult<Value> {
        let item_idx = req_i64(data, "item_idx")?;
        let quantity = req_i64(data, "quantity")?;
        let after = self.grant(item_idx, quantity).await?;
        Ok(json!({ "item_idx": item_idx, "quantity": after }))
    }

    /// Spend `quantity` copies of an item and apply its effect.
    pub async fn use_item(&self, data: &Value) -> GameResult<Value> {
        let item_idx = req_i64(data, "item_idx")?;
        let quantity = opt_i64(data, "quantity").unwrap_or(1);
        if quantity <= 0 {
            return Err(GameError::Validation("quantity must be positive".into()));
        }
        let spec = self
            .deps
            .catalog
            .item(item_idx)
            .ok_or_else(|| GameError::NotFound(format!("item {item_idx}")))?
            .clone();

        self.ensure_cached().await?;
        let key = keys::items(self.user_no);
        let field = item_idx.to_string();
        let ttl = Some(self.deps.user_ttl());
        let after = self.deps.cache.hincrby(&key, &field, -quantity, ttl);
        if after < 0 {
            self.deps.cache.hincrby(&key, &field, quantity, ttl);
            return Err(GameError::Conflict(format!(
                "not enough of item {item_idx}"
            )));
        }
        if after == 0 {
            self.deps.cache.hdel(&key, &field);
        }
        self.deps.dirty.mark(SyncClass::Item, self.user_no);

        let effect = self.apply_effect(&spec, quantity, data).await;
        match effect {
            Ok(effect) => Ok(json!({
                "item_idx": item_idx,
                "remaining": after,
                "effect": effect,
            })),
            Err(e) => {
                // The effect did not apply; give the items back.
                self.deps.cache.hincrby(&key, &field, quantity, ttl);
                Err(e)
            }
        }
    }

    async fn apply_effect(
        &self,
        spec: &ItemSpec,
        quantity: i64,
        data: &Value,
    ) -> GameResult<Value> {
        match spec.category {
            ItemCategory::Resource => {
                let bundle = spec.gives.scaled(quantity);
                ResourceService::new(self.deps.clone(), self.user_no)
                    .produce(&bundle)
                    .await?;
                Ok(json!({ "kind": "resource", "gained": bundle }))
            }
            ItemCategory::Speedup => {
                let seconds = spec.effect_value * quantity;
                let target_idx = req_i64(data, "target_idx")?;
                match data.get("task_class").and_then(Value::as_str) {
                    Some("building") => {
                        BuildingService::new(self.deps.clone(), self.user_no)
                            .speedup_by(target_idx, seconds)
                            .await?;
                    }
                    Some("unit_training") => {
                        UnitService::new(self.deps.clone(), self.user_no)
                            .speedup_by(target_idx, seconds)
                            .await?;
                    }
                    Some("research") => {
                        ResearchService::new(self.deps.clone(), self.user_no)
                            .speedup_by(target_idx, seconds)
                            .await?;
                    }
                    _ => {
                        return Err(GameError::Validation(
                            "task_class must be building, unit_training, or research".into(),
                        ))
                    }
                }
                Ok(json!({ "kind": "speedup", "seconds": seconds }))
            }
            ItemCategory::Chest => {
                let table = self
                    .deps
                    .catalog
                    .loot_table(spec.item_idx)
                    .ok_or_else(|| {
                        GameError::Fatal(format!("chest {} has no loot table", spec.item_idx))
                    })?;
                // Roll everything first; the rng must not live across the
                // grant awaits.
                let drops: Vec<i64> = {
                    let mut rng = rand::thread_rng();
                    (0..quantity)
                        .map(|_| pick_weighted(table, &mut rng))
                        .collect::<GameResult<Vec<_>>>()?
                };
                for item_idx in &drops {
                    self.grant(*item_idx, 1).await?;
                }
                Ok(json!({ "kind": "chest", "drops": drops }))
            }
            ItemCategory::Buff => {
                let buffs = BuffService::new(self.deps.clone(), self.user_no);
                let mut activated = Vec::with_capacity(quantity as usize);
                for _ in 0..quantity {
                    activated.push(buffs.activate_from_item(spec.effect_value).await?);
                }
                Ok(json!({ "kind": "buff", "activated": activated }))
            }
        }
    }
}

fn pick_weighted(table: &[LootEntry], rng: &mut impl rand::Rng) -> GameResult<i64> {
    let dist = WeightedIndex::new(table.iter().map(|e| e.weight))
        .map_err(|e| GameError::Fatal(format!("bad loot table: {e}")))?;
    Ok(table[dist.sample(rng)].item_idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Deps;
    use chrono::Utc;
    use wk_core::catalog::GameCatalog;
    use wk_core::config::ServerConfig;
    use wk_core::types::{ResourceBundle, UserProfile};

    fn catalog() -> GameCatalog {
        let mut c = GameCatalog::default();
        c.items.insert(
            901,
            ItemSpec {
                item_idx: 901,
                category: ItemCategory::Resource,
                effect_value: 0,
                gives: ResourceBundle {
                    food: 100,
                    ..ResourceBundle::default()
                },
                name: "Food Pack".into(),
            },
        );
        c.items.insert(
            902,
            ItemSpec {
                item_idx: 902,
                category: ItemCategory::Chest,
                effect_value: 0,
                gives: ResourceBundle::default(),
                name: "Supply Chest".into(),
            },
        );
        c.loot_tables.insert(
            902,
            vec![LootEntry {
                item_idx: 901,
                weight: 1,
            }],
        );
        c
    }

    async fn deps() -> Arc<Deps> {
        let deps = Deps::in_memory(catalog(), ServerConfig::default())
            .await
            .unwrap();
        let profile = UserProfile {
            user_no: 1,
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
        deps
    }

    #[tokio::test]
    async fn grant_and_use_resource_item() {
        let deps = deps().await;
        let svc = ItemService::new(deps.clone(), 1);
        svc.grant(901, 3).await.unwrap();
        assert_eq!(svc.quantity(901).await.unwrap(), 3);

        let out = svc
            .use_item(&json!({ "item_idx": 901, "quantity": 2 }))
            .await
            .unwrap();
        assert_eq!(out["remaining"], 1);
        let res = ResourceService::new(deps, 1).snapshot().await.unwrap();
        assert_eq!(res.food, 200);
    }

    #[tokio::test]
    async fn quantity_never_goes_negative() {
        let deps = deps().await;
        let svc = ItemService::new(deps, 1);
        svc.grant(901, 1).await.unwrap();
        let err = svc
            .use_item(&json!({ "item_idx": 901, "quantity": 5 }))
            .await
            .unwrap_err();
        assert!(matches!(err, GameError::Conflict(_)));
        assert_eq!(svc.quantity(901).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn zero_rows_are_evicted() {
        let deps = deps().await;
        let svc = ItemService::new(deps.clone(), 1);
        svc.grant(901, 1).await.unwrap();
        svc.use_item(&json!({ "item_idx": 901 })).await.unwrap();
        assert!(deps
            .cache
            .hget(&keys::items(1), "901")
            .is_none());
    }

    #[tokio::test]
    async fn chest_rolls_loot() {
        let deps = deps().await;
        let svc = ItemService::new(deps, 1);
        svc.grant(902, 2).await.unwrap();
        let out = svc
            .use_item(&json!({ "item_idx": 902, "quantity": 2 }))
            .await
            .unwrap();
        assert_eq!(out["effect"]["kind"], "chest");
        // The single-entry loot table always drops the food pack.
        assert_eq!(svc.quantity(901).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn unknown_item_is_not_found() {
        let deps = deps().await;
        let svc = ItemService::new(deps, 1);
        assert!(matches!(
            svc.use_item(&json!({ "item_idx": 999 })).await,
            Err(GameError::NotFound(_))
        ));
    }
}
