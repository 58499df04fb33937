//! Per-user shop slots.
//!
//! Six slots are rolled on first view by weighted random selection without
//! duplicates. Buying a slot grants one item and marks it sold; a refresh
//! re-rolls everything and clears the sold flags. The shop is hot-cache
//! state only — a lapsed cache simply rolls fresh slots.

use std::sync::Arc;

use rand::distributions::{Distribution, WeightedIndex};
use serde_json::{json, Value};

use wk_core::catalog::ShopEntry;
use wk_core::types::{ShopSlot, UserNo};
use wk_core::{GameError, GameResult};
use wk_store::keys;

use crate::context::{req_i64, Deps};
use crate::item::ItemService;

pub struct ShopService {
    deps: Arc<Deps>,
    user_no: UserNo,
}

impl ShopService {
    pub fn new(deps: Arc<Deps>, user_no: UserNo) -> Self {
        Self { deps, user_no }
    }

    fn slots(&self) -> Vec<ShopSlot> {
        let mut out: Vec<ShopSlot> = self
            .deps
            .cache
            .hgetall(&keys::shop(self.user_no))
            .into_values()
            .filter_map(|raw| serde_json::from_str(&raw).ok())
            .collect();
        out.sort_by_key(|s| s.slot);
        out
    }

    fn put(&self, slot: &ShopSlot) {
        self.deps.cache.hset(
            &keys::shop(self.user_no),
            &slot.slot.to_string(),
            serde_json::to_string(slot).expect("serialize slot"),
            Some(self.deps.user_ttl()),
        );
    }

    fn roll(&self) -> GameResult<Vec<ShopSlot>> {
        let count = self.deps.config.game.shop_slots as usize;
        let mut rng = rand::thread_rng();
        let picks = weighted_sample(&self.deps.catalog.shop_pool, count, &mut rng)?;
        self.deps.cache.del(&keys::shop(self.user_no));
        let slots: Vec<ShopSlot> = picks
            .into_iter()
            .enumerate()
            .map(|(i, item_idx)| ShopSlot {
                slot: i as i64 + 1,
                item_idx,
                sold: false,
            })
            .collect();
        for slot in &slots {
            self.put(slot);
        }
        Ok(slots)
    }

    pub async fn info(&self) -> GameResult<Value> {
        let mut slots = self.slots();
        if slots.is_empty() {
            slots = self.roll()?;
        }
        Ok(json!({ "slots": slots }))
    }

    /// Re-roll every slot, clearing sold flags.
    pub async fn refresh(&self) -> GameResult<Value> {
        Ok(json!({ "slots": self.roll()? }))
    }

    pub async fn buy(&self, data: &Value) -> GameResult<Value> {
        let slot_no = req_i64(data, "slot")?;
        let mut slot = self
            .slots()
            .into_iter()
            .find(|s| s.slot == slot_no)
            .ok_or_else(|| GameError::NotFound(format!("shop slot {slot_no}")))?;
        if slot.sold {
            return Err(GameError::Conflict(format!(
                "shop slot {slot_no} already sold"
            )));
        }

        ItemService::new(self.deps.clone(), self.user_no)
            .grant(slot.item_idx, 1)
            .await?;
        slot.sold = true;
        self.put(&slot);
        Ok(json!({ "slot": slot }))
    }
}

/// Weighted sample without replacement. Fails on an empty pool; a pool
/// smaller than `count` yields one slot per entry.
fn weighted_sample(
    pool: &[ShopEntry],
    count: usize,
    rng: &mut impl rand::Rng,
) -> GameResult<Vec<i64>> {
    if pool.is_empty() {
        return Err(GameError::Fatal("shop pool is empty".into()));
    }
    let mut remaining: Vec<&ShopEntry> = pool.iter().collect();
    let mut out = Vec::with_capacity(count);
    while out.len() < count && !remaining.is_empty() {
        let dist = WeightedIndex::new(remaining.iter().map(|e| e.weight))
            .map_err(|e| GameError::Fatal(format!("bad shop pool: {e}")))?;
        let picked = dist.sample(rng);
        out.push(remaining.remove(picked).item_idx);
    }
    Ok(out)
}
