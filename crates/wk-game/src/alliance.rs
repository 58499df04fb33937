//! Alliances — membership, ranks, applications, donations, and the shared
//! alliance buff.
//!
//! Alliance state is owned by the alliance: the member map, applications,
//! and level all live under alliance keys, and a user's profile carries
//! only a weak `alliance_id` back-reference. Mutations run under the
//! alliance lock (taken after the caller's user lock, never before) and are
//! written through to persistence immediately — alliance changes are rare
//! and loss-sensitive, so they do not ride the write-behind cadence.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};

use wk_core::types::{
    AllianceApplication, AllianceId, AllianceMember, AlliancePosition, AllianceState, JoinPolicy,
    ResourceKind, UserNo, UserProfile,
};
use wk_core::{GameError, GameResult};
use wk_store::keys;

use crate::buff::BuffService;
use crate::context::{opt_i64, opt_str, req_i64, req_str, Deps};
use crate::resource::ResourceService;

const MAX_NAME_LEN: usize = 30;
const SEARCH_LIMIT: i64 = 20;

pub struct AllianceService {
    deps: Arc<Deps>,
    user_no: UserNo,
}

impl AllianceService {
    pub fn new(deps: Arc<Deps>, user_no: UserNo) -> Self {
        Self { deps, user_no }
    }

    // -----------------------------------------------------------------------
    // Profile plumbing
    // -----------------------------------------------------------------------

    async fn profile_of(&self, user_no: UserNo) -> GameResult<UserProfile> {
        let key = keys::profile(user_no);
        if let Some(raw) = self.deps.cache.hget(&key, "profile") {
            return serde_json::from_str(&raw)
                .map_err(|e| GameError::Fatal(format!("corrupt profile: {e}")));
        }
        let profile = self
            .deps
            .db
            .load_profile(user_no)
            .await?
            .ok_or_else(|| GameError::NotFound(format!("user {user_no}")))?;
        self.deps.cache.hset(
            &key,
            "profile",
            serde_json::to_string(&profile).expect("serialize profile"),
            Some(self.deps.user_ttl()),
        );
        Ok(profile)
    }

    /// Alliance fields on a profile are owned by the alliance domain, so
    /// they are written through rather than ride a sync worker.
    async fn save_profile(&self, profile: &UserProfile) -> GameResult<()> {
        self.deps.cache.hset(
            &keys::profile(profile.user_no),
            "profile",
            serde_json::to_string(profile).expect("serialize profile"),
            Some(self.deps.user_ttl()),
        );
        self.deps.db.save_profile(profile).await
    }

    async fn set_membership(
        &self,
        user_no: UserNo,
        membership: Option<(AllianceId, AlliancePosition)>,
    ) -> GameResult<()> {
        let mut profile = self.profile_of(user_no).await?;
        match membership {
            Some((id, position)) => {
                profile.alliance_id = Some(id);
                profile.alliance_position = Some(position);
            }
            None => {
                profile.alliance_id = None;
                profile.alliance_position = None;
            }
        }
        self.save_profile(&profile).await
    }

    // -----------------------------------------------------------------------
    // Alliance cache plumbing
    // -----------------------------------------------------------------------

    pub(crate) async fn ensure_cached(&self, alliance_id: AllianceId) -> GameResult<()> {
        let info_key = keys::alliance_info(alliance_id);
        if self.deps.cache.exists(&info_key) {
            return Ok(());
        }
        let (state, members, applications) = self
            .deps
            .db
            .load_alliance(alliance_id)
            .await?
            .ok_or_else(|| GameError::NotFound(format!("alliance {alliance_id}")))?;
        let ttl = Some(self.deps.alliance_ttl());
        self.deps.cache.hset(
            &info_key,
            "info",
            serde_json::to_string(&state).expect("serialize alliance"),
            ttl,
        );
        self.deps.cache.hset_many(
            &keys::alliance_members(alliance_id),
            members.iter().map(|m| {
                (
                    m.user_no.to_string(),
                    serde_json::to_string(m).expect("serialize member"),
                )
            }),
            ttl,
        );
        self.deps.cache.hset_many(
            &keys::alliance_applications(alliance_id),
            applications.iter().map(|a| {
                (
                    a.user_no.to_string(),
                    serde_json::to_string(a).expect("serialize application"),
                )
            }),
            ttl,
        );
        self.deps
            .cache
            .hset(&keys::alliance_names(), &state.name, alliance_id.to_string(), None);
        Ok(())
    }

    pub(crate) async fn state(&self, alliance_id: AllianceId) -> GameResult<AllianceState> {
        self.ensure_cached(alliance_id).await?;
        let raw = self
            .deps
            .cache
            .hget(&keys::alliance_info(alliance_id), "info")
            .ok_or_else(|| GameError::NotFound(format!("alliance {alliance_id}")))?;
        serde_json::from_str(&raw)
            .map_err(|e| GameError::Fatal(format!("corrupt alliance record: {e}")))
    }

    fn put_state(&self, state: &AllianceState) {
        self.deps.cache.hset(
            &keys::alliance_info(state.alliance_id),
            "info",
            serde_json::to_string(state).expect("serialize alliance"),
            Some(self.deps.alliance_ttl()),
        );
    }

    fn members(&self, alliance_id: AllianceId) -> Vec<AllianceMember> {
        let mut out: Vec<AllianceMember> = self
            .deps
            .cache
            .hgetall(&keys::alliance_members(alliance_id))
            .into_values()
            .filter_map(|raw| serde_json::from_str(&raw).ok())
            .collect();
        out.sort_by_key(|m| (m.position.rank(), m.user_no));
        out
    }

    fn member(&self, alliance_id: AllianceId, user_no: UserNo) -> Option<AllianceMember> {
        self.deps
            .cache
            .hget(&keys::alliance_members(alliance_id), &user_no.to_string())
            .and_then(|raw| serde_json::from_str(&raw).ok())
    }

    fn put_member(&self, alliance_id: AllianceId, member: &AllianceMember) {
        self.deps.cache.hset(
            &keys::alliance_members(alliance_id),
            &member.user_no.to_string(),
            serde_json::to_string(member).expect("serialize member"),
            Some(self.deps.alliance_ttl()),
        );
    }

    fn applications(&self, alliance_id: AllianceId) -> Vec<AllianceApplication> {
        let mut out: Vec<AllianceApplication> = self
            .deps
            .cache
            .hgetall(&keys::alliance_applications(alliance_id))
            .into_values()
            .filter_map(|raw| serde_json::from_str(&raw).ok())
            .collect();
        out.sort_by_key(|a| a.applied_at);
        out
    }

    async fn persist(&self, alliance_id: AllianceId) -> GameResult<()> {
        let state = self.state(alliance_id).await?;
        self.deps
            .db
            .save_alliance(&state, &self.members(alliance_id), &self.applications(alliance_id))
            .await
    }

    /// The caller's alliance id from their profile, with the alliance
    /// warmed into the cache.
    async fn my_alliance_id(&self) -> GameResult<AllianceId> {
        let profile = self.profile_of(self.user_no).await?;
        let alliance_id = profile
            .alliance_id
            .ok_or_else(|| GameError::Conflict("not in an alliance".into()))?;
        self.ensure_cached(alliance_id).await?;
        Ok(alliance_id)
    }

    /// The caller's alliance id and membership record. Read paths only —
    /// write paths must re-read the membership under the alliance lock
    /// via [`AllianceService::my_member_locked`].
    async fn my_membership(&self) -> GameResult<(AllianceId, AllianceMember)> {
        let alliance_id = self.my_alliance_id().await?;
        let member = self
            .member(alliance_id, self.user_no)
            .ok_or_else(|| GameError::Fatal("profile references a vanished membership".into()))?;
        Ok((alliance_id, member))
    }

    /// Re-read the caller's own membership after the alliance lock is
    /// held. Rank checks must run against this record, never one fetched
    /// before the lock: a concurrent kick or demotion lands under the
    /// same lock, and a stale pre-lock rank would let the old privileges
    /// through.
    fn my_member_locked(&self, alliance_id: AllianceId) -> GameResult<AllianceMember> {
        self.member(alliance_id, self.user_no)
            .ok_or_else(|| GameError::Conflict("no longer a member of this alliance".into()))
    }

    // -----------------------------------------------------------------------
    // Alliance buff
    // -----------------------------------------------------------------------

    pub(crate) fn grant_alliance_buff(&self, user_no: UserNo, alliance_id: AllianceId, level: i64) {
        let Some(cfg) = self.deps.catalog.alliance_level(level) else {
            return;
        };
        if cfg.buff_idx == 0 {
            return;
        }
        let buffs = BuffService::new(self.deps.clone(), user_no);
        if let Err(e) = buffs.grant_permanent(
            "alliance",
            &alliance_id.to_string(),
            cfg.buff_idx,
            Some(cfg.buff_value),
        ) {
            tracing::warn!(user_no, alliance_id, error = %e, "alliance buff grant failed");
        }
    }

    fn revoke_alliance_buff(&self, user_no: UserNo, alliance_id: AllianceId) {
        BuffService::new(self.deps.clone(), user_no)
            .revoke_permanent("alliance", &alliance_id.to_string());
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn info(&self, data: &Value) -> GameResult<Value> {
        let alliance_id = match opt_i64(data, "alliance_id") {
            Some(id) => id,
            None => {
                let profile = self.profile_of(self.user_no).await?;
                profile
                    .alliance_id
                    .ok_or_else(|| GameError::Conflict("not in an alliance".into()))?
            }
        };
        let state = self.state(alliance_id).await?;
        let members = self.members(alliance_id);
        Ok(json!({
            "alliance": state,
            "member_count": members.len(),
            "my_member": members.iter().find(|m| m.user_no == self.user_no),
        }))
    }

    pub async fn search(&self, data: &Value) -> GameResult<Value> {
        let pattern = req_str(data, "name")?;
        let hits = self.deps.db.search_alliances(pattern, SEARCH_LIMIT).await?;
        Ok(json!({ "alliances": hits }))
    }

    pub async fn member_list(&self) -> GameResult<Value> {
        let (alliance_id, _) = self.my_membership().await?;
        Ok(json!({ "members": self.members(alliance_id) }))
    }

    pub async fn application_list(&self) -> GameResult<Value> {
        let (alliance_id, me) = self.my_membership().await?;
        if me.position.rank() > AlliancePosition::Officer.rank() {
            return Err(GameError::Forbidden(
                "only officers may view applications".into(),
            ));
        }
        Ok(json!({ "applications": self.applications(alliance_id) }))
    }

    // -----------------------------------------------------------------------
    // Membership commands
    // -----------------------------------------------------------------------

    pub async fn create(&self, data: &Value) -> GameResult<Value> {
        let name = req_str(data, "name")?.trim().to_string();
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(GameError::Validation(format!(
                "alliance name must be 1-{MAX_NAME_LEN} characters"
            )));
        }
        let join_policy = match opt_str(data, "join_policy") {
            Some("approval") => JoinPolicy::Approval,
            Some("open") | None => JoinPolicy::Open,
            Some(other) => {
                return Err(GameError::Validation(format!("unknown join_policy '{other}'")))
            }
        };

        let profile = self.profile_of(self.user_no).await?;
        if profile.alliance_id.is_some() {
            return Err(GameError::Conflict("already in an alliance".into()));
        }
        if self.deps.cache.hget(&keys::alliance_names(), &name).is_some()
            || self.deps.db.find_alliance_by_name(&name).await?.is_some()
        {
            return Err(GameError::Conflict(format!(
                "alliance name '{name}' is taken"
            )));
        }

        let alliance_id = self.deps.ids.next_alliance_id().await?;
        let now = Utc::now();
        let state = AllianceState {
            alliance_id,
            name: name.clone(),
            level: 1,
            exp: 0,
            leader_no: self.user_no,
            join_policy,
            notice: String::new(),
            created_at: now,
        };
        let founder = AllianceMember {
            user_no: self.user_no,
            position: AlliancePosition::Leader,
            joined_at: now,
            donated_exp: 0,
        };
        self.put_state(&state);
        self.put_member(alliance_id, &founder);
        self.deps
            .cache
            .hset(&keys::alliance_names(), &name, alliance_id.to_string(), None);

        self.set_membership(self.user_no, Some((alliance_id, AlliancePosition::Leader)))
            .await?;
        self.grant_alliance_buff(self.user_no, alliance_id, 1);
        self.persist(alliance_id).await?;

        tracing::info!(user_no = self.user_no, alliance_id, name = %name, "alliance created");
        Ok(json!({ "alliance": state }))
    }

    pub async fn join(&self, data: &Value) -> GameResult<Value> {
        let alliance_id = req_i64(data, "alliance_id")?;
        let profile = self.profile_of(self.user_no).await?;
        if profile.alliance_id.is_some() {
            return Err(GameError::Conflict("already in an alliance".into()));
        }
        let _lock = self.deps.locks.lock_alliance(alliance_id).await?;
        let state = self.state(alliance_id).await?;

        match state.join_policy {
            JoinPolicy::Open => {
                self.admit(alliance_id, self.user_no, state.level).await?;
                self.persist(alliance_id).await?;
                Ok(json!({ "joined": true, "alliance_id": alliance_id }))
            }
            JoinPolicy::Approval => {
                let apps_key = keys::alliance_applications(alliance_id);
                if self
                    .deps
                    .cache
                    .hget(&apps_key, &self.user_no.to_string())
                    .is_some()
                {
                    return Err(GameError::Conflict("application already pending".into()));
                }
                let application = AllianceApplication {
                    user_no: self.user_no,
                    applied_at: Utc::now(),
                };
                self.deps.cache.hset(
                    &apps_key,
                    &self.user_no.to_string(),
                    serde_json::to_string(&application).expect("serialize application"),
                    Some(self.deps.alliance_ttl()),
                );
                self.persist(alliance_id).await?;
                Ok(json!({ "joined": false, "applied": true, "alliance_id": alliance_id }))
            }
        }
    }

    /// Shared admission path for open joins and approvals.
    async fn admit(&self, alliance_id: AllianceId, user_no: UserNo, level: i64) -> GameResult<()> {
        self.put_member(
            alliance_id,
            &AllianceMember {
                user_no,
                position: AlliancePosition::Member,
                joined_at: Utc::now(),
                donated_exp: 0,
            },
        );
        self.set_membership(user_no, Some((alliance_id, AlliancePosition::Member)))
            .await?;
        self.grant_alliance_buff(user_no, alliance_id, level);
        Ok(())
    }

    pub async fn leave(&self) -> GameResult<Value> {
        let alliance_id = self.my_alliance_id().await?;
        let _lock = self.deps.locks.lock_alliance(alliance_id).await?;
        let me = self.my_member_locked(alliance_id)?;
        if me.position == AlliancePosition::Leader {
            return Err(GameError::Forbidden(
                "the leader cannot leave; transfer leadership or disband".into(),
            ));
        }
        self.deps
            .cache
            .hdel(&keys::alliance_members(alliance_id), &self.user_no.to_string());
        self.set_membership(self.user_no, None).await?;
        self.revoke_alliance_buff(self.user_no, alliance_id);
        self.persist(alliance_id).await?;
        Ok(json!({ "left": alliance_id }))
    }

    pub async fn kick(&self, data: &Value) -> GameResult<Value> {
        let target_no = req_i64(data, "target_user_no")?;
        if target_no == self.user_no {
            return Err(GameError::Validation("cannot kick yourself".into()));
        }
        let alliance_id = self.my_alliance_id().await?;
        let _lock = self.deps.locks.lock_alliance(alliance_id).await?;
        let me = self.my_member_locked(alliance_id)?;
        if me.position.rank() > AlliancePosition::Officer.rank() {
            return Err(GameError::Forbidden("only officers may kick".into()));
        }
        let target = self
            .member(alliance_id, target_no)
            .ok_or_else(|| GameError::NotFound(format!("member {target_no}")))?;
        if !me.position.outranks(target.position) {
            return Err(GameError::Forbidden(
                "cannot kick a member of equal or higher rank".into(),
            ));
        }

        self.deps
            .cache
            .hdel(&keys::alliance_members(alliance_id), &target_no.to_string());
        self.set_membership(target_no, None).await?;
        self.revoke_alliance_buff(target_no, alliance_id);
        self.persist(alliance_id).await?;
        Ok(json!({ "kicked": target_no }))
    }

    pub async fn promote(&self, data: &Value) -> GameResult<Value> {
        let target_no = req_i64(data, "target_user_no")?;
        let position: AlliancePosition =
            serde_json::from_value(json!(req_str(data, "position")?))
                .map_err(|_| GameError::Validation("unknown position".into()))?;
        if target_no == self.user_no {
            return Err(GameError::Validation("cannot change your own rank".into()));
        }
        let alliance_id = self.my_alliance_id().await?;
        let _lock = self.deps.locks.lock_alliance(alliance_id).await?;
        let me = self.my_member_locked(alliance_id)?;
        let mut target = self
            .member(alliance_id, target_no)
            .ok_or_else(|| GameError::NotFound(format!("member {target_no}")))?;

        if position == AlliancePosition::Leader {
            // Leadership transfer: swap ranks atomically.
            if me.position != AlliancePosition::Leader {
                return Err(GameError::Forbidden(
                    "only the leader may transfer leadership".into(),
                ));
            }
            let mut state = self.state(alliance_id).await?;
            let old_position = target.position;
            target.position = AlliancePosition::Leader;
            self.put_member(alliance_id, &target);
            let mut me_after = me.clone();
            me_after.position = old_position;
            self.put_member(alliance_id, &me_after);
            state.leader_no = target_no;
            self.put_state(&state);

            self.set_membership(target_no, Some((alliance_id, AlliancePosition::Leader)))
                .await?;
            self.set_membership(self.user_no, Some((alliance_id, old_position)))
                .await?;
        } else {
            if !me.position.outranks(position) {
                return Err(GameError::Forbidden(
                    "may only grant ranks below your own".into(),
                ));
            }
            if !me.position.outranks(target.position) {
                return Err(GameError::Forbidden(
                    "cannot change a member of equal or higher rank".into(),
                ));
            }
            target.position = position;
            self.put_member(alliance_id, &target);
            self.set_membership(target_no, Some((alliance_id, position)))
                .await?;
        }
        self.persist(alliance_id).await?;
        Ok(json!({ "target_user_no": target_no, "position": position }))
    }

    pub async fn approve(&self, data: &Value) -> GameResult<Value> {
        let target_no = req_i64(data, "target_user_no")?;
        let accept = data
            .get("approve")
            .and_then(Value::as_bool)
            .ok_or_else(|| GameError::Validation("missing field 'approve'".into()))?;
        let alliance_id = self.my_alliance_id().await?;
        let _lock = self.deps.locks.lock_alliance(alliance_id).await?;
        let me = self.my_member_locked(alliance_id)?;
        if me.position.rank() > AlliancePosition::Officer.rank() {
            return Err(GameError::Forbidden(
                "only officers may handle applications".into(),
            ));
        }

        let apps_key = keys::alliance_applications(alliance_id);
        if self
            .deps
            .cache
            .hget(&apps_key, &target_no.to_string())
            .is_none()
        {
            return Err(GameError::NotFound(format!(
                "no application from user {target_no}"
            )));
        }
        // The application is consumed either way.
        self.deps.cache.hdel(&apps_key, &target_no.to_string());

        if accept {
            let applicant = self.profile_of(target_no).await?;
            if applicant.alliance_id.is_some() {
                self.persist(alliance_id).await?;
                return Err(GameError::Conflict(format!(
                    "user {target_no} already joined another alliance"
                )));
            }
            let state = self.state(alliance_id).await?;
            self.admit(alliance_id, target_no, state.level).await?;
        }
        self.persist(alliance_id).await?;
        Ok(json!({ "target_user_no": target_no, "approved": accept }))
    }

    // -----------------------------------------------------------------------
    // Donation & levels
    // -----------------------------------------------------------------------

    pub async fn donate(&self, data: &Value) -> GameResult<Value> {
        let amount = req_i64(data, "amount")?;
        if amount <= 0 {
            return Err(GameError::Validation("amount must be positive".into()));
        }
        let alliance_id = self.my_alliance_id().await?;
        let _lock = self.deps.locks.lock_alliance(alliance_id).await?;
        let mut me = self.my_member_locked(alliance_id)?;

        ResourceService::new(self.deps.clone(), self.user_no)
            .atomic_consume(ResourceKind::Food, amount)
            .await?;
        let exp_gained = amount / self.deps.config.game.donate_ratio;

        let mut state = self.state(alliance_id).await?;
        let old_level = state.level;
        state.exp += exp_gained;

        // Level thresholds are cumulative experience totals.
        while let Some(next) = self.deps.catalog.alliance_level(state.level + 1) {
            if state.exp >= next.required_exp {
                state.level += 1;
            } else {
                break;
            }
        }
        self.put_state(&state);

        me.donated_exp += exp_gained;
        self.put_member(alliance_id, &me);

        if state.level > old_level {
            for member in self.members(alliance_id) {
                self.revoke_alliance_buff(member.user_no, alliance_id);
                self.grant_alliance_buff(member.user_no, alliance_id, state.level);
            }
            tracing::info!(alliance_id, level = state.level, "alliance leveled up");
        }
        self.persist(alliance_id).await?;

        Ok(json!({
            "donated_food": amount,
            "exp_gained": exp_gained,
            "alliance_exp": state.exp,
            "alliance_level": state.level,
            "leveled_up": state.level > old_level,
        }))
    }

    // -----------------------------------------------------------------------
    // Administration
    // -----------------------------------------------------------------------

    pub async fn set_join_policy(&self, data: &Value) -> GameResult<Value> {
        let policy = match req_str(data, "join_policy")? {
            "open" => JoinPolicy::Open,
            "approval" => JoinPolicy::Approval,
            other => {
                return Err(GameError::Validation(format!("unknown join_policy '{other}'")))
            }
        };
        let alliance_id = self.my_alliance_id().await?;
        let _lock = self.deps.locks.lock_alliance(alliance_id).await?;
        let me = self.my_member_locked(alliance_id)?;
        if me.position.rank() > AlliancePosition::ViceLeader.rank() {
            return Err(GameError::Forbidden(
                "only the leader or vice leader may change the join policy".into(),
            ));
        }
        let mut state = self.state(alliance_id).await?;
        state.join_policy = policy;
        self.put_state(&state);
        self.persist(alliance_id).await?;
        Ok(json!({ "join_policy": policy }))
    }

    pub async fn disband(&self) -> GameResult<Value> {
        let alliance_id = self.my_alliance_id().await?;
        let _lock = self.deps.locks.lock_alliance(alliance_id).await?;
        let me = self.my_member_locked(alliance_id)?;
        if me.position != AlliancePosition::Leader {
            return Err(GameError::Forbidden("only the leader may disband".into()));
        }
        let state = self.state(alliance_id).await?;

        for member in self.members(alliance_id) {
            self.revoke_alliance_buff(member.user_no, alliance_id);
            self.set_membership(member.user_no, None).await?;
        }
        self.deps.cache.del(&keys::alliance_info(alliance_id));
        self.deps.cache.del(&keys::alliance_members(alliance_id));
        self.deps.cache.del(&keys::alliance_applications(alliance_id));
        self.deps.cache.hdel(&keys::alliance_names(), &state.name);
        self.deps.db.delete_alliance(alliance_id).await?;

        tracing::info!(alliance_id, "alliance disbanded");
        Ok(json!({ "disbanded": alliance_id }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Deps;
    use wk_core::catalog::{AllianceLevelSpec, BuffSpec, GameCatalog};
    use wk_core::config::ServerConfig;
    use wk_core::types::{ResourceBundle, ValueKind};

    fn catalog() -> GameCatalog {
        let mut c = GameCatalog::default();
        c.buffs.insert(
            401,
            BuffSpec {
                buff_idx: 401,
                target_type: "resource".into(),
                target_sub: 0,
                stat: "production".into(),
                value: 5,
                value_kind: ValueKind::Percent,
                duration_secs: 0,
                ruby_cost: 0,
            },
        );
        c.alliance_levels.insert(
            1,
            AllianceLevelSpec {
                level: 1,
                required_exp: 0,
                buff_idx: 401,
                buff_value: 5,
            },
        );
        c.alliance_levels.insert(
            2,
            AllianceLevelSpec {
                level: 2,
                required_exp: 100,
                buff_idx: 401,
                buff_value: 10,
            },
        );
        c
    }

    async fn deps() -> Arc<Deps> {
        let deps = Deps::in_memory(catalog(), ServerConfig::default())
            .await
            .unwrap();
        for user_no in [1001, 1002, 1003] {
            let profile = UserProfile {
                user_no,
                account_id: format!("acct-{user_no}"),
                nickname: format!("p{user_no}"),
                level: 1,
                power: 0,
                alliance_id: None,
                alliance_position: None,
                created_at: Utc::now(),
            };
            deps.db
                .create_user(
                    &profile,
                    &ResourceBundle {
                        food: 20_000,
                        ..ResourceBundle::default()
                    },
                )
                .await
                .unwrap();
        }
        deps
    }

    async fn create_and_join(deps: &Arc<Deps>) -> AllianceId {
        let leader = AllianceService::new(deps.clone(), 1001);
        let out = leader
            .create(&json!({ "name": "Iron Pact" }))
            .await
            .unwrap();
        let alliance_id = out["alliance"]["alliance_id"].as_i64().unwrap();
        AllianceService::new(deps.clone(), 1002)
            .join(&json!({ "alliance_id": alliance_id }))
            .await
            .unwrap();
        alliance_id
    }

    #[tokio::test]
    async fn create_sets_leader_and_buff() {
        let deps = deps().await;
        let svc = AllianceService::new(deps.clone(), 1001);
        svc.create(&json!({ "name": "Iron Pact" })).await.unwrap();

        let profile = svc.profile_of(1001).await.unwrap();
        assert_eq!(profile.alliance_position, Some(AlliancePosition::Leader));
        let buffs = BuffService::new(deps, 1001);
        assert_eq!(buffs.totals("resource", 0, "production"), (5, 0));
    }

    #[tokio::test]
    async fn duplicate_name_conflicts() {
        let deps = deps().await;
        AllianceService::new(deps.clone(), 1001)
            .create(&json!({ "name": "Iron Pact" }))
            .await
            .unwrap();
        let err = AllianceService::new(deps, 1002)
            .create(&json!({ "name": "Iron Pact" }))
            .await
            .unwrap_err();
        assert!(matches!(err, GameError::Conflict(_)));
    }

    #[tokio::test]
    async fn user_cannot_join_twice() {
        let deps = deps().await;
        let alliance_id = create_and_join(&deps).await;
        let err = AllianceService::new(deps, 1002)
            .join(&json!({ "alliance_id": alliance_id }))
            .await
            .unwrap_err();
        assert!(matches!(err, GameError::Conflict(_)));
    }

    #[tokio::test]
    async fn leader_cannot_leave_member_can() {
        let deps = deps().await;
        create_and_join(&deps).await;
        let err = AllianceService::new(deps.clone(), 1001)
            .leave()
            .await
            .unwrap_err();
        assert!(matches!(err, GameError::Forbidden(_)));

        AllianceService::new(deps.clone(), 1002).leave().await.unwrap();
        let profile = AllianceService::new(deps.clone(), 1002)
            .profile_of(1002)
            .await
            .unwrap();
        assert_eq!(profile.alliance_id, None);
        // Membership buff is gone.
        let buffs = BuffService::new(deps, 1002);
        assert_eq!(buffs.totals("resource", 0, "production"), (0, 0));
    }

    #[tokio::test]
    async fn approval_flow() {
        let deps = deps().await;
        let leader = AllianceService::new(deps.clone(), 1001);
        let out = leader
            .create(&json!({ "name": "Gatekeepers", "join_policy": "approval" }))
            .await
            .unwrap();
        let alliance_id = out["alliance"]["alliance_id"].as_i64().unwrap();

        let joiner = AllianceService::new(deps.clone(), 1002);
        let out = joiner
            .join(&json!({ "alliance_id": alliance_id }))
            .await
            .unwrap();
        assert_eq!(out["applied"], true);

        let apps = leader.application_list().await.unwrap();
        assert_eq!(apps["applications"].as_array().unwrap().len(), 1);

        leader
            .approve(&json!({ "target_user_no": 1002, "approve": true }))
            .await
            .unwrap();
        let profile = joiner.profile_of(1002).await.unwrap();
        assert_eq!(profile.alliance_id, Some(alliance_id));
        assert!(leader.applications(alliance_id).is_empty());
    }

    #[tokio::test]
    async fn kick_respects_rank_order() {
        let deps = deps().await;
        let alliance_id = create_and_join(&deps).await;
        let member = AllianceService::new(deps.clone(), 1002);
        // A plain member cannot kick anyone.
        let err = member
            .kick(&json!({ "target_user_no": 1001 }))
            .await
            .unwrap_err();
        assert!(matches!(err, GameError::Forbidden(_)));

        let leader = AllianceService::new(deps.clone(), 1001);
        leader
            .kick(&json!({ "target_user_no": 1002 }))
            .await
            .unwrap();
        assert!(leader.member(alliance_id, 1002).is_none());
    }

    #[tokio::test]
    async fn leadership_transfer_swaps_ranks() {
        let deps = deps().await;
        let alliance_id = create_and_join(&deps).await;
        let leader = AllianceService::new(deps.clone(), 1001);
        leader
            .promote(&json!({ "target_user_no": 1002, "position": "leader" }))
            .await
            .unwrap();

        let members = leader.members(alliance_id);
        let new_leader = members.iter().find(|m| m.user_no == 1002).unwrap();
        let old_leader = members.iter().find(|m| m.user_no == 1001).unwrap();
        assert_eq!(new_leader.position, AlliancePosition::Leader);
        assert_eq!(old_leader.position, AlliancePosition::Member);
        assert_eq!(leader.state(alliance_id).await.unwrap().leader_no, 1002);
        // Exactly one leader remains.
        assert_eq!(
            members
                .iter()
                .filter(|m| m.position == AlliancePosition::Leader)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn vanished_membership_is_rejected_under_the_lock() {
        let deps = deps().await;
        let alliance_id = create_and_join(&deps).await;
        // Simulate a concurrent kick landing before this call takes the
        // alliance lock: the member record is gone, the caller's cached
        // profile is stale.
        deps.cache
            .hdel(&keys::alliance_members(alliance_id), "1002");

        let member = AllianceService::new(deps.clone(), 1002);
        let err = member.donate(&json!({ "amount": 1000 })).await.unwrap_err();
        assert!(matches!(err, GameError::Conflict(_)));
        // The rejection happened before any food was consumed.
        let res = ResourceService::new(deps, 1002).snapshot().await.unwrap();
        assert_eq!(res.food, 20_000);
    }

    #[tokio::test]
    async fn donate_levels_up_and_regrants_buffs() {
        let deps = deps().await;
        let alliance_id = create_and_join(&deps).await;
        let member = AllianceService::new(deps.clone(), 1002);

        let out = member.donate(&json!({ "amount": 10_000 })).await.unwrap();
        assert_eq!(out["exp_gained"], 100);
        assert_eq!(out["alliance_level"], 2);
        assert_eq!(out["leveled_up"], true);

        // Every member's buff reflects the new level's value.
        for user_no in [1001, 1002] {
            let buffs = BuffService::new(deps.clone(), user_no);
            assert_eq!(buffs.totals("resource", 0, "production"), (10, 0));
        }
        let res = ResourceService::new(deps.clone(), 1002)
            .snapshot()
            .await
            .unwrap();
        assert_eq!(res.food, 10_000);
        assert_eq!(
            member.state(alliance_id).await.unwrap().exp,
            100
        );
    }

    #[tokio::test]
    async fn disband_clears_everyone() {
        let deps = deps().await;
        let alliance_id = create_and_join(&deps).await;
        let leader = AllianceService::new(deps.clone(), 1001);
        leader.disband().await.unwrap();

        for user_no in [1001, 1002] {
            let profile = leader.profile_of(user_no).await.unwrap();
            assert_eq!(profile.alliance_id, None);
        }
        assert!(deps.db.load_alliance(alliance_id).await.unwrap().is_none());
        assert!(matches!(
            leader.state(alliance_id).await,
            Err(GameError::NotFound(_))
        ));
    }
}
