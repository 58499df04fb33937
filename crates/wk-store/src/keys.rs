//! Cache key builders.
//!
//! Every key in the hot store is produced here so the layout stays in one
//! place: per-user entity hashes under `user_data:{user}:{class}`, alliance
//! hashes under `alliance_data:{id}:{part}`, completion queues under
//! `completion_queue:{class}`, and the dirty sets under
//! `sync_pending:{class}`.

use wk_core::types::{AllianceId, SyncClass, TaskClass, UserNo};

// -- per-user entity hashes --------------------------------------------------

pub fn profile(user_no: UserNo) -> String {
    format!("user_data:{user_no}:profile")
}

pub fn resources(user_no: UserNo) -> String {
    format!("user_data:{user_no}:resources")
}

pub fn buildings(user_no: UserNo) -> String {
    format!("user_data:{user_no}:building")
}

pub fn units(user_no: UserNo) -> String {
    format!("user_data:{user_no}:unit")
}

pub fn unit_tasks(user_no: UserNo) -> String {
    format!("user_data:{user_no}:unit_task")
}

pub fn researches(user_no: UserNo) -> String {
    format!("user_data:{user_no}:research")
}

pub fn items(user_no: UserNo) -> String {
    format!("user_data:{user_no}:item")
}

pub fn missions(user_no: UserNo) -> String {
    format!("user_data:{user_no}:mission")
}

pub fn shop(user_no: UserNo) -> String {
    format!("user_data:{user_no}:shop")
}

pub fn permanent_buffs(user_no: UserNo) -> String {
    format!("user_data:{user_no}:buff:permanent")
}

pub fn temporary_buffs(user_no: UserNo) -> String {
    format!("user_data:{user_no}:buff:temporary")
}

/// Short-TTL aggregate of buff values per `(target, sub, stat)`.
pub fn buff_totals(user_no: UserNo) -> String {
    format!("user_data:{user_no}:buff:totals")
}

// -- alliances ---------------------------------------------------------------

pub fn alliance_info(alliance_id: AllianceId) -> String {
    format!("alliance_data:{alliance_id}:info")
}

pub fn alliance_members(alliance_id: AllianceId) -> String {
    format!("alliance_data:{alliance_id}:members")
}

pub fn alliance_applications(alliance_id: AllianceId) -> String {
    format!("alliance_data:{alliance_id}:applications")
}

/// Name → alliance id index; enforces the 1-1 name mapping.
pub fn alliance_names() -> String {
    "alliance:names".to_string()
}

// -- queues, dirty sets, counters -------------------------------------------

pub fn queue(class: TaskClass) -> String {
    format!("completion_queue:{}", class.as_str())
}

pub fn queue_meta(class: TaskClass, member: &str) -> String {
    format!("completion_queue:{}:metadata:{member}", class.as_str())
}

pub fn dead_letter(class: TaskClass) -> String {
    format!("dead_letter:{}", class.as_str())
}

pub fn sync_pending(class: SyncClass) -> String {
    format!("sync_pending:{}", class.as_str())
}

pub fn counters() -> String {
    "counters".to_string()
}
