//! Timed-task completion queues.
//!
//! One sorted set per task class. Members are `"user:task[:sub]"`, scored by
//! the completion time in unix milliseconds; a companion metadata hash per
//! member (24 h TTL) carries quantity, task kind, retry attempts, and
//! whatever else the finish handler needs. Draining is non-destructive —
//! the worker deletes an entry only after its finish handler succeeds, so a
//! failed completion stays queued for retry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use wk_core::types::{TaskClass, UserNo};

use crate::cache::CacheStore;
use crate::keys;

const METADATA_TTL: Duration = Duration::from_secs(86400);

/// A matured queue entry, metadata attached.
#[derive(Debug, Clone)]
pub struct DueTask {
    pub class: TaskClass,
    pub user_no: UserNo,
    pub task_id: String,
    pub sub_id: Option<String>,
    pub completion: DateTime<Utc>,
    pub member: String,
    pub metadata: HashMap<String, String>,
}

impl DueTask {
    /// Metadata field parsed as an integer, defaulting to 0.
    pub fn meta_i64(&self, field: &str) -> i64 {
        self.metadata
            .get(field)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }
}

#[derive(Clone)]
pub struct TaskQueue {
    cache: Arc<CacheStore>,
    class: TaskClass,
}

impl TaskQueue {
    pub fn new(cache: Arc<CacheStore>, class: TaskClass) -> Self {
        Self { cache, class }
    }

    pub fn class(&self) -> TaskClass {
        self.class
    }

    fn member_key(user_no: UserNo, task_id: &str, sub_id: Option<&str>) -> String {
        match sub_id {
            Some(sub) => format!("{user_no}:{task_id}:{sub}"),
            None => format!("{user_no}:{task_id}"),
        }
    }

    fn parse_member(member: &str) -> Option<(UserNo, String, Option<String>)> {
        let mut parts = member.splitn(3, ':');
        let user_no = parts.next()?.parse().ok()?;
        let task_id = parts.next()?.to_string();
        let sub_id = parts.next().map(str::to_string);
        Some((user_no, task_id, sub_id))
    }

    /// Register a completion at `completion`, with metadata.
    pub fn enqueue(
        &self,
        user_no: UserNo,
        task_id: &str,
        sub_id: Option<&str>,
        completion: DateTime<Utc>,
        metadata: &[(&str, String)],
    ) {
        let member = Self::member_key(user_no, task_id, sub_id);
        if !metadata.is_empty() {
            self.cache.hset_many(
                &keys::queue_meta(self.class, &member),
                metadata.iter().map(|(k, v)| (k.to_string(), v.clone())),
                Some(METADATA_TTL),
            );
        }
        self.cache
            .zadd(&keys::queue(self.class), member, completion.timestamp_millis());
    }

    /// Move an existing entry to a new completion time. Returns false when
    /// the entry is not queued.
    pub fn reschedule(
        &self,
        user_no: UserNo,
        task_id: &str,
        sub_id: Option<&str>,
        completion: DateTime<Utc>,
    ) -> bool {
        let member = Self::member_key(user_no, task_id, sub_id);
        let key = keys::queue(self.class);
        if self.cache.zscore(&key, &member).is_none() {
            return false;
        }
        self.cache
            .zadd(&key, member, completion.timestamp_millis());
        true
    }

    /// Remove an entry and its metadata. Idempotent.
    pub fn remove(&self, user_no: UserNo, task_id: &str, sub_id: Option<&str>) -> bool {
        let member = Self::member_key(user_no, task_id, sub_id);
        self.remove_member(&member)
    }

    pub fn remove_member(&self, member: &str) -> bool {
        let removed = self.cache.zrem(&keys::queue(self.class), member);
        self.cache.del(&keys::queue_meta(self.class, member));
        removed
    }

    pub fn completion_of(
        &self,
        user_no: UserNo,
        task_id: &str,
        sub_id: Option<&str>,
    ) -> Option<DateTime<Utc>> {
        let member = Self::member_key(user_no, task_id, sub_id);
        let ms = self.cache.zscore(&keys::queue(self.class), &member)?;
        Utc.timestamp_millis_opt(ms).single()
    }

    /// Entries with a completion time at or before `now`, ascending by
    /// `(score, member)`. Entries are left in place; callers delete on
    /// success via [`TaskQueue::remove_member`].
    pub fn due(&self, now: DateTime<Utc>) -> Vec<DueTask> {
        let rows = self
            .cache
            .zrangebyscore(&keys::queue(self.class), i64::MIN, now.timestamp_millis());
        let mut out = Vec::with_capacity(rows.len());
        for (member, score) in rows {
            let Some((user_no, task_id, sub_id)) = Self::parse_member(&member) else {
                tracing::error!(member = %member, class = self.class.as_str(), "unparseable queue member, dropping");
                self.remove_member(&member);
                continue;
            };
            let Some(completion) = Utc.timestamp_millis_opt(score).single() else {
                continue;
            };
            out.push(DueTask {
                class: self.class,
                user_no,
                task_id,
                sub_id,
                completion,
                metadata: self.cache.hgetall(&keys::queue_meta(self.class, &member)),
                member,
            });
        }
        out
    }

    /// Record one more failed completion attempt; returns the new count.
    pub fn bump_attempts(&self, member: &str) -> i64 {
        self.cache.hincrby(
            &keys::queue_meta(self.class, member),
            "attempts",
            1,
            Some(METADATA_TTL),
        )
    }

    /// Park a repeatedly failing entry in the dead-letter set and drop it
    /// from the queue.
    pub fn dead_letter(&self, member: &str) {
        self.cache.sadd(&keys::dead_letter(self.class), member);
        self.remove_member(member);
    }

    pub fn dead_letter_members(&self) -> Vec<String> {
        self.cache.smembers(&keys::dead_letter(self.class))
    }

    pub fn len(&self) -> usize {
        self.cache.zcard(&keys::queue(self.class))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn queue() -> TaskQueue {
        TaskQueue::new(Arc::new(CacheStore::new()), TaskClass::Building)
    }

    #[test]
    fn enqueue_then_due_after_maturity() {
        let q = queue();
        let now = Utc::now();
        q.enqueue(1001, "201", None, now + ChronoDuration::seconds(60), &[]);

        assert!(q.due(now).is_empty());
        let due = q.due(now + ChronoDuration::seconds(61));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].user_no, 1001);
        assert_eq!(due[0].task_id, "201");
        assert!(due[0].sub_id.is_none());
    }

    #[test]
    fn due_is_non_destructive() {
        let q = queue();
        let past = Utc::now() - ChronoDuration::seconds(5);
        q.enqueue(1, "9", None, past, &[]);
        assert_eq!(q.due(Utc::now()).len(), 1);
        assert_eq!(q.due(Utc::now()).len(), 1);
        q.remove_member("1:9");
        assert!(q.due(Utc::now()).is_empty());
    }

    #[test]
    fn metadata_round_trips() {
        let q = queue();
        let past = Utc::now() - ChronoDuration::seconds(1);
        q.enqueue(
            7,
            "5",
            Some("2"),
            past,
            &[("kind", "train".into()), ("quantity", "10".into())],
        );
        let due = q.due(Utc::now());
        assert_eq!(due[0].metadata.get("kind").unwrap(), "train");
        assert_eq!(due[0].meta_i64("quantity"), 10);
        assert_eq!(due[0].sub_id.as_deref(), Some("2"));
    }

    #[test]
    fn remove_is_idempotent_and_clears_metadata() {
        let q = queue();
        let past = Utc::now() - ChronoDuration::seconds(1);
        q.enqueue(7, "5", None, past, &[("quantity", "3".into())]);
        assert!(q.remove(7, "5", None));
        assert!(!q.remove(7, "5", None));
        let due = q.due(Utc::now());
        assert!(due.is_empty());
    }

    #[test]
    fn reschedule_moves_completion() {
        let q = queue();
        let now = Utc::now();
        q.enqueue(7, "5", None, now + ChronoDuration::seconds(100), &[]);
        assert!(q.reschedule(7, "5", None, now - ChronoDuration::seconds(1)));
        assert_eq!(q.due(now).len(), 1);
        assert!(!q.reschedule(8, "5", None, now));
    }

    #[test]
    fn attempts_and_dead_letter() {
        let q = queue();
        let past = Utc::now() - ChronoDuration::seconds(1);
        q.enqueue(7, "5", None, past, &[]);
        assert_eq!(q.bump_attempts("7:5"), 1);
        assert_eq!(q.bump_attempts("7:5"), 2);
        assert_eq!(q.bump_attempts("7:5"), 3);
        q.dead_letter("7:5");
        assert!(q.due(Utc::now()).is_empty());
        assert_eq!(q.dead_letter_members(), vec!["7:5"]);
    }
}
