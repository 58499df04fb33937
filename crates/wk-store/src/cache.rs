//! In-process hot store with hash, sorted-set, and plain-set keys.
//!
//! Semantics mirror what the domain layer needs from a keyed cache: per-user
//! hashes with sliding TTLs, atomic integer fields, score-ordered queues,
//! and membership sets for dirty tracking. Single-field operations are
//! atomic (each key is touched under its shard lock); composite sequences
//! are serialized by the per-user lock, not by the store.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Hot keyed store. Cheap to clone behind an `Arc`; every method takes
/// `&self` and is safe to call from any task.
#[derive(Default)]
pub struct CacheStore {
    hashes: DashMap<String, HashEntry>,
    zsets: DashMap<String, ZSet>,
    sets: DashMap<String, HashSet<String>>,
}

struct HashEntry {
    fields: HashMap<String, String>,
    expires_at: Option<Instant>,
}

impl HashEntry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Instant::now())
    }
}

#[derive(Default)]
struct ZSet {
    scores: HashMap<String, i64>,
    ordered: BTreeSet<(i64, String)>,
}

impl ZSet {
    fn insert(&mut self, member: String, score: i64) {
        if let Some(old) = self.scores.insert(member.clone(), score) {
            self.ordered.remove(&(old, member.clone()));
        }
        self.ordered.insert((score, member));
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.ordered.remove(&(score, member.to_string()));
                true
            }
            None => false,
        }
    }
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    // -----------------------------------------------------------------------
    // Hashes
    // -----------------------------------------------------------------------

    pub fn hget(&self, key: &str, field: &str) -> Option<String> {
        let entry = self.hashes.get(key)?;
        if entry.expired() {
            drop(entry);
            self.hashes.remove(key);
            return None;
        }
        entry.fields.get(field).cloned()
    }

    /// Set one field. A `Some(ttl)` refreshes the key's expiry; `None`
    /// leaves the current expiry untouched.
    pub fn hset(&self, key: &str, field: &str, value: impl Into<String>, ttl: Option<Duration>) {
        let mut entry = self.hashes.entry(key.to_string()).or_insert_with(|| HashEntry {
            fields: HashMap::new(),
            expires_at: None,
        });
        if entry.expired() {
            entry.fields.clear();
            entry.expires_at = None;
        }
        entry.fields.insert(field.to_string(), value.into());
        if let Some(ttl) = ttl {
            entry.expires_at = Some(Instant::now() + ttl);
        }
    }

    /// Replace or extend a hash with many fields at once.
    pub fn hset_many<I, K, V>(&self, key: &str, fields: I, ttl: Option<Duration>)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut entry = self.hashes.entry(key.to_string()).or_insert_with(|| HashEntry {
            fields: HashMap::new(),
            expires_at: None,
        });
        if entry.expired() {
            entry.fields.clear();
            entry.expires_at = None;
        }
        for (k, v) in fields {
            entry.fields.insert(k.into(), v.into());
        }
        if let Some(ttl) = ttl {
            entry.expires_at = Some(Instant::now() + ttl);
        }
    }

    pub fn hdel(&self, key: &str, field: &str) -> bool {
        match self.hashes.get_mut(key) {
            Some(mut entry) => {
                if entry.expired() {
                    drop(entry);
                    self.hashes.remove(key);
                    return false;
                }
                entry.fields.remove(field).is_some()
            }
            None => false,
        }
    }

    pub fn hgetall(&self, key: &str) -> HashMap<String, String> {
        let expired = match self.hashes.get(key) {
            Some(entry) if !entry.expired() => return entry.fields.clone(),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.hashes.remove(key);
        }
        HashMap::new()
    }

    /// Atomically add `delta` to an integer field, treating a missing field
    /// as zero. Returns the new value. Non-integer garbage in the field is
    /// overwritten from zero.
    pub fn hincrby(&self, key: &str, field: &str, delta: i64, ttl: Option<Duration>) -> i64 {
        let mut entry = self.hashes.entry(key.to_string()).or_insert_with(|| HashEntry {
            fields: HashMap::new(),
            expires_at: None,
        });
        if entry.expired() {
            entry.fields.clear();
            entry.expires_at = None;
        }
        let current = entry
            .fields
            .get(field)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        let next = current + delta;
        entry.fields.insert(field.to_string(), next.to_string());
        if let Some(ttl) = ttl {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        next
    }

    pub fn hlen(&self, key: &str) -> usize {
        match self.hashes.get(key) {
            Some(entry) if !entry.expired() => entry.fields.len(),
            _ => 0,
        }
    }

    /// Whether the hash key exists and has not expired.
    pub fn exists(&self, key: &str) -> bool {
        match self.hashes.get(key) {
            Some(entry) => !entry.expired(),
            None => false,
        }
    }

    pub fn del(&self, key: &str) -> bool {
        self.hashes.remove(key).is_some()
    }

    /// Refresh or set the expiry of an existing hash key.
    pub fn expire(&self, key: &str, ttl: Duration) -> bool {
        match self.hashes.get_mut(key) {
            Some(mut entry) if !entry.expired() => {
                entry.expires_at = Some(Instant::now() + ttl);
                true
            }
            _ => false,
        }
    }

    /// Live hash keys starting with `prefix`.
    pub fn scan_prefix(&self, prefix: &str) -> Vec<String> {
        self.hashes
            .iter()
            .filter(|e| e.key().starts_with(prefix) && !e.value().expired())
            .map(|e| e.key().clone())
            .collect()
    }

    // -----------------------------------------------------------------------
    // Sorted sets
    // -----------------------------------------------------------------------

    pub fn zadd(&self, key: &str, member: impl Into<String>, score: i64) {
        self.zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.into(), score);
    }

    pub fn zrem(&self, key: &str, member: &str) -> bool {
        match self.zsets.get_mut(key) {
            Some(mut z) => z.remove(member),
            None => false,
        }
    }

    pub fn zscore(&self, key: &str, member: &str) -> Option<i64> {
        self.zsets.get(key)?.scores.get(member).copied()
    }

    /// Members with `min <= score <= max`, ascending by `(score, member)`.
    /// The lexicographic tie-break keeps drain order deterministic.
    pub fn zrangebyscore(&self, key: &str, min: i64, max: i64) -> Vec<(String, i64)> {
        use std::ops::Bound;
        let lower = Bound::Included((min, String::new()));
        let upper = match max.checked_add(1) {
            Some(next) => Bound::Excluded((next, String::new())),
            None => Bound::Unbounded,
        };
        match self.zsets.get(key) {
            Some(z) => z
                .ordered
                .range((lower, upper))
                .map(|(score, member)| (member.clone(), *score))
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn zcard(&self, key: &str) -> usize {
        self.zsets.get(key).map(|z| z.scores.len()).unwrap_or(0)
    }

    // -----------------------------------------------------------------------
    // Plain sets
    // -----------------------------------------------------------------------

    pub fn sadd(&self, key: &str, member: impl Into<String>) -> bool {
        self.sets
            .entry(key.to_string())
            .or_default()
            .insert(member.into())
    }

    pub fn srem(&self, key: &str, member: &str) -> bool {
        match self.sets.get_mut(key) {
            Some(mut s) => s.remove(member),
            None => false,
        }
    }

    pub fn smembers(&self, key: &str) -> Vec<String> {
        self.sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Take the whole set as a snapshot, leaving it empty. Members added
    /// concurrently after the swap land in the next snapshot.
    pub fn spop_all(&self, key: &str) -> Vec<String> {
        match self.sets.get_mut(key) {
            Some(mut s) => s.drain().collect(),
            None => Vec::new(),
        }
    }

    pub fn scard(&self, key: &str) -> usize {
        self.sets.get(key).map(|s| s.len()).unwrap_or(0)
    }
}
