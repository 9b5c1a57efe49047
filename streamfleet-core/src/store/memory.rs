use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};

use crate::clock::{Clock, SystemClock};

use super::{SharedStore, StoreError, StoreResult};

#[derive(Debug, Clone)]
struct ZEntry {
    member: String,
    score: f64,
    seq: u64,
}

#[derive(Debug, Default)]
struct Inner {
    strings: HashMap<String, String>,
    zsets: HashMap<String, Vec<ZEntry>>,
    lists: HashMap<String, VecDeque<String>>,
    expirations: HashMap<String, DateTime<Utc>>,
    seq: u64,
}

impl Inner {
    fn remove(&mut self, key: &str) -> bool {
        let mut removed = self.strings.remove(key).is_some();
        removed |= self.zsets.remove(key).is_some();
        removed |= self.lists.remove(key).is_some();
        self.expirations.remove(key);
        removed
    }

    fn contains(&self, key: &str) -> bool {
        self.strings.contains_key(key)
            || self.zsets.get(key).map(|set| !set.is_empty()).unwrap_or(false)
            || self.lists.get(key).map(|list| !list.is_empty()).unwrap_or(false)
    }

    fn purge_key(&mut self, key: &str, now: DateTime<Utc>) {
        if self
            .expirations
            .get(key)
            .map(|deadline| *deadline <= now)
            .unwrap_or(false)
        {
            self.remove(key);
        }
    }

    fn purge_all(&mut self, now: DateTime<Utc>) {
        let expired: Vec<String> = self
            .expirations
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.remove(&key);
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

/// In-process [`SharedStore`] honouring TTLs through the injected clock.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore").finish_non_exhaustive()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            clock,
        }
    }

    fn lock(&self, key: Option<&str>) -> StoreResult<MutexGuard<'_, Inner>> {
        let mut guard = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        let now = self.clock.now();
        match key {
            Some(key) => guard.purge_key(key, now),
            None => guard.purge_all(now),
        }
        Ok(guard)
    }

    fn apply_ttl(&self, inner: &mut Inner, key: &str, ttl: Option<Duration>) {
        match ttl {
            Some(ttl) => {
                inner
                    .expirations
                    .insert(key.to_string(), self.clock.now() + ttl);
            }
            None => {
                inner.expirations.remove(key);
            }
        }
    }
}

impl SharedStore for MemoryStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let guard = self.lock(Some(key))?;
        Ok(guard.strings.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut guard = self.lock(Some(key))?;
        guard.strings.insert(key.to_string(), value.to_string());
        self.apply_ttl(&mut guard, key, ttl);
        Ok(())
    }

    fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<bool> {
        let mut guard = self.lock(Some(key))?;
        if guard.contains(key) {
            return Ok(false);
        }
        guard.strings.insert(key.to_string(), value.to_string());
        self.apply_ttl(&mut guard, key, ttl);
        Ok(true)
    }

    fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut guard = self.lock(Some(key))?;
        Ok(guard.remove(key))
    }

    fn exists(&self, key: &str) -> StoreResult<bool> {
        let guard = self.lock(Some(key))?;
        Ok(guard.contains(key))
    }

    fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut guard = self.lock(Some(key))?;
        if !guard.contains(key) {
            return Ok(false);
        }
        self.apply_ttl(&mut guard, key, Some(ttl));
        Ok(true)
    }

    fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let guard = self.lock(Some(key))?;
        let now = self.clock.now();
        Ok(guard.expirations.get(key).map(|deadline| *deadline - now))
    }

    fn incr_by(&self, key: &str, delta: i64) -> StoreResult<i64> {
        let mut guard = self.lock(Some(key))?;
        let current = match guard.strings.get(key) {
            Some(raw) => raw.parse::<i64>().map_err(|_| StoreError::NotAnInteger {
                key: key.to_string(),
            })?,
            None => 0,
        };
        let next = current + delta;
        guard.strings.insert(key.to_string(), next.to_string());
        Ok(next)
    }

    fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        let mut guard = self.lock(Some(key))?;
        let seq = guard.next_seq();
        let set = guard.zsets.entry(key.to_string()).or_default();
        match set.iter_mut().find(|entry| entry.member == member) {
            Some(existing) => existing.score = score,
            None => set.push(ZEntry {
                member: member.to_string(),
                score,
                seq,
            }),
        }
        Ok(())
    }

    fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut guard = self.lock(Some(key))?;
        let Some(set) = guard.zsets.get_mut(key) else {
            return Ok(false);
        };
        let before = set.len();
        set.retain(|entry| entry.member != member);
        let removed = set.len() != before;
        if set.is_empty() {
            guard.remove(key);
        }
        Ok(removed)
    }

    fn zrange_desc(&self, key: &str) -> StoreResult<Vec<(String, f64)>> {
        let guard = self.lock(Some(key))?;
        let mut entries = guard.zsets.get(key).cloned().unwrap_or_default();
        entries.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.seq.cmp(&b.seq))
        });
        Ok(entries
            .into_iter()
            .map(|entry| (entry.member, entry.score))
            .collect())
    }

    fn zrange_by_score(&self, key: &str, max: f64) -> StoreResult<Vec<(String, f64)>> {
        let guard = self.lock(Some(key))?;
        let mut entries: Vec<ZEntry> = guard
            .zsets
            .get(key)
            .map(|set| set.iter().filter(|entry| entry.score <= max).cloned().collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| {
            a.score
                .partial_cmp(&b.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.seq.cmp(&b.seq))
        });
        Ok(entries
            .into_iter()
            .map(|entry| (entry.member, entry.score))
            .collect())
    }

    fn zcard(&self, key: &str) -> StoreResult<usize> {
        let guard = self.lock(Some(key))?;
        Ok(guard.zsets.get(key).map(Vec::len).unwrap_or(0))
    }

    fn lpush(&self, key: &str, value: &str) -> StoreResult<usize> {
        let mut guard = self.lock(Some(key))?;
        let list = guard.lists.entry(key.to_string()).or_default();
        list.push_front(value.to_string());
        Ok(list.len())
    }

    fn ltrim(&self, key: &str, keep: usize) -> StoreResult<()> {
        let mut guard = self.lock(Some(key))?;
        if let Some(list) = guard.lists.get_mut(key) {
            list.truncate(keep);
        }
        Ok(())
    }

    fn lrange(&self, key: &str, limit: usize) -> StoreResult<Vec<String>> {
        let guard = self.lock(Some(key))?;
        Ok(guard
            .lists
            .get(key)
            .map(|list| list.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    fn keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let guard = self.lock(None)?;
        let mut keys: Vec<String> = guard
            .strings
            .keys()
            .chain(guard.zsets.keys())
            .chain(guard.lists.keys())
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}
