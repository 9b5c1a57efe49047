//! Shared key-value state.
//!
//! Every coordination invariant in the fleet (operation admission, breaker
//! state, handover contexts, timers) lives in a store reachable by all
//! workers. The trait mirrors the handful of primitives the components need:
//! plain strings with TTL, an atomic set-if-absent, counters, sorted sets and
//! capped lists.

pub mod memory;
pub mod sqlite;

use chrono::Duration;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::codec::{decode_record, encode_record, CodecError};

pub use memory::MemoryStore;
pub use sqlite::{SqliteStore, SqliteStoreBuilder};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store path not configured")]
    MissingStore,
    #[error("failed to open store at {path}: {source}")]
    Open {
        path: std::path::PathBuf,
        source: rusqlite::Error,
    },
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("record codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("value at {key} is not an integer")]
    NotAnInteger { key: String },
    #[error("store lock poisoned")]
    Poisoned,
}

pub type StoreResult<T> = Result<T, StoreError>;

pub trait SharedStore: Send + Sync {
    fn get(&self, key: &str) -> StoreResult<Option<String>>;
    /// Writes `value`; `ttl: None` leaves the key without expiry.
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;
    /// Writes only when the key is absent. Returns whether the write happened.
    fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<bool>;
    fn delete(&self, key: &str) -> StoreResult<bool>;
    fn exists(&self, key: &str) -> StoreResult<bool>;
    fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;
    fn ttl(&self, key: &str) -> StoreResult<Option<Duration>>;
    fn incr_by(&self, key: &str, delta: i64) -> StoreResult<i64>;

    /// Inserts or re-scores `member`. Members with equal scores keep
    /// insertion order.
    fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()>;
    fn zrem(&self, key: &str, member: &str) -> StoreResult<bool>;
    /// All members, highest score first.
    fn zrange_desc(&self, key: &str) -> StoreResult<Vec<(String, f64)>>;
    /// Members with `score <= max`, lowest score first.
    fn zrange_by_score(&self, key: &str, max: f64) -> StoreResult<Vec<(String, f64)>>;
    fn zcard(&self, key: &str) -> StoreResult<usize>;

    /// Prepends `value`, returning the new list length.
    fn lpush(&self, key: &str, value: &str) -> StoreResult<usize>;
    /// Keeps only the `keep` most recent entries.
    fn ltrim(&self, key: &str, keep: usize) -> StoreResult<()>;
    /// Most recent entries first.
    fn lrange(&self, key: &str, limit: usize) -> StoreResult<Vec<String>>;

    fn keys(&self, prefix: &str) -> StoreResult<Vec<String>>;
}

pub fn get_record<T: DeserializeOwned>(
    store: &dyn SharedStore,
    key: &str,
) -> StoreResult<Option<T>> {
    match store.get(key)? {
        Some(raw) => Ok(Some(decode_record(&raw)?)),
        None => Ok(None),
    }
}

pub fn put_record<T: Serialize>(
    store: &dyn SharedStore,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> StoreResult<()> {
    let raw = encode_record(value)?;
    store.set(key, &raw, ttl)
}
