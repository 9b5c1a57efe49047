use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Duration;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use crate::clock::{Clock, SystemClock};
use crate::sqlite::configure_connection;

use super::{SharedStore, StoreError, StoreResult};

const STORE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS kv_strings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS kv_zsets (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT NOT NULL,
    member TEXT NOT NULL,
    score REAL NOT NULL,
    UNIQUE (key, member)
);
CREATE INDEX IF NOT EXISTS idx_kv_zsets_key_score ON kv_zsets (key, score);
CREATE TABLE IF NOT EXISTS kv_lists (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT NOT NULL,
    value TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_kv_lists_key ON kv_lists (key, seq);
CREATE TABLE IF NOT EXISTS kv_expirations (
    key TEXT PRIMARY KEY,
    expires_at INTEGER NOT NULL
);
";

#[derive(Clone)]
pub struct SqliteStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
    clock: Option<Arc<dyn Clock>>,
}

impl fmt::Debug for SqliteStoreBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteStoreBuilder")
            .field("path", &self.path)
            .field("read_only", &self.read_only)
            .field("create_if_missing", &self.create_if_missing)
            .finish()
    }
}

impl Default for SqliteStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
            clock: None,
        }
    }
}

impl SqliteStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> StoreResult<SqliteStore> {
        let path = self.path.ok_or(StoreError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(SqliteStore {
            path,
            flags,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
        })
    }
}

/// Durable [`SharedStore`] so fleet state survives controller restarts.
#[derive(Clone)]
pub struct SqliteStore {
    path: PathBuf,
    flags: OpenFlags,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.path)
            .finish()
    }
}

impl SqliteStore {
    pub fn builder() -> SqliteStoreBuilder {
        SqliteStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        SqliteStoreBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn initialize(&self) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute_batch(STORE_SCHEMA)?;
        Ok(())
    }

    fn open(&self) -> StoreResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            StoreError::Open {
                source,
                path: self.path.clone(),
            }
        })?;
        configure_connection(&conn).map_err(|source| StoreError::Open {
            source,
            path: self.path.clone(),
        })?;
        Ok(conn)
    }

    /// Opens a connection with every expired key already removed.
    fn open_purged(&self) -> StoreResult<Connection> {
        let conn = self.open()?;
        let now = self.now_millis();
        conn.execute_batch("BEGIN IMMEDIATE;")?;
        let purge = (|| -> rusqlite::Result<()> {
            for table in ["kv_strings", "kv_zsets", "kv_lists"] {
                conn.execute(
                    &format!(
                        "DELETE FROM {table} WHERE key IN \
                         (SELECT key FROM kv_expirations WHERE expires_at <= ?1)"
                    ),
                    [now],
                )?;
            }
            conn.execute("DELETE FROM kv_expirations WHERE expires_at <= ?1", [now])?;
            Ok(())
        })();
        match purge {
            Ok(()) => conn.execute_batch("COMMIT;")?,
            Err(err) => {
                let _ = conn.execute_batch("ROLLBACK;");
                return Err(err.into());
            }
        }
        Ok(conn)
    }

    fn now_millis(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    fn apply_ttl(&self, conn: &Connection, key: &str, ttl: Option<Duration>) -> StoreResult<()> {
        match ttl {
            Some(ttl) => {
                conn.execute(
                    "INSERT INTO kv_expirations (key, expires_at) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET expires_at = excluded.expires_at",
                    params![key, self.now_millis() + ttl.num_milliseconds()],
                )?;
            }
            None => {
                conn.execute("DELETE FROM kv_expirations WHERE key = ?1", [key])?;
            }
        }
        Ok(())
    }

    fn key_exists(conn: &Connection, key: &str) -> rusqlite::Result<bool> {
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM kv_strings WHERE key = ?1)
                 OR EXISTS(SELECT 1 FROM kv_zsets WHERE key = ?1)
                 OR EXISTS(SELECT 1 FROM kv_lists WHERE key = ?1)",
            [key],
            |row| row.get(0),
        )
    }
}

impl SharedStore for SqliteStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let conn = self.open_purged()?;
        let value = conn
            .query_row("SELECT value FROM kv_strings WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut conn = self.open_purged()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO kv_strings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        self.apply_ttl(&tx, key, ttl)?;
        tx.commit()?;
        Ok(())
    }

    fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<bool> {
        let mut conn = self.open_purged()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        if Self::key_exists(&tx, key)? {
            tx.commit()?;
            return Ok(false);
        }
        tx.execute(
            "INSERT INTO kv_strings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        self.apply_ttl(&tx, key, ttl)?;
        tx.commit()?;
        Ok(true)
    }

    fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.open_purged()?;
        let tx = conn.transaction()?;
        let mut affected = 0;
        for table in ["kv_strings", "kv_zsets", "kv_lists"] {
            affected += tx.execute(&format!("DELETE FROM {table} WHERE key = ?1"), [key])?;
        }
        tx.execute("DELETE FROM kv_expirations WHERE key = ?1", [key])?;
        tx.commit()?;
        Ok(affected > 0)
    }

    fn exists(&self, key: &str) -> StoreResult<bool> {
        let conn = self.open_purged()?;
        Ok(Self::key_exists(&conn, key)?)
    }

    fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let conn = self.open_purged()?;
        if !Self::key_exists(&conn, key)? {
            return Ok(false);
        }
        self.apply_ttl(&conn, key, Some(ttl))?;
        Ok(true)
    }

    fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let conn = self.open_purged()?;
        let deadline: Option<i64> = conn
            .query_row(
                "SELECT expires_at FROM kv_expirations WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(deadline.map(|at| Duration::milliseconds(at - self.now_millis())))
    }

    fn incr_by(&self, key: &str, delta: i64) -> StoreResult<i64> {
        let mut conn = self.open_purged()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let current: Option<String> = tx
            .query_row("SELECT value FROM kv_strings WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        let current = match current {
            Some(raw) => raw.parse::<i64>().map_err(|_| StoreError::NotAnInteger {
                key: key.to_string(),
            })?,
            None => 0,
        };
        let next = current + delta;
        tx.execute(
            "INSERT INTO kv_strings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, next.to_string()],
        )?;
        tx.commit()?;
        Ok(next)
    }

    fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        let conn = self.open_purged()?;
        conn.execute(
            "INSERT INTO kv_zsets (key, member, score) VALUES (?1, ?2, ?3)
             ON CONFLICT(key, member) DO UPDATE SET score = excluded.score",
            params![key, member, score],
        )?;
        Ok(())
    }

    fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let conn = self.open_purged()?;
        let affected = conn.execute(
            "DELETE FROM kv_zsets WHERE key = ?1 AND member = ?2",
            params![key, member],
        )?;
        Ok(affected > 0)
    }

    fn zrange_desc(&self, key: &str) -> StoreResult<Vec<(String, f64)>> {
        let conn = self.open_purged()?;
        let mut stmt = conn.prepare(
            "SELECT member, score FROM kv_zsets WHERE key = ?1 ORDER BY score DESC, seq ASC",
        )?;
        let rows = stmt
            .query_map([key], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn zrange_by_score(&self, key: &str, max: f64) -> StoreResult<Vec<(String, f64)>> {
        let conn = self.open_purged()?;
        let mut stmt = conn.prepare(
            "SELECT member, score FROM kv_zsets WHERE key = ?1 AND score <= ?2
             ORDER BY score ASC, seq ASC",
        )?;
        let rows = stmt
            .query_map(params![key, max], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn zcard(&self, key: &str) -> StoreResult<usize> {
        let conn = self.open_purged()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM kv_zsets WHERE key = ?1", [key], |row| {
                row.get(0)
            })?;
        Ok(count as usize)
    }

    fn lpush(&self, key: &str, value: &str) -> StoreResult<usize> {
        let conn = self.open_purged()?;
        conn.execute(
            "INSERT INTO kv_lists (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM kv_lists WHERE key = ?1", [key], |row| {
                row.get(0)
            })?;
        Ok(count as usize)
    }

    fn ltrim(&self, key: &str, keep: usize) -> StoreResult<()> {
        let conn = self.open_purged()?;
        conn.execute(
            "DELETE FROM kv_lists WHERE key = ?1 AND seq NOT IN (
                SELECT seq FROM kv_lists WHERE key = ?1 ORDER BY seq DESC LIMIT ?2
             )",
            params![key, keep as i64],
        )?;
        Ok(())
    }

    fn lrange(&self, key: &str, limit: usize) -> StoreResult<Vec<String>> {
        let conn = self.open_purged()?;
        let mut stmt =
            conn.prepare("SELECT value FROM kv_lists WHERE key = ?1 ORDER BY seq DESC LIMIT ?2")?;
        let rows = stmt
            .query_map(params![key, limit as i64], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(rows)
    }

    fn keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let conn = self.open_purged()?;
        let mut stmt = conn.prepare(
            "SELECT key FROM kv_strings WHERE substr(key, 1, length(?1)) = ?1
             UNION SELECT key FROM kv_zsets WHERE substr(key, 1, length(?1)) = ?1
             UNION SELECT key FROM kv_lists WHERE substr(key, 1, length(?1)) = ?1
             ORDER BY key",
        )?;
        let rows = stmt
            .query_map([prefix], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(rows)
    }
}
