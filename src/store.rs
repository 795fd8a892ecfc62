//! Timestamped key/value stores backing the response cache and the
//! message deduplicator.
//!
//! Two backends:
//! - [`MemoryStore`]: process-local map, the default.
//! - [`SqliteStore`]: a SQLite file, so entries survive restarts and can be
//!   shared by instances on one host.
//!
//! Expiry is the caller's business: stores only remember when an entry was
//! written and purge on request.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntry {
    pub value: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store lock poisoned")]
    Poisoned,
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("invalid stored timestamp {0}")]
    Timestamp(i64),
}

pub trait TtlStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<StoredEntry>, StoreError>;

    /// Insert or overwrite.
    fn put(&self, key: &str, value: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Insert only when `key` is absent, as one step. Returns whether the
    /// entry was written.
    fn insert_if_absent(&self, key: &str, value: &str, at: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Drop every entry written strictly before `cutoff`. Returns how many went.
    fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

    fn len(&self) -> Result<usize, StoreError>;
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, StoredEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TtlStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<StoredEntry>, StoreError> {
        let entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &str, value: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        entries.insert(
            key.to_string(),
            StoredEntry { value: value.to_string(), created_at: at },
        );
        Ok(())
    }

    fn insert_if_absent(&self, key: &str, value: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        match entries.entry(key.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(StoredEntry { value: value.to_string(), created_at: at });
                Ok(true)
            }
        }
    }

    fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        let before = entries.len();
        entries.retain(|_, e| e.created_at >= cutoff);
        Ok(before - entries.len())
    }

    fn len(&self) -> Result<usize, StoreError> {
        Ok(self.entries.lock().map_err(|_| StoreError::Poisoned)?.len())
    }
}

/// SQLite-backed store. Several namespaces can share one file.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    namespace: String,
}

impl SqliteStore {
    pub fn open(path: &Path, namespace: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self::with_connection(conn, namespace)?;
        info!("Opened {} store at {:?} ({} entries)", namespace, path, store.len()?);
        Ok(store)
    }

    pub fn in_memory(namespace: &str) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?, namespace)
    }

    fn with_connection(conn: Connection, namespace: &str) -> Result<Self, StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS ttl_entries (
                namespace TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (namespace, key)
            );

            CREATE INDEX IF NOT EXISTS idx_ttl_entries_created ON ttl_entries(namespace, created_at);
        "#,
        )?;
        Ok(Self { conn: Mutex::new(conn), namespace: namespace.to_string() })
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(ms).single().ok_or(StoreError::Timestamp(ms))
}

impl TtlStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<StoredEntry>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT value, created_at FROM ttl_entries WHERE namespace = ?1 AND key = ?2",
                params![self.namespace, key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match row {
            Some((value, ms)) => Ok(Some(StoredEntry { value, created_at: from_millis(ms)? })),
            None => Ok(None),
        }
    }

    fn put(&self, key: &str, value: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        conn.execute(
            "INSERT OR REPLACE INTO ttl_entries (namespace, key, value, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![self.namespace, key, value, at.timestamp_millis()],
        )?;
        Ok(())
    }

    fn insert_if_absent(&self, key: &str, value: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO ttl_entries (namespace, key, value, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![self.namespace, key, value, at.timestamp_millis()],
        )?;
        Ok(inserted == 1)
    }

    fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let removed = conn.execute(
            "DELETE FROM ttl_entries WHERE namespace = ?1 AND created_at < ?2",
            params![self.namespace, cutoff.timestamp_millis()],
        )?;
        if removed > 0 {
            debug!("Purged {} expired {} entries", removed, self.namespace);
        }
        Ok(removed)
    }

    fn len(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM ttl_entries WHERE namespace = ?1",
            params![self.namespace],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}
