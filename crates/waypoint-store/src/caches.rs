//! Named response caches.
//!
//! ```text
//! CacheStorage
//!     └── Cache (static-v3, runtime-v3, ...)
//!             └── "GET <url>" → CacheEntry
//! ```

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, trace};
use waypoint_core::{OfflineError, OfflineResult};

use crate::schema::{open_database, storage_err, StoreLocation, CACHE_SCHEMA};

/// Normalized cache key: upper-case method plus the URL without fragment.
pub fn request_key(method: &str, url: &str) -> String {
    let url = url.split('#').next().unwrap_or(url);
    format!("{} {}", method.to_ascii_uppercase(), url)
}

/// A cached request/response pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request method.
    pub method: String,

    /// Request URL.
    pub url: String,

    /// Response status.
    pub status: u16,

    /// Response headers in arrival order.
    pub headers: Vec<(String, String)>,

    /// Response body.
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: i64,
}

impl CacheEntry {
    pub fn request_key(&self) -> String {
        request_key(&self.method, &self.url)
    }

    /// Only successful GET responses are ever stored.
    pub fn is_storable(&self) -> bool {
        self.method.eq_ignore_ascii_case("GET") && self.status == 200
    }
}

type SharedConnection = Arc<Mutex<Connection>>;

fn lock(conn: &SharedConnection) -> OfflineResult<MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|_| OfflineError::storage("Cache storage lock poisoned"))
}

/// Cache storage (the set of named caches).
#[derive(Clone)]
pub struct CacheStorage {
    conn: SharedConnection,
}

impl CacheStorage {
    /// Open cache storage backed by a database file.
    pub fn open(path: impl Into<PathBuf>) -> OfflineResult<Self> {
        Self::with_location(StoreLocation::File(path.into()))
    }

    /// Cache storage in a private in-memory database.
    pub fn in_memory() -> OfflineResult<Self> {
        Self::with_location(StoreLocation::Memory)
    }

    pub fn with_location(location: StoreLocation) -> OfflineResult<Self> {
        let conn = open_database(&location, CACHE_SCHEMA)?;
        debug!(location = ?location, "Cache storage opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open a cache (creates if doesn't exist).
    pub fn open_cache(&self, name: &str) -> OfflineResult<Cache> {
        {
            let conn = lock(&self.conn)?;
            ensure_cache(&conn, name)?;
        }
        Ok(Cache {
            name: name.to_string(),
            conn: Arc::clone(&self.conn),
        })
    }

    /// Check if cache exists.
    pub fn has(&self, name: &str) -> OfflineResult<bool> {
        let conn = lock(&self.conn)?;
        cache_exists(&conn, name)
    }

    /// Delete a cache and all its entries.
    pub fn delete(&self, name: &str) -> OfflineResult<bool> {
        let conn = lock(&self.conn)?;
        let removed = conn
            .execute("DELETE FROM caches WHERE name = ?", [name])
            .map_err(|e| storage_err("Failed to delete cache", e))?;
        if removed > 0 {
            debug!(cache = name, "Cache deleted");
        }
        Ok(removed > 0)
    }

    /// Version recorded by the last activation, if any.
    pub fn active_generation(&self) -> OfflineResult<Option<String>> {
        let conn = lock(&self.conn)?;
        conn.query_row(
            "SELECT active_version FROM registration WHERE id = 1",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| storage_err("Failed to read registration", e))
    }

    /// Record `version` as the active generation.
    pub fn record_activation(&self, version: &str) -> OfflineResult<()> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT INTO registration (id, active_version, activated_at) VALUES (1, ?, ?)
             ON CONFLICT(id) DO UPDATE SET active_version = excluded.active_version,
                                           activated_at = excluded.activated_at",
            params![version, Utc::now().timestamp_millis()],
        )
        .map_err(|e| storage_err("Failed to record activation", e))?;
        debug!(version, "Activation recorded");
        Ok(())
    }

    /// Get all cache names in creation order.
    pub fn keys(&self) -> OfflineResult<Vec<String>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn
            .prepare("SELECT name FROM caches ORDER BY created_at ASC, name ASC")
            .map_err(|e| storage_err("Failed to list caches", e))?;
        let names = stmt
            .query_map([], |row| row.get(0))
            .map_err(|e| storage_err("Failed to list caches", e))?
            .collect::<Result<Vec<String>, _>>()
            .map_err(|e| storage_err("Failed to read cache name", e))?;
        Ok(names)
    }
}

impl fmt::Debug for CacheStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStorage").finish_non_exhaustive()
    }
}

fn ensure_cache(conn: &Connection, name: &str) -> OfflineResult<()> {
    conn.execute(
        "INSERT OR IGNORE INTO caches (name, created_at) VALUES (?, ?)",
        params![name, Utc::now().timestamp_millis()],
    )
    .map_err(|e| storage_err("Failed to create cache", e))?;
    Ok(())
}

fn cache_exists(conn: &Connection, name: &str) -> OfflineResult<bool> {
    conn.query_row("SELECT 1 FROM caches WHERE name = ?", [name], |_| Ok(()))
        .optional()
        .map(|found| found.is_some())
        .map_err(|e| storage_err("Failed to look up cache", e))
}

fn insert_entry(conn: &Connection, cache: &str, entry: &CacheEntry) -> OfflineResult<()> {
    let headers = serde_json::to_string(&entry.headers)?;
    conn.execute(
        "INSERT OR REPLACE INTO cache_entries
            (cache_name, request_key, method, url, status, headers, body, cached_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            cache,
            entry.request_key(),
            entry.method.to_ascii_uppercase(),
            entry.url,
            entry.status,
            headers,
            entry.body,
            entry.cached_at
        ],
    )
    .map_err(|e| storage_err("Failed to store cache entry", e))?;
    Ok(())
}

/// A single named cache.
#[derive(Clone)]
pub struct Cache {
    name: String,
    conn: SharedConnection,
}

impl Cache {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Match a request.
    pub fn match_request(&self, method: &str, url: &str) -> OfflineResult<Option<CacheEntry>> {
        let key = request_key(method, url);
        let row = {
            let conn = lock(&self.conn)?;
            conn.query_row(
                "SELECT method, url, status, headers, body, cached_at
                 FROM cache_entries WHERE cache_name = ? AND request_key = ?",
                params![self.name, key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, u16>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Vec<u8>>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| storage_err("Failed to match request", e))?
        };

        let Some((method, url, status, headers, body, cached_at)) = row else {
            trace!(cache = %self.name, key = %key, "Cache miss");
            return Ok(None);
        };

        trace!(cache = %self.name, key = %key, "Cache hit");
        Ok(Some(CacheEntry {
            method,
            url,
            status,
            headers: serde_json::from_str(&headers)?,
            body,
            cached_at,
        }))
    }

    /// Store an entry, replacing any previous snapshot for the same request.
    ///
    /// Entries that are not successful GET responses are skipped, as are
    /// writes into a cache deleted since it was opened. The return value
    /// tells whether anything was written.
    pub fn put(&self, entry: &CacheEntry) -> OfflineResult<bool> {
        if !entry.is_storable() {
            trace!(
                cache = %self.name,
                method = %entry.method,
                status = entry.status,
                "Refusing to cache entry"
            );
            return Ok(false);
        }

        let conn = lock(&self.conn)?;
        if !cache_exists(&conn, &self.name)? {
            debug!(cache = %self.name, url = %entry.url, "Cache was deleted, dropping write");
            return Ok(false);
        }
        insert_entry(&conn, &self.name, entry)?;
        trace!(cache = %self.name, url = %entry.url, "Entry stored");
        Ok(true)
    }

    /// Store a batch of entries atomically: either all are written or none.
    /// Fails if the cache was deleted since it was opened.
    pub fn put_all(&self, entries: &[CacheEntry]) -> OfflineResult<usize> {
        if let Some(bad) = entries.iter().find(|e| !e.is_storable()) {
            return Err(OfflineError::invalid_record(format!(
                "{} {} with status {} cannot be cached",
                bad.method, bad.url, bad.status
            )));
        }

        let mut conn = lock(&self.conn)?;
        let tx = conn
            .transaction()
            .map_err(|e| storage_err("Failed to start cache transaction", e))?;
        if !cache_exists(&tx, &self.name)? {
            return Err(OfflineError::storage(format!(
                "cache {} was deleted before its entries were stored",
                self.name
            )));
        }
        for entry in entries {
            insert_entry(&tx, &self.name, entry)?;
        }
        tx.commit()
            .map_err(|e| storage_err("Failed to commit cache entries", e))?;

        debug!(cache = %self.name, count = entries.len(), "Entries stored");
        Ok(entries.len())
    }

    /// Delete an entry.
    pub fn delete(&self, method: &str, url: &str) -> OfflineResult<bool> {
        let conn = lock(&self.conn)?;
        let removed = conn
            .execute(
                "DELETE FROM cache_entries WHERE cache_name = ? AND request_key = ?",
                params![self.name, request_key(method, url)],
            )
            .map_err(|e| storage_err("Failed to delete cache entry", e))?;
        Ok(removed > 0)
    }

    /// Get all request keys.
    pub fn keys(&self) -> OfflineResult<Vec<String>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn
            .prepare("SELECT request_key FROM cache_entries WHERE cache_name = ? ORDER BY request_key")
            .map_err(|e| storage_err("Failed to list cache entries", e))?;
        let keys = stmt
            .query_map([&self.name], |row| row.get(0))
            .map_err(|e| storage_err("Failed to list cache entries", e))?
            .collect::<Result<Vec<String>, _>>()
            .map_err(|e| storage_err("Failed to read cache key", e))?;
        Ok(keys)
    }

    pub fn len(&self) -> OfflineResult<usize> {
        let conn = lock(&self.conn)?;
        conn.query_row(
            "SELECT COUNT(*) FROM cache_entries WHERE cache_name = ?",
            [&self.name],
            |row| row.get::<_, i64>(0),
        )
        .map(|n| n as usize)
        .map_err(|e| storage_err("Failed to count cache entries", e))
    }

    pub fn is_empty(&self) -> OfflineResult<bool> {
        Ok(self.len()? == 0)
    }
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache").field("name", &self.name).finish()
    }
}
