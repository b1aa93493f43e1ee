//! Durable store: write queues and the lesson cache.
//!
//! Queues are append-only with auto-incremented keys, so iteration in key
//! order is insertion order. The lesson cache is keyed by the record's own
//! `id` field and upserts.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value as JsonValue;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, trace, warn};
use waypoint_core::{CachedLesson, OfflineError, OfflineResult, PendingOperation, QueueKind};

use crate::schema::{open_database, storage_err, StoreLocation, DURABLE_SCHEMA};

/// Object stores held by the durable store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreName {
    SubmissionsQueue,
    ProgressQueue,
    LessonCache,
}

impl StoreName {
    pub const ALL: [StoreName; 3] = [
        StoreName::SubmissionsQueue,
        StoreName::ProgressQueue,
        StoreName::LessonCache,
    ];

    /// Queue store backing a queue kind.
    pub fn for_queue(kind: QueueKind) -> Self {
        match kind {
            QueueKind::Submission => StoreName::SubmissionsQueue,
            QueueKind::Progress => StoreName::ProgressQueue,
        }
    }

    pub fn queue_kind(&self) -> Option<QueueKind> {
        match self {
            StoreName::SubmissionsQueue => Some(QueueKind::Submission),
            StoreName::ProgressQueue => Some(QueueKind::Progress),
            StoreName::LessonCache => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StoreName::SubmissionsQueue => "submissionsQueue",
            StoreName::ProgressQueue => "progressQueue",
            StoreName::LessonCache => "lessonCache",
        }
    }

    fn table(&self) -> &'static str {
        match self {
            StoreName::SubmissionsQueue => "submissions_queue",
            StoreName::ProgressQueue => "progress_queue",
            StoreName::LessonCache => "lesson_cache",
        }
    }
}

impl fmt::Display for StoreName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Primary key of a stored record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StoreKey {
    /// Generated key of a queue record.
    Id(i64),
    /// Natural key of a lesson.
    Natural(String),
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKey::Id(id) => write!(f, "{}", id),
            StoreKey::Natural(key) => f.write_str(key),
        }
    }
}

/// A stored record.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreRecord {
    pub key: StoreKey,
    pub value: JsonValue,
}

/// Versioned key-value persistence for the offline worker.
///
/// The connection is opened lazily on first use and reused afterwards; a
/// failed open is retried on the next call.
pub struct DurableStore {
    location: StoreLocation,
    conn: Mutex<Option<Connection>>,
}

impl DurableStore {
    /// Store backed by a database file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_location(StoreLocation::File(path.into()))
    }

    /// Store backed by a private in-memory database.
    pub fn in_memory() -> Self {
        Self::with_location(StoreLocation::Memory)
    }

    pub fn with_location(location: StoreLocation) -> Self {
        Self {
            location,
            conn: Mutex::new(None),
        }
    }

    pub fn location(&self) -> &StoreLocation {
        &self.location
    }

    /// Open the database and create the object stores if absent.
    pub fn open(&self) -> OfflineResult<()> {
        self.lock().map(|_| ())
    }

    fn lock(&self) -> OfflineResult<MutexGuard<'_, Option<Connection>>> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| OfflineError::storage("Durable store lock poisoned"))?;

        if guard.is_none() {
            let conn = open_database(&self.location, DURABLE_SCHEMA)?;
            debug!(location = ?self.location, "Durable store opened");
            *guard = Some(conn);
        }

        Ok(guard)
    }

    fn with_conn<R>(&self, f: impl FnOnce(&mut Connection) -> OfflineResult<R>) -> OfflineResult<R> {
        let mut guard = self.lock()?;
        match guard.as_mut() {
            Some(conn) => f(conn),
            None => Err(OfflineError::storage("Durable store is not open")),
        }
    }

    /// Write a record.
    ///
    /// Queue stores always append under a fresh key. The lesson cache
    /// upserts under the record's `id` field.
    pub fn put(&self, store: StoreName, value: &JsonValue) -> OfflineResult<StoreKey> {
        let serialized = serde_json::to_string(value)?;
        let now = Utc::now().timestamp_millis();

        match store {
            StoreName::LessonCache => {
                let id = value
                    .get("id")
                    .and_then(JsonValue::as_str)
                    .ok_or_else(|| {
                        OfflineError::invalid_record("lessonCache records need a string `id`")
                    })?
                    .to_string();

                self.with_conn(|conn| {
                    conn.execute(
                        "INSERT INTO lesson_cache (id, value, updated_at) VALUES (?, ?, ?)
                         ON CONFLICT(id) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                        params![id, serialized, now],
                    )
                    .map_err(|e| storage_err("Failed to upsert lesson", e))?;
                    Ok(())
                })?;

                trace!(store = %store, key = %id, "Record upserted");
                Ok(StoreKey::Natural(id))
            }
            queue => {
                let id = self.with_conn(|conn| {
                    conn.execute(
                        &format!(
                            "INSERT INTO {} (payload, enqueued_at) VALUES (?, ?)",
                            queue.table()
                        ),
                        params![serialized, now],
                    )
                    .map_err(|e| storage_err("Failed to append record", e))?;
                    Ok(conn.last_insert_rowid())
                })?;

                trace!(store = %queue, key = id, "Record appended");
                Ok(StoreKey::Id(id))
            }
        }
    }

    /// All records of a store, ordered by key ascending. Records whose JSON
    /// no longer parses are skipped.
    pub fn get_all(&self, store: StoreName) -> OfflineResult<Vec<StoreRecord>> {
        let rows: Vec<(StoreKey, String)> = self.with_conn(|conn| {
            let query = match store {
                StoreName::LessonCache => "SELECT id, value FROM lesson_cache ORDER BY id ASC".to_string(),
                queue => format!("SELECT id, payload FROM {} ORDER BY id ASC", queue.table()),
            };

            let mut stmt = conn
                .prepare(&query)
                .map_err(|e| storage_err("Failed to prepare scan", e))?;

            let rows = stmt
                .query_map([], |row| {
                    let key = match store {
                        StoreName::LessonCache => StoreKey::Natural(row.get(0)?),
                        _ => StoreKey::Id(row.get(0)?),
                    };
                    Ok((key, row.get::<_, String>(1)?))
                })
                .map_err(|e| storage_err("Failed to scan store", e))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| storage_err("Failed to read record", e))?;

            Ok(rows)
        })?;

        Ok(rows
            .into_iter()
            .filter_map(|(key, raw)| match serde_json::from_str(&raw) {
                Ok(value) => Some(StoreRecord { key, value }),
                Err(e) => {
                    warn!(store = %store, key = %key, error = %e, "Skipping unreadable record");
                    None
                }
            })
            .collect())
    }

    /// A single record by key.
    pub fn get(&self, store: StoreName, key: &StoreKey) -> OfflineResult<Option<JsonValue>> {
        let raw: Option<String> = self.with_conn(|conn| match (store, key) {
            (StoreName::LessonCache, StoreKey::Natural(id)) => conn
                .query_row(
                    "SELECT value FROM lesson_cache WHERE id = ?",
                    [id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| storage_err("Failed to read lesson", e)),
            (StoreName::LessonCache, StoreKey::Id(_)) => Ok(None),
            (queue, StoreKey::Id(id)) => conn
                .query_row(
                    &format!("SELECT payload FROM {} WHERE id = ?", queue.table()),
                    [id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| storage_err("Failed to read record", e)),
            (_, StoreKey::Natural(_)) => Ok(None),
        })?;

        raw.map(|raw| serde_json::from_str(&raw).map_err(OfflineError::from))
            .transpose()
    }

    /// Delete a record. Returns whether it existed.
    pub fn delete(&self, store: StoreName, key: &StoreKey) -> OfflineResult<bool> {
        let removed = self.with_conn(|conn| {
            let removed = match key {
                StoreKey::Id(id) => conn.execute(
                    &format!("DELETE FROM {} WHERE id = ?", store.table()),
                    params![id],
                ),
                StoreKey::Natural(id) => conn.execute(
                    &format!("DELETE FROM {} WHERE id = ?", store.table()),
                    params![id],
                ),
            }
            .map_err(|e| storage_err("Failed to delete record", e))?;
            Ok(removed > 0)
        })?;

        trace!(store = %store, key = %key, removed, "Record deleted");
        Ok(removed)
    }

    /// Remove every record of a store.
    pub fn clear(&self, store: StoreName) -> OfflineResult<()> {
        self.with_conn(|conn| {
            conn.execute(&format!("DELETE FROM {}", store.table()), [])
                .map_err(|e| storage_err("Failed to clear store", e))?;
            Ok(())
        })?;
        debug!(store = %store, "Store cleared");
        Ok(())
    }

    pub fn count(&self, store: StoreName) -> OfflineResult<usize> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT COUNT(*) FROM {}", store.table()),
                [],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as usize)
            .map_err(|e| storage_err("Failed to count records", e))
        })
    }

    // ==================== Queues ====================

    /// Append a failed write to its queue, returning its id.
    pub fn enqueue(&self, kind: QueueKind, payload: &JsonValue) -> OfflineResult<i64> {
        match self.put(StoreName::for_queue(kind), payload)? {
            StoreKey::Id(id) => Ok(id),
            StoreKey::Natural(key) => Err(OfflineError::invalid_record(format!(
                "queue returned natural key {}",
                key
            ))),
        }
    }

    /// Pending operations of one queue in FIFO order.
    pub fn pending(&self, kind: QueueKind) -> OfflineResult<Vec<PendingOperation>> {
        let records = self.get_all(StoreName::for_queue(kind))?;
        Ok(records
            .into_iter()
            .filter_map(|record| match record.key {
                StoreKey::Id(id) => Some(PendingOperation {
                    id,
                    kind,
                    payload: record.value,
                }),
                StoreKey::Natural(_) => None,
            })
            .collect())
    }

    /// Remove an acknowledged operation.
    pub fn remove_pending(&self, kind: QueueKind, id: i64) -> OfflineResult<bool> {
        self.delete(StoreName::for_queue(kind), &StoreKey::Id(id))
    }

    // ==================== Lessons ====================

    pub fn upsert_lesson(&self, lesson: &CachedLesson) -> OfflineResult<()> {
        self.put(StoreName::LessonCache, &serde_json::to_value(lesson)?)?;
        Ok(())
    }

    /// Upsert a batch of lessons in one transaction.
    pub fn upsert_lessons(&self, lessons: &[CachedLesson]) -> OfflineResult<usize> {
        let now = Utc::now().timestamp_millis();
        let rows = lessons
            .iter()
            .map(|lesson| Ok((lesson.id.clone(), serde_json::to_string(lesson)?)))
            .collect::<OfflineResult<Vec<_>>>()?;

        self.with_conn(|conn| {
            let tx = conn
                .transaction()
                .map_err(|e| storage_err("Failed to start lesson transaction", e))?;
            for (id, value) in &rows {
                tx.execute(
                    "INSERT INTO lesson_cache (id, value, updated_at) VALUES (?, ?, ?)
                     ON CONFLICT(id) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                    params![id, value, now],
                )
                .map_err(|e| storage_err("Failed to upsert lesson", e))?;
            }
            tx.commit()
                .map_err(|e| storage_err("Failed to commit lessons", e))
        })?;

        debug!(count = rows.len(), "Lessons cached");
        Ok(rows.len())
    }

    pub fn lesson(&self, id: &str) -> OfflineResult<Option<CachedLesson>> {
        self.get(StoreName::LessonCache, &StoreKey::Natural(id.to_string()))?
            .map(|value| serde_json::from_value(value).map_err(OfflineError::from))
            .transpose()
    }

    pub fn lessons(&self) -> OfflineResult<Vec<CachedLesson>> {
        self.get_all(StoreName::LessonCache)?
            .into_iter()
            .map(|record| serde_json::from_value(record.value).map_err(OfflineError::from))
            .collect()
    }
}

impl fmt::Debug for DurableStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DurableStore")
            .field("location", &self.location)
            .finish()
    }
}
