//! SQLite connection setup and versioned schema management.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;
use waypoint_core::{OfflineError, OfflineResult};

/// Where a database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    File(PathBuf),
    Memory,
}

/// A schema a database can be brought up to.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Schema {
    pub name: &'static str,
    pub version: i32,
    pub create: &'static str,
}

/// Durable store schema: two FIFO queues and the keyed lesson cache.
pub(crate) const DURABLE_SCHEMA: Schema = Schema {
    name: "durable",
    version: 1,
    create: r#"
        CREATE TABLE IF NOT EXISTS submissions_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            payload TEXT NOT NULL,
            enqueued_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS progress_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            payload TEXT NOT NULL,
            enqueued_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS lesson_cache (
            id TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        );
    "#,
};

/// Response cache schema: named caches holding request/response snapshots,
/// plus the registration row naming the active generation.
pub(crate) const CACHE_SCHEMA: Schema = Schema {
    name: "caches",
    version: 2,
    create: r#"
        CREATE TABLE IF NOT EXISTS caches (
            name TEXT PRIMARY KEY,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cache_entries (
            cache_name TEXT NOT NULL REFERENCES caches(name) ON DELETE CASCADE,
            request_key TEXT NOT NULL,
            method TEXT NOT NULL,
            url TEXT NOT NULL,
            status INTEGER NOT NULL,
            headers TEXT NOT NULL,
            body BLOB NOT NULL,
            cached_at INTEGER NOT NULL,
            PRIMARY KEY (cache_name, request_key)
        );

        CREATE TABLE IF NOT EXISTS registration (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            active_version TEXT NOT NULL,
            activated_at INTEGER NOT NULL
        );
    "#,
};

pub(crate) fn storage_err(context: &str, e: impl std::fmt::Display) -> OfflineError {
    OfflineError::storage(format!("{}: {}", context, e))
}

/// Open a connection and bring its schema up to date.
pub(crate) fn open_database(location: &StoreLocation, schema: Schema) -> OfflineResult<Connection> {
    let conn = match location {
        StoreLocation::File(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| storage_err("Failed to create data directory", e))?;
            }
            Connection::open(path)
        }
        StoreLocation::Memory => Connection::open_in_memory(),
    }
    .map_err(|e| storage_err(&format!("Failed to open {} database", schema.name), e))?;

    conn.pragma_update(None, "foreign_keys", "ON")
        .map_err(|e| storage_err("Failed to enable foreign keys", e))?;

    migrate(&conn, schema)?;
    Ok(conn)
}

/// Read the applied schema version, 0 for a fresh database.
pub(crate) fn schema_version(conn: &Connection) -> OfflineResult<i32> {
    let table_exists: bool = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='schema_version'",
            [],
            |row| row.get::<_, i32>(0).map(|count| count > 0),
        )
        .map_err(|e| storage_err("Failed to inspect schema", e))?;

    if !table_exists {
        return Ok(0);
    }

    let version = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY id DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| storage_err("Failed to read schema version", e))?
        .unwrap_or(0);

    Ok(version)
}

fn migrate(conn: &Connection, schema: Schema) -> OfflineResult<()> {
    let version = schema_version(conn)?;

    if version > schema.version {
        return Err(OfflineError::storage(format!(
            "{} database is at schema version {}, newer than supported version {}",
            schema.name, version, schema.version
        )));
    }

    if version == schema.version {
        return Ok(());
    }

    tracing::info!(
        database = schema.name,
        from = version,
        to = schema.version,
        "Upgrading schema"
    );

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| storage_err("Failed to start schema transaction", e))?;

    tx.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            version INTEGER NOT NULL,
            applied_at INTEGER NOT NULL
        );
        "#,
    )
    .map_err(|e| storage_err("Failed to create schema_version table", e))?;

    tx.execute_batch(schema.create)
        .map_err(|e| storage_err(&format!("Failed to create {} schema", schema.name), e))?;

    tx.execute(
        "INSERT INTO schema_version (version, applied_at) VALUES (?, ?)",
        params![schema.version, Utc::now().timestamp()],
    )
    .map_err(|e| storage_err("Failed to record schema version", e))?;

    tx.commit()
        .map_err(|e| storage_err("Failed to commit schema", e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_database_is_migrated() {
        let conn = open_database(&StoreLocation::Memory, DURABLE_SCHEMA).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), 1);
    }

    #[test]
    fn test_reopen_does_not_duplicate_version_rows() {
        let dir = tempfile::tempdir().unwrap();
        let location = StoreLocation::File(dir.path().join("nested").join("caches.sqlite3"));

        drop(open_database(&location, CACHE_SCHEMA).unwrap());
        let conn = open_database(&location, CACHE_SCHEMA).unwrap();

        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn test_upgrade_adds_registration_table() {
        let dir = tempfile::tempdir().unwrap();
        let location = StoreLocation::File(dir.path().join("caches.sqlite3"));

        let conn = open_database(&location, CACHE_SCHEMA).unwrap();
        conn.execute_batch(
            "DROP TABLE registration;
             DELETE FROM schema_version;
             INSERT INTO schema_version (version, applied_at) VALUES (1, 0);",
        )
        .unwrap();
        drop(conn);

        let conn = open_database(&location, CACHE_SCHEMA).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), 2);
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM registration", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 0);
    }

    #[test]
    fn test_newer_schema_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let location = StoreLocation::File(dir.path().join("offline.sqlite3"));

        let conn = open_database(&location, DURABLE_SCHEMA).unwrap();
        conn.execute(
            "INSERT INTO schema_version (version, applied_at) VALUES (99, 0)",
            [],
        )
        .unwrap();
        drop(conn);

        let err = open_database(&location, DURABLE_SCHEMA).unwrap_err();
        assert!(matches!(err, OfflineError::StorageUnavailable(_)));
    }
}
