//! database.rs
//!
//! SQLite connection handle shared by the ledger, the package store, the
//! outbox and the scheduler lease. Every multi-statement change runs inside a
//! `BEGIN IMMEDIATE` transaction, which takes SQLite's write lock up front and
//! serializes concurrent writers, including other processes on the same file.

use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use log::{debug, info};

use crate::config::DatabaseConfig;
use crate::error::{EngineError, Result};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS file_request (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    request_type TEXT NOT NULL,
    checksum TEXT NOT NULL,
    algorithm TEXT NOT NULL,
    storage TEXT NOT NULL,
    sub_directory TEXT,
    origin_url TEXT,
    file_name TEXT,
    file_size INTEGER NOT NULL DEFAULT 0,
    session_owner TEXT,
    session TEXT,
    status TEXT NOT NULL,
    error_cause TEXT,
    creation_date INTEGER NOT NULL,
    UNIQUE(request_type, checksum, storage)
);
CREATE INDEX IF NOT EXISTS file_request_status ON file_request(request_type, status, id);

CREATE TABLE IF NOT EXISTS file_request_owner (
    request_id INTEGER NOT NULL REFERENCES file_request(id) ON DELETE CASCADE,
    owner TEXT NOT NULL,
    PRIMARY KEY (request_id, owner)
);

CREATE TABLE IF NOT EXISTS file_request_group (
    request_id INTEGER NOT NULL REFERENCES file_request(id) ON DELETE CASCADE,
    group_id TEXT NOT NULL,
    PRIMARY KEY (request_id, group_id)
);

CREATE TABLE IF NOT EXISTS request_group (
    id TEXT PRIMARY KEY,
    request_type TEXT NOT NULL,
    expected INTEGER NOT NULL,
    creation_date INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS request_result_info (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    group_id TEXT NOT NULL REFERENCES request_group(id) ON DELETE CASCADE,
    request_type TEXT NOT NULL,
    result_file_url TEXT,
    request_checksum TEXT NOT NULL,
    request_storage TEXT NOT NULL,
    error INTEGER NOT NULL,
    error_cause TEXT,
    UNIQUE(group_id, request_checksum, request_storage)
);

CREATE TABLE IF NOT EXISTS package_reference (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    storage TEXT NOT NULL,
    storage_subdirectory TEXT NOT NULL,
    size INTEGER NOT NULL,
    status TEXT NOT NULL,
    archive_name TEXT NOT NULL UNIQUE,
    stored_url TEXT,
    error_cause TEXT,
    creation_date INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS package_single_building
    ON package_reference(storage, storage_subdirectory) WHERE status = 'BUILDING';
CREATE INDEX IF NOT EXISTS package_status ON package_reference(status, id);

CREATE TABLE IF NOT EXISTS file_in_building_package (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source TEXT NOT NULL,
    storage_request_id INTEGER NOT NULL,
    storage TEXT NOT NULL,
    checksum TEXT NOT NULL,
    filename TEXT NOT NULL,
    storage_subdirectory TEXT NOT NULL,
    final_archive_parent_url TEXT NOT NULL,
    final_archive_parent_path TEXT NOT NULL,
    origin_url TEXT,
    size INTEGER NOT NULL,
    status TEXT NOT NULL,
    package_id INTEGER REFERENCES package_reference(id),
    error_cause TEXT,
    creation_date INTEGER NOT NULL,
    UNIQUE(source, storage_request_id)
);
CREATE INDEX IF NOT EXISTS building_file_status ON file_in_building_package(status, id);
CREATE INDEX IF NOT EXISTS building_file_package ON file_in_building_package(package_id);

CREATE TABLE IF NOT EXISTS event_outbox (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    payload BLOB NOT NULL,
    creation_date INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS scheduler_lease (
    name TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    expires_at INTEGER NOT NULL,
    dirty INTEGER NOT NULL DEFAULT 0
);
";

/// Shared SQLite handle.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open the database described by the configuration, creating it if needed.
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        let path = Path::new(&config.db_path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        info!("Opening ledger database at {}", path.display());
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
        if config.wal_mode {
            let mode: String =
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            debug!("Journal mode set to {}", mode);
        }
        Self::from_connection(conn)
    }

    /// Open a database file with default settings.
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        let config = DatabaseConfig {
            db_path: path.as_ref().to_string_lossy().into_owned(),
            ..DatabaseConfig::default()
        };
        Self::open(&config)
    }

    /// Private in-memory database, used by tests and the mock setup.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        debug!("Ledger schema ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| EngineError::Internal("database connection mutex poisoned".into()))
    }

    /// Run read-only or single-statement work on the connection.
    pub fn with_conn<T>(&self, work: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock()?;
        work(&conn)
    }

    /// Run `work` in an immediate transaction, committing on `Ok` and rolling
    /// back on `Err`.
    pub fn immediate<T>(&self, work: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = work(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_failed_transaction_rolls_back() {
        let db = Database::open_in_memory().unwrap();
        let result: Result<()> = db.immediate(|tx| {
            tx.execute(
                "INSERT INTO scheduler_lease (name, owner, expires_at) VALUES ('a', 'b', 0)",
                [],
            )?;
            Err(EngineError::Internal("abort".into()))
        });
        assert!(result.is_err());
        let count: i64 = db
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM scheduler_lease", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_single_building_package_per_key() {
        let db = Database::open_in_memory().unwrap();
        let insert = "INSERT INTO package_reference
            (storage, storage_subdirectory, size, status, archive_name, creation_date)
            VALUES ('tape', 'dir', 0, ?1, ?2, 0)";
        db.with_conn(|conn| {
            conn.execute(insert, rusqlite::params!["BUILDING", "a1"])?;
            conn.execute(insert, rusqlite::params!["TO_STORE", "a2"])?;
            Ok(())
        })
        .unwrap();
        let second_building = db.with_conn(|conn| {
            conn.execute(insert, rusqlite::params!["BUILDING", "a3"])?;
            Ok(())
        });
        assert!(matches!(second_building, Err(EngineError::Database(_))));
    }
}
