//! Artifact registry: the authoritative store for projects, files and
//! conversion task cycles.
//!
//! Uses rusqlite (SQLite). All mutations go through a single writer
//! connection and run inside one transaction per call. File-backed
//! databases also get a read-only connection in WAL mode so lookups do
//! not wait behind the writer.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, OpenFlags, Transaction};

pub mod error;
pub mod file_repo;
pub mod migrations;
pub mod project_repo;
pub mod task_repo;

pub use error::DatabaseError;

const BUSY_TIMEOUT_MS: u32 = 5_000;

/// Thread-safe registry handle.
///
/// Cloning is cheap (inner `Arc`s). Writes are serialized through the
/// writer `Mutex`; reads use their own connection when one exists.
#[derive(Clone)]
pub struct Database {
    writer: Arc<Mutex<Connection>>,
    reader: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens (or creates) the database at the given path and runs all
    /// pending migrations.
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DatabaseError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(&format!(
            "PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout={};",
            BUSY_TIMEOUT_MS
        ))?;

        migrations::run_all(&conn)?;

        let reader = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        reader.execute_batch(&format!("PRAGMA busy_timeout={};", BUSY_TIMEOUT_MS))?;

        log::info!("Registry opened at {}", path.display());

        Ok(Self {
            writer: Arc::new(Mutex::new(conn)),
            reader: Arc::new(Mutex::new(reader)),
        })
    }

    /// Opens an in-memory database for testing. Runs all migrations.
    ///
    /// Reads and writes share the one connection.
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        migrations::run_all(&conn)?;

        let shared = Arc::new(Mutex::new(conn));
        Ok(Self {
            writer: Arc::clone(&shared),
            reader: shared,
        })
    }

    /// Runs a read-only closure against the reader connection.
    ///
    /// Must not be called from inside [`Database::write`].
    pub fn read<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Connection) -> Result<T, E>,
        E: From<DatabaseError>,
    {
        let conn = self
            .reader
            .lock()
            .map_err(|_| E::from(DatabaseError::LockPoisoned))?;
        f(&conn)
    }

    /// Runs a closure inside a transaction on the writer connection.
    ///
    /// Commits when the closure returns `Ok`; any `Err` rolls back every
    /// statement the closure executed.
    pub fn write<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, E>,
        E: From<DatabaseError>,
    {
        let mut conn = self
            .writer
            .lock()
            .map_err(|_| E::from(DatabaseError::LockPoisoned))?;
        let tx = conn
            .transaction()
            .map_err(|e| E::from(DatabaseError::from(e)))?;
        let value = f(&tx)?;
        tx.commit().map_err(|e| E::from(DatabaseError::from(e)))?;
        Ok(value)
    }
}

/// Returns the canonical database path: `~/.lingport/data/lingport.db`.
pub fn default_database_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".lingport").join("data").join("lingport.db"))
}

/// Current UTC time in the RFC 3339 form stored in every timestamp column.
pub fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Reads a column holding one of the string enums from [`crate::model`].
pub(crate) fn parse_column<T>(
    row: &rusqlite::Row<'_>,
    column: &'static str,
    parse: fn(&str) -> Option<T>,
) -> Result<T, rusqlite::Error> {
    let raw: String = row.get(column)?;
    parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(DatabaseError::CorruptValue { column, value: raw }),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn migration_count(conn: &Connection) -> Result<u32, DatabaseError> {
        Ok(conn.query_row("SELECT COUNT(*) FROM _migrations", [], |r| r.get(0))?)
    }

    #[test]
    fn test_open_in_memory() {
        let db = Database::open_in_memory().unwrap();
        let count = db.read(migration_count).unwrap();
        assert!(count > 0);
    }

    #[test]
    fn test_open_file_db_reader_sees_commits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("registry.db");
        let db = Database::open(&path).unwrap();
        assert!(path.exists());

        db.write(|tx| -> Result<(), DatabaseError> {
            tx.execute(
                "INSERT INTO projects (id, name, folder_name, root_path, created_at, updated_at)
                 VALUES ('p1', 'Demo', 'demo', '/tmp/demo', 'now', 'now')",
                [],
            )?;
            Ok(())
        })
        .unwrap();

        let count: u32 = db
            .read(|conn| -> Result<u32, DatabaseError> {
                Ok(conn.query_row("SELECT COUNT(*) FROM projects", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_reader_is_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("registry.db")).unwrap();
        let result = db.read(|conn| -> Result<(), DatabaseError> {
            conn.execute("DELETE FROM projects", [])?;
            Ok(())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_write_rolls_back_on_error() {
        let db = Database::open_in_memory().unwrap();
        let result = db.write(|tx| -> Result<(), DatabaseError> {
            tx.execute(
                "INSERT INTO projects (id, name, folder_name, root_path, created_at, updated_at)
                 VALUES ('p1', 'Demo', 'demo', '/tmp/demo', 'now', 'now')",
                [],
            )?;
            Err(DatabaseError::Migration {
                version: 0,
                reason: "forced".to_string(),
            })
        });
        assert!(result.is_err());

        let count: u32 = db
            .read(|conn| -> Result<u32, DatabaseError> {
                Ok(conn.query_row("SELECT COUNT(*) FROM projects", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_default_database_path() {
        let path = default_database_path().unwrap();
        assert!(path.ends_with("lingport.db"));
        assert!(path.to_string_lossy().contains(".lingport"));
    }

    #[test]
    fn test_now_timestamp_parses() {
        let ts = now_timestamp();
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok());
    }
}
