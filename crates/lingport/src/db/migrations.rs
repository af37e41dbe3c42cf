//! Registry migration system.
//!
//! Tracks applied migrations in a `_migrations` table and applies
//! pending ones in order.

use rusqlite::Connection;

use super::error::DatabaseError;

/// A single migration definition.
struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

/// All migrations in order. Each is applied at most once.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "create_projects_tables",
        sql: include_str!("sql/001_create_projects.sql"),
    },
    Migration {
        version: 2,
        description: "create_project_files_table",
        sql: include_str!("sql/002_create_project_files.sql"),
    },
    Migration {
        version: 3,
        description: "create_conversion_tasks_table",
        sql: include_str!("sql/003_create_conversion_tasks.sql"),
    },
];

/// Runs all pending migrations on the given connection.
pub fn run_all(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    let current_version: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |r| r.get(0),
    )?;

    for migration in MIGRATIONS {
        if migration.version <= current_version {
            continue;
        }

        log::info!(
            "Running migration v{}: {}",
            migration.version,
            migration.description
        );

        conn.execute_batch(migration.sql)
            .map_err(|e| DatabaseError::Migration {
                version: migration.version,
                reason: e.to_string(),
            })?;

        conn.execute(
            "INSERT INTO _migrations (version, description) VALUES (?1, ?2)",
            rusqlite::params![migration.version, migration.description],
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn migrated() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys=ON;").unwrap();
        run_all(&conn).unwrap();
        conn
    }

    #[test]
    fn test_migrations_run_on_fresh_db() {
        let conn = migrated();
        let count: u32 = conn
            .query_row("SELECT COUNT(*) FROM _migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as u32);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = migrated();
        run_all(&conn).unwrap();

        let count: u32 = conn
            .query_row("SELECT COUNT(*) FROM _migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as u32);
    }

    #[test]
    fn test_conversion_tasks_has_derived_path() {
        let conn = migrated();
        let columns: Vec<String> = conn
            .prepare("PRAGMA table_info(conversion_tasks)")
            .unwrap()
            .query_map([], |row| row.get(1))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert!(columns.iter().any(|c| c == "derived_rel_path"));
    }

    #[test]
    fn test_deleting_project_cascades() {
        let conn = migrated();
        conn.execute_batch(
            "INSERT INTO projects (id, name, folder_name, root_path, created_at, updated_at)
                 VALUES ('p1', 'Demo', 'demo', '/tmp/demo', 'now', 'now');
             INSERT INTO project_language_pairs (project_id, source_tag, target_tag, position)
                 VALUES ('p1', 'en-US', 'it-IT', 0);
             INSERT INTO project_files (id, project_id, original_name, source_path, extension, position, created_at, updated_at)
                 VALUES ('f1', 'p1', 'a.docx', '/src/a.docx', 'docx', 0, 'now', 'now');
             INSERT INTO conversion_tasks (id, project_id, file_id, source_tag, target_tag, format, format_version, source_checksum, output_rel_path, created_at, updated_at)
                 VALUES ('t1', 'p1', 'f1', 'en-US', 'it-IT', 'xliff', '2.0', 'abc', 'artifacts/x.xlf', 'now', 'now');
             DELETE FROM projects WHERE id = 'p1';",
        )
        .unwrap();

        for table in ["project_language_pairs", "project_files", "conversion_tasks"] {
            let count: u32 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))
                .unwrap();
            assert_eq!(count, 0, "{} should be empty", table);
        }
    }
}
