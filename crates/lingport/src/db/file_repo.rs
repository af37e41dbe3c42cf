//! Project file repository: CRUD operations for `project_files`.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use super::{parse_column, DatabaseError};
use crate::model::{FileRole, ImportStatus};

/// A project file row from the registry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRow {
    pub id: String,
    pub project_id: String,
    pub original_name: String,
    pub source_path: String,
    pub extension: String,
    pub role: FileRole,
    pub import_status: ImportStatus,
    pub import_error: Option<String>,
    /// Path relative to the project root; set once the file is promoted.
    pub rel_path: Option<String>,
    pub checksum: Option<String>,
    pub size_bytes: Option<i64>,
    pub position: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl FileRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            project_id: row.get("project_id")?,
            original_name: row.get("original_name")?,
            source_path: row.get("source_path")?,
            extension: row.get("extension")?,
            role: parse_column(row, "role", FileRole::parse)?,
            import_status: parse_column(row, "import_status", ImportStatus::parse)?,
            import_error: row.get("import_error")?,
            rel_path: row.get("rel_path")?,
            checksum: row.get("checksum")?,
            size_bytes: row.get("size_bytes")?,
            position: row.get("position")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    /// Imported processable files are the only ones the planner converts.
    pub fn is_convertible(&self) -> bool {
        self.role == FileRole::Processable && self.import_status == ImportStatus::Imported
    }
}

/// Inserts a new file row.
pub fn insert(conn: &Connection, file: &FileRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO project_files (id, project_id, original_name, source_path, extension, role,
         import_status, import_error, rel_path, checksum, size_bytes, position, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            file.id,
            file.project_id,
            file.original_name,
            file.source_path,
            file.extension,
            file.role.as_str(),
            file.import_status.as_str(),
            file.import_error,
            file.rel_path,
            file.checksum,
            file.size_bytes,
            file.position,
            file.created_at,
            file.updated_at,
        ],
    )?;
    Ok(())
}

/// Finds a file by its ID.
pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<FileRow>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM project_files WHERE id = ?1",
            params![id],
            FileRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Lists a project's files in declaration order.
pub fn list_by_project(conn: &Connection, project_id: &str) -> Result<Vec<FileRow>, DatabaseError> {
    let mut stmt =
        conn.prepare("SELECT * FROM project_files WHERE project_id = ?1 ORDER BY position")?;
    let rows = stmt
        .query_map(params![project_id], FileRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Position the next appended file should take.
pub fn next_position(conn: &Connection, project_id: &str) -> Result<i64, DatabaseError> {
    let next: i64 = conn.query_row(
        "SELECT COALESCE(MAX(position) + 1, 0) FROM project_files WHERE project_id = ?1",
        params![project_id],
        |r| r.get(0),
    )?;
    Ok(next)
}

/// Records a successful promotion of the file into the project root.
pub fn mark_imported(
    conn: &Connection,
    id: &str,
    rel_path: &str,
    checksum: &str,
    size_bytes: i64,
    updated_at: &str,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE project_files SET import_status = 'imported', import_error = NULL,
         rel_path = ?2, checksum = ?3, size_bytes = ?4, updated_at = ?5
         WHERE id = ?1",
        params![id, rel_path, checksum, size_bytes, updated_at],
    )?;
    Ok(())
}

pub fn mark_failed(
    conn: &Connection,
    id: &str,
    error: &str,
    updated_at: &str,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE project_files SET import_status = 'failed', import_error = ?2, updated_at = ?3
         WHERE id = ?1",
        params![id, error, updated_at],
    )?;
    Ok(())
}

/// Changes a file's role and, when it has been moved, its relative path.
pub fn update_role(
    conn: &Connection,
    id: &str,
    role: FileRole,
    rel_path: Option<&str>,
    updated_at: &str,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE project_files SET role = ?2, rel_path = COALESCE(?3, rel_path), updated_at = ?4
         WHERE id = ?1",
        params![id, role.as_str(), rel_path, updated_at],
    )?;
    Ok(())
}

/// Deletes a file row. Its conversion tasks go with it.
pub fn delete(conn: &Connection, id: &str) -> Result<usize, DatabaseError> {
    let removed = conn.execute("DELETE FROM project_files WHERE id = ?1", params![id])?;
    Ok(removed)
}
