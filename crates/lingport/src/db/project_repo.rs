//! Project repository: `projects`, `project_subjects` and
//! `project_language_pairs`.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use super::{parse_column, DatabaseError};
use crate::model::{LanguagePair, ProjectStatus};

/// A project row from the registry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRow {
    pub id: String,
    pub name: String,
    pub folder_name: String,
    pub root_path: String,
    pub status: ProjectStatus,
    pub created_at: String,
    pub updated_at: String,
}

impl ProjectRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            folder_name: row.get("folder_name")?,
            root_path: row.get("root_path")?,
            status: parse_column(row, "status", ProjectStatus::parse)?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Inserts a new project row.
pub fn insert(conn: &Connection, project: &ProjectRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO projects (id, name, folder_name, root_path, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            project.id,
            project.name,
            project.folder_name,
            project.root_path,
            project.status.as_str(),
            project.created_at,
            project.updated_at,
        ],
    )?;
    Ok(())
}

/// Finds a project by its ID.
pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<ProjectRow>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM projects WHERE id = ?1",
            params![id],
            ProjectRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Whether any project already uses the given folder name.
pub fn folder_exists(conn: &Connection, folder_name: &str) -> Result<bool, DatabaseError> {
    let count: u32 = conn.query_row(
        "SELECT COUNT(*) FROM projects WHERE folder_name = ?1",
        params![folder_name],
        |r| r.get(0),
    )?;
    Ok(count > 0)
}

/// Lists all projects, newest first.
pub fn list(conn: &Connection) -> Result<Vec<ProjectRow>, DatabaseError> {
    let mut stmt = conn.prepare("SELECT * FROM projects ORDER BY created_at DESC, rowid DESC")?;
    let rows = stmt
        .query_map([], ProjectRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Updates only the status and updated_at of a project.
///
/// Returns the number of rows touched (0 when the project is gone).
pub fn update_status(
    conn: &Connection,
    id: &str,
    status: ProjectStatus,
    updated_at: &str,
) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE projects SET status = ?2, updated_at = ?3 WHERE id = ?1",
        params![id, status.as_str(), updated_at],
    )?;
    Ok(changed)
}

pub fn insert_subjects(
    conn: &Connection,
    project_id: &str,
    subjects: &[String],
) -> Result<(), DatabaseError> {
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO project_subjects (project_id, subject) VALUES (?1, ?2)",
    )?;
    for subject in subjects {
        stmt.execute(params![project_id, subject])?;
    }
    Ok(())
}

pub fn list_subjects(conn: &Connection, project_id: &str) -> Result<Vec<String>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT subject FROM project_subjects WHERE project_id = ?1 ORDER BY rowid",
    )?;
    let subjects = stmt
        .query_map(params![project_id], |r| r.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(subjects)
}

/// Appends language pairs after any already declared for the project.
pub fn insert_language_pairs(
    conn: &Connection,
    project_id: &str,
    pairs: &[LanguagePair],
) -> Result<(), DatabaseError> {
    let next: i64 = conn.query_row(
        "SELECT COALESCE(MAX(position) + 1, 0) FROM project_language_pairs WHERE project_id = ?1",
        params![project_id],
        |r| r.get(0),
    )?;
    let mut stmt = conn.prepare(
        "INSERT INTO project_language_pairs (project_id, source_tag, target_tag, position)
         VALUES (?1, ?2, ?3, ?4)",
    )?;
    for (offset, pair) in pairs.iter().enumerate() {
        stmt.execute(params![
            project_id,
            pair.source,
            pair.target,
            next + offset as i64
        ])?;
    }
    Ok(())
}

/// Lists the project's language pairs in declaration order.
pub fn list_language_pairs(
    conn: &Connection,
    project_id: &str,
) -> Result<Vec<LanguagePair>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT source_tag, target_tag FROM project_language_pairs
         WHERE project_id = ?1 ORDER BY position",
    )?;
    let pairs = stmt
        .query_map(params![project_id], |r| {
            Ok(LanguagePair::new(r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(pairs)
}
