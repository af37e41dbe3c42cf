//! Conversion task repository: one row per conversion cycle in
//! `conversion_tasks`.
//!
//! Status updates are guarded by the expected current status in the
//! `WHERE` clause, so a caller racing another writer sees `0` rows
//! changed instead of clobbering a newer state.

use std::collections::HashMap;

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use super::{parse_column, DatabaseError};
use crate::model::{LanguagePair, TaskStatus, ValidationOutcome};

const SELECT_TASKS: &str = "SELECT rowid AS seq, * FROM conversion_tasks";

/// A conversion task row from the registry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRow {
    pub id: String,
    pub project_id: String,
    pub file_id: String,
    pub source_tag: String,
    pub target_tag: String,
    pub format: String,
    pub format_version: String,
    pub status: TaskStatus,
    pub attempt: i64,
    pub source_checksum: String,
    pub segmentation: bool,
    pub embed: bool,
    pub output_rel_path: String,
    pub derived_rel_path: Option<String>,
    pub validation: Option<ValidationOutcome>,
    pub validation_message: Option<String>,
    pub error: Option<String>,
    pub warning: Option<String>,
    pub log_tail: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    /// Insertion order; the highest value per cycle key is the latest cycle.
    #[serde(skip)]
    pub seq: i64,
}

impl TaskRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let validation: Option<String> = row.get("validation")?;
        Ok(Self {
            id: row.get("id")?,
            project_id: row.get("project_id")?,
            file_id: row.get("file_id")?,
            source_tag: row.get("source_tag")?,
            target_tag: row.get("target_tag")?,
            format: row.get("format")?,
            format_version: row.get("format_version")?,
            status: parse_column(row, "status", TaskStatus::parse)?,
            attempt: row.get("attempt")?,
            source_checksum: row.get("source_checksum")?,
            segmentation: row.get("segmentation")?,
            embed: row.get("embed")?,
            output_rel_path: row.get("output_rel_path")?,
            derived_rel_path: row.get("derived_rel_path")?,
            validation: validation.as_deref().and_then(ValidationOutcome::parse),
            validation_message: row.get("validation_message")?,
            error: row.get("error")?,
            warning: row.get("warning")?,
            log_tail: row.get("log_tail")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            started_at: row.get("started_at")?,
            finished_at: row.get("finished_at")?,
            seq: row.get("seq")?,
        })
    }

    pub fn pair(&self) -> LanguagePair {
        LanguagePair::new(&self.source_tag, &self.target_tag)
    }

    pub fn cycle_key(&self) -> CycleKey {
        CycleKey {
            file_id: self.file_id.clone(),
            pair: self.pair(),
            format: self.format.clone(),
            format_version: self.format_version.clone(),
        }
    }
}

/// Identity of a conversion: the same key across cycles means the same
/// file, pair and target format.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CycleKey {
    pub file_id: String,
    pub pair: LanguagePair,
    pub format: String,
    pub format_version: String,
}

/// Terminal details recorded when a task completes.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub validation: Option<ValidationOutcome>,
    pub validation_message: Option<String>,
    pub derived_rel_path: Option<String>,
    pub warning: Option<String>,
    pub log_tail: Option<String>,
}

/// Terminal details recorded when a task fails.
#[derive(Debug, Clone, Default)]
pub struct Failure {
    pub error: String,
    pub validation: Option<ValidationOutcome>,
    pub validation_message: Option<String>,
    pub log_tail: Option<String>,
}

/// Inserts a new task cycle.
pub fn insert(conn: &Connection, task: &TaskRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO conversion_tasks (id, project_id, file_id, source_tag, target_tag, format,
         format_version, status, attempt, source_checksum, segmentation, embed, output_rel_path,
         derived_rel_path, validation, validation_message, error, warning, log_tail,
         created_at, updated_at, started_at, finished_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
         ?18, ?19, ?20, ?21, ?22, ?23)",
        params![
            task.id,
            task.project_id,
            task.file_id,
            task.source_tag,
            task.target_tag,
            task.format,
            task.format_version,
            task.status.as_str(),
            task.attempt,
            task.source_checksum,
            task.segmentation,
            task.embed,
            task.output_rel_path,
            task.derived_rel_path,
            task.validation.map(|v| v.as_str()),
            task.validation_message,
            task.error,
            task.warning,
            task.log_tail,
            task.created_at,
            task.updated_at,
            task.started_at,
            task.finished_at,
        ],
    )?;
    Ok(())
}

/// Finds a task by its ID.
pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<TaskRow>, DatabaseError> {
    let row = conn
        .query_row(
            &format!("{} WHERE id = ?1", SELECT_TASKS),
            params![id],
            TaskRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Lists every cycle of a project in insertion order.
pub fn list_by_project(conn: &Connection, project_id: &str) -> Result<Vec<TaskRow>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "{} WHERE project_id = ?1 ORDER BY rowid",
        SELECT_TASKS
    ))?;
    let rows = stmt
        .query_map(params![project_id], TaskRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Lists every cycle recorded for one file.
pub fn list_by_file(conn: &Connection, file_id: &str) -> Result<Vec<TaskRow>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "{} WHERE file_id = ?1 ORDER BY rowid",
        SELECT_TASKS
    ))?;
    let rows = stmt
        .query_map(params![file_id], TaskRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Returns the most recent cycle for each conversion of the project.
pub fn latest_cycles(
    conn: &Connection,
    project_id: &str,
) -> Result<HashMap<CycleKey, TaskRow>, DatabaseError> {
    let mut latest = HashMap::new();
    for task in list_by_project(conn, project_id)? {
        latest.insert(task.cycle_key(), task);
    }
    Ok(latest)
}

pub fn count_by_status(
    conn: &Connection,
    project_id: &str,
    status: TaskStatus,
) -> Result<u64, DatabaseError> {
    let count: u64 = conn.query_row(
        "SELECT COUNT(*) FROM conversion_tasks WHERE project_id = ?1 AND status = ?2",
        params![project_id, status.as_str()],
        |r| r.get(0),
    )?;
    Ok(count)
}

/// Puts a failed, pending or running cycle back to pending for another
/// attempt. Completed cycles are never reset.
pub fn reset_to_pending(
    conn: &Connection,
    id: &str,
    source_checksum: &str,
    updated_at: &str,
) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE conversion_tasks SET status = 'pending', attempt = attempt + 1,
         source_checksum = ?2, error = NULL, warning = NULL, validation = NULL,
         validation_message = NULL, log_tail = NULL, started_at = NULL, finished_at = NULL,
         updated_at = ?3
         WHERE id = ?1 AND status != 'completed'",
        params![id, source_checksum, updated_at],
    )?;
    Ok(changed)
}

/// Claims a pending task for execution.
pub fn mark_running(conn: &Connection, id: &str, now: &str) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE conversion_tasks SET status = 'running', started_at = ?2, updated_at = ?2
         WHERE id = ?1 AND status = 'pending'",
        params![id, now],
    )?;
    Ok(changed)
}

pub fn mark_completed(
    conn: &Connection,
    id: &str,
    completion: &Completion,
    now: &str,
) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE conversion_tasks SET status = 'completed', validation = ?2,
         validation_message = ?3, derived_rel_path = ?4, warning = ?5, log_tail = ?6,
         error = NULL, finished_at = ?7, updated_at = ?7
         WHERE id = ?1 AND status = 'running'",
        params![
            id,
            completion.validation.map(|v| v.as_str()),
            completion.validation_message,
            completion.derived_rel_path,
            completion.warning,
            completion.log_tail,
            now,
        ],
    )?;
    Ok(changed)
}

pub fn mark_failed(
    conn: &Connection,
    id: &str,
    failure: &Failure,
    now: &str,
) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE conversion_tasks SET status = 'failed', error = ?2, validation = ?3,
         validation_message = ?4, log_tail = ?5, finished_at = ?6, updated_at = ?6
         WHERE id = ?1 AND status IN ('pending', 'running')",
        params![
            id,
            failure.error,
            failure.validation.map(|v| v.as_str()),
            failure.validation_message,
            failure.log_tail,
            now,
        ],
    )?;
    Ok(changed)
}

/// Fails every pending or running cycle of a file. Returns how many
/// cycles were closed.
pub fn fail_open_cycles(
    conn: &Connection,
    file_id: &str,
    error: &str,
    now: &str,
) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE conversion_tasks SET status = 'failed', error = ?2, finished_at = ?3,
         updated_at = ?3
         WHERE file_id = ?1 AND status IN ('pending', 'running')",
        params![file_id, error, now],
    )?;
    Ok(changed)
}
