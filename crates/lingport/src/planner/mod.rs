//! Conversion planning.
//!
//! [`build_plan`] is a pure function of the desired state (which files
//! and pairs should have artifacts) and the observed state (what the disk
//! and the registry currently hold). Observation and materialization of
//! the resulting cycles live around it in [`ConversionPlanner`].

mod observe;
mod readiness;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::config::ConversionConfig;
use crate::db::file_repo::{self, FileRow};
use crate::db::project_repo::{self, ProjectRow};
use crate::db::task_repo::{self, CycleKey, TaskRow};
use crate::db::{now_timestamp, Database};
use crate::error::{LingportError, Result};
use crate::model::{LanguagePair, TaskStatus};
use crate::storage::layout;

pub use observe::{ObservedState, SourceObservation};
pub use readiness::is_ready;

/// Output format every planned task converts to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetFormat {
    pub format: String,
    pub version: String,
    pub extension: String,
    pub segmentation: bool,
    pub embed: bool,
}

impl From<&ConversionConfig> for TargetFormat {
    fn from(config: &ConversionConfig) -> Self {
        Self {
            format: config.format.clone(),
            version: config.format_version.clone(),
            extension: config.extension.clone(),
            segmentation: config.segmentation,
            embed: config.embed,
        }
    }
}

/// What a project should contain.
#[derive(Debug, Clone)]
pub struct DesiredState {
    pub project: ProjectRow,
    /// All project files in declaration order.
    pub files: Vec<FileRow>,
    pub pairs: Vec<LanguagePair>,
    pub target: TargetFormat,
    /// Restricts planning to these files when set.
    pub file_filter: Option<HashSet<String>>,
    /// Pending or running cycles untouched for longer are re-planned.
    pub stale_after: Duration,
}

impl DesiredState {
    /// Imported processable files, in declaration order, after the filter.
    pub fn eligible_files(&self) -> impl Iterator<Item = &FileRow> {
        self.files.iter().filter(move |f| {
            f.is_convertible()
                && self
                    .file_filter
                    .as_ref()
                    .map(|ids| ids.contains(&f.id))
                    .unwrap_or(true)
        })
    }

    pub fn cycle_key(&self, file_id: &str, pair: &LanguagePair) -> CycleKey {
        CycleKey {
            file_id: file_id.to_string(),
            pair: pair.clone(),
            format: self.target.format.clone(),
            format_version: self.target.version.clone(),
        }
    }
}

/// Whether a planned task starts a new cycle or retries the latest one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum TaskCycle {
    New,
    Retry { task_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanReason {
    NeverConverted,
    SourceChanged,
    OutputMissing,
    PreviousFailed,
    Abandoned,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedTask {
    pub cycle: TaskCycle,
    pub reason: PlanReason,
    pub file_id: String,
    pub file_name: String,
    pub pair: LanguagePair,
    pub source_checksum: String,
    pub input_rel_path: String,
    pub output_rel_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityAlertKind {
    Missing,
    Unreadable,
    ChecksumMismatch,
}

/// A source file that no longer matches what was imported.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityAlert {
    pub file_id: String,
    pub file_name: String,
    pub kind: IntegrityAlertKind,
    pub expected_checksum: Option<String>,
    pub actual_checksum: Option<String>,
    pub message: String,
}

impl IntegrityAlert {
    pub fn to_error(&self) -> LingportError {
        LingportError::Integrity {
            file_name: self.file_name.clone(),
            reason: self.message.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub project_id: String,
    pub target: TargetFormat,
    pub tasks: Vec<PlannedTask>,
    pub integrity_alerts: Vec<IntegrityAlert>,
}

/// Reconciles desired against observed state.
///
/// Files come out in declaration order, and within a file the pairs in
/// declaration order. A file whose source fails the integrity check gets
/// one alert and no tasks.
pub fn build_plan(desired: &DesiredState, observed: &ObservedState) -> Plan {
    let mut tasks = Vec::new();
    let mut integrity_alerts = Vec::new();

    for file in desired.eligible_files() {
        let Some(rel_path) = file.rel_path.as_deref() else {
            continue;
        };
        if let Some(alert) = integrity_alert(file, observed.source(&file.id)) {
            integrity_alerts.push(alert);
            continue;
        }
        let checksum = file.checksum.clone().unwrap_or_default();

        for pair in &desired.pairs {
            let key = desired.cycle_key(&file.id, pair);
            let latest = observed.latest.get(&key);
            let Some((cycle, reason)) = decide(latest, &checksum, observed, desired.stale_after)
            else {
                continue;
            };
            tasks.push(PlannedTask {
                cycle,
                reason,
                file_id: file.id.clone(),
                file_name: file.original_name.clone(),
                pair: pair.clone(),
                source_checksum: checksum.clone(),
                input_rel_path: rel_path.to_string(),
                output_rel_path: layout::artifact_rel_path(
                    &desired.target.format,
                    pair,
                    &file.id,
                    &desired.target.extension,
                ),
            });
        }
    }

    Plan {
        project_id: desired.project.id.clone(),
        target: desired.target.clone(),
        tasks,
        integrity_alerts,
    }
}

fn integrity_alert(file: &FileRow, observation: Option<&SourceObservation>) -> Option<IntegrityAlert> {
    let expected = file.checksum.clone();
    let (kind, actual, message) = match observation {
        None | Some(SourceObservation::Missing) => (
            IntegrityAlertKind::Missing,
            None,
            format!("Source file '{}' is missing", file.original_name),
        ),
        Some(SourceObservation::Unreadable(reason)) => (
            IntegrityAlertKind::Unreadable,
            None,
            format!("Source file '{}' cannot be read: {}", file.original_name, reason),
        ),
        Some(SourceObservation::Present { sha256 }) => {
            if expected.as_deref() == Some(sha256.as_str()) {
                return None;
            }
            (
                IntegrityAlertKind::ChecksumMismatch,
                Some(sha256.clone()),
                format!("Source file '{}' changed since import", file.original_name),
            )
        }
    };
    Some(IntegrityAlert {
        file_id: file.id.clone(),
        file_name: file.original_name.clone(),
        kind,
        expected_checksum: expected,
        actual_checksum: actual,
        message,
    })
}

fn decide(
    latest: Option<&TaskRow>,
    checksum: &str,
    observed: &ObservedState,
    stale_after: Duration,
) -> Option<(TaskCycle, PlanReason)> {
    let Some(task) = latest else {
        return Some((TaskCycle::New, PlanReason::NeverConverted));
    };
    let retry = || TaskCycle::Retry {
        task_id: task.id.clone(),
    };

    match task.status {
        TaskStatus::Completed if task.source_checksum != checksum => {
            Some((TaskCycle::New, PlanReason::SourceChanged))
        }
        TaskStatus::Completed if !observed.output_exists(&task.id) => {
            Some((TaskCycle::New, PlanReason::OutputMissing))
        }
        TaskStatus::Completed => None,
        TaskStatus::Failed => Some((retry(), PlanReason::PreviousFailed)),
        TaskStatus::Pending | TaskStatus::Running => {
            if is_stale(&task.updated_at, observed.now, stale_after) {
                Some((retry(), PlanReason::Abandoned))
            } else {
                None
            }
        }
    }
}

fn is_stale(updated_at: &str, now: DateTime<Utc>, stale_after: Duration) -> bool {
    match DateTime::parse_from_rfc3339(updated_at) {
        Ok(at) => now.signed_duration_since(at.with_timezone(&Utc)) > stale_after,
        // An unparseable timestamp can never become fresh.
        Err(_) => true,
    }
}

/// A task cycle ready for the executor.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionTask {
    pub task_id: String,
    pub project_id: String,
    pub file_id: String,
    pub file_name: String,
    pub pair: LanguagePair,
    pub format: String,
    pub format_version: String,
    pub attempt: i64,
    pub segmentation: bool,
    pub embed: bool,
    pub source_checksum: String,
    pub project_root: PathBuf,
    pub input_path: PathBuf,
    pub output_rel_path: String,
    pub output_path: PathBuf,
}

impl ConversionTask {
    pub fn from_rows(project: &ProjectRow, file: &FileRow, task: &TaskRow) -> Result<Self> {
        let root = PathBuf::from(&project.root_path);
        let input_rel = file.rel_path.as_deref().ok_or_else(|| {
            LingportError::validation(format!(
                "File '{}' has not been imported",
                file.original_name
            ))
        })?;
        Ok(Self {
            task_id: task.id.clone(),
            project_id: project.id.clone(),
            file_id: file.id.clone(),
            file_name: file.original_name.clone(),
            pair: task.pair(),
            format: task.format.clone(),
            format_version: task.format_version.clone(),
            attempt: task.attempt,
            segmentation: task.segmentation,
            embed: task.embed,
            source_checksum: task.source_checksum.clone(),
            input_path: layout::resolve_within(&root, input_rel)?,
            output_path: layout::resolve_within(&root, &task.output_rel_path)?,
            output_rel_path: task.output_rel_path.clone(),
            project_root: root,
        })
    }
}

/// Plans and materializes conversion cycles for projects.
pub struct ConversionPlanner {
    db: Database,
    target: TargetFormat,
    stale_after: Duration,
}

impl ConversionPlanner {
    pub fn new(db: Database, config: &ConversionConfig) -> Self {
        let stale_secs = i64::try_from(config.stale_after_secs).unwrap_or(i64::MAX / 1000);
        Self {
            db,
            target: TargetFormat::from(config),
            stale_after: Duration::seconds(stale_secs),
        }
    }

    pub fn target(&self) -> &TargetFormat {
        &self.target
    }

    /// Loads the desired state of a project from the registry.
    pub fn desired_state(
        &self,
        project_id: &str,
        file_ids: Option<&[String]>,
    ) -> Result<DesiredState> {
        let (project, files, pairs) = self.db.read(|c| -> Result<_> {
            let project = project_repo::find_by_id(c, project_id)?
                .ok_or_else(|| LingportError::not_found("Project", project_id))?;
            let files = file_repo::list_by_project(c, project_id)?;
            let pairs = project_repo::list_language_pairs(c, project_id)?;
            Ok((project, files, pairs))
        })?;

        let file_filter = match file_ids {
            Some(ids) => {
                let known: HashSet<&str> = files.iter().map(|f| f.id.as_str()).collect();
                if let Some(unknown) = ids.iter().find(|id| !known.contains(id.as_str())) {
                    return Err(LingportError::not_found("File", unknown.as_str()));
                }
                Some(ids.iter().cloned().collect())
            }
            None => None,
        };

        Ok(DesiredState {
            project,
            files,
            pairs,
            target: self.target.clone(),
            file_filter,
            stale_after: self.stale_after,
        })
    }

    /// Observes and plans without writing anything.
    #[instrument(skip(self, file_ids))]
    pub async fn plan(&self, project_id: &str, file_ids: Option<&[String]>) -> Result<Plan> {
        let desired = self.desired_state(project_id, file_ids)?;
        let observed = observe::observe(&self.db, &desired).await?;
        let plan = build_plan(&desired, &observed);
        info!(
            tasks = plan.tasks.len(),
            alerts = plan.integrity_alerts.len(),
            "Plan built"
        );
        Ok(plan)
    }

    /// Records each planned task as a pending cycle and returns the
    /// cycles the executor should run.
    ///
    /// A retry whose row moved on in the meantime (for instance completed
    /// by a concurrent run) is dropped.
    pub fn materialize(&self, plan: &Plan) -> Result<Vec<ConversionTask>> {
        let now = now_timestamp();
        let (project, files, rows) = self.db.write(|tx| -> Result<_> {
            let project = project_repo::find_by_id(tx, &plan.project_id)?
                .ok_or_else(|| LingportError::not_found("Project", &plan.project_id))?;
            let files: HashMap<String, FileRow> = file_repo::list_by_project(tx, &plan.project_id)?
                .into_iter()
                .map(|f| (f.id.clone(), f))
                .collect();

            let mut rows = Vec::with_capacity(plan.tasks.len());
            for planned in &plan.tasks {
                if !files.get(&planned.file_id).is_some_and(FileRow::is_convertible) {
                    debug!(file_id = %planned.file_id, "Skipping task of a file that is no longer convertible");
                    continue;
                }
                let task_id = match &planned.cycle {
                    TaskCycle::New => {
                        let row = new_task_row(&plan.project_id, &plan.target, planned, &now);
                        task_repo::insert(tx, &row)?;
                        row.id
                    }
                    TaskCycle::Retry { task_id } => {
                        let changed =
                            task_repo::reset_to_pending(tx, task_id, &planned.source_checksum, &now)?;
                        if changed == 0 {
                            debug!(task_id = %task_id, "Skipping retry of a cycle that moved on");
                            continue;
                        }
                        task_id.clone()
                    }
                };
                if let Some(row) = task_repo::find_by_id(tx, &task_id)? {
                    rows.push(row);
                }
            }
            Ok((project, files, rows))
        })?;

        rows.iter()
            .filter_map(|row| files.get(&row.file_id).map(|file| (file, row)))
            .map(|(file, row)| ConversionTask::from_rows(&project, file, row))
            .collect()
    }

    /// Pending cycles of a project in creation order, such as ones reset
    /// by an explicit re-run. Cycles of files that are no longer
    /// convertible are left out.
    pub fn pending_tasks(&self, project_id: &str) -> Result<Vec<ConversionTask>> {
        let (project, files, tasks) = self.db.read(|c| -> Result<_> {
            let project = project_repo::find_by_id(c, project_id)?
                .ok_or_else(|| LingportError::not_found("Project", project_id))?;
            let files: HashMap<String, FileRow> = file_repo::list_by_project(c, project_id)?
                .into_iter()
                .map(|f| (f.id.clone(), f))
                .collect();
            let tasks = task_repo::list_by_project(c, project_id)?;
            Ok((project, files, tasks))
        })?;

        tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter_map(|t| {
                files
                    .get(&t.file_id)
                    .filter(|f| f.is_convertible())
                    .map(|f| (f, t))
            })
            .map(|(file, task)| ConversionTask::from_rows(&project, file, task))
            .collect()
    }

    /// Whether every eligible file has a terminal, current cycle for every
    /// declared pair.
    pub fn project_is_ready(&self, project_id: &str) -> Result<bool> {
        let desired = self.desired_state(project_id, None)?;
        let latest = self
            .db
            .read(|c| task_repo::latest_cycles(c, project_id))?;
        Ok(is_ready(&desired, &latest))
    }
}

fn new_task_row(project_id: &str, target: &TargetFormat, planned: &PlannedTask, now: &str) -> TaskRow {
    TaskRow {
        id: Uuid::new_v4().to_string(),
        project_id: project_id.to_string(),
        file_id: planned.file_id.clone(),
        source_tag: planned.pair.source.clone(),
        target_tag: planned.pair.target.clone(),
        format: target.format.clone(),
        format_version: target.version.clone(),
        status: TaskStatus::Pending,
        attempt: 1,
        source_checksum: planned.source_checksum.clone(),
        segmentation: target.segmentation,
        embed: target.embed,
        output_rel_path: planned.output_rel_path.clone(),
        derived_rel_path: None,
        validation: None,
        validation_message: None,
        error: None,
        warning: None,
        log_tail: None,
        created_at: now.to_string(),
        updated_at: now.to_string(),
        started_at: None,
        finished_at: None,
        seq: 0,
    }
}
