//! The upward API: one handle that owns the registry, the project locks
//! and the three services, and keeps project status current after every
//! change.

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::config::{validate_config, Config};
use crate::db::file_repo::{self, FileRow};
use crate::db::project_repo::{self, ProjectRow};
use crate::db::task_repo::{self, Completion, Failure, TaskRow};
use crate::db::{now_timestamp, Database};
use crate::error::{LingportError, Result};
use crate::executor::{BatchReport, ConversionExecutor};
use crate::intake::{AssetInput, IntakeCoordinator, NewProjectInput, ProjectBundle, StagingReport};
use crate::lock::ProjectLocks;
use crate::model::{FileRole, LanguagePair, ProjectStatus, TaskStatus, ValidationOutcome};
use crate::planner::{ConversionPlanner, ConversionTask, IntegrityAlert};
use crate::progress::ProgressReporter;
use crate::storage::{layout, ProjectLayout};

/// Tasks ready to run plus the files that could not be planned.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionPlan {
    pub project_id: String,
    pub tasks: Vec<ConversionTask>,
    pub integrity_alerts: Vec<IntegrityAlert>,
}

/// Details recorded with an explicit status update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusDetails {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub validation: Option<ValidationOutcome>,
    #[serde(default)]
    pub validation_message: Option<String>,
}

pub struct Workspace {
    config: Arc<Config>,
    db: Database,
    locks: Arc<ProjectLocks>,
    intake: IntakeCoordinator,
    planner: ConversionPlanner,
    executor: ConversionExecutor,
}

impl Workspace {
    /// Validates the config and opens the registry it points at.
    pub fn open(config: Config, progress: Arc<dyn ProgressReporter>) -> Result<Self> {
        validate_config(&config)?;
        let path = config.database_path().ok_or_else(|| {
            LingportError::validation("No database_path configured and no home directory found")
        })?;
        let db = Database::open(&path)?;
        Self::with_database(config, db, progress)
    }

    /// Builds a workspace on an already opened registry.
    pub fn with_database(
        config: Config,
        db: Database,
        progress: Arc<dyn ProgressReporter>,
    ) -> Result<Self> {
        let locks = Arc::new(ProjectLocks::new());
        let intake = IntakeCoordinator::new(db.clone(), ProjectLayout::new(config.projects_root()));
        let planner = ConversionPlanner::new(db.clone(), &config.conversion);
        let executor = ConversionExecutor::new(db.clone(), &config, Arc::clone(&locks), progress)?;

        Ok(Self {
            config: Arc::new(config),
            db,
            locks,
            intake,
            planner,
            executor,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub async fn create_project(&self, input: &NewProjectInput) -> Result<ProjectBundle> {
        let mut bundle = self.intake.create_project(input).await?;
        bundle.project.status = self.refresh_project_status(&bundle.project.id)?;
        Ok(bundle)
    }

    /// Plans the project and records every planned task as a pending
    /// cycle. Calling it again without an intervening change returns no
    /// tasks.
    #[instrument(skip(self, file_ids))]
    pub async fn ensure_plan(
        &self,
        project_id: &str,
        file_ids: Option<&[String]>,
    ) -> Result<ConversionPlan> {
        let _guard = self.locks.acquire(project_id).await;
        self.active_project(project_id)?;

        let plan = self.planner.plan(project_id, file_ids).await?;
        let tasks = self.planner.materialize(&plan)?;
        self.refresh_project_status(project_id)?;

        Ok(ConversionPlan {
            project_id: project_id.to_string(),
            tasks,
            integrity_alerts: plan.integrity_alerts,
        })
    }

    /// Executes planned tasks in order, then re-evaluates readiness.
    pub async fn run_conversions(
        &self,
        project_id: &str,
        tasks: &[ConversionTask],
        cancel: &AtomicBool,
    ) -> Result<BatchReport> {
        let report = self.executor.run_batch(project_id, tasks, cancel).await?;
        self.refresh_project_status(project_id)?;
        Ok(report)
    }

    /// Runs every pending cycle of the project, such as explicit re-runs.
    pub async fn run_pending(&self, project_id: &str, cancel: &AtomicBool) -> Result<BatchReport> {
        let tasks = self.planner.pending_tasks(project_id)?;
        self.run_conversions(project_id, &tasks, cancel).await
    }

    /// Applies an explicit status change to a task.
    ///
    /// `failed -> pending` starts another attempt of the same cycle.
    /// Completed tasks cannot be changed.
    #[instrument(skip(self, details))]
    pub async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        details: TaskStatusDetails,
    ) -> Result<TaskRow> {
        let task = self.task(task_id)?;
        let _guard = self.locks.acquire(&task.project_id).await;

        let current = self.task(task_id)?;
        if !current.status.can_transition_to(status) {
            return Err(LingportError::InvalidTransition {
                from: current.status,
                to: status,
            });
        }

        let now = now_timestamp();
        let changed = match status {
            TaskStatus::Pending => {
                let checksum = self
                    .db
                    .read(|c| file_repo::find_by_id(c, &current.file_id))?
                    .and_then(|f| f.checksum)
                    .unwrap_or_else(|| current.source_checksum.clone());
                self.db
                    .write(|tx| task_repo::reset_to_pending(tx, task_id, &checksum, &now))?
            }
            TaskStatus::Running => self.db.write(|tx| task_repo::mark_running(tx, task_id, &now))?,
            TaskStatus::Completed => {
                let validation = self.check_completion(&current, details.validation).await?;
                let completion = Completion {
                    validation: Some(validation),
                    validation_message: details.validation_message,
                    ..Default::default()
                };
                self.db
                    .write(|tx| task_repo::mark_completed(tx, task_id, &completion, &now))?
            }
            TaskStatus::Failed => {
                let failure = Failure {
                    error: details
                        .error
                        .unwrap_or_else(|| "Marked as failed".to_string()),
                    validation: details.validation,
                    validation_message: details.validation_message,
                    log_tail: None,
                };
                self.db
                    .write(|tx| task_repo::mark_failed(tx, task_id, &failure, &now))?
            }
        };
        if changed == 0 {
            return Err(LingportError::InvalidTransition {
                from: current.status,
                to: status,
            });
        }

        info!(from = %current.status, to = %status, "Task status updated");
        self.refresh_project_status(&current.project_id)?;
        self.task(task_id)
    }

    pub async fn add_files(
        &self,
        project_id: &str,
        assets: &[AssetInput],
    ) -> Result<(Vec<FileRow>, StagingReport)> {
        let _guard = self.locks.acquire(project_id).await;
        let project = self.project(project_id)?;
        let added = self.intake.add_files(&project, assets).await?;
        self.refresh_project_status(project_id)?;
        Ok(added)
    }

    pub async fn remove_file(&self, project_id: &str, file_id: &str) -> Result<()> {
        let _guard = self.locks.acquire(project_id).await;
        let project = self.active_project(project_id)?;
        self.intake.remove_file(&project, file_id).await?;
        self.refresh_project_status(project_id)?;
        Ok(())
    }

    pub async fn update_file_role(
        &self,
        project_id: &str,
        file_id: &str,
        role: FileRole,
    ) -> Result<FileRow> {
        let _guard = self.locks.acquire(project_id).await;
        let project = self.active_project(project_id)?;
        let file = self.intake.update_file_role(&project, file_id, role).await?;
        self.refresh_project_status(project_id)?;
        Ok(file)
    }

    /// Declares another language pair and returns all declared pairs.
    pub async fn add_language_pair(
        &self,
        project_id: &str,
        pair: LanguagePair,
    ) -> Result<Vec<LanguagePair>> {
        let _guard = self.locks.acquire(project_id).await;
        let project = self.active_project(project_id)?;
        let pairs = self.intake.add_language_pairs(&project, &[pair])?;
        self.refresh_project_status(project_id)?;
        Ok(pairs)
    }

    pub fn project(&self, project_id: &str) -> Result<ProjectRow> {
        self.db
            .read(|c| project_repo::find_by_id(c, project_id))?
            .ok_or_else(|| LingportError::not_found("Project", project_id))
    }

    pub fn list_projects(&self) -> Result<Vec<ProjectRow>> {
        Ok(self.db.read(project_repo::list)?)
    }

    pub fn list_files(&self, project_id: &str) -> Result<Vec<FileRow>> {
        self.project(project_id)?;
        Ok(self.db.read(|c| file_repo::list_by_project(c, project_id))?)
    }

    pub fn list_language_pairs(&self, project_id: &str) -> Result<Vec<LanguagePair>> {
        self.project(project_id)?;
        Ok(self
            .db
            .read(|c| project_repo::list_language_pairs(c, project_id))?)
    }

    pub fn list_tasks(&self, project_id: &str) -> Result<Vec<TaskRow>> {
        self.project(project_id)?;
        Ok(self.db.read(|c| task_repo::list_by_project(c, project_id))?)
    }

    pub fn task(&self, task_id: &str) -> Result<TaskRow> {
        self.db
            .read(|c| task_repo::find_by_id(c, task_id))?
            .ok_or_else(|| LingportError::not_found("Task", task_id))
    }

    /// Moves an active project between IN_PROGRESS and READY. Projects
    /// still being created, or whose creation failed, are left alone.
    pub fn refresh_project_status(&self, project_id: &str) -> Result<ProjectStatus> {
        let project = self.project(project_id)?;
        if !project.status.is_active() {
            return Ok(project.status);
        }

        let next = if self.planner.project_is_ready(project_id)? {
            ProjectStatus::Ready
        } else {
            ProjectStatus::InProgress
        };
        if next != project.status {
            let now = now_timestamp();
            self.db
                .write(|tx| project_repo::update_status(tx, project_id, next, &now))?;
            info!(project_id, from = %project.status, to = %next, "Project status changed");
        }
        Ok(next)
    }

    /// A task may only be marked completed when its validation passed or
    /// was skipped and its artifact is on disk.
    async fn check_completion(
        &self,
        task: &TaskRow,
        validation: Option<ValidationOutcome>,
    ) -> Result<ValidationOutcome> {
        let validation = validation.unwrap_or(ValidationOutcome::Skipped);
        if !matches!(
            validation,
            ValidationOutcome::Passed | ValidationOutcome::Skipped
        ) {
            return Err(LingportError::validation(format!(
                "Task '{}' cannot complete with validation {}",
                task.id,
                validation.as_str()
            )));
        }

        let project = self.project(&task.project_id)?;
        let output = layout::resolve_within(Path::new(&project.root_path), &task.output_rel_path)?;
        let exists = tokio::fs::metadata(&output)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        if !exists {
            return Err(LingportError::validation(format!(
                "Task '{}' cannot complete: artifact '{}' does not exist",
                task.id, task.output_rel_path
            )));
        }
        Ok(validation)
    }

    fn active_project(&self, project_id: &str) -> Result<ProjectRow> {
        let project = self.project(project_id)?;
        if !project.status.is_active() {
            return Err(LingportError::validation(format!(
                "Project '{}' is {}",
                project.name, project.status
            )));
        }
        Ok(project)
    }
}
