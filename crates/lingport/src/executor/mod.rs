//! Conversion executor.
//!
//! Runs materialized task cycles through the external converter, the
//! validator and the optional derived-format transform, persisting every
//! state change through the registry writer. Each task runs under its
//! project's lock.

mod tool;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use regex::Regex;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::config::{Config, DerivedConfig, ToolConfig};
use crate::db::task_repo::{self, Completion, Failure};
use crate::db::{now_timestamp, Database};
use crate::error::{LingportError, Result};
use crate::lock::ProjectLocks;
use crate::model::{LanguagePair, TaskStatus, ValidationOutcome};
use crate::planner::ConversionTask;
use crate::progress::{ConversionEvent, ConversionPhase, ProgressReporter};
use crate::storage::layout;
use crate::storage::staging::remove_file_if_exists;

pub use tool::{compile_patterns, run_tool, ToolCommand, ToolError, ToolOutput};

/// Final state of one executed task.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalState {
    pub task_id: String,
    pub file_id: String,
    pub pair: LanguagePair,
    pub status: TaskStatus,
    pub validation: Option<ValidationOutcome>,
    pub output_rel_path: Option<String>,
    pub derived_rel_path: Option<String>,
    pub error: Option<String>,
    pub warning: Option<String>,
}

impl TerminalState {
    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

/// A task the batch did not execute.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedTask {
    pub task_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub project_id: String,
    pub results: Vec<TerminalState>,
    pub skipped: Vec<SkippedTask>,
    pub cancelled: bool,
}

impl BatchReport {
    fn new(project_id: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            results: Vec::new(),
            skipped: Vec::new(),
            cancelled: false,
        }
    }

    pub fn completed_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_completed()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.status == TaskStatus::Failed)
            .count()
    }
}

/// Why a task did not complete.
struct StepFailure {
    error: String,
    validation: Option<ValidationOutcome>,
    validation_message: Option<String>,
}

impl StepFailure {
    fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            validation: None,
            validation_message: None,
        }
    }
}

struct StepSuccess {
    validation: ValidationOutcome,
    validation_message: Option<String>,
    derived_rel_path: Option<String>,
    warning: Option<String>,
}

pub struct ConversionExecutor {
    db: Database,
    converter: ToolConfig,
    validator: Option<ToolConfig>,
    derived: Option<DerivedConfig>,
    failure_patterns: Vec<Regex>,
    tail_lines: usize,
    locks: Arc<ProjectLocks>,
    progress: Arc<dyn ProgressReporter>,
}

impl ConversionExecutor {
    pub fn new(
        db: Database,
        config: &Config,
        locks: Arc<ProjectLocks>,
        progress: Arc<dyn ProgressReporter>,
    ) -> Result<Self> {
        Ok(Self {
            db,
            converter: config.converter.clone(),
            validator: config.validator.clone(),
            derived: config.derived.clone(),
            failure_patterns: compile_patterns(&config.conversion.failure_patterns)?,
            tail_lines: config.conversion.log_tail_lines,
            locks,
            progress,
        })
    }

    /// Runs every task in order, checking `cancel` between tasks.
    ///
    /// A task that fails or cannot be claimed never stops the batch. A
    /// running tool is always allowed to finish.
    #[instrument(skip(self, tasks, cancel), fields(tasks = tasks.len()))]
    pub async fn run_batch(
        &self,
        project_id: &str,
        tasks: &[ConversionTask],
        cancel: &AtomicBool,
    ) -> Result<BatchReport> {
        if let Some(foreign) = tasks.iter().find(|t| t.project_id != project_id) {
            return Err(LingportError::validation(format!(
                "Task {} belongs to project {}, not {}",
                foreign.task_id, foreign.project_id, project_id
            )));
        }

        let mut report = BatchReport::new(project_id);
        for (index, task) in tasks.iter().enumerate() {
            if cancel.load(Ordering::SeqCst) {
                info!(remaining = tasks.len() - index, "Batch cancelled");
                report.cancelled = true;
                report
                    .skipped
                    .extend(tasks[index..].iter().map(|t| SkippedTask {
                        task_id: t.task_id.clone(),
                        reason: "cancelled".to_string(),
                    }));
                break;
            }

            match self.run(task).await {
                Ok(state) => report.results.push(state),
                Err(e) => {
                    warn!(task_id = %task.task_id, "Task not executed: {}", e);
                    report.skipped.push(SkippedTask {
                        task_id: task.task_id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            completed = report.completed_count(),
            failed = report.failed_count(),
            skipped = report.skipped.len(),
            "Batch finished"
        );
        Ok(report)
    }

    /// Executes one task cycle to a terminal state.
    ///
    /// Tool failures end up on the task, not in the returned error. An
    /// error means the task could not be claimed or its state could not
    /// be persisted.
    #[instrument(skip(self, task), fields(task_id = %task.task_id, file = %task.file_name, pair = %task.pair))]
    pub async fn run(&self, task: &ConversionTask) -> Result<TerminalState> {
        let _guard = self.locks.acquire(&task.project_id).await;

        let claimed = self
            .db
            .write(|tx| task_repo::mark_running(tx, &task.task_id, &now_timestamp()))?;
        if claimed == 0 {
            let current = self
                .db
                .read(|c| task_repo::find_by_id(c, &task.task_id))?
                .ok_or_else(|| LingportError::not_found("Task", &task.task_id))?;
            return Err(LingportError::InvalidTransition {
                from: current.status,
                to: TaskStatus::Running,
            });
        }
        self.emit(task, ConversionPhase::Started, "Conversion started");

        let mut log = Vec::new();
        let outcome = self.execute(task, &mut log).await;
        let log_tail = (!log.is_empty()).then(|| log.join("\n"));
        let now = now_timestamp();

        match outcome {
            Ok(done) => {
                let completion = Completion {
                    validation: Some(done.validation),
                    validation_message: done.validation_message,
                    derived_rel_path: done.derived_rel_path.clone(),
                    warning: done.warning.clone(),
                    log_tail,
                };
                let changed = self
                    .db
                    .write(|tx| task_repo::mark_completed(tx, &task.task_id, &completion, &now))?;
                if changed == 0 {
                    warn!("Task left the running state before completion was recorded");
                }
                info!(validation = done.validation.as_str(), "Task completed");
                self.emit(task, ConversionPhase::Completed, "Conversion completed");

                Ok(TerminalState {
                    task_id: task.task_id.clone(),
                    file_id: task.file_id.clone(),
                    pair: task.pair.clone(),
                    status: TaskStatus::Completed,
                    validation: Some(done.validation),
                    output_rel_path: Some(task.output_rel_path.clone()),
                    derived_rel_path: done.derived_rel_path,
                    error: None,
                    warning: done.warning,
                })
            }
            Err(failure) => {
                let record = Failure {
                    error: failure.error.clone(),
                    validation: failure.validation,
                    validation_message: failure.validation_message,
                    log_tail,
                };
                let changed = self
                    .db
                    .write(|tx| task_repo::mark_failed(tx, &task.task_id, &record, &now))?;
                if changed == 0 {
                    warn!("Task left the running state before failure was recorded");
                }
                warn!(error = %failure.error, "Task failed");
                self.progress.report(
                    ConversionEvent::new(
                        &task.project_id,
                        &task.task_id,
                        &task.file_id,
                        ConversionPhase::Failed,
                        "Conversion failed",
                    )
                    .with_error(&failure.error),
                );

                Ok(TerminalState {
                    task_id: task.task_id.clone(),
                    file_id: task.file_id.clone(),
                    pair: task.pair.clone(),
                    status: TaskStatus::Failed,
                    validation: failure.validation,
                    output_rel_path: None,
                    derived_rel_path: None,
                    error: Some(failure.error),
                    warning: None,
                })
            }
        }
    }

    async fn execute(
        &self,
        task: &ConversionTask,
        log: &mut Vec<String>,
    ) -> std::result::Result<StepSuccess, StepFailure> {
        prepare_output(&task.output_path).await?;

        self.emit(task, ConversionPhase::Converting, "Running converter");
        let output = self
            .run_step(task, ConversionPhase::Converting, &converter_command(&self.converter, task), log)
            .await
            .map_err(|e| StepFailure::new(e.to_string()))?;
        if let Some(err) = output.failure() {
            return Err(StepFailure::new(describe_failure(&err, &output)));
        }
        if !is_file(&task.output_path).await {
            let err = ToolError::MissingOutput {
                program: self.converter.program.clone(),
                path: task.output_path.clone(),
            };
            return Err(StepFailure::new(err.to_string()));
        }

        let (validation, validation_message) = match &self.validator {
            None => (ValidationOutcome::Skipped, None),
            Some(validator) => {
                self.emit(task, ConversionPhase::Validating, "Running validator");
                let command = ToolCommand::new(&validator.program)
                    .args(validator.args.iter().cloned())
                    .arg("-file")
                    .arg(task.output_path.to_string_lossy());
                let failure = match self
                    .run_step(task, ConversionPhase::Validating, &command, log)
                    .await
                {
                    Ok(output) => output.failure().map(|e| describe_failure(&e, &output)),
                    Err(e) => Some(e.to_string()),
                };
                if let Some(message) = failure {
                    return Err(StepFailure {
                        error: format!("Validation failed: {}", message),
                        validation: Some(ValidationOutcome::Failed),
                        validation_message: Some(message),
                    });
                }
                (ValidationOutcome::Passed, None)
            }
        };

        let (derived_rel_path, warning) = match &self.derived {
            None => (None, None),
            Some(derived) => match self.derive(task, derived, log).await {
                Ok(rel) => (Some(rel), None),
                Err(message) => {
                    warn!(warning = %message, "Derived transform failed");
                    (None, Some(message))
                }
            },
        };

        Ok(StepSuccess {
            validation,
            validation_message,
            derived_rel_path,
            warning,
        })
    }

    /// Runs the optional derived-format transform. Any failure is
    /// returned as a warning message.
    async fn derive(
        &self,
        task: &ConversionTask,
        derived: &DerivedConfig,
        log: &mut Vec<String>,
    ) -> std::result::Result<String, String> {
        let rel = layout::artifact_rel_path(&derived.format, &task.pair, &task.file_id, &derived.extension);
        let path = layout::resolve_within(&task.project_root, &rel).map_err(|e| e.to_string())?;
        prepare_output(&path).await.map_err(|f| f.error)?;

        self.emit(task, ConversionPhase::Deriving, "Running derived transform");
        let tool = derived.tool();
        let command = ToolCommand::new(&tool.program)
            .args(tool.args)
            .arg("-file")
            .arg(task.output_path.to_string_lossy())
            .arg("-output")
            .arg(path.to_string_lossy());
        let output = self
            .run_step(task, ConversionPhase::Deriving, &command, log)
            .await
            .map_err(|e| format!("Derived transform failed: {}", e))?;
        if let Some(err) = output.failure() {
            return Err(format!("Derived transform failed: {}", describe_failure(&err, &output)));
        }
        if !is_file(&path).await {
            return Err(format!("Derived transform did not produce {}", path.display()));
        }
        Ok(rel)
    }

    async fn run_step(
        &self,
        task: &ConversionTask,
        phase: ConversionPhase,
        command: &ToolCommand,
        log: &mut Vec<String>,
    ) -> std::result::Result<ToolOutput, ToolError> {
        tracing::debug!(command = %command, "Running tool");
        let output = run_tool(command, &self.failure_patterns, self.tail_lines, |stream, line| {
            self.progress.report(
                ConversionEvent::new(&task.project_id, &task.task_id, &task.file_id, phase, "output")
                    .with_line(stream, line),
            );
        })
        .await?;

        log.extend(output.tail.iter().cloned());
        if log.len() > self.tail_lines {
            log.drain(..log.len() - self.tail_lines);
        }
        Ok(output)
    }

    fn emit(&self, task: &ConversionTask, phase: ConversionPhase, message: &str) {
        self.progress.report(ConversionEvent::new(
            &task.project_id,
            &task.task_id,
            &task.file_id,
            phase,
            message,
        ));
    }
}

/// `<configured args> -file <in> -srcLang <src> -tgtLang <tgt> -xliff <out> -<version> [-paragraph] [-embed]`
fn converter_command(converter: &ToolConfig, task: &ConversionTask) -> ToolCommand {
    let mut command = ToolCommand::new(&converter.program)
        .args(converter.args.iter().cloned())
        .arg("-file")
        .arg(task.input_path.to_string_lossy())
        .arg("-srcLang")
        .arg(&task.pair.source)
        .arg("-tgtLang")
        .arg(&task.pair.target)
        .arg("-xliff")
        .arg(task.output_path.to_string_lossy())
        .arg(format!("-{}", task.format_version));
    if task.segmentation {
        command = command.arg("-paragraph");
    }
    if task.embed {
        command = command.arg("-embed");
    }
    command
}

/// The error plus the last output line, which usually carries the
/// tool's own explanation.
fn describe_failure(err: &ToolError, output: &ToolOutput) -> String {
    match (err, output.tail.last()) {
        (ToolError::NonZeroExit { .. }, Some(last)) if !last.trim().is_empty() => {
            format!("{}: {}", err, last.trim())
        }
        _ => err.to_string(),
    }
}

/// Creates the output's parent directory and removes any output left by
/// an earlier cycle, so a tool that writes nothing is detected.
async fn prepare_output(path: &Path) -> std::result::Result<(), StepFailure> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            StepFailure::new(format!("Failed to create {}: {}", parent.display(), e))
        })?;
    }
    remove_file_if_exists(path)
        .await
        .map_err(|e| StepFailure::new(e.to_string()))
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

#[cfg(all(test, unix))]
mod tests;
