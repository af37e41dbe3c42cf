use std::path::PathBuf;

use tempfile::TempDir;

use super::*;
use crate::config::Config;
use crate::db::file_repo::{self, tests::sample_file};
use crate::db::project_repo::{self, tests::sample_project};
use crate::db::task_repo::tests::sample_task;
use crate::model::{ImportStatus, ProjectStatus};
use crate::progress::{BroadcastProgress, OutputStream};

/// Writes a small document to the `-xliff` argument.
const CONVERT_OK: &str = r#"out=""
while [ $# -gt 0 ]; do
  if [ "$1" = "-xliff" ]; then out="$2"; fi
  shift
done
echo "converting"
printf '<xliff version="2.0"/>' > "$out""#;

/// Writes its own argument list to the `-xliff` argument, one per line.
const CONVERT_ECHO_ARGS: &str = r#"out=""
for a in "$@"; do
  if [ "$prev" = "-xliff" ]; then out="$a"; fi
  prev="$a"
done
printf '%s\n' "$@" > "$out""#;

const CONVERT_UNSUPPORTED: &str = r#"echo "Unsupported format: docx" >&2; exit 1"#;

const DERIVE_OK: &str = r#"out=""
while [ $# -gt 0 ]; do
  if [ "$1" = "-output" ]; then out="$2"; fi
  shift
done
printf '{}' > "$out""#;

fn sh(script: &str) -> ToolConfig {
    ToolConfig::new("sh").with_args(["-c", script, "tool"])
}

struct Fixture {
    _dir: TempDir,
    db: Database,
    root: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("demo");
        std::fs::create_dir_all(root.join("original/processable")).unwrap();
        std::fs::write(root.join("original/processable/f1.docx"), b"source").unwrap();

        let db = Database::open_in_memory().unwrap();
        let mut project = sample_project("p1", "demo");
        project.root_path = root.to_string_lossy().into_owned();
        project.status = ProjectStatus::InProgress;
        let mut file = sample_file("f1", "p1", 0);
        file.import_status = ImportStatus::Imported;
        file.rel_path = Some("original/processable/f1.docx".to_string());
        file.checksum = Some("abc".to_string());
        db.write(|tx| {
            project_repo::insert(tx, &project)?;
            file_repo::insert(tx, &file)
        })
        .unwrap();

        Self {
            _dir: dir,
            db,
            root,
        }
    }

    fn pending_task(&self, id: &str, target: &str) -> ConversionTask {
        let row = sample_task(id, "f1", target);
        self.db.write(|tx| task_repo::insert(tx, &row)).unwrap();
        let project = self
            .db
            .read(|c| project_repo::find_by_id(c, "p1"))
            .unwrap()
            .unwrap();
        let file = self
            .db
            .read(|c| file_repo::find_by_id(c, "f1"))
            .unwrap()
            .unwrap();
        ConversionTask::from_rows(&project, &file, &row).unwrap()
    }

    fn config(&self, converter: ToolConfig) -> Config {
        Config::new(self.root.parent().unwrap().to_string_lossy(), converter)
    }

    fn executor(&self, config: &Config) -> (ConversionExecutor, BroadcastProgress) {
        let progress = BroadcastProgress::new(1024);
        let executor = ConversionExecutor::new(
            self.db.clone(),
            config,
            Arc::new(ProjectLocks::new()),
            Arc::new(progress.clone()),
        )
        .unwrap();
        (executor, progress)
    }

    fn stored(&self, id: &str) -> task_repo::TaskRow {
        self.db
            .read(|c| task_repo::find_by_id(c, id))
            .unwrap()
            .unwrap()
    }
}

#[tokio::test]
async fn test_completes_without_validator() {
    let fx = Fixture::new();
    let (executor, _) = fx.executor(&fx.config(sh(CONVERT_OK)));
    let task = fx.pending_task("t1", "it-IT");

    let state = executor.run(&task).await.unwrap();

    assert_eq!(state.status, TaskStatus::Completed);
    assert_eq!(state.validation, Some(ValidationOutcome::Skipped));
    assert_eq!(
        state.output_rel_path.as_deref(),
        Some("artifacts/xliff/en-US__it-IT/f1.xlf")
    );
    assert!(task.output_path.is_file());

    let row = fx.stored("t1");
    assert_eq!(row.status, TaskStatus::Completed);
    assert_eq!(row.validation, Some(ValidationOutcome::Skipped));
    assert!(row.started_at.is_some());
    assert!(row.finished_at.is_some());
    assert!(row.log_tail.unwrap().contains("converting"));
}

#[tokio::test]
async fn test_converter_receives_explicit_arguments() {
    let fx = Fixture::new();
    let (executor, _) = fx.executor(&fx.config(sh(CONVERT_ECHO_ARGS)));
    let task = fx.pending_task("t1", "it-IT");

    executor.run(&task).await.unwrap();

    let written = std::fs::read_to_string(&task.output_path).unwrap();
    let args: Vec<&str> = written.lines().collect();
    assert_eq!(
        args,
        vec![
            "-file",
            task.input_path.to_str().unwrap(),
            "-srcLang",
            "en-US",
            "-tgtLang",
            "it-IT",
            "-xliff",
            task.output_path.to_str().unwrap(),
            "-2.0",
            "-paragraph",
            "-embed",
        ]
    );
}

#[tokio::test]
async fn test_unsupported_format_fails_task_with_message() {
    let fx = Fixture::new();
    let (executor, progress) = fx.executor(&fx.config(sh(CONVERT_UNSUPPORTED)));
    let mut events = progress.subscribe();
    let task = fx.pending_task("t1", "it-IT");

    let state = executor.run(&task).await.unwrap();

    assert_eq!(state.status, TaskStatus::Failed);
    assert!(state.error.as_deref().unwrap().contains("Unsupported format"));
    let row = fx.stored("t1");
    assert_eq!(row.status, TaskStatus::Failed);
    assert!(row.error.unwrap().contains("Unsupported format"));

    let mut saw_line = false;
    let mut saw_failed = false;
    while let Ok(event) = events.try_recv() {
        if event.stream == Some(OutputStream::Stderr) {
            saw_line = true;
        }
        if event.phase == ConversionPhase::Failed {
            saw_failed = true;
        }
    }
    assert!(saw_line);
    assert!(saw_failed);
}

#[tokio::test]
async fn test_clean_exit_without_output_fails() {
    let fx = Fixture::new();
    let (executor, _) = fx.executor(&fx.config(sh("exit 0")));
    let task = fx.pending_task("t1", "it-IT");

    let state = executor.run(&task).await.unwrap();

    assert_eq!(state.status, TaskStatus::Failed);
    assert!(state.error.unwrap().contains("did not produce"));
}

#[tokio::test]
async fn test_validator_failure_fails_task() {
    let fx = Fixture::new();
    let mut config = fx.config(sh(CONVERT_OK));
    config.validator = Some(sh(r#"echo "invalid segment" >&2; exit 2"#));
    let (executor, _) = fx.executor(&config);
    let task = fx.pending_task("t1", "it-IT");

    let state = executor.run(&task).await.unwrap();

    assert_eq!(state.status, TaskStatus::Failed);
    assert_eq!(state.validation, Some(ValidationOutcome::Failed));
    let row = fx.stored("t1");
    assert_eq!(row.validation, Some(ValidationOutcome::Failed));
    assert!(row.validation_message.unwrap().contains("invalid segment"));
}

#[tokio::test]
async fn test_validator_receives_artifact_path() {
    let fx = Fixture::new();
    let mut config = fx.config(sh(CONVERT_OK));
    config.validator = Some(sh(r#"[ "$1" = "-file" ] && [ -f "$2" ]"#));
    let (executor, _) = fx.executor(&config);
    let task = fx.pending_task("t1", "it-IT");

    let state = executor.run(&task).await.unwrap();

    assert_eq!(state.status, TaskStatus::Completed);
    assert_eq!(state.validation, Some(ValidationOutcome::Passed));
}

#[tokio::test]
async fn test_derived_failure_is_only_a_warning() {
    let fx = Fixture::new();
    let mut config = fx.config(sh(CONVERT_OK));
    config.derived = Some(DerivedConfig {
        program: "sh".to_string(),
        args: vec!["-c".to_string(), "exit 1".to_string(), "tool".to_string()],
        format: "xjliff".to_string(),
        extension: "xjliff".to_string(),
    });
    let (executor, _) = fx.executor(&config);
    let task = fx.pending_task("t1", "it-IT");

    let state = executor.run(&task).await.unwrap();

    assert_eq!(state.status, TaskStatus::Completed);
    assert!(state.derived_rel_path.is_none());
    assert!(state.warning.unwrap().contains("Derived transform failed"));
    assert!(fx.stored("t1").warning.is_some());
}

#[tokio::test]
async fn test_derived_output_is_recorded() {
    let fx = Fixture::new();
    let mut config = fx.config(sh(CONVERT_OK));
    config.derived = Some(DerivedConfig {
        program: "sh".to_string(),
        args: vec!["-c".to_string(), DERIVE_OK.to_string(), "tool".to_string()],
        format: "xjliff".to_string(),
        extension: "xjliff".to_string(),
    });
    let (executor, _) = fx.executor(&config);
    let task = fx.pending_task("t1", "it-IT");

    let state = executor.run(&task).await.unwrap();

    let rel = state.derived_rel_path.unwrap();
    assert_eq!(rel, "artifacts/xjliff/en-US__it-IT/f1.xjliff");
    assert!(fx.root.join(&rel).is_file());
    assert_eq!(fx.stored("t1").derived_rel_path.as_deref(), Some(rel.as_str()));
}

#[tokio::test]
async fn test_only_pending_tasks_can_run() {
    let fx = Fixture::new();
    let (executor, _) = fx.executor(&fx.config(sh(CONVERT_OK)));
    let task = fx.pending_task("t1", "it-IT");
    executor.run(&task).await.unwrap();

    let err = executor.run(&task).await.unwrap_err();
    assert!(matches!(
        err,
        LingportError::InvalidTransition {
            from: TaskStatus::Completed,
            to: TaskStatus::Running
        }
    ));
}

#[tokio::test]
async fn test_batch_continues_after_failure() {
    let fx = Fixture::new();
    let script = format!(
        r#"case "$*" in *it-IT*) echo "Unsupported format" >&2; exit 1;; esac
{}"#,
        CONVERT_OK
    );
    let (executor, _) = fx.executor(&fx.config(sh(&script)));
    let tasks = vec![fx.pending_task("t1", "it-IT"), fx.pending_task("t2", "de-DE")];

    let report = executor
        .run_batch("p1", &tasks, &AtomicBool::new(false))
        .await
        .unwrap();

    assert_eq!(report.results.len(), 2);
    assert_eq!(report.results[0].status, TaskStatus::Failed);
    assert_eq!(report.results[1].status, TaskStatus::Completed);
    assert_eq!(report.failed_count(), 1);
    assert_eq!(report.completed_count(), 1);
    assert!(!report.cancelled);
}

#[tokio::test]
async fn test_cancelled_batch_runs_nothing() {
    let fx = Fixture::new();
    let (executor, _) = fx.executor(&fx.config(sh(CONVERT_OK)));
    let tasks = vec![fx.pending_task("t1", "it-IT"), fx.pending_task("t2", "de-DE")];

    let report = executor
        .run_batch("p1", &tasks, &AtomicBool::new(true))
        .await
        .unwrap();

    assert!(report.cancelled);
    assert!(report.results.is_empty());
    assert_eq!(report.skipped.len(), 2);
    assert_eq!(fx.stored("t1").status, TaskStatus::Pending);
}

#[tokio::test]
async fn test_batch_rejects_tasks_of_other_projects() {
    let fx = Fixture::new();
    let (executor, _) = fx.executor(&fx.config(sh(CONVERT_OK)));
    let tasks = vec![fx.pending_task("t1", "it-IT")];

    let err = executor
        .run_batch("other", &tasks, &AtomicBool::new(false))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
}
