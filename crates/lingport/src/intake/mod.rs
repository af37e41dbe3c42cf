//! Project intake: validates a new-project request, registers it in one
//! transaction, then stages and promotes its files.

mod files;
pub mod validation;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::db::file_repo::{self, FileRow};
use crate::db::project_repo::{self, ProjectRow};
use crate::db::{now_timestamp, Database, DatabaseError};
use crate::error::{LingportError, Result};
use crate::model::{ImportStatus, LanguagePair, ProjectStatus};
use crate::storage::layout::slugify;
use crate::storage::{
    ProjectLayout, StageOutcome, StageRequest, StagedFile, StagingArea, StagingManager,
};

pub use validation::{AssetInput, ValidatedAsset};

/// Everything needed to create a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProjectInput {
    pub name: String,
    /// Derived from `name` when absent.
    #[serde(default)]
    pub folder_name: Option<String>,
    #[serde(default)]
    pub subjects: Vec<String>,
    pub language_pairs: Vec<LanguagePair>,
    pub assets: Vec<AssetInput>,
}

/// How the files of one import fared.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StagingReport {
    pub staged: usize,
    pub failed: usize,
    /// `false` when promotion had to copy across volumes.
    pub atomic: bool,
}

/// A freshly created project as the caller sees it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectBundle {
    pub project: ProjectRow,
    pub subjects: Vec<String>,
    pub language_pairs: Vec<LanguagePair>,
    pub files: Vec<FileRow>,
    pub staging: StagingReport,
}

/// A project recorded in the registry whose files are not yet promoted.
pub(crate) struct Registration {
    pub(crate) project: ProjectRow,
    files: Vec<FileRow>,
    assets: Vec<ValidatedAsset>,
    final_root: PathBuf,
}

pub struct IntakeCoordinator {
    db: Database,
    staging: StagingManager,
}

impl IntakeCoordinator {
    pub fn new(db: Database, layout: ProjectLayout) -> Self {
        Self {
            db,
            staging: StagingManager::new(layout),
        }
    }

    fn layout(&self) -> &ProjectLayout {
        self.staging.layout()
    }

    #[instrument(skip_all, fields(name = %input.name))]
    pub async fn create_project(&self, input: &NewProjectInput) -> Result<ProjectBundle> {
        let registration = self.register_project(input).await?;
        let project_id = registration.project.id.clone();

        let staging = match self.stage_and_promote(&registration).await {
            Ok(report) => report,
            Err(e) => {
                error!(project_id = %project_id, error = %e, "Project intake failed");
                self.mark_project_failed(&project_id);
                return Err(e);
            }
        };

        info!(
            project_id = %project_id,
            staged = staging.staged,
            failed = staging.failed,
            atomic = staging.atomic,
            "Project promoted"
        );

        self.load_bundle(&project_id, staging)
    }

    /// Validates the request and records the project, its subjects, pairs
    /// and pending file rows in one transaction. Nothing touches disk
    /// before the transaction commits.
    pub(crate) async fn register_project(&self, input: &NewProjectInput) -> Result<Registration> {
        let name = validation::validate_project_name(&input.name)?;
        let language_pairs = validation::normalize_language_pairs(&input.language_pairs)?;
        let subjects = validation::normalize_subjects(&input.subjects);
        let assets = validation::validate_assets(&input.assets).await?;
        let folder_name = match &input.folder_name {
            Some(folder) => validation::validate_folder_name(folder)?,
            None => slugify(&name),
        };

        let final_root = self.layout().project_root(&folder_name);
        let taken = self
            .db
            .read(|c| project_repo::folder_exists(c, &folder_name))?;
        if taken || tokio::fs::symlink_metadata(&final_root).await.is_ok() {
            return Err(LingportError::validation(format!(
                "A project folder named '{}' already exists",
                folder_name
            )));
        }

        let now = now_timestamp();
        let project = ProjectRow {
            id: Uuid::new_v4().to_string(),
            name,
            folder_name,
            root_path: final_root.to_string_lossy().into_owned(),
            status: ProjectStatus::Creating,
            created_at: now.clone(),
            updated_at: now.clone(),
        };
        let files = new_file_rows(&project.id, &assets, 0, &now);

        self.db.write(|tx| -> std::result::Result<(), DatabaseError> {
            project_repo::insert(tx, &project)?;
            project_repo::insert_subjects(tx, &project.id, &subjects)?;
            project_repo::insert_language_pairs(tx, &project.id, &language_pairs)?;
            for file in &files {
                file_repo::insert(tx, file)?;
            }
            Ok(())
        })?;
        info!(project_id = %project.id, files = files.len(), "Project registered");

        Ok(Registration {
            project,
            files,
            assets,
            final_root,
        })
    }

    /// Copies the registered files into a fresh staging area. File rows
    /// keep no final path until [`Self::promote_staged`] records them.
    pub(crate) async fn stage(&self, registration: &Registration) -> Result<StagingArea> {
        let mut area = self.staging.create(&registration.project.id).await?;
        self.staging
            .stage_files(
                &mut area,
                &stage_requests(&registration.files, &registration.assets),
            )
            .await;
        Ok(area)
    }

    async fn stage_and_promote(&self, registration: &Registration) -> Result<StagingReport> {
        let area = self.stage(registration).await?;
        self.promote_staged(&registration.project.id, area, &registration.final_root)
            .await
    }

    /// Moves a staging area into the project root, then records every
    /// file's outcome and opens the project.
    async fn promote_staged(
        &self,
        project_id: &str,
        area: StagingArea,
        final_root: &Path,
    ) -> Result<StagingReport> {
        let promotion = match self.staging.promote(&area, final_root).await {
            Ok(promotion) => promotion,
            Err(e) => {
                self.staging.discard(area).await;
                return Err(e.into());
            }
        };
        if !promotion.atomic {
            warn!(project_id, "Project promoted by copy, not by rename");
        }

        let now = now_timestamp();
        self.db.write(|tx| -> std::result::Result<(), DatabaseError> {
            record_stage_outcomes(tx, area.files(), &now)?;
            project_repo::update_status(tx, project_id, ProjectStatus::InProgress, &now)?;
            Ok(())
        })?;

        Ok(StagingReport {
            staged: area.files().len() - area.failed_count(),
            failed: area.failed_count(),
            atomic: promotion.atomic,
        })
    }

    fn mark_project_failed(&self, project_id: &str) {
        let now = now_timestamp();
        if let Err(e) = self
            .db
            .write(|tx| project_repo::update_status(tx, project_id, ProjectStatus::Failed, &now))
        {
            error!(project_id, error = %e, "Failed to mark project as failed");
        }
    }

    fn load_bundle(&self, project_id: &str, staging: StagingReport) -> Result<ProjectBundle> {
        self.db.read(|c| {
            let project = project_repo::find_by_id(c, project_id)?
                .ok_or_else(|| LingportError::not_found("Project", project_id))?;
            Ok(ProjectBundle {
                subjects: project_repo::list_subjects(c, project_id)?,
                language_pairs: project_repo::list_language_pairs(c, project_id)?,
                files: file_repo::list_by_project(c, project_id)?,
                project,
                staging,
            })
        })
    }

    /// Imports more files into an existing project root.
    ///
    /// The caller must hold the project's lock.
    #[instrument(skip_all, fields(project_id = %project.id))]
    pub async fn add_files(
        &self,
        project: &ProjectRow,
        assets: &[AssetInput],
    ) -> Result<(Vec<FileRow>, StagingReport)> {
        if !project.status.is_active() {
            return Err(LingportError::validation(format!(
                "Project '{}' does not accept files while {}",
                project.name, project.status
            )));
        }
        let assets = validation::validate_assets(assets).await?;

        let now = now_timestamp();
        let files = self.db.write(|tx| -> std::result::Result<_, DatabaseError> {
            let start = file_repo::next_position(tx, &project.id)?;
            let files = new_file_rows(&project.id, &assets, start, &now);
            for file in &files {
                file_repo::insert(tx, file)?;
            }
            Ok(files)
        })?;

        let key = format!("{}-{}", project.id, Uuid::new_v4().simple());
        let mut area = match self.staging.create(&key).await {
            Ok(area) => area,
            Err(e) => {
                let message = e.to_string();
                self.db.write(|tx| -> std::result::Result<(), DatabaseError> {
                    for file in &files {
                        file_repo::mark_failed(tx, &file.id, &message, &now)?;
                    }
                    Ok(())
                })?;
                return Err(e.into());
            }
        };
        self.staging
            .stage_files(&mut area, &stage_requests(&files, &assets))
            .await;
        let merged = self
            .staging
            .merge_into(&area, Path::new(&project.root_path))
            .await;
        self.staging.discard(area).await;

        let done = now_timestamp();
        self.db
            .write(|tx| record_stage_outcomes(tx, &merged, &done))?;

        let failed = merged
            .iter()
            .filter(|f| matches!(f.outcome, StageOutcome::Failed { .. }))
            .count();
        info!(added = files.len(), failed, "Files added");

        let ids: Vec<&str> = files.iter().map(|f| f.id.as_str()).collect();
        let rows = self.db.read(|c| -> std::result::Result<_, DatabaseError> {
            let mut rows = Vec::with_capacity(ids.len());
            for id in &ids {
                if let Some(row) = file_repo::find_by_id(c, id)? {
                    rows.push(row);
                }
            }
            Ok(rows)
        })?;

        Ok((
            rows,
            StagingReport {
                staged: merged.len() - failed,
                failed,
                atomic: true,
            },
        ))
    }
}

fn new_file_rows(
    project_id: &str,
    assets: &[ValidatedAsset],
    start_position: i64,
    now: &str,
) -> Vec<FileRow> {
    assets
        .iter()
        .enumerate()
        .map(|(index, asset)| FileRow {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            original_name: asset.file_name.clone(),
            source_path: asset.path.to_string_lossy().into_owned(),
            extension: asset.extension.clone(),
            role: asset.role,
            import_status: ImportStatus::Pending,
            import_error: None,
            rel_path: None,
            checksum: None,
            size_bytes: None,
            position: start_position + index as i64,
            created_at: now.to_string(),
            updated_at: now.to_string(),
        })
        .collect()
}

fn stage_requests(files: &[FileRow], assets: &[ValidatedAsset]) -> Vec<StageRequest> {
    files
        .iter()
        .zip(assets)
        .map(|(file, asset)| StageRequest {
            file_id: file.id.clone(),
            source_path: PathBuf::from(&asset.path),
            file_name: asset.file_name.clone(),
            role: asset.role,
        })
        .collect()
}

fn record_stage_outcomes(
    conn: &rusqlite::Connection,
    staged: &[StagedFile],
    now: &str,
) -> std::result::Result<(), DatabaseError> {
    for file in staged {
        match &file.outcome {
            StageOutcome::Staged {
                rel_path,
                fingerprint,
            } => file_repo::mark_imported(
                conn,
                &file.file_id,
                rel_path,
                &fingerprint.sha256,
                fingerprint.size_bytes as i64,
                now,
            )?,
            StageOutcome::Failed { error } => {
                file_repo::mark_failed(conn, &file.file_id, error, now)?
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::model::FileRole;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        sources: PathBuf,
        projects: PathBuf,
        db: Database,
        intake: IntakeCoordinator,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let sources = dir.path().join("sources");
        let projects = dir.path().join("projects");
        std::fs::create_dir_all(&sources).unwrap();
        let db = Database::open_in_memory().unwrap();
        let intake = IntakeCoordinator::new(db.clone(), ProjectLayout::new(&projects));
        Fixture {
            _dir: dir,
            sources,
            projects,
            db,
            intake,
        }
    }

    impl Fixture {
        fn source(&self, name: &str) -> PathBuf {
            let path = self.sources.join(name);
            std::fs::write(&path, format!("content of {}", name)).unwrap();
            path
        }

        fn input(&self, name: &str, assets: Vec<AssetInput>) -> NewProjectInput {
            NewProjectInput {
                name: name.to_string(),
                folder_name: None,
                subjects: vec!["legal".to_string()],
                language_pairs: vec![LanguagePair::new("en-US", "it-IT")],
                assets,
            }
        }
    }

    #[tokio::test]
    async fn test_create_project_promotes_files() {
        let fx = fixture();
        let input = fx.input(
            "Demo Project",
            vec![
                AssetInput::new(fx.source("doc.docx")),
                AssetInput::new(fx.source("glossary.pdf")),
            ],
        );

        let bundle = fx.intake.create_project(&input).await.unwrap();
        assert_eq!(bundle.project.status, ProjectStatus::InProgress);
        assert_eq!(bundle.project.folder_name, "demo-project");
        assert_eq!(bundle.files.len(), 2);
        assert_eq!(bundle.staging.staged, 2);
        assert!(bundle.staging.atomic);
        assert_eq!(bundle.subjects, vec!["legal"]);

        let root = fx.projects.join("demo-project");
        for file in &bundle.files {
            assert_eq!(file.import_status, ImportStatus::Imported);
            let rel = file.rel_path.as_deref().unwrap();
            assert!(!rel.contains(".staging"));
            assert!(root.join(rel).exists());
            assert_eq!(file.checksum.as_ref().unwrap().len(), 64);
        }
        assert_eq!(bundle.files[1].role, FileRole::Reference);
        assert!(!fx.projects.join(".staging").join(&bundle.project.id).exists());
    }

    #[tokio::test]
    async fn test_validation_failure_writes_nothing() {
        let fx = fixture();
        let mut input = fx.input("Demo", vec![AssetInput::new(fx.source("doc.docx"))]);
        input.language_pairs = vec![LanguagePair::new("en-US", "en-US")];

        let err = fx.intake.create_project(&input).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(fx.db.read(project_repo::list).unwrap().is_empty());
        assert!(!fx.projects.exists());
    }

    #[tokio::test]
    async fn test_duplicate_folder_rejected() {
        let fx = fixture();
        let input = fx.input("Demo", vec![AssetInput::new(fx.source("doc.docx"))]);
        fx.intake.create_project(&input).await.unwrap();

        let err = fx.intake.create_project(&input).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(fx.db.read(project_repo::list).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_promotion_failure_marks_project_failed() {
        let fx = fixture();
        let input = fx.input("Demo", vec![AssetInput::new(fx.source("doc.docx"))]);

        // A plain file where the staging root belongs makes staging fail
        // after the project was registered.
        std::fs::create_dir_all(&fx.projects).unwrap();
        std::fs::write(fx.projects.join(".staging"), b"not a directory").unwrap();

        let err = fx.intake.create_project(&input).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Filesystem);

        let projects = fx.db.read(project_repo::list).unwrap();
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].status, ProjectStatus::Failed);
        assert!(!fx.projects.join("demo").exists());
    }

    #[tokio::test]
    async fn test_add_files_appends_in_order() {
        let fx = fixture();
        let input = fx.input("Demo", vec![AssetInput::new(fx.source("doc.docx"))]);
        let bundle = fx.intake.create_project(&input).await.unwrap();

        let other = fx.sources.join("second");
        std::fs::create_dir_all(&other).unwrap();
        std::fs::write(other.join("doc.docx"), b"another doc").unwrap();

        let (added, report) = fx
            .intake
            .add_files(&bundle.project, &[AssetInput::new(other.join("doc.docx"))])
            .await
            .unwrap();
        assert_eq!(report.staged, 1);
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].position, 1);
        assert_eq!(
            added[0].rel_path.as_deref(),
            Some("original/processable/doc_2.docx")
        );

        let staging_root = fx.projects.join(".staging");
        let leftovers = std::fs::read_dir(&staging_root).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_add_files_rejects_failed_project() {
        let fx = fixture();
        let mut project = crate::db::project_repo::tests::sample_project("p1", "demo");
        project.status = ProjectStatus::Failed;
        let err = fx
            .intake
            .add_files(&project, &[AssetInput::new(fx.source("doc.docx"))])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
