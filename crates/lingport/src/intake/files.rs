//! File-set changes on a promoted project. Callers hold the project lock.

use std::path::{Path, PathBuf};

use tracing::{info, instrument, warn};

use super::validation;
use super::IntakeCoordinator;
use crate::db::file_repo::{self, FileRow};
use crate::db::project_repo::{self, ProjectRow};
use crate::db::task_repo;
use crate::db::{now_timestamp, DatabaseError};
use crate::error::{LingportError, Result};
use crate::model::{FileRole, ImportStatus, LanguagePair};
use crate::storage::layout;
use crate::storage::staging::{move_file, remove_file_if_exists};

const NOT_PROCESSABLE: &str = "File is no longer processable";

impl IntakeCoordinator {
    fn project_file(&self, project: &ProjectRow, file_id: &str) -> Result<FileRow> {
        self.db
            .read(|c| file_repo::find_by_id(c, file_id))?
            .filter(|f| f.project_id == project.id)
            .ok_or_else(|| LingportError::not_found("File", file_id))
    }

    /// Deletes a file's stored copy, every artifact produced from it, and
    /// its rows.
    #[instrument(skip_all, fields(project_id = %project.id, file_id = %file_id))]
    pub async fn remove_file(&self, project: &ProjectRow, file_id: &str) -> Result<()> {
        let file = self.project_file(project, file_id)?;
        let tasks = self.db.read(|c| task_repo::list_by_file(c, file_id))?;
        let root = PathBuf::from(&project.root_path);

        if let Some(rel) = &file.rel_path {
            remove_file_if_exists(&layout::resolve_within(&root, rel)?).await?;
        }
        for task in &tasks {
            let outputs = std::iter::once(&task.output_rel_path).chain(task.derived_rel_path.as_ref());
            for rel in outputs {
                remove_file_if_exists(&layout::resolve_within(&root, rel)?).await?;
            }
        }

        self.db.write(|tx| file_repo::delete(tx, file_id))?;
        info!(
            name = %file.original_name,
            artifacts = tasks.len(),
            "File removed"
        );
        Ok(())
    }

    /// Changes a file's role, moving an imported file into the folder of
    /// its new role.
    #[instrument(skip_all, fields(project_id = %project.id, file_id = %file_id, role = %role))]
    pub async fn update_file_role(
        &self,
        project: &ProjectRow,
        file_id: &str,
        role: FileRole,
    ) -> Result<FileRow> {
        let file = self.project_file(project, file_id)?;
        if file.role == role {
            return Ok(file);
        }
        validation::validate_role(role, &file.extension, &file.original_name)?;

        let root = PathBuf::from(&project.root_path);
        let moved = match (&file.rel_path, file.import_status) {
            (Some(rel), ImportStatus::Imported) => {
                Some(move_to_role(&root, rel, &file.original_name, role).await?)
            }
            _ => None,
        };

        let now = now_timestamp();
        let updated = self.db.write(|tx| -> std::result::Result<usize, DatabaseError> {
            let rel = moved.as_ref().map(|(rel, _)| rel.as_str());
            file_repo::update_role(tx, file_id, role, rel, &now)?;
            if role == FileRole::Processable {
                return Ok(0);
            }
            task_repo::fail_open_cycles(tx, file_id, NOT_PROCESSABLE, &now)
        });
        match updated {
            Ok(0) => {}
            Ok(closed) => info!(closed, "Closed open cycles of a file that left the processable role"),
            Err(e) => {
                if let (Some((_, dst)), Some(rel)) = (&moved, &file.rel_path) {
                    let original = layout::resolve_within(&root, rel)?;
                    if let Err(undo) = move_file(dst, &original).await {
                        warn!(error = %undo, "Failed to move file back after registry error");
                    }
                }
                return Err(e.into());
            }
        }

        self.project_file(project, file_id)
    }

    /// Declares more language pairs; ones already declared are ignored.
    pub fn add_language_pairs(
        &self,
        project: &ProjectRow,
        pairs: &[LanguagePair],
    ) -> Result<Vec<LanguagePair>> {
        let pairs = validation::normalize_language_pairs(pairs)?;
        self.db.write(|tx| -> std::result::Result<_, DatabaseError> {
            let existing = project_repo::list_language_pairs(tx, &project.id)?;
            let fresh: Vec<LanguagePair> = pairs
                .into_iter()
                .filter(|p| !existing.contains(p))
                .collect();
            project_repo::insert_language_pairs(tx, &project.id, &fresh)?;
            project_repo::list_language_pairs(tx, &project.id)
        })
        .map_err(Into::into)
    }
}

async fn move_to_role(
    root: &Path,
    rel_path: &str,
    file_name: &str,
    role: FileRole,
) -> Result<(String, PathBuf)> {
    let src = layout::resolve_within(root, rel_path)?;
    let dir = layout::resolve_within(root, &layout::role_rel_dir(role))?;
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| crate::error::StorageError::CreateDirectory {
            path: dir.clone(),
            source: e,
        })?;
    let dst = layout::available_path(&dir, file_name)?;
    move_file(&src, &dst).await?;
    Ok((layout::to_rel_path(root, &dst)?, dst))
}
