//! Staging and promotion.
//!
//! Every import is copied into a private staging directory under
//! `<projects_root>/.staging/` first. Promotion then moves the whole
//! directory into place with one rename when source and destination share
//! a volume, and with copy, verify and delete otherwise.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use super::checksum::{copy_with_fingerprint, fingerprint_file, Fingerprint};
use super::layout::{self, ProjectLayout};
use crate::error::StorageError;
use crate::model::FileRole;

// EXDEV on Linux and macOS.
const EXDEV: i32 = 18;

/// One file to copy into a staging area.
#[derive(Debug, Clone)]
pub struct StageRequest {
    pub file_id: String,
    pub source_path: PathBuf,
    pub file_name: String,
    pub role: FileRole,
}

#[derive(Debug, Clone)]
pub enum StageOutcome {
    Staged {
        /// Relative to the staging directory, which mirrors the project root.
        rel_path: String,
        fingerprint: Fingerprint,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone)]
pub struct StagedFile {
    pub file_id: String,
    pub outcome: StageOutcome,
}

/// A private directory holding files for one import.
#[derive(Debug)]
pub struct StagingArea {
    dir: PathBuf,
    files: Vec<StagedFile>,
}

impl StagingArea {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn files(&self) -> &[StagedFile] {
        &self.files
    }

    pub fn failed_count(&self) -> usize {
        self.files
            .iter()
            .filter(|f| matches!(f.outcome, StageOutcome::Failed { .. }))
            .count()
    }
}

/// Result of moving a staging area into its final place.
#[derive(Debug, Clone)]
pub struct Promotion {
    pub final_root: PathBuf,
    /// `false` when the copy fallback was used.
    pub atomic: bool,
}

#[derive(Debug, Clone)]
pub struct StagingManager {
    layout: ProjectLayout,
}

impl StagingManager {
    pub fn new(layout: ProjectLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &ProjectLayout {
        &self.layout
    }

    /// Creates a fresh staging directory. Fails if `key` is already staged.
    pub async fn create(&self, key: &str) -> Result<StagingArea, StorageError> {
        let root = self.layout.staging_root();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| StorageError::CreateDirectory {
                path: root.clone(),
                source: e,
            })?;

        let dir = self.layout.staging_dir(key);
        match tokio::fs::create_dir(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(StorageError::StagingExists(dir));
            }
            Err(e) => {
                return Err(StorageError::CreateDirectory {
                    path: dir,
                    source: e,
                });
            }
        }

        debug!(dir = %dir.display(), "Created staging area");
        Ok(StagingArea {
            dir,
            files: Vec::new(),
        })
    }

    /// Copies each requested file into the staging area.
    ///
    /// A failing file is recorded as [`StageOutcome::Failed`] and does not
    /// stop the others.
    pub async fn stage_files(&self, area: &mut StagingArea, requests: &[StageRequest]) {
        for request in requests {
            let outcome = match stage_one(&area.dir, request).await {
                Ok((rel_path, fingerprint)) => StageOutcome::Staged {
                    rel_path,
                    fingerprint,
                },
                Err(e) => {
                    warn!(
                        file_id = %request.file_id,
                        source = %request.source_path.display(),
                        error = %e,
                        "Failed to stage file"
                    );
                    StageOutcome::Failed {
                        error: e.to_string(),
                    }
                }
            };
            area.files.push(StagedFile {
                file_id: request.file_id.clone(),
                outcome,
            });
        }
    }

    /// Moves the staging directory to `final_root`.
    pub async fn promote(
        &self,
        area: &StagingArea,
        final_root: &Path,
    ) -> Result<Promotion, StorageError> {
        if tokio::fs::symlink_metadata(final_root).await.is_ok() {
            return Err(StorageError::ProjectRootExists(final_root.to_path_buf()));
        }
        if let Some(parent) = final_root.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::CreateDirectory {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }

        match tokio::fs::rename(&area.dir, final_root).await {
            Ok(()) => Ok(Promotion {
                final_root: final_root.to_path_buf(),
                atomic: true,
            }),
            Err(e) if is_cross_device(&e) => {
                warn!(
                    from = %area.dir.display(),
                    to = %final_root.display(),
                    "Rename crosses volumes, promoting by copy"
                );
                promote_by_copy(&area.dir, final_root).await?;
                Ok(Promotion {
                    final_root: final_root.to_path_buf(),
                    atomic: false,
                })
            }
            Err(e) => Err(StorageError::MoveFile {
                from: area.dir.clone(),
                to: final_root.to_path_buf(),
                source: e,
            }),
        }
    }

    /// Moves staged files into an existing project root, next to the
    /// files already there. Returns each file with its final relative path.
    pub async fn merge_into(&self, area: &StagingArea, project_root: &Path) -> Vec<StagedFile> {
        let mut merged = Vec::with_capacity(area.files.len());
        for file in &area.files {
            let outcome = match &file.outcome {
                StageOutcome::Staged {
                    rel_path,
                    fingerprint,
                } => match merge_one(&area.dir, project_root, rel_path).await {
                    Ok(final_rel) => StageOutcome::Staged {
                        rel_path: final_rel,
                        fingerprint: fingerprint.clone(),
                    },
                    Err(e) => {
                        warn!(file_id = %file.file_id, error = %e, "Failed to merge staged file");
                        StageOutcome::Failed {
                            error: e.to_string(),
                        }
                    }
                },
                failed => failed.clone(),
            };
            merged.push(StagedFile {
                file_id: file.file_id.clone(),
                outcome,
            });
        }
        merged
    }

    /// Removes the staging directory and everything in it.
    pub async fn discard(&self, area: StagingArea) {
        if let Err(e) = remove_dir_if_exists(&area.dir).await {
            warn!(dir = %area.dir.display(), error = %e, "Failed to remove staging area");
        }
    }
}

async fn stage_one(
    staging_dir: &Path,
    request: &StageRequest,
) -> Result<(String, Fingerprint), StorageError> {
    let role_dir = staging_dir.join(layout::role_rel_dir(request.role));
    tokio::fs::create_dir_all(&role_dir)
        .await
        .map_err(|e| StorageError::CreateDirectory {
            path: role_dir.clone(),
            source: e,
        })?;

    for candidate in layout::candidate_names(&request.file_name) {
        let dst = role_dir.join(&candidate);
        let mut out = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&dst)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => {
                return Err(StorageError::CopyFile {
                    from: request.source_path.clone(),
                    to: dst,
                    source: e,
                })
            }
        };

        return match copy_with_fingerprint(&request.source_path, &mut out).await {
            Ok(fingerprint) => {
                let rel_path = layout::to_rel_path(staging_dir, &dst)?;
                Ok((rel_path, fingerprint))
            }
            Err(e) => {
                drop(out);
                let _ = tokio::fs::remove_file(&dst).await;
                Err(StorageError::CopyFile {
                    from: request.source_path.clone(),
                    to: dst,
                    source: e,
                })
            }
        };
    }

    Err(StorageError::NameExhausted(role_dir.join(&request.file_name)))
}

async fn merge_one(
    staging_dir: &Path,
    project_root: &Path,
    rel_path: &str,
) -> Result<String, StorageError> {
    let src = layout::resolve_within(staging_dir, rel_path)?;
    let wanted = layout::resolve_within(project_root, rel_path)?;
    let (dir, name) = match (wanted.parent(), wanted.file_name()) {
        (Some(dir), Some(name)) => (dir.to_path_buf(), name.to_string_lossy().into_owned()),
        _ => return Err(StorageError::OutsideRoot(wanted)),
    };
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| StorageError::CreateDirectory {
            path: dir.clone(),
            source: e,
        })?;

    let dst = layout::available_path(&dir, &name)?;
    move_file(&src, &dst).await?;
    layout::to_rel_path(project_root, &dst)
}

fn is_cross_device(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::CrossesDevices || e.raw_os_error() == Some(EXDEV)
}

/// Move a file from `src` to `dst`. Uses `rename` first and falls back to
/// copy + delete when rename fails.
pub(crate) async fn move_file(src: &Path, dst: &Path) -> Result<(), StorageError> {
    if tokio::fs::rename(src, dst).await.is_ok() {
        return Ok(());
    }

    tokio::fs::copy(src, dst)
        .await
        .map_err(|e| StorageError::MoveFile {
            from: src.to_path_buf(),
            to: dst.to_path_buf(),
            source: e,
        })?;
    tokio::fs::remove_file(src)
        .await
        .map_err(|e| StorageError::MoveFile {
            from: src.to_path_buf(),
            to: dst.to_path_buf(),
            source: e,
        })?;
    Ok(())
}

pub(crate) async fn remove_file_if_exists(path: &Path) -> Result<(), StorageError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StorageError::RemovePath {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

pub(crate) async fn remove_dir_if_exists(path: &Path) -> Result<(), StorageError> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StorageError::RemovePath {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Copies `src` to `dst`, checks every file arrived with the same
/// content, then deletes `src`. A partial or mismatched copy is removed
/// again and `src` is left untouched.
pub(crate) async fn promote_by_copy(src: &Path, dst: &Path) -> Result<(), StorageError> {
    let copied = async {
        let files = list_files(src)?;
        copy_tree(src, dst, &files).await?;
        verify_tree(src, dst, &files).await
    }
    .await;

    if let Err(e) = copied {
        let _ = remove_dir_if_exists(dst).await;
        return Err(e);
    }

    if let Err(e) = remove_dir_if_exists(src).await {
        warn!(
            dir = %src.display(),
            error = %e,
            "Promoted by copy but failed to remove staging area"
        );
    }
    Ok(())
}

/// Relative paths of every regular file under `root`, sorted.
fn list_files(root: &Path) -> Result<Vec<PathBuf>, StorageError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(root).to_path_buf();
            StorageError::ReadFile {
                path,
                source: e.into(),
            }
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(rel) = entry.path().strip_prefix(root) {
            files.push(rel.to_path_buf());
        }
    }
    Ok(files)
}

async fn copy_tree(src: &Path, dst: &Path, files: &[PathBuf]) -> Result<(), StorageError> {
    tokio::fs::create_dir_all(dst)
        .await
        .map_err(|e| StorageError::CreateDirectory {
            path: dst.to_path_buf(),
            source: e,
        })?;

    for rel in files {
        let from = src.join(rel);
        let to = dst.join(rel);
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::CreateDirectory {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }
        tokio::fs::copy(&from, &to)
            .await
            .map_err(|e| StorageError::CopyFile {
                from: from.clone(),
                to: to.clone(),
                source: e,
            })?;
    }
    Ok(())
}

async fn verify_tree(src: &Path, dst: &Path, files: &[PathBuf]) -> Result<(), StorageError> {
    for rel in files {
        let from = src.join(rel);
        let to = dst.join(rel);
        let expected = fingerprint_file(&from)
            .await
            .map_err(|e| StorageError::ReadFile {
                path: from.clone(),
                source: e,
            })?;
        let actual = match fingerprint_file(&to).await {
            Ok(fingerprint) => fingerprint,
            Err(_) => {
                return Err(StorageError::VerifyFailed {
                    path: to,
                    reason: "file missing after copy".to_string(),
                })
            }
        };
        if expected != actual {
            return Err(StorageError::VerifyFailed {
                path: to,
                reason: format!(
                    "expected {} bytes with sha256 {}, found {} bytes with sha256 {}",
                    expected.size_bytes, expected.sha256, actual.size_bytes, actual.sha256
                ),
            });
        }
    }
    Ok(())
}
