//! On-disk layout of the projects root.
//!
//! ```text
//! <projects_root>/
//!   .staging/<key>/original/<role>/<file>
//!   <folder>/original/<role>/<file>
//!   <folder>/artifacts/<format>/<src>__<tgt>/<file_id>.<ext>
//! ```
//!
//! Relative paths are stored in the registry with `/` separators.

use std::path::{Component, Path, PathBuf};

use crate::error::StorageError;
use crate::model::{FileRole, LanguagePair};

pub const STAGING_DIR: &str = ".staging";
pub const ORIGINAL_DIR: &str = "original";
pub const ARTIFACTS_DIR: &str = "artifacts";

const MAX_NAME_ATTEMPTS: u32 = 1000;

#[derive(Debug, Clone)]
pub struct ProjectLayout {
    projects_root: PathBuf,
}

impl ProjectLayout {
    pub fn new<P: AsRef<Path>>(projects_root: P) -> Self {
        Self {
            projects_root: projects_root.as_ref().to_path_buf(),
        }
    }

    pub fn projects_root(&self) -> &Path {
        &self.projects_root
    }

    pub fn staging_root(&self) -> PathBuf {
        self.projects_root.join(STAGING_DIR)
    }

    pub fn staging_dir(&self, key: &str) -> PathBuf {
        self.staging_root().join(key)
    }

    pub fn project_root(&self, folder_name: &str) -> PathBuf {
        self.projects_root.join(folder_name)
    }
}

/// `original/<role>`
pub fn role_rel_dir(role: FileRole) -> String {
    format!("{}/{}", ORIGINAL_DIR, role.as_str())
}

/// `artifacts/<format>/<src>__<tgt>/<file_id>.<ext>`
pub fn artifact_rel_path(
    format: &str,
    pair: &LanguagePair,
    file_id: &str,
    extension: &str,
) -> String {
    format!(
        "{}/{}/{}/{}.{}",
        ARTIFACTS_DIR,
        format,
        pair.directory_name(),
        file_id,
        extension
    )
}

/// Joins a stored relative path onto `root`, refusing anything that
/// could land outside it.
pub fn resolve_within(root: &Path, rel_path: &str) -> Result<PathBuf, StorageError> {
    let rel = Path::new(rel_path);
    let mut resolved = root.to_path_buf();
    for component in rel.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            _ => return Err(StorageError::OutsideRoot(rel.to_path_buf())),
        }
    }
    if resolved == root {
        return Err(StorageError::OutsideRoot(rel.to_path_buf()));
    }
    Ok(resolved)
}

/// Expresses `path` relative to `root` with `/` separators.
pub fn to_rel_path(root: &Path, path: &Path) -> Result<String, StorageError> {
    let rel = path
        .strip_prefix(root)
        .map_err(|_| StorageError::OutsideRoot(path.to_path_buf()))?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

/// Derives a folder name from a project name: lowercase ASCII
/// alphanumerics joined by single dashes.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    if slug.is_empty() {
        "project".to_string()
    } else {
        slug
    }
}

/// Splits `name.ext` into `("name", Some(".ext"))`.
fn split_extension(filename: &str) -> (&str, Option<&str>) {
    match filename.rfind('.') {
        Some(dot) if dot > 0 => (&filename[..dot], Some(&filename[dot..])),
        _ => (filename, None),
    }
}

/// Candidate file names for `filename`: the name itself, then
/// `name_2.ext`, `name_3.ext`, ...
pub fn candidate_names(filename: &str) -> impl Iterator<Item = String> + '_ {
    let (base, ext) = split_extension(filename);
    (1..=MAX_NAME_ATTEMPTS).map(move |counter| {
        if counter == 1 {
            filename.to_string()
        } else {
            match ext {
                Some(ext) => format!("{}_{}{}", base, counter, ext),
                None => format!("{}_{}", base, counter),
            }
        }
    })
}

/// First candidate name not present in `directory`.
pub fn available_path(directory: &Path, filename: &str) -> Result<PathBuf, StorageError> {
    for candidate in candidate_names(filename) {
        let path = directory.join(&candidate);
        if std::fs::symlink_metadata(&path).is_err() {
            return Ok(path);
        }
    }
    Err(StorageError::NameExhausted(directory.join(filename)))
}
