//! Request validation. Nothing here writes to disk or the registry.

use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{LingportError, Result};
use crate::model::{is_convertible_extension, is_valid_language_tag, FileRole, LanguagePair};

const NAME_MIN_CHARS: usize = 2;
const NAME_MAX_CHARS: usize = 120;

/// A source file offered for import.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetInput {
    pub path: PathBuf,
    /// Inferred from the extension when absent.
    #[serde(default)]
    pub role: Option<FileRole>,
}

impl AssetInput {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            role: None,
        }
    }

    pub fn with_role(path: impl Into<PathBuf>, role: FileRole) -> Self {
        Self {
            path: path.into(),
            role: Some(role),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValidatedAsset {
    pub path: PathBuf,
    pub file_name: String,
    pub extension: String,
    pub role: FileRole,
}

pub fn validate_project_name(name: &str) -> Result<String> {
    let trimmed = name.trim();
    let chars = trimmed.chars().count();
    if !(NAME_MIN_CHARS..=NAME_MAX_CHARS).contains(&chars) {
        return Err(LingportError::validation(format!(
            "Project name must be between {} and {} characters",
            NAME_MIN_CHARS, NAME_MAX_CHARS
        )));
    }
    if !trimmed.chars().any(char::is_alphanumeric) {
        return Err(LingportError::validation(
            "Project name must contain at least one letter or digit",
        ));
    }
    Ok(trimmed.to_string())
}

/// An explicit folder name must already be a safe single path segment.
pub fn validate_folder_name(folder: &str) -> Result<String> {
    let trimmed = folder.trim();
    if trimmed.is_empty() || trimmed.chars().count() > NAME_MAX_CHARS {
        return Err(LingportError::validation(format!(
            "Folder name must be between 1 and {} characters",
            NAME_MAX_CHARS
        )));
    }
    if trimmed.starts_with('.') {
        return Err(LingportError::validation(format!(
            "Folder name '{}' must not start with a dot",
            trimmed
        )));
    }
    if !trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(LingportError::validation(format!(
            "Folder name '{}' may only contain letters, digits, '-' and '_'",
            trimmed
        )));
    }
    Ok(trimmed.to_string())
}

/// Trims tags, checks their shape, drops duplicate pairs and keeps the
/// first-seen order.
pub fn normalize_language_pairs(pairs: &[LanguagePair]) -> Result<Vec<LanguagePair>> {
    let mut seen = HashSet::new();
    let mut normalized = Vec::with_capacity(pairs.len());

    for pair in pairs {
        let source = pair.source.trim();
        let target = pair.target.trim();
        for tag in [source, target] {
            if !is_valid_language_tag(tag) {
                return Err(LingportError::validation(format!(
                    "Invalid language tag: '{}'",
                    tag
                )));
            }
        }
        if source.eq_ignore_ascii_case(target) {
            return Err(LingportError::validation(format!(
                "Source and target language must differ ({})",
                source
            )));
        }
        let pair = LanguagePair::new(source, target);
        if seen.insert(pair.clone()) {
            normalized.push(pair);
        }
    }

    if normalized.is_empty() {
        return Err(LingportError::validation(
            "At least one language pair is required",
        ));
    }
    Ok(normalized)
}

/// Trimmed, non-empty, de-duplicated subjects.
pub fn normalize_subjects(subjects: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    subjects
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter(|s| seen.insert(s.to_string()))
        .map(str::to_string)
        .collect()
}

pub fn validate_role(role: FileRole, extension: &str, file_name: &str) -> Result<()> {
    if role == FileRole::Processable && !is_convertible_extension(extension) {
        return Err(LingportError::validation(format!(
            "'{}' cannot be processable: extension '{}' is not convertible",
            file_name, extension
        )));
    }
    Ok(())
}

/// Checks every asset exists as a regular file with an extension and
/// that none is listed twice.
pub async fn validate_assets(assets: &[AssetInput]) -> Result<Vec<ValidatedAsset>> {
    if assets.is_empty() {
        return Err(LingportError::validation("At least one file is required"));
    }

    let mut seen = HashSet::new();
    let mut validated = Vec::with_capacity(assets.len());

    for asset in assets {
        let display = asset.path.display().to_string();
        let metadata = tokio::fs::metadata(&asset.path).await.map_err(|_| {
            LingportError::validation(format!("File not found: {}", display))
        })?;
        if !metadata.is_file() {
            return Err(LingportError::validation(format!(
                "Not a regular file: {}",
                display
            )));
        }

        let canonical = tokio::fs::canonicalize(&asset.path)
            .await
            .unwrap_or_else(|_| asset.path.clone());
        if !seen.insert(canonical.clone()) {
            return Err(LingportError::validation(format!(
                "File listed more than once: {}",
                display
            )));
        }

        let file_name = canonical
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| LingportError::validation(format!("Invalid file name: {}", display)))?;
        let extension = canonical
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .ok_or_else(|| {
                LingportError::validation(format!("File has no extension: {}", display))
            })?;

        let role = asset
            .role
            .unwrap_or_else(|| FileRole::infer_from_extension(&extension));
        validate_role(role, &extension, &file_name)?;

        validated.push(ValidatedAsset {
            path: canonical,
            file_name,
            extension,
            role,
        });
    }

    Ok(validated)
}
