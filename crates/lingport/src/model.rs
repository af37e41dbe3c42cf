//! Domain vocabulary shared by the registry, planner and executor.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Extensions the converter knows how to turn into an interchange document.
pub const CONVERTIBLE_EXTENSIONS: &[&str] = &[
    "doc", "docx", "ppt", "pptx", "xls", "xlsx", "odt", "odp", "ods", "html", "xml", "dita", "md",
    "xlf", "xliff", "mqxliff", "sdlxliff",
];

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "bmp", "tif", "tiff", "webp"];

static LANGUAGE_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z]{2,3}(-[A-Za-z]{4})?(-(?:[A-Za-z]{2}|[0-9]{3}))?$")
        .unwrap_or_else(|e| panic!("language tag pattern is invalid: {e}"))
});

pub fn is_convertible_extension(extension: &str) -> bool {
    let ext = extension.to_ascii_lowercase();
    CONVERTIBLE_EXTENSIONS.contains(&ext.as_str())
}

pub fn is_valid_language_tag(tag: &str) -> bool {
    LANGUAGE_TAG.is_match(tag)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProjectStatus {
    Creating,
    InProgress,
    Ready,
    Failed,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "CREATING",
            Self::InProgress => "IN_PROGRESS",
            Self::Ready => "READY",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "CREATING" => Some(Self::Creating),
            "IN_PROGRESS" => Some(Self::InProgress),
            "READY" => Some(Self::Ready),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether the project has been promoted and can accept work.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::InProgress | Self::Ready)
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared purpose of an imported file. Also names its folder under `original/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileRole {
    Processable,
    Reference,
    Instructions,
    Image,
    Ocr,
    Undefined,
}

impl FileRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processable => "processable",
            Self::Reference => "reference",
            Self::Instructions => "instructions",
            Self::Image => "image",
            Self::Ocr => "ocr",
            Self::Undefined => "undefined",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "processable" => Some(Self::Processable),
            "reference" => Some(Self::Reference),
            "instructions" => Some(Self::Instructions),
            "image" => Some(Self::Image),
            "ocr" => Some(Self::Ocr),
            "undefined" => Some(Self::Undefined),
            _ => None,
        }
    }

    pub fn infer_from_extension(extension: &str) -> Self {
        let ext = extension.to_ascii_lowercase();
        if is_convertible_extension(&ext) {
            Self::Processable
        } else if ext == "pdf" {
            Self::Reference
        } else if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            Self::Image
        } else {
            Self::Undefined
        }
    }
}

impl fmt::Display for FileRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportStatus {
    Pending,
    Imported,
    Failed,
}

impl ImportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Imported => "imported",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "imported" => Some(Self::Imported),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Transitions reachable through explicit status updates.
    ///
    /// `failed -> pending` is an explicit re-run. `completed` is final; a
    /// new conversion of the same inputs gets a new cycle instead.
    pub fn valid_transitions(&self) -> &'static [TaskStatus] {
        match self {
            Self::Pending => &[Self::Running, Self::Failed],
            Self::Running => &[Self::Completed, Self::Failed],
            Self::Failed => &[Self::Pending],
            Self::Completed => &[],
        }
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        self.valid_transitions().contains(&next)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationOutcome {
    Passed,
    Skipped,
    Failed,
}

impl ValidationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "passed" => Some(Self::Passed),
            "skipped" => Some(Self::Skipped),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Ordered source and target language tags.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LanguagePair {
    pub source: String,
    pub target: String,
}

impl LanguagePair {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }

    /// Directory segment used under `artifacts/<format>/`.
    pub fn directory_name(&self) -> String {
        format!("{}__{}", self.source, self.target)
    }
}

impl fmt::Display for LanguagePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source, self.target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_inference() {
        assert_eq!(FileRole::infer_from_extension("docx"), FileRole::Processable);
        assert_eq!(FileRole::infer_from_extension("DOCX"), FileRole::Processable);
        assert_eq!(FileRole::infer_from_extension("pdf"), FileRole::Reference);
        assert_eq!(FileRole::infer_from_extension("png"), FileRole::Image);
        assert_eq!(FileRole::infer_from_extension("zip"), FileRole::Undefined);
    }

    #[test]
    fn test_language_tags() {
        assert!(is_valid_language_tag("en"));
        assert!(is_valid_language_tag("en-US"));
        assert!(is_valid_language_tag("zh-Hant-TW"));
        assert!(is_valid_language_tag("es-419"));
        assert!(!is_valid_language_tag(""));
        assert!(!is_valid_language_tag("english"));
        assert!(!is_valid_language_tag("en_US"));
    }

    #[test]
    fn test_task_transitions() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Failed.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
    }

    #[test]
    fn test_status_strings_round_trip() {
        for status in [
            ProjectStatus::Creating,
            ProjectStatus::InProgress,
            ProjectStatus::Ready,
            ProjectStatus::Failed,
        ] {
            assert_eq!(ProjectStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ProjectStatus::parse("DONE"), None);
    }

    #[test]
    fn test_pair_directory_name() {
        let pair = LanguagePair::new("en-US", "it-IT");
        assert_eq!(pair.directory_name(), "en-US__it-IT");
        assert_eq!(pair.to_string(), "en-US -> it-IT");
    }

    #[test]
    fn test_project_status_serializes_upper_case() {
        let json = serde_json::to_string(&ProjectStatus::InProgress).unwrap();
        assert_eq!(json, "\"IN_PROGRESS\"");
    }
}
