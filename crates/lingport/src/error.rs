use std::path::PathBuf;
use thiserror::Error;

use crate::model::TaskStatus;

/// Machine-checkable classification of a [`LingportError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input; nothing was written to disk or the database.
    Validation,
    /// Copy, rename or permission failure.
    Filesystem,
    /// Constraint or transaction failure; always rolled back.
    Database,
    /// An external tool failed for a task.
    Conversion,
    /// A source file is missing, unreadable or changed since import.
    Integrity,
}

#[derive(Error, Debug)]
pub enum LingportError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Conversion error: {0}")]
    Conversion(#[from] crate::executor::ToolError),

    #[error("Integrity error for file '{file_name}': {reason}")]
    Integrity { file_name: String, reason: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid task transition from {from} to {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },
}

impl LingportError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_)
            | Self::Config(_)
            | Self::NotFound { .. }
            | Self::InvalidTransition { .. } => ErrorKind::Validation,
            Self::Storage(_) => ErrorKind::Filesystem,
            Self::Database(_) => ErrorKind::Database,
            Self::Conversion(_) => ErrorKind::Conversion,
            Self::Integrity { .. } => ErrorKind::Integrity,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },

    #[error("Invalid failure pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Failed to initialize logging: {0}")]
    Logging(String),
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to create directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to copy '{from}' to '{to}': {source}")]
    CopyFile {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to move '{from}' to '{to}': {source}")]
    MoveFile {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove '{path}': {source}")]
    RemovePath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Staging area already exists: {0}")]
    StagingExists(PathBuf),

    #[error("Project root already exists: {0}")]
    ProjectRootExists(PathBuf),

    #[error("Promotion verification failed for '{path}': {reason}")]
    VerifyFailed { path: PathBuf, reason: String },

    #[error("Path escapes the project root: {0}")]
    OutsideRoot(PathBuf),

    #[error("No free file name for '{0}'")]
    NameExhausted(PathBuf),
}

pub type Result<T> = std::result::Result<T, LingportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            LingportError::validation("bad").kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            LingportError::not_found("Project", "p1").kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            LingportError::from(StorageError::StagingExists(PathBuf::from("/tmp/x"))).kind(),
            ErrorKind::Filesystem
        );
        assert_eq!(
            LingportError::from(crate::db::DatabaseError::LockPoisoned).kind(),
            ErrorKind::Database
        );
        assert_eq!(
            LingportError::Integrity {
                file_name: "a.docx".into(),
                reason: "missing".into()
            }
            .kind(),
            ErrorKind::Integrity
        );
    }

    #[test]
    fn test_messages_are_human_readable() {
        let err = LingportError::InvalidTransition {
            from: TaskStatus::Completed,
            to: TaskStatus::Running,
        };
        assert_eq!(
            err.to_string(),
            "Invalid task transition from completed to running"
        );

        let err = LingportError::not_found("Project", "abc");
        assert_eq!(err.to_string(), "Project not found: abc");
    }
}
