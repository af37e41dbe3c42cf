use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::db::default_database_path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    pub projects_root: String,
    /// Registry location; `~/.lingport/data/lingport.db` when unset.
    #[serde(default)]
    pub database_path: Option<String>,
    pub converter: ToolConfig,
    #[serde(default)]
    pub validator: Option<ToolConfig>,
    #[serde(default)]
    pub derived: Option<DerivedConfig>,
    #[serde(default)]
    pub conversion: ConversionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// A config with every optional section at its default.
    pub fn new(projects_root: impl Into<String>, converter: ToolConfig) -> Self {
        Self {
            version: "1.0".to_string(),
            projects_root: projects_root.into(),
            database_path: None,
            converter,
            validator: None,
            derived: None,
            conversion: ConversionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn projects_root(&self) -> PathBuf {
        PathBuf::from(&self.projects_root)
    }

    pub fn database_path(&self) -> Option<PathBuf> {
        self.database_path
            .as_ref()
            .map(PathBuf::from)
            .or_else(default_database_path)
    }
}

/// An external program and the arguments placed before the ones
/// generated per task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ToolConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// Optional second artifact produced from a completed interchange file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DerivedConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_derived_format")]
    pub format: String,
    #[serde(default = "default_derived_extension")]
    pub extension: String,
}

fn default_derived_format() -> String {
    "xjliff".to_string()
}

fn default_derived_extension() -> String {
    "xjliff".to_string()
}

impl DerivedConfig {
    pub fn tool(&self) -> ToolConfig {
        ToolConfig {
            program: self.program.clone(),
            args: self.args.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionConfig {
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default = "default_format_version")]
    pub format_version: String,
    #[serde(default = "default_extension")]
    pub extension: String,
    #[serde(default = "default_true")]
    pub segmentation: bool,
    #[serde(default = "default_true")]
    pub embed: bool,
    /// A pending or running cycle older than this is planned again.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    /// Output lines matching any of these mark the run as failed even
    /// when the tool exits with status 0.
    #[serde(default = "default_failure_patterns")]
    pub failure_patterns: Vec<String>,
    /// Output lines kept per task for diagnostics.
    #[serde(default = "default_log_tail_lines")]
    pub log_tail_lines: usize,
}

fn default_format() -> String {
    "xliff".to_string()
}

fn default_format_version() -> String {
    "2.0".to_string()
}

fn default_extension() -> String {
    "xlf".to_string()
}

fn default_true() -> bool {
    true
}

fn default_stale_after_secs() -> u64 {
    15 * 60
}

fn default_failure_patterns() -> Vec<String> {
    vec![
        r"(?i)unsupported format".to_string(),
        r"(?i)^\s*error:".to_string(),
        r"(?i)exception in thread".to_string(),
    ]
}

fn default_log_tail_lines() -> usize {
    200
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            format: default_format(),
            format_version: default_format_version(),
            extension: default_extension(),
            segmentation: true,
            embed: true,
            stale_after_secs: default_stale_after_secs(),
            failure_patterns: default_failure_patterns(),
            log_tail_lines: default_log_tail_lines(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}
