//! Test harness for isolated workspace tests.
//!
//! Every harness owns a temp directory holding the incoming files, the
//! projects root and the registry database. External tools are shell
//! snippets run as `sh -c <script> tool <args...>`, so `$@` holds the
//! arguments the executor passed.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use lingport::config::{Config, ToolConfig};
use lingport::{
    AssetInput, BroadcastProgress, Database, LanguagePair, NewProjectInput, Workspace,
};

use super::builders::ConfigBuilder;

/// Writes a small XLIFF document to the `-xliff` argument.
pub const CONVERTER_OK: &str = r#"out=""
while [ $# -gt 0 ]; do
  if [ "$1" = "-xliff" ]; then out="$2"; fi
  shift
done
echo "Converting to $out"
printf '<xliff version="2.0"/>' > "$out""#;

/// Fails the way the real converter does on unknown input.
pub const CONVERTER_UNSUPPORTED: &str = r#"echo "Unsupported format" >&2; exit 1"#;

/// Passes when it is handed an existing artifact.
pub const VALIDATOR_OK: &str = r#"[ "$1" = "-file" ] && [ -f "$2" ]"#;

pub const VALIDATOR_FAIL: &str = r#"echo "Validation error: segment 3 is malformed" >&2; exit 1"#;

/// A tool running `script` through `sh`.
pub fn sh_tool(script: &str) -> ToolConfig {
    ToolConfig::new("sh").with_args(["-c", script, "tool"])
}

/// A converter that fails for inputs whose path contains `needle` and
/// behaves like [`CONVERTER_OK`] otherwise.
pub fn converter_failing_on(needle: &str) -> ToolConfig {
    sh_tool(&format!(
        "case \"$*\" in *{}*) echo \"Unsupported format\" >&2; exit 1;; esac\n{}",
        needle, CONVERTER_OK
    ))
}

/// A converter that fails while `flag` exists.
pub fn converter_failing_while(flag: &Path) -> ToolConfig {
    sh_tool(&format!(
        "if [ -e '{}' ]; then echo \"Unsupported format\" >&2; exit 1; fi\n{}",
        flag.display(),
        CONVERTER_OK
    ))
}

/// Isolated environment for a workspace under test.
pub struct TestHarness {
    temp_dir: TempDir,
    /// Where source files are written before import.
    pub incoming_dir: PathBuf,
    pub projects_root: PathBuf,
    pub database_path: PathBuf,
}

impl TestHarness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let base = temp_dir.path();

        let incoming_dir = base.join("incoming");
        let projects_root = base.join("projects");
        std::fs::create_dir_all(&incoming_dir).expect("Failed to create incoming dir");
        std::fs::create_dir_all(&projects_root).expect("Failed to create projects root");

        Self {
            database_path: base.join("data").join("lingport.db"),
            temp_dir,
            incoming_dir,
            projects_root,
        }
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// A config pointing at this harness, with a working converter and
    /// no validator.
    pub fn config(&self) -> ConfigBuilder {
        ConfigBuilder::new(&self.projects_root, sh_tool(CONVERTER_OK))
            .database_path(&self.database_path)
    }

    pub fn workspace(&self, config: Config) -> Workspace {
        self.workspace_with_progress(config).0
    }

    pub fn workspace_with_progress(&self, config: Config) -> (Workspace, BroadcastProgress) {
        let progress = BroadcastProgress::new(1024);
        let db = Database::open(&self.database_path).expect("Failed to open registry");
        let workspace = Workspace::with_database(config, db, Arc::new(progress.clone()))
            .expect("Failed to build workspace");
        (workspace, progress)
    }

    /// Writes a source file to the incoming directory.
    pub fn write_incoming(&self, filename: &str, content: &[u8]) -> PathBuf {
        let path = self.incoming_dir.join(filename);
        std::fs::write(&path, content).expect("Failed to write incoming file");
        path
    }

    /// Entries directly under the projects root.
    pub fn project_dirs(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(&self.projects_root)
            .expect("Failed to list projects root")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    /// Files left in any staging area.
    pub fn staging_leftovers(&self) -> usize {
        walkdir::WalkDir::new(self.projects_root.join(".staging"))
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .count()
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Input for a project translating `en-US` into each of `targets`.
pub fn project_input(name: &str, assets: Vec<AssetInput>, targets: &[&str]) -> NewProjectInput {
    NewProjectInput {
        name: name.to_string(),
        folder_name: None,
        subjects: vec!["legal".to_string()],
        language_pairs: targets
            .iter()
            .map(|t| LanguagePair::new("en-US", *t))
            .collect(),
        assets,
    }
}
