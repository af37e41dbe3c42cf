//! Gathers the observed side of a plan: source checksums on disk, the
//! latest cycle per conversion, and which completed outputs still exist.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tracing::warn;

use super::DesiredState;
use crate::db::task_repo::{self, CycleKey, TaskRow};
use crate::db::Database;
use crate::error::Result;
use crate::model::TaskStatus;
use crate::storage::{fingerprint_file, layout};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceObservation {
    Present { sha256: String },
    Missing,
    Unreadable(String),
}

#[derive(Debug, Clone)]
pub struct ObservedState {
    pub sources: HashMap<String, SourceObservation>,
    pub latest: HashMap<CycleKey, TaskRow>,
    /// Ids of completed cycles whose output file is on disk.
    pub outputs_present: HashSet<String>,
    pub now: DateTime<Utc>,
}

impl ObservedState {
    pub fn source(&self, file_id: &str) -> Option<&SourceObservation> {
        self.sources.get(file_id)
    }

    pub fn output_exists(&self, task_id: &str) -> bool {
        self.outputs_present.contains(task_id)
    }
}

pub(super) async fn observe(db: &Database, desired: &DesiredState) -> Result<ObservedState> {
    let root = PathBuf::from(&desired.project.root_path);
    let mut sources = HashMap::new();

    for file in desired.eligible_files() {
        let Some(rel) = file.rel_path.as_deref() else {
            continue;
        };
        let observation = match layout::resolve_within(&root, rel) {
            Ok(path) => match fingerprint_file(&path).await {
                Ok(fp) => SourceObservation::Present { sha256: fp.sha256 },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => SourceObservation::Missing,
                Err(e) => SourceObservation::Unreadable(e.to_string()),
            },
            Err(e) => SourceObservation::Unreadable(e.to_string()),
        };
        if !matches!(observation, SourceObservation::Present { .. }) {
            warn!(file_id = %file.id, name = %file.original_name, ?observation, "Source file failed integrity check");
        }
        sources.insert(file.id.clone(), observation);
    }

    let latest = db.read(|c| task_repo::latest_cycles(c, &desired.project.id))?;

    let mut outputs_present = HashSet::new();
    for task in latest.values() {
        if task.status != TaskStatus::Completed {
            continue;
        }
        if let Ok(path) = layout::resolve_within(&root, &task.output_rel_path) {
            if tokio::fs::metadata(&path).await.map(|m| m.is_file()).unwrap_or(false) {
                outputs_present.insert(task.id.clone());
            }
        }
    }

    Ok(ObservedState {
        sources,
        latest,
        outputs_present,
        now: Utc::now(),
    })
}
