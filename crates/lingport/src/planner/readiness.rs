use std::collections::HashMap;

use super::DesiredState;
use crate::db::task_repo::{CycleKey, TaskRow};
use crate::model::TaskStatus;

/// A project is ready when, for every eligible file and declared pair,
/// the latest cycle is terminal and, if completed, was produced from the
/// file's current checksum. Failed cycles count as terminal.
pub fn is_ready(desired: &DesiredState, latest: &HashMap<CycleKey, TaskRow>) -> bool {
    desired.eligible_files().all(|file| {
        desired.pairs.iter().all(|pair| {
            match latest.get(&desired.cycle_key(&file.id, pair)) {
                Some(task) => match task.status {
                    TaskStatus::Completed => {
                        file.checksum.as_deref() == Some(task.source_checksum.as_str())
                    }
                    TaskStatus::Failed => true,
                    TaskStatus::Pending | TaskStatus::Running => false,
                },
                None => false,
            }
        })
    })
}
