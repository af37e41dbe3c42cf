//! Per-project mutual exclusion for filesystem mutations.
//!
//! Operations on different projects never wait on each other. Entries
//! are dropped from the registry once nobody holds or waits on them.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Default)]
pub struct ProjectLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ProjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>> {
        // A panic while holding the map lock leaves the map itself intact.
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Waits until the project's lock is free and takes it.
    pub async fn acquire(&self, project_id: &str) -> ProjectLockGuard<'_> {
        let lock = {
            let mut registry = self.registry();
            Arc::clone(
                registry
                    .entry(project_id.to_string())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };

        let guard = lock.lock_owned().await;
        log::debug!("Acquired project lock for {}", project_id);

        ProjectLockGuard {
            owner: self,
            project_id: project_id.to_string(),
            guard: Some(guard),
        }
    }

    /// Runs `work` while holding the project's lock.
    pub async fn with_project_lock<F, Fut, T>(&self, project_id: &str, work: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.acquire(project_id).await;
        work().await
    }

    /// Whether the project's lock is currently held.
    pub fn is_locked(&self, project_id: &str) -> bool {
        self.registry()
            .get(project_id)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Number of projects with a live lock entry.
    pub fn tracked(&self) -> usize {
        self.registry().len()
    }

    fn release(&self, project_id: &str) {
        let mut registry = self.registry();
        // Only the map still references an idle entry.
        let idle = registry
            .get(project_id)
            .map(|lock| Arc::strong_count(lock) == 1)
            .unwrap_or(false);
        if idle {
            registry.remove(project_id);
        }
    }
}

/// Holds a project's lock until dropped.
pub struct ProjectLockGuard<'a> {
    owner: &'a ProjectLocks,
    project_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl ProjectLockGuard<'_> {
    pub fn project_id(&self) -> &str {
        &self.project_id
    }
}

impl Drop for ProjectLockGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.owner.release(&self.project_id);
        log::debug!("Released project lock for {}", self.project_id);
    }
}
