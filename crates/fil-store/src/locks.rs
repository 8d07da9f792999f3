use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use fil_bus::{topics, EventBus};
use fil_core::error::StoreError;
use fil_core::types::{BusEvent, FileLock};

/// Collapse `.`, `..` and duplicate separators so that two spellings of the
/// same path share a lock. `..` never escapes the root.
pub fn normalize_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

// ---------------------------------------------------------------------------
// FileLockManager
// ---------------------------------------------------------------------------

/// Exclusive, strictly advisory path-level locks scoped by project.
///
/// One mutex per project keeps acquire/release O(1); locks have no TTL and
/// survive until released or the owning agent is torn down
/// ([`FileLockManager::release_by_agent`]).
pub struct FileLockManager {
    projects: DashMap<Uuid, Arc<Mutex<HashMap<String, FileLock>>>>,
    bus: EventBus,
}

impl FileLockManager {
    pub fn new(bus: EventBus) -> Self {
        Self {
            projects: DashMap::new(),
            bus,
        }
    }

    fn table(&self, project_id: Uuid) -> Arc<Mutex<HashMap<String, FileLock>>> {
        self.projects
            .entry(project_id)
            .or_insert_with(|| Arc::new(Mutex::new(HashMap::new())))
            .clone()
    }

    /// Take the lock for (project, path). Re-acquiring a lock the same
    /// agent already holds returns the existing lock.
    pub fn acquire(
        &self,
        project_id: Uuid,
        path: &str,
        agent_id: Uuid,
        bead_id: Option<Uuid>,
    ) -> Result<FileLock, StoreError> {
        let canonical = normalize_path(path);
        if canonical.is_empty() {
            return Err(StoreError::InvalidArgument(format!(
                "path normalizes to nothing: {path:?}"
            )));
        }

        let table = self.table(project_id);
        let lock = {
            let mut guard = table.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(existing) = guard.get(&canonical) {
                if existing.agent_id == agent_id {
                    return Ok(existing.clone());
                }
                return Err(StoreError::FileLocked {
                    path: canonical,
                    holder: existing.agent_id,
                });
            }
            let lock = FileLock {
                project_id,
                path: canonical.clone(),
                agent_id,
                bead_id,
                acquired_at: Utc::now(),
            };
            guard.insert(canonical, lock.clone());
            lock
        };

        tracing::debug!(project_id = %project_id, path = %lock.path, agent_id = %agent_id, "file lock acquired");
        self.bus.publish(
            BusEvent::new(topics::FILE_LOCK_ACQUIRED, "file_lock_manager")
                .with_project(project_id)
                .with_data("path", serde_json::json!(lock.path))
                .with_data("agent_id", serde_json::json!(agent_id)),
        );
        Ok(lock)
    }

    /// Release (project, path) if `agent_id` holds it.
    pub fn release(&self, project_id: Uuid, path: &str, agent_id: Uuid) -> Result<(), StoreError> {
        let canonical = normalize_path(path);
        let table = self.table(project_id);
        {
            let mut guard = table.lock().unwrap_or_else(|e| e.into_inner());
            match guard.get(&canonical) {
                None => {
                    return Err(StoreError::InvalidArgument(format!(
                        "no lock held on {canonical}"
                    )))
                }
                Some(existing) if existing.agent_id != agent_id => {
                    return Err(StoreError::FileLocked {
                        path: canonical,
                        holder: existing.agent_id,
                    });
                }
                Some(_) => {
                    guard.remove(&canonical);
                }
            }
        }

        self.bus.publish(
            BusEvent::new(topics::FILE_LOCK_RELEASED, "file_lock_manager")
                .with_project(project_id)
                .with_data("path", serde_json::json!(canonical))
                .with_data("agent_id", serde_json::json!(agent_id)),
        );
        Ok(())
    }

    /// Drop every lock the agent holds, across all projects. Agent teardown
    /// MUST call this to prevent leakage.
    pub fn release_by_agent(&self, agent_id: Uuid) -> usize {
        let mut released = 0;
        for entry in self.projects.iter() {
            let mut guard = entry.value().lock().unwrap_or_else(|e| e.into_inner());
            let before = guard.len();
            guard.retain(|_, lock| lock.agent_id != agent_id);
            released += before - guard.len();
        }
        if released > 0 {
            tracing::info!(agent_id = %agent_id, released, "released file locks on agent teardown");
        }
        released
    }

    /// Insert without publishing; used by import.
    pub(crate) fn insert_raw(&self, lock: FileLock) {
        let table = self.table(lock.project_id);
        let mut guard = table.lock().unwrap_or_else(|e| e.into_inner());
        guard.insert(lock.path.clone(), lock);
    }

    pub(crate) fn contains(&self, project_id: Uuid, path: &str) -> bool {
        self.projects
            .get(&project_id)
            .map(|table| {
                table
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .contains_key(path)
            })
            .unwrap_or(false)
    }

    pub(crate) fn clear_all(&self) {
        self.projects.clear();
    }

    /// Current locks, optionally narrowed to one project.
    pub fn list(&self, project_id: Option<Uuid>) -> Vec<FileLock> {
        let mut out = Vec::new();
        match project_id {
            Some(project) => {
                if let Some(table) = self.projects.get(&project) {
                    let guard = table.lock().unwrap_or_else(|e| e.into_inner());
                    out.extend(guard.values().cloned());
                }
            }
            None => {
                for entry in self.projects.iter() {
                    let guard = entry.value().lock().unwrap_or_else(|e| e.into_inner());
                    out.extend(guard.values().cloned());
                }
            }
        }
        out.sort_by(|a, b| a.acquired_at.cmp(&b.acquired_at));
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
