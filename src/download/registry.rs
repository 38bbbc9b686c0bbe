// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-memory live status of every known task.
//!
//! The registry lives as long as the process. After a restart it starts
//! empty and rebuilds an entry the first time a task is asked for, from the
//! task record and the size of its partial file.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use super::store::TaskStore;
use super::types::{TaskPhase, TaskStatus};
use crate::error::{DownloadError, DownloadResult};
use crate::locks::resilient_lock;

/// Handles the manager uses to steer an engine run.
#[derive(Debug, Clone)]
pub struct TaskControl {
    /// Cancelled to stop the transfer at the next chunk boundary.
    pub cancel: CancellationToken,
    /// Held by the engine while the partial file is open. Acquiring it
    /// after cancelling is the acknowledgement that writing has stopped.
    pub writer: Arc<tokio::sync::Mutex<()>>,
    /// Bumped every time a cancelled token is replaced. A run whose
    /// generation is behind the registry's has been superseded.
    pub generation: u64,
}

impl TaskControl {
    fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            writer: Arc::new(tokio::sync::Mutex::new(())),
            generation: 0,
        }
    }
}

#[derive(Debug)]
struct TaskEntry {
    status: TaskStatus,
    control: TaskControl,
    /// Set once deletion starts; the engine stops reporting.
    removing: bool,
}

impl TaskEntry {
    fn new(status: TaskStatus) -> Self {
        Self {
            status,
            control: TaskControl::new(),
            removing: false,
        }
    }
}

/// Map of task id to live status, rehydrated lazily from the [`TaskStore`].
#[derive(Debug)]
pub struct StatusRegistry {
    store: TaskStore,
    entries: Mutex<HashMap<String, TaskEntry>>,
}

impl StatusRegistry {
    pub fn new(store: TaskStore) -> Self {
        Self {
            store,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Rebuild a status from disk. Fails with NotFound without a record.
    fn hydrate(&self, task_id: &str) -> DownloadResult<TaskStatus> {
        let content = self.store.get(task_id)?;
        let downloaded = self.store.partial_size(task_id);
        let preview = self.store.preview_name(task_id);
        tracing::debug!("Rehydrated task {} at {} bytes", task_id, downloaded);
        Ok(TaskStatus::from_content(task_id, &content, preview, downloaded))
    }

    /// Current status of a task, loading it from disk if not cached.
    pub fn get_or_create(&self, task_id: &str) -> DownloadResult<TaskStatus> {
        if let Some(entry) = resilient_lock(&self.entries).get(task_id) {
            return Ok(entry.status.clone());
        }

        // Disk I/O happens outside the lock.
        let status = self.hydrate(task_id)?;

        let mut entries = resilient_lock(&self.entries);
        let entry = entries
            .entry(task_id.to_string())
            .or_insert_with(|| TaskEntry::new(status));
        Ok(entry.status.clone())
    }

    /// Seed (or replace) the status of a freshly created task.
    pub fn insert(&self, status: TaskStatus) {
        let mut entries = resilient_lock(&self.entries);
        entries.insert(status.task_id.clone(), TaskEntry::new(status));
    }

    /// Mutate a cached status in place. Returns the updated snapshot, or
    /// `None` when the task is not in the registry.
    pub fn update<F>(&self, task_id: &str, f: F) -> Option<TaskStatus>
    where
        F: FnOnce(&mut TaskStatus),
    {
        let mut entries = resilient_lock(&self.entries);
        entries.get_mut(task_id).map(|entry| {
            f(&mut entry.status);
            entry.status.clone()
        })
    }

    /// Like [`update`](Self::update), but leaves tasks that are being
    /// deleted untouched and returns `None` for them.
    ///
    /// `f` runs under the registry lock, so anything it publishes is
    /// ordered before a concurrent [`mark_removing`](Self::mark_removing).
    pub fn update_live<F>(&self, task_id: &str, f: F) -> Option<TaskStatus>
    where
        F: FnOnce(&mut TaskStatus),
    {
        let mut entries = resilient_lock(&self.entries);
        match entries.get_mut(task_id) {
            Some(entry) if !entry.removing => {
                f(&mut entry.status);
                Some(entry.status.clone())
            }
            _ => None,
        }
    }

    /// Like [`update_live`](Self::update_live), restricted to the run
    /// holding `generation`. Superseded runs get `None`.
    pub fn update_current<F>(&self, task_id: &str, generation: u64, f: F) -> Option<TaskStatus>
    where
        F: FnOnce(&mut TaskStatus),
    {
        let mut entries = resilient_lock(&self.entries);
        match entries.get_mut(task_id) {
            Some(entry) if !entry.removing && entry.control.generation == generation => {
                f(&mut entry.status);
                Some(entry.status.clone())
            }
            _ => None,
        }
    }

    /// True while the task is live and `generation` is its latest run.
    pub fn is_current(&self, task_id: &str, generation: u64) -> bool {
        resilient_lock(&self.entries)
            .get(task_id)
            .is_some_and(|entry| !entry.removing && entry.control.generation == generation)
    }

    /// Evict a task. Disk is left alone.
    pub fn remove(&self, task_id: &str) -> Option<TaskStatus> {
        resilient_lock(&self.entries)
            .remove(task_id)
            .map(|entry| entry.status)
    }

    pub fn contains(&self, task_id: &str) -> bool {
        resilient_lock(&self.entries).contains_key(task_id)
    }

    /// Control handles of a cached task.
    pub fn control(&self, task_id: &str) -> Option<TaskControl> {
        resilient_lock(&self.entries)
            .get(task_id)
            .map(|entry| entry.control.clone())
    }

    /// Prepare a task to run: keep the live cancellation token, or install a
    /// fresh one if the previous run was cancelled. Clears the last error.
    pub fn arm(&self, task_id: &str) -> DownloadResult<TaskControl> {
        self.get_or_create(task_id)?;

        let mut entries = resilient_lock(&self.entries);
        let entry = match entries.get_mut(task_id) {
            Some(entry) => entry,
            // Removed between the two locks: a concurrent delete won.
            None => return Err(DownloadError::NotFound(task_id.to_string())),
        };
        if entry.control.cancel.is_cancelled() {
            entry.control.cancel = CancellationToken::new();
            entry.control.generation += 1;
        }
        entry.status.error = None;
        Ok(entry.control.clone())
    }

    /// Flip a task to `pause` and cancel its current run, if any.
    pub fn pause(&self, task_id: &str) -> DownloadResult<TaskStatus> {
        self.get_or_create(task_id)?;

        let mut entries = resilient_lock(&self.entries);
        match entries.get_mut(task_id) {
            Some(entry) => {
                entry.status.status = TaskPhase::Pause;
                entry.control.cancel.cancel();
                Ok(entry.status.clone())
            }
            None => Err(DownloadError::NotFound(task_id.to_string())),
        }
    }

    /// Start removing a task: mark it, park it in the transitional
    /// `waiting` phase and cancel any run. Returns the status as it was
    /// before, so the caller knows whether a transfer was active.
    pub fn mark_removing(&self, task_id: &str) -> Option<(TaskStatus, TaskControl)> {
        let mut entries = resilient_lock(&self.entries);
        entries.get_mut(task_id).map(|entry| {
            let before = entry.status.clone();
            entry.removing = true;
            entry.status.status = TaskPhase::Waiting;
            entry.control.cancel.cancel();
            (before, entry.control.clone())
        })
    }

    /// True when the task is being deleted or is already gone.
    pub fn is_removing(&self, task_id: &str) -> bool {
        resilient_lock(&self.entries)
            .get(task_id)
            .map_or(true, |entry| entry.removing)
    }
}
