// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download manager: the single entry point for creating and steering tasks.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::FutureExt;
use tokio::sync::broadcast;

use super::engine::{DownloadEngine, EngineOptions};
use super::events::{Notifier, TaskEvent};
use super::pool::{normalize_max_workers, PanicHook, WorkerPool};
use super::registry::StatusRegistry;
use super::store::TaskStore;
use super::types::{PreviewAsset, SubmitOutcome, TaskContent, TaskPhase, TaskStatus, NO_PREVIEW};
use crate::config::{Config, SettingsStore, KEY_MAX_TASK_COUNT};
use crate::error::{DownloadError, DownloadResult};
use crate::library::{self, PathResolver};
use crate::utils::generate_task_id;

/// How long delete and shutdown wait for a running transfer to let go of its file.
pub const DEFAULT_RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long startup waits for the downloads directory lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// Error left on a task whose run panicked.
pub const CRASHED_RUN_ERROR: &str = "Download stopped unexpectedly";

/// Construction parameters of a [`DownloadManager`].
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Directory holding task records, partial files and previews.
    pub downloads_dir: PathBuf,
    pub engine: EngineOptions,
    pub lock_timeout: Duration,
    pub release_timeout: Duration,
}

impl ManagerOptions {
    pub fn new(downloads_dir: impl Into<PathBuf>) -> Self {
        Self {
            downloads_dir: downloads_dir.into(),
            engine: EngineOptions::default(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            release_timeout: DEFAULT_RELEASE_TIMEOUT,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let mut options = Self::new(config.downloads_dir()?);
        options.engine = EngineOptions::from_settings(&config.download);
        Ok(options)
    }
}

struct Inner {
    store: TaskStore,
    registry: Arc<StatusRegistry>,
    pool: WorkerPool,
    engine: Arc<DownloadEngine>,
    notifier: Notifier,
    resolver: Arc<dyn PathResolver>,
    release_timeout: Duration,
    /// Held for the manager's lifetime.
    _dir_lock: File,
}

/// Owns the task store, status registry, worker pool and engine.
///
/// Cheap to clone; clones share the same state. Create one per process.
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<Inner>,
}

impl DownloadManager {
    /// Open the downloads directory and start the workers.
    ///
    /// Must be called inside a Tokio runtime. Fails if another process
    /// already manages the same directory.
    pub fn new(
        options: ManagerOptions,
        resolver: Arc<dyn PathResolver>,
        settings: Arc<dyn SettingsStore>,
    ) -> Result<Self> {
        let store = TaskStore::open(&options.downloads_dir).with_context(|| {
            format!("Failed to open downloads directory {}", options.downloads_dir.display())
        })?;
        let dir_lock = store.lock_directory(options.lock_timeout)?;

        let registry = Arc::new(StatusRegistry::new(store.clone()));
        let notifier = Notifier::new();
        let max_workers = normalize_max_workers(settings.get_i64(KEY_MAX_TASK_COUNT));
        let engine = Arc::new(DownloadEngine::new(
            store.clone(),
            Arc::clone(&registry),
            notifier.clone(),
            Arc::clone(&resolver),
            settings,
            options.engine,
        )?);
        let pool = WorkerPool::with_panic_hook(
            max_workers,
            settle_crashed_run(Arc::clone(&registry), notifier.clone()),
        );

        tracing::info!(
            "Download manager ready: {} workers, tasks in {}",
            max_workers,
            store.dir().display()
        );

        Ok(Self {
            inner: Arc::new(Inner {
                store,
                registry,
                pool,
                engine,
                notifier,
                resolver,
                release_timeout: options.release_timeout,
                _dir_lock: dir_lock,
            }),
        })
    }

    /// Create a task and start downloading it. Returns the new task id.
    ///
    /// Validation errors leave nothing behind on disk.
    pub fn create(
        &self,
        content: TaskContent,
        preview: Option<PreviewAsset>,
    ) -> DownloadResult<String> {
        let inner = &self.inner;
        let destination = inner.resolver.resolve_destination(
            &content.model_type,
            content.path_index,
            &content.fullname,
        )?;
        if destination.exists() {
            return Err(DownloadError::DestinationExists(destination));
        }
        if content.download_url.trim().is_empty() {
            return Err(DownloadError::MissingUrl);
        }

        let task_id = generate_task_id();
        if inner.store.exists(&task_id) {
            return Err(DownloadError::TaskExists(task_id));
        }

        if let Err(e) = self.set_up(&task_id, &content, preview.as_ref()) {
            tracing::warn!("Failed to create task for {}: {}", content.fullname, e);
            inner.store.delete(&task_id);
            inner.registry.remove(&task_id);
            return Err(e);
        }
        tracing::info!("Created download task {} for {}", task_id, content.fullname);

        if let Err(e) = self.resume(&task_id) {
            tracing::warn!("Created task {} but could not start it: {}", task_id, e);
        }
        Ok(task_id)
    }

    fn set_up(
        &self,
        task_id: &str,
        content: &TaskContent,
        preview: Option<&PreviewAsset>,
    ) -> DownloadResult<()> {
        let inner = &self.inner;
        let preview_name = match preview {
            Some(asset) => {
                let name = format!("{}.{}", task_id, asset.extension()?);
                library::save_preview(&inner.store.dir().join(&name), asset)?;
                name
            }
            None => NO_PREVIEW.to_string(),
        };

        inner.store.put(task_id, content)?;
        let status = TaskStatus::from_content(task_id, content, preview_name, 0);
        inner.registry.insert(status.clone());
        inner.notifier.broadcast(TaskEvent::CreateDownloadTask(status));
        Ok(())
    }

    /// Ask a running task to stop. The partial file is kept.
    pub fn pause(&self, task_id: &str) -> DownloadResult<TaskStatus> {
        let inner = &self.inner;
        inner.registry.get_or_create(task_id)?;
        if inner.registry.is_removing(task_id) {
            return Err(DownloadError::NotFound(task_id.to_string()));
        }

        let status = inner.registry.pause(task_id)?;
        inner
            .notifier
            .broadcast(TaskEvent::UpdateDownloadTask(status.clone()));
        tracing::info!("Paused task {}", task_id);
        Ok(status)
    }

    /// Submit a task to the worker pool.
    ///
    /// Returns `Existing` without doing anything when the task is already
    /// running or queued. A task that was paused but whose previous run is
    /// still queued or winding down gets a fresh run chained behind it.
    pub fn resume(&self, task_id: &str) -> DownloadResult<SubmitOutcome> {
        let inner = &self.inner;
        inner.registry.get_or_create(task_id)?;
        if inner.registry.is_removing(task_id) {
            return Err(DownloadError::NotFound(task_id.to_string()));
        }
        let tracked = inner.pool.is_tracked(task_id);
        let superseding = tracked
            && inner
                .registry
                .control(task_id)
                .is_some_and(|control| control.cancel.is_cancelled());
        if tracked && !superseding {
            return Ok(SubmitOutcome::Existing);
        }

        let control = inner.registry.arm(task_id)?;
        let generation = control.generation;
        let engine = Arc::clone(&inner.engine);
        let id = task_id.to_string();
        let job = async move {
            engine.run(&id, control).await;
            Ok(())
        }
        .boxed();

        let submitted = if superseding {
            inner.pool.submit_after(task_id, job)
        } else {
            inner.pool.submit(task_id, job)
        };
        match submitted {
            Ok(outcome) => {
                tracing::debug!("Task {} submitted: {:?}", task_id, outcome);
                if outcome == SubmitOutcome::Waiting {
                    self.announce_waiting(task_id, generation);
                }
                Ok(outcome)
            }
            Err(e) => {
                tracing::warn!("Could not submit task {}: {}", task_id, e);
                let stopped = DownloadError::Stopped;
                self.publish(task_id, TaskPhase::Pause, Some(stopped.to_string()));
                Err(stopped)
            }
        }
    }

    /// Stop a task if it is running and remove every file it owns.
    ///
    /// Waits for a running transfer to close its file before removing it.
    /// Unknown ids still get a best-effort cleanup and then fail with NotFound.
    pub async fn delete(&self, task_id: &str) -> DownloadResult<()> {
        let inner = &self.inner;
        let marked = match inner.registry.mark_removing(task_id) {
            Some(marked) => Some(marked),
            None if inner.store.exists(task_id) => {
                inner.registry.get_or_create(task_id)?;
                inner.registry.mark_removing(task_id)
            }
            None => None,
        };
        let Some((before, control)) = marked else {
            let removed = inner.store.delete(task_id);
            tracing::debug!("Delete of unknown task {} removed {} stray files", task_id, removed);
            return Err(DownloadError::NotFound(task_id.to_string()));
        };

        inner
            .notifier
            .broadcast(TaskEvent::DeleteDownloadTask(task_id.to_string()));
        if before.status == TaskPhase::Doing {
            tracing::info!("Stopping task {} before removing it", task_id);
        }

        let writer = match tokio::time::timeout(inner.release_timeout, control.writer.lock()).await {
            Ok(guard) => Some(guard),
            Err(_) => {
                tracing::warn!(
                    "Task {} did not release its file within {:?}, removing anyway",
                    task_id,
                    inner.release_timeout
                );
                None
            }
        };
        let removed = inner.store.delete(task_id);
        inner.registry.remove(task_id);
        drop(writer);

        inner
            .notifier
            .broadcast(TaskEvent::DeleteDownloadTask(task_id.to_string()));
        tracing::info!("Deleted task {} ({} files)", task_id, removed);
        Ok(())
    }

    /// Every task on disk, most recently created first.
    pub fn list(&self) -> DownloadResult<Vec<TaskStatus>> {
        let inner = &self.inner;
        let statuses = inner
            .store
            .list()?
            .into_iter()
            .filter_map(|task_id| match inner.registry.get_or_create(&task_id) {
                Ok(status) => Some(status),
                Err(e) => {
                    tracing::warn!("Skipping unreadable task {}: {}", task_id, e);
                    None
                }
            })
            .collect();
        Ok(statuses)
    }

    pub fn status(&self, task_id: &str) -> DownloadResult<TaskStatus> {
        self.inner.registry.get_or_create(task_id)
    }

    /// Listen to task events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.notifier.subscribe()
    }

    pub fn downloads_dir(&self) -> &std::path::Path {
        self.inner.store.dir()
    }

    pub fn max_workers(&self) -> usize {
        self.inner.pool.max_workers()
    }

    /// Downloads transferring right now.
    pub fn active_count(&self) -> usize {
        self.inner.pool.active_count()
    }

    /// Pause everything that is running or queued and wait for the workers.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        let active = inner.pool.tracked_ids();
        for task_id in &active {
            if let Err(e) = inner.registry.pause(task_id) {
                tracing::debug!("Could not pause {} on shutdown: {}", task_id, e);
            }
        }
        for task_id in &active {
            if let Some(control) = inner.registry.control(task_id) {
                if tokio::time::timeout(inner.release_timeout, control.writer.lock())
                    .await
                    .is_err()
                {
                    tracing::warn!("Task {} still writing at shutdown", task_id);
                }
            }
        }
        inner.pool.shutdown().await;
        tracing::info!("Download manager stopped ({} tasks paused)", active.len());
    }

    /// Show a queued task as waiting, unless its run already started.
    fn announce_waiting(&self, task_id: &str, generation: u64) {
        let notifier = &self.inner.notifier;
        self.inner
            .registry
            .update_current(task_id, generation, |status| {
                if status.status != TaskPhase::Doing {
                    status.status = TaskPhase::Waiting;
                    status.bps = 0;
                    notifier.broadcast(TaskEvent::UpdateDownloadTask(status.clone()));
                }
            });
    }

    fn publish(&self, task_id: &str, phase: TaskPhase, error: Option<String>) {
        let notifier = &self.inner.notifier;
        self.inner.registry.update_live(task_id, |status| {
            status.status = phase;
            status.bps = 0;
            if error.is_some() {
                status.error = error;
            }
            notifier.broadcast(TaskEvent::UpdateDownloadTask(status.clone()));
        });
    }
}

/// Leave a task whose run panicked in `pause` with an error instead of `doing`.
fn settle_crashed_run(registry: Arc<StatusRegistry>, notifier: Notifier) -> PanicHook {
    Arc::new(move |task_id: &str| {
        tracing::warn!("Download of task {} crashed", task_id);
        registry.update_live(task_id, |status| {
            status.status = TaskPhase::Pause;
            status.bps = 0;
            status.error = Some(CRASHED_RUN_ERROR.to_string());
            notifier.broadcast(TaskEvent::UpdateDownloadTask(status.clone()));
        });
    })
}
