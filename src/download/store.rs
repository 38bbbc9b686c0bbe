// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! On-disk task records.
//!
//! Every task owns a handful of files in the downloads directory, all
//! sharing the task id as their stem:
//!
//! ```text
//! downloads/
//! ├── {taskId}.task       JSON TaskContent, presence == "task exists"
//! ├── {taskId}.download   partial bytes of the model file
//! ├── {taskId}.png        optional preview image
//! └── {taskId}.md         description, written only at completion
//! ```
//!
//! The store does no locking of individual files. A given task's files are
//! only touched by the worker running it or by the manager, and the whole
//! directory is claimed by one process through [`TaskStore::lock_directory`].

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{bail, Context};
use fs2::FileExt;

use super::types::{TaskContent, NO_PREVIEW};
use crate::error::{DownloadError, DownloadResult};

/// Extension of the serialized task descriptor.
pub const TASK_EXT: &str = "task";

/// Extension of the partial download.
pub const DOWNLOAD_EXT: &str = "download";

/// Extensions recognised as preview images.
pub const PREVIEW_EXTS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "bmp", "svg"];

/// Retry interval while waiting for the directory lock.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Name of the lock file claiming the directory for one process.
const LOCK_FILE: &str = ".lock";

/// Durable store of task descriptors and partial files, keyed by task id.
#[derive(Debug, Clone)]
pub struct TaskStore {
    dir: PathBuf,
}

impl TaskStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> DownloadResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// The downloads directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn task_path(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", task_id, TASK_EXT))
    }

    /// Path of the partial download for a task.
    pub fn download_path(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", task_id, DOWNLOAD_EXT))
    }

    /// Path of the description sidecar written at completion.
    pub fn description_path(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{}.md", task_id))
    }

    /// Returns true if a record exists for the task.
    pub fn exists(&self, task_id: &str) -> bool {
        self.task_path(task_id).is_file()
    }

    /// Serialize `content` to `{taskId}.task`, replacing any previous record.
    ///
    /// Writes to a temp file and renames it over the record so a crash
    /// mid-write never leaves a truncated descriptor behind.
    pub fn put(&self, task_id: &str, content: &TaskContent) -> DownloadResult<()> {
        let path = self.task_path(task_id);
        let temp_path = self.dir.join(format!("{}.task-tmp", task_id));

        let body = serde_json::to_vec_pretty(content)?;
        {
            let mut temp_file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)?;
            temp_file.write_all(&body)?;
            temp_file.sync_all()?;
        }

        fs::rename(&temp_path, &path)?;
        Ok(())
    }

    /// Load the descriptor of a task.
    pub fn get(&self, task_id: &str) -> DownloadResult<TaskContent> {
        let path = self.task_path(task_id);
        let body = match fs::read(&path) {
            Ok(body) => body,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(DownloadError::NotFound(task_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&body)?)
    }

    /// Remove only the `.task` record, used once a download is finalized.
    pub fn remove_record(&self, task_id: &str) -> DownloadResult<()> {
        match fs::remove_file(self.task_path(task_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Best-effort removal of every file whose stem is the task id.
    ///
    /// Returns the number of files removed. Missing files are not errors,
    /// so deleting twice is harmless.
    pub fn delete(&self, task_id: &str) -> usize {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("Failed to scan {:?} while deleting {}: {}", self.dir, task_id, e);
                return 0;
            }
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let stem_matches = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .is_some_and(|stem| stem == task_id);
            if !stem_matches || !path.is_file() {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("Failed to remove {:?}: {}", path, e),
            }
        }
        removed
    }

    /// Task ids ordered by record creation time, most recent first.
    pub fn list(&self) -> DownloadResult<Vec<String>> {
        let mut records: Vec<(SystemTime, String)> = Vec::new();

        for entry in fs::read_dir(&self.dir)?.flatten() {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(TASK_EXT) {
                continue;
            }
            let Some(task_id) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            let created = metadata
                .created()
                .or_else(|_| metadata.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            records.push((created, task_id.to_string()));
        }

        records.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        Ok(records.into_iter().map(|(_, id)| id).collect())
    }

    /// Size of the partial download, 0 when there is none.
    pub fn partial_size(&self, task_id: &str) -> u64 {
        fs::metadata(self.download_path(task_id))
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// File name of the preview image stored for a task, if any.
    pub fn preview_name(&self, task_id: &str) -> String {
        PREVIEW_EXTS
            .iter()
            .map(|ext| format!("{}.{}", task_id, ext))
            .find(|name| self.dir.join(name).is_file())
            .unwrap_or_else(|| NO_PREVIEW.to_string())
    }

    /// Claim the directory for this process with an exclusive advisory lock.
    ///
    /// The returned file holds the lock until dropped. Fails once `timeout`
    /// expires while another process holds it.
    pub fn lock_directory(&self, timeout: Duration) -> anyhow::Result<File> {
        let path = self.dir.join(LOCK_FILE);
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("Failed to open lock file: {:?}", path))?;

        let start = Instant::now();
        loop {
            match lock_file.try_lock_exclusive() {
                Ok(()) => return Ok(lock_file),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if start.elapsed() >= timeout {
                        bail!(
                            "Timed out waiting for exclusive lock on {:?} after {:?}. \
                             Another modeldock instance is using this downloads directory.",
                            path,
                            timeout
                        );
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to acquire exclusive lock on {:?}", path));
                }
            }
        }
    }
}
