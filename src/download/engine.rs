// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The download engine: one resumable HTTP transfer per run.
//!
//! A run picks up where the partial file ends (`Range: bytes=N-`), streams
//! the body into `{taskId}.download` and reports progress at a fixed
//! interval. When the byte count reaches the expected total the file is
//! moved into the model library together with its sidecars.
//!
//! Transfer failures never leave a run as errors. They park the task in
//! `pause` with the message on its status, and the user resumes it.

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_RANGE, CONTENT_TYPE, RANGE};
use reqwest::{Response, StatusCode};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use super::events::{Notifier, TaskEvent};
use super::registry::{StatusRegistry, TaskControl};
use super::store::TaskStore;
use super::types::{TaskContent, TaskPhase, TaskStatus, NO_PREVIEW};
use crate::config::{DownloadSettings, SettingsStore, DEFAULT_USER_AGENT};
use crate::error::{DownloadError, DownloadResult};
use crate::library::{self, PathResolver};
use crate::utils::{format_bytes, mask_sensitive};

/// Bytes written between cancellation checks.
pub const CHUNK_SIZE: usize = 8 * 1024;

/// Tuning knobs of the engine.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub chunk_size: usize,
    pub progress_interval: Duration,
    pub user_agent: String,
    pub connect_timeout: Duration,
    /// Limit on a whole request including the body. None means no limit.
    pub request_timeout: Option<Duration>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            progress_interval: Duration::from_secs(1),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            connect_timeout: Duration::from_secs(30),
            request_timeout: None,
        }
    }
}

impl EngineOptions {
    pub fn from_settings(settings: &DownloadSettings) -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            progress_interval: settings.progress_interval(),
            user_agent: settings.user_agent.clone(),
            connect_timeout: settings.connect_timeout(),
            request_timeout: settings.request_timeout(),
        }
    }
}

/// How the body stream stopped.
enum StreamEnd {
    Cancelled,
    Drained,
}

/// Byte counters of one run.
struct Progress {
    downloaded: u64,
    since_sample: u64,
    last_sample: Instant,
}

impl Progress {
    fn new(downloaded: u64) -> Self {
        Self {
            downloaded,
            since_sample: 0,
            last_sample: Instant::now(),
        }
    }

    fn advance(&mut self, bytes: u64) {
        self.downloaded += bytes;
        self.since_sample += bytes;
    }

    /// Close the current sample, returning bytes since the previous one.
    fn sample(&mut self) -> u64 {
        let bps = self.since_sample;
        self.since_sample = 0;
        self.last_sample = Instant::now();
        bps
    }
}

pub struct DownloadEngine {
    client: reqwest::Client,
    store: TaskStore,
    registry: Arc<StatusRegistry>,
    notifier: Notifier,
    resolver: Arc<dyn PathResolver>,
    settings: Arc<dyn SettingsStore>,
    options: EngineOptions,
}

impl DownloadEngine {
    pub fn new(
        store: TaskStore,
        registry: Arc<StatusRegistry>,
        notifier: Notifier,
        resolver: Arc<dyn PathResolver>,
        settings: Arc<dyn SettingsStore>,
        options: EngineOptions,
    ) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .user_agent(options.user_agent.clone())
            .connect_timeout(options.connect_timeout);
        if let Some(timeout) = options.request_timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            store,
            registry,
            notifier,
            resolver,
            settings,
            options,
        })
    }

    /// Run one transfer attempt for a task.
    ///
    /// Holds the task's writer lock for the whole run. Returns when the task
    /// completed, paused, failed or was removed. A run superseded by a later
    /// resume, or started after removal, returns without touching the task.
    pub async fn run(&self, task_id: &str, control: TaskControl) {
        let _writer = control.writer.lock().await;

        if !self.registry.is_current(task_id, control.generation) {
            tracing::debug!("Task {} was resumed again or removed, skipping run", task_id);
            return;
        }
        if control.cancel.is_cancelled() {
            tracing::debug!("Task {} was stopped while queued", task_id);
            self.settle_paused(task_id, &control, 0);
            return;
        }

        let mut content = match self.store.get(task_id) {
            Ok(content) => content,
            Err(e) if e.is_not_found() => {
                tracing::debug!("Task {} record vanished, skipping run", task_id);
                return;
            }
            Err(e) => {
                self.fail(task_id, &control, e);
                return;
            }
        };

        let result = match self.transfer(task_id, &mut content, &control).await {
            Ok(true) if !self.registry.is_current(task_id, control.generation) => Ok(()),
            Ok(true) => self.finalize(task_id, &content).await,
            Ok(false) => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            self.fail(task_id, &control, e);
        }
    }

    /// Stream the body into the partial file. Ok(true) means all bytes are on disk.
    async fn transfer(
        &self,
        task_id: &str,
        content: &mut TaskContent,
        control: &TaskControl,
    ) -> DownloadResult<bool> {
        if content.download_url.trim().is_empty() {
            return Err(DownloadError::MissingUrl);
        }

        let download_path = self.store.download_path(task_id);
        let mut downloaded = self.store.partial_size(task_id);
        let mut total = content.size_bytes;

        if total > 0 && downloaded > total {
            tracing::warn!(
                "Partial file of {} is larger than expected ({} > {}), starting over",
                task_id,
                downloaded,
                total
            );
            tokio::fs::remove_file(&download_path).await?;
            downloaded = 0;
        }

        self.publish(task_id, control, |status| {
            status.status = TaskPhase::Doing;
            status.bps = 0;
            status.total_size = total;
            status.set_downloaded(downloaded);
        });

        if total > 0 && downloaded == total {
            tracing::info!("{} is already fully downloaded", content.fullname);
            return Ok(true);
        }

        let response = tokio::select! {
            biased;
            _ = control.cancel.cancelled() => {
                self.settle_paused(task_id, control, 0);
                return Ok(false);
            }
            response = self.request(content, downloaded) => response?,
        };
        check_response(&response, &content.fullname)?;

        let restart = response.status() == StatusCode::OK && downloaded > 0;
        if restart {
            tracing::info!(
                "Server ignored the range request for {}, restarting from byte 0",
                content.fullname
            );
            downloaded = 0;
        }

        if let Some(server_total) = server_total(&response, downloaded) {
            if server_total != total {
                tracing::info!(
                    "Total size of {} is {} (was {})",
                    content.fullname,
                    format_bytes(server_total),
                    format_bytes(total)
                );
                total = server_total;
                content.size_bytes = server_total;
                self.store.put(task_id, content)?;
            }
        }
        self.publish(task_id, control, |status| {
            status.total_size = total;
            status.set_downloaded(downloaded);
        });

        let mut file = open_partial(&download_path, restart).await?;
        let mut progress = Progress::new(downloaded);
        let streamed = self
            .stream_body(task_id, response, &mut file, &mut progress, total, control)
            .await;
        let flushed = file.flush().await;
        drop(file);

        let downloaded = progress.downloaded;
        self.registry.update(task_id, |status| status.set_downloaded(downloaded));
        let end = streamed?;
        flushed?;

        match end {
            StreamEnd::Cancelled => {
                let bps = progress.sample();
                self.settle_paused(task_id, control, bps);
                tracing::info!(
                    "Paused {} at {} of {}",
                    content.fullname,
                    format_bytes(downloaded),
                    format_bytes(total)
                );
                Ok(false)
            }
            StreamEnd::Drained => {
                if total == 0 && downloaded > 0 {
                    total = downloaded;
                    content.size_bytes = downloaded;
                    self.store.put(task_id, content)?;
                }
                if total > 0 && downloaded == total {
                    let bps = progress.sample();
                    self.publish(task_id, control, |status| {
                        status.total_size = total;
                        status.set_downloaded(downloaded);
                        status.bps = bps;
                    });
                    Ok(true)
                } else {
                    Err(DownloadError::Incomplete { downloaded, total })
                }
            }
        }
    }

    async fn request(&self, content: &TaskContent, offset: u64) -> DownloadResult<Response> {
        let mut request = self
            .client
            .get(&content.download_url)
            .header(RANGE, format!("bytes={}-", offset));

        let api_key = content
            .download_platform
            .api_key_setting()
            .and_then(|key| self.settings.get_str(key));
        if let Some(api_key) = api_key {
            tracing::debug!(
                "Authorizing {:?} download with key {}",
                content.download_platform,
                mask_sensitive(&api_key, 4)
            );
            request = request.bearer_auth(api_key);
        }

        tracing::debug!("GET {} from byte {}", content.download_url, offset);
        Ok(request.send().await?)
    }

    async fn stream_body(
        &self,
        task_id: &str,
        response: Response,
        file: &mut File,
        progress: &mut Progress,
        total: u64,
        control: &TaskControl,
    ) -> DownloadResult<StreamEnd> {
        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::select! {
                biased;
                _ = control.cancel.cancelled() => return Ok(StreamEnd::Cancelled),
                next = stream.next() => next,
            };
            let Some(chunk) = next else {
                return Ok(StreamEnd::Drained);
            };
            let chunk = chunk?;

            for piece in chunk.chunks(self.options.chunk_size) {
                if control.cancel.is_cancelled() {
                    return Ok(StreamEnd::Cancelled);
                }
                let piece = if total > 0 {
                    let room = total.saturating_sub(progress.downloaded);
                    if room == 0 {
                        tracing::warn!("Server sent more than {} bytes for {}", total, task_id);
                        return Ok(StreamEnd::Drained);
                    }
                    let room = usize::try_from(room).unwrap_or(usize::MAX);
                    &piece[..piece.len().min(room)]
                } else {
                    piece
                };
                file.write_all(piece).await?;
                progress.advance(piece.len() as u64);
            }

            if progress.last_sample.elapsed() >= self.options.progress_interval {
                let downloaded = progress.downloaded;
                let bps = progress.sample();
                tracing::debug!(task = task_id, downloaded, bps, "progress");
                self.publish(task_id, control, |status| {
                    status.set_downloaded(downloaded);
                    status.bps = bps;
                });
            }
        }
    }

    /// Move the finished file and its sidecars into the library and retire the task.
    async fn finalize(&self, task_id: &str, content: &TaskContent) -> DownloadResult<()> {
        let destination = self.resolver.resolve_destination(
            &content.model_type,
            content.path_index,
            &content.fullname,
        )?;
        if destination.exists() {
            return Err(DownloadError::DestinationExists(destination));
        }

        let download_path = self.store.download_path(task_id);
        if let Some(expected) = content.hash("sha256") {
            verify_sha256(&download_path, expected, &content.fullname).await;
        }

        let description_path = self.store.description_path(task_id);
        if let Err(e) = library::save_description(&description_path, &content.description) {
            tracing::warn!("Failed to write description for {}: {}", content.fullname, e);
        }

        let (from, to) = (download_path, destination.clone());
        tokio::task::spawn_blocking(move || library::relocate(&from, &to))
            .await
            .map_err(io::Error::other)??;

        let preview = self.store.preview_name(task_id);
        if preview != NO_PREVIEW {
            if let Some(ext) = Path::new(&preview).extension().and_then(|ext| ext.to_str()) {
                move_sidecar(
                    &self.store.dir().join(&preview),
                    &library::sidecar_path(&destination, ext),
                );
            }
        }
        if description_path.exists() {
            move_sidecar(&description_path, &library::sidecar_path(&destination, "md"));
        }

        if let Err(e) = self.store.remove_record(task_id) {
            tracing::warn!("Failed to remove task record {}: {}", task_id, e);
        }
        self.registry.remove(task_id);
        self.notifier
            .broadcast(TaskEvent::CompleteDownloadTask(task_id.to_string()));
        tracing::info!("Downloaded {} to {}", content.fullname, destination.display());
        Ok(())
    }

    /// Park a task in `pause` with the error attached.
    fn fail(&self, task_id: &str, control: &TaskControl, err: DownloadError) {
        if !self.registry.is_current(task_id, control.generation) {
            tracing::debug!("Task {} stopped after removal or a new resume: {}", task_id, err);
            return;
        }
        tracing::error!("Download {} failed: {}", task_id, err);
        let message = err.to_string();
        self.publish(task_id, control, |status| {
            status.status = TaskPhase::Pause;
            status.bps = 0;
            status.error = Some(message);
        });
    }

    fn settle_paused(&self, task_id: &str, control: &TaskControl, bps: u64) {
        self.publish(task_id, control, |status| {
            status.status = TaskPhase::Pause;
            status.bps = bps;
        });
    }

    /// Update a live task and announce the new status. Tasks being
    /// removed, and runs superseded by a later resume, are skipped.
    fn publish<F>(&self, task_id: &str, control: &TaskControl, f: F)
    where
        F: FnOnce(&mut TaskStatus),
    {
        let notifier = &self.notifier;
        self.registry.update_current(task_id, control.generation, |status| {
            f(status);
            notifier.broadcast(TaskEvent::UpdateDownloadTask(status.clone()));
        });
    }
}

/// Accept only 200/206 responses that are not an HTML page.
fn check_response(response: &Response, fullname: &str) -> DownloadResult<()> {
    let status = response.status();
    if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
        return Err(DownloadError::HttpStatus {
            fullname: fullname.to_string(),
            status: status.as_u16(),
        });
    }

    // Catalogs answer unauthenticated downloads with their login page.
    let is_html = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.trim().to_ascii_lowercase().starts_with("text/html"));
    if is_html {
        return Err(DownloadError::LoginRequired(fullname.to_string()));
    }
    Ok(())
}

/// Full size of the remote file as reported by the server.
fn server_total(response: &Response, offset: u64) -> Option<u64> {
    if response.status() == StatusCode::PARTIAL_CONTENT {
        let from_range = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_content_range_total);
        if from_range.is_some() {
            return from_range;
        }
    }
    response.content_length().map(|len| offset + len)
}

/// Total from a `Content-Range: bytes 100-199/5000` header.
fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.trim().strip_prefix("bytes")?.rsplit_once('/')?;
    total.trim().parse().ok()
}

async fn open_partial(path: &Path, restart: bool) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.create(true);
    if restart {
        options.write(true).truncate(true);
    } else {
        options.append(true);
    }
    options.open(path).await
}

fn move_sidecar(from: &Path, to: &Path) {
    if let Err(e) = library::relocate(from, to) {
        tracing::warn!("Failed to move {:?} to {:?}: {}", from, to, e);
    }
}

/// Compare the file against its published digest. Mismatches are logged only.
async fn verify_sha256(path: &Path, expected: &str, fullname: &str) {
    let path = path.to_path_buf();
    match tokio::task::spawn_blocking(move || library::sha256_file(&path)).await {
        Ok(Ok(actual)) if actual.eq_ignore_ascii_case(expected.trim()) => {
            tracing::debug!("SHA256 of {} verified", fullname);
        }
        Ok(Ok(actual)) => tracing::warn!(
            "SHA256 mismatch for {}: expected {}, got {}",
            fullname,
            expected,
            actual
        ),
        Ok(Err(e)) => tracing::warn!("Could not hash {}: {}", fullname, e),
        Err(e) => tracing::warn!("Hashing {} panicked: {}", fullname, e),
    }
}
