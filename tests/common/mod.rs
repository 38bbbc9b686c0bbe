// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Shared fixtures: an in-process file server with Range support and a
//! manager wired to temporary directories.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::StreamExt;
use tempfile::TempDir;
use tokio::sync::broadcast;

use modeldock::config::{MemorySettings, KEY_MAX_TASK_COUNT};
use modeldock::download::{
    DownloadManager, EngineOptions, ManagerOptions, Platform, TaskContent, TaskEvent, TaskStatus,
};
use modeldock::library::ModelFolders;

pub const MODEL_TYPE: &str = "checkpoints";

/// A file the test server hands out.
#[derive(Debug, Clone)]
pub struct ServedFile {
    pub body: Vec<u8>,
    pub content_type: String,
    /// Bytes per streamed chunk.
    pub chunk_size: usize,
    /// Pause before each chunk.
    pub delay: Duration,
    /// Answer `Range` requests with 206; otherwise always send everything.
    pub honor_range: bool,
    /// Fixed status instead of the file.
    pub status: Option<StatusCode>,
}

impl ServedFile {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            content_type: "application/octet-stream".to_string(),
            chunk_size: 1024,
            delay: Duration::ZERO,
            honor_range: true,
            status: None,
        }
    }

    /// Stream `chunk_size` bytes every `delay`.
    pub fn throttled(mut self, chunk_size: usize, delay: Duration) -> Self {
        self.chunk_size = chunk_size;
        self.delay = delay;
        self
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = content_type.to_string();
        self
    }
}

#[derive(Default)]
pub struct FileServerState {
    files: Mutex<HashMap<String, ServedFile>>,
    /// `Range` header of every request, in arrival order, by file name.
    ranges: Mutex<Vec<(String, Option<String>)>>,
}

pub struct FileServer {
    pub addr: SocketAddr,
    state: Arc<FileServerState>,
}

impl FileServer {
    pub async fn start() -> Self {
        let state = Arc::new(FileServerState::default());
        let router = Router::new()
            .route("/files/:name", get(serve_file))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn put(&self, name: &str, file: ServedFile) -> String {
        self.state.files.lock().unwrap().insert(name.to_string(), file);
        self.url(name)
    }

    pub fn update<F: FnOnce(&mut ServedFile)>(&self, name: &str, f: F) {
        let mut files = self.state.files.lock().unwrap();
        f(files.get_mut(name).expect("file not served"));
    }

    pub fn url(&self, name: &str) -> String {
        format!("http://{}/files/{}", self.addr, name)
    }

    /// Range headers received for one file.
    pub fn ranges(&self, name: &str) -> Vec<Option<String>> {
        self.state
            .ranges
            .lock()
            .unwrap()
            .iter()
            .filter(|(file, _)| file == name)
            .map(|(_, range)| range.clone())
            .collect()
    }
}

fn range_start(value: &str) -> Option<usize> {
    value.strip_prefix("bytes=")?.strip_suffix('-')?.parse().ok()
}

async fn serve_file(
    State(state): State<Arc<FileServerState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Response {
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.ranges.lock().unwrap().push((name.clone(), range.clone()));

    let Some(file) = state.files.lock().unwrap().get(&name).cloned() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if let Some(status) = file.status {
        return status.into_response();
    }

    let len = file.body.len();
    let start = range.as_deref().and_then(range_start).unwrap_or(0);
    let (status, start) = if file.honor_range && start > 0 {
        if start >= len {
            return StatusCode::RANGE_NOT_SATISFIABLE.into_response();
        }
        (StatusCode::PARTIAL_CONTENT, start)
    } else {
        (StatusCode::OK, 0)
    };

    let chunks: Vec<Bytes> = file.body[start..]
        .chunks(file.chunk_size.max(1))
        .map(Bytes::copy_from_slice)
        .collect();
    let delay = file.delay;
    let stream = futures_util::stream::iter(chunks).then(move |chunk| async move {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok::<_, std::io::Error>(chunk)
    });

    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, file.content_type.as_str())
        .header(header::CONTENT_LENGTH, len - start);
    if status == StatusCode::PARTIAL_CONTENT {
        builder = builder.header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", start, len - 1, len),
        );
    }
    builder.body(Body::from_stream(stream)).unwrap()
}

/// Deterministic, non-repeating-looking test payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

pub struct Harness {
    pub dir: TempDir,
    pub manager: DownloadManager,
}

impl Harness {
    pub fn new(max_workers: i64) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let manager = open_manager(&dir, max_workers);
        Self { dir, manager }
    }

    pub fn models_dir(&self) -> PathBuf {
        self.dir.path().join("models").join(MODEL_TYPE)
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.dir.path().join("downloads")
    }

    /// Files in the downloads directory other than the lock file.
    pub fn download_files(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.downloads_dir())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name != ".lock")
            .collect();
        names.sort();
        names
    }

    pub fn partial_size(&self, task_id: &str) -> u64 {
        std::fs::metadata(self.downloads_dir().join(format!("{}.download", task_id)))
            .map(|m| m.len())
            .unwrap_or(0)
    }
}

pub fn open_manager(dir: &TempDir, max_workers: i64) -> DownloadManager {
    let resolver = ModelFolders::default().with_folder(MODEL_TYPE, dir.path().join("models").join(MODEL_TYPE));
    let settings = MemorySettings::new().with(KEY_MAX_TASK_COUNT, max_workers);

    let mut options = ManagerOptions::new(dir.path().join("downloads"));
    options.engine = EngineOptions {
        progress_interval: Duration::from_millis(50),
        ..EngineOptions::default()
    };
    DownloadManager::new(options, Arc::new(resolver), Arc::new(settings)).unwrap()
}

pub fn content(fullname: &str, url: &str, size_bytes: u64) -> TaskContent {
    TaskContent {
        model_type: MODEL_TYPE.to_string(),
        path_index: 0,
        fullname: fullname.to_string(),
        description: format!("Notes for {}", fullname),
        download_platform: Platform::Other,
        download_url: url.to_string(),
        size_bytes,
        hashes: None,
    }
}

/// Poll `cond` until it holds or five seconds pass.
pub async fn wait_until<F: FnMut() -> bool>(mut cond: F) -> bool {
    for _ in 0..500 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Current status, or None once the task is gone.
pub fn status(manager: &DownloadManager, task_id: &str) -> Option<TaskStatus> {
    manager.status(task_id).ok()
}

/// Receive events until `pred` matches one, returning everything seen.
pub async fn collect_until<F>(rx: &mut broadcast::Receiver<TaskEvent>, mut pred: F) -> Vec<TaskEvent>
where
    F: FnMut(&TaskEvent) -> bool,
{
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let event = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        let done = pred(&event);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

/// Drain whatever is buffered right now.
pub fn drain(rx: &mut broadcast::Receiver<TaskEvent>) -> Vec<TaskEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(event);
    }
    seen
}
