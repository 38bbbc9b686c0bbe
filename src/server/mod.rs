// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! API server
//!
//! Exposes the download manager over HTTP and pushes task events over a
//! WebSocket.
//!
//! # Endpoints
//!
//! - `GET /health` - Health check
//! - `GET /model-manager/download/task` - List tasks, newest first
//! - `POST /model-manager/download/task` - Create a task
//! - `GET /model-manager/download/task/:id` - One task
//! - `PUT /model-manager/download/task/:id/pause` - Pause a task
//! - `PUT /model-manager/download/task/:id/resume` - Resume a task
//! - `DELETE /model-manager/download/task/:id` - Delete a task and its files
//! - `GET /model-manager/preview/download/:name` - Preview image of a pending task
//! - `GET /model-manager/ws` - Task events
//!
//! Every JSON response is `{"success": true, "data": ...}` or
//! `{"success": false, "error": "..."}`.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use modeldock::config::MemorySettings;
//! use modeldock::download::{DownloadManager, ManagerOptions};
//! use modeldock::library::ModelFolders;
//! use modeldock::server::Server;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let manager = DownloadManager::new(
//!     ManagerOptions::new("/tmp/modeldock/downloads"),
//!     Arc::new(ModelFolders::default()),
//!     Arc::new(MemorySettings::new()),
//! )?;
//! let server = Server::new(manager, 8787);
//! server.start().await?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::path::Path as FsPath;
use std::time::Duration;

use anyhow::Result;
use axum::{
    extract::{
        rejection::JsonRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
        DefaultBodyLimit, Path, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, put},
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;

use crate::download::store::PREVIEW_EXTS;
use crate::download::{CreateTaskRequest, DownloadManager, SubmitOutcome, TaskEvent, TaskStatus};
use crate::error::DownloadError;

/// Creation requests carry the preview image inline.
const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// Limit on plain request/response routes.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared by all handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: DownloadManager,
    /// Cancelled when the server shuts down; closes WebSocket sessions.
    pub shutdown: CancellationToken,
}

/// API server.
pub struct Server {
    port: u16,
    /// Address to bind to (defaults to 127.0.0.1 for security).
    bind_address: String,
    manager: DownloadManager,
}

impl Server {
    /// Create a new server for `manager` on the given port.
    /// By default, binds to 127.0.0.1 (localhost only) for security.
    pub fn new(manager: DownloadManager, port: u16) -> Self {
        Self {
            port,
            bind_address: "127.0.0.1".to_string(),
            manager,
        }
    }

    /// Set the bind address.
    /// Use "0.0.0.0" to allow network access, "127.0.0.1" (default) for localhost only.
    pub fn with_bind_address(mut self, addr: impl Into<String>) -> Self {
        self.bind_address = addr.into();
        self
    }

    /// Get the port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Start the server; returns after SIGINT/SIGTERM and a clean manager shutdown.
    pub async fn start(&self) -> Result<()> {
        let addr = format!("{}:{}", self.bind_address, self.port);
        tracing::info!("Starting server on {}", addr);

        if self.bind_address == "0.0.0.0" {
            tracing::warn!(
                "Server is binding to 0.0.0.0 which exposes the API to the network. \
                Use 127.0.0.1 (default) for local-only access."
            );
        }

        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                anyhow::anyhow!(
                    "Port {} is already in use. \
                    Another modeldock server may be running; stop it or pick a different port with --port <PORT>",
                    self.port
                )
            } else {
                anyhow::anyhow!("Failed to bind to {}: {}", addr, e)
            }
        })?;

        self.serve(listener, shutdown_signal()).await
    }

    /// Serve on an already bound listener until `signal` resolves, then
    /// pause all downloads.
    pub async fn serve<F>(&self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let shutdown = CancellationToken::new();
        let router = build_router(self.manager.clone(), shutdown.clone());

        let on_signal = shutdown.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                signal.await;
                on_signal.cancel();
            })
            .await?;

        self.manager.shutdown().await;
        tracing::info!("Cleanup complete, server stopped");
        Ok(())
    }
}

/// Build the router with all routes.
pub fn build_router(manager: DownloadManager, shutdown: CancellationToken) -> Router {
    let state = AppState { manager, shutdown };

    let api = Router::new()
        .route("/health", get(health_handler))
        .route(
            "/model-manager/download/task",
            get(list_tasks_handler).post(create_task_handler),
        )
        .route(
            "/model-manager/download/task/:id",
            get(get_task_handler).delete(delete_task_handler),
        )
        .route("/model-manager/download/task/:id/pause", put(pause_task_handler))
        .route("/model-manager/download/task/:id/resume", put(resume_task_handler))
        .route("/model-manager/preview/download/:name", get(preview_handler))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT));

    Router::new()
        .route("/model-manager/ws", get(ws_handler))
        .merge(api)
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(state)
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// Response envelope.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

/// Error response with its HTTP status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<DownloadError> for ApiError {
    fn from(err: DownloadError) -> Self {
        let status = if err.is_validation() {
            StatusCode::BAD_REQUEST
        } else if err.is_not_found() {
            StatusCode::NOT_FOUND
        } else if matches!(err, DownloadError::Stopped) {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(self.message),
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<ApiResponse<T>>, ApiError>;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreatedTask {
    task_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ResumedTask {
    outcome: SubmitOutcome,
    task: Option<TaskStatus>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    max_workers: usize,
    active_downloads: usize,
}

/// Request sent by a WebSocket client.
#[derive(Debug, Deserialize)]
struct ClientRequest {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    detail: serde_json::Value,
}

// =============================================================================
// Handlers
// =============================================================================

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        max_workers: state.manager.max_workers(),
        active_downloads: state.manager.active_count(),
    })
}

async fn list_tasks_handler(State(state): State<AppState>) -> ApiResult<Vec<TaskStatus>> {
    Ok(ApiResponse::ok(state.manager.list()?))
}

async fn create_task_handler(
    State(state): State<AppState>,
    body: std::result::Result<Json<CreateTaskRequest>, JsonRejection>,
) -> ApiResult<CreatedTask> {
    let Json(request) = body.map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.body_text()))?;
    let (content, preview) = request.into_parts()?;
    let task_id = state.manager.create(content, preview)?;
    Ok(ApiResponse::ok(CreatedTask { task_id }))
}

async fn get_task_handler(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<TaskStatus> {
    Ok(ApiResponse::ok(state.manager.status(&task_id)?))
}

async fn pause_task_handler(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<TaskStatus> {
    Ok(ApiResponse::ok(state.manager.pause(&task_id)?))
}

async fn resume_task_handler(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<ResumedTask> {
    let outcome = state.manager.resume(&task_id)?;
    let task = state.manager.status(&task_id).ok();
    Ok(ApiResponse::ok(ResumedTask { outcome, task }))
}

async fn delete_task_handler(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<String> {
    state.manager.delete(&task_id).await?;
    Ok(ApiResponse::ok(task_id))
}

/// Serve `{taskId}.{ext}` from the downloads directory.
async fn preview_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> std::result::Result<Response, ApiError> {
    let not_found = || ApiError::new(StatusCode::NOT_FOUND, format!("Preview {} not found", name));

    let ext = preview_extension(&name).ok_or_else(not_found)?;
    let path = state.manager.downloads_dir().join(&name);
    let bytes = tokio::fs::read(&path).await.map_err(|_| not_found())?;

    Ok(([(header::CONTENT_TYPE, preview_mime(ext))], bytes).into_response())
}

/// Extension of a safe preview file name, or None.
fn preview_extension(name: &str) -> Option<&str> {
    let is_plain_name = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_');
    if !is_plain_name {
        return None;
    }
    let ext = FsPath::new(name).extension()?.to_str()?;
    PREVIEW_EXTS.contains(&ext).then_some(ext)
}

fn preview_mime(ext: &str) -> &'static str {
    match ext {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "svg" => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// One WebSocket session: forwards every broadcast event and answers
/// client requests on the same socket.
async fn handle_socket(socket: WebSocket, state: AppState) {
    tracing::debug!("WebSocket connected");

    let (mut sink, mut stream) = socket.split();
    let mut events = state.manager.subscribe();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<TaskEvent>();
    let shutdown = state.shutdown.clone();

    let send_task = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                reply = reply_rx.recv() => match reply {
                    Some(reply) => reply,
                    None => break,
                },
                event = events.recv() => match event {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("WebSocket client lagging, skipped {} events", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!("Failed to encode event: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                tracing::debug!("WebSocket sink closed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        let message = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            message = stream.next() => message,
        };
        match message {
            Some(Ok(Message::Text(text))) => {
                if let Some(reply) = handle_request(&state.manager, &text).await {
                    if reply_tx.send(reply).is_err() {
                        break;
                    }
                }
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::debug!(error = %e, "WebSocket receive error");
                break;
            }
        }
    }

    drop(reply_tx);
    if let Err(e) = send_task.await {
        tracing::debug!("WebSocket sender ended abnormally: {}", e);
    }
    tracing::debug!("WebSocket disconnected");
}

/// Act on one client request. Returns a direct reply, if any.
async fn handle_request(manager: &DownloadManager, text: &str) -> Option<TaskEvent> {
    let request: ClientRequest = match serde_json::from_str(text) {
        Ok(request) => request,
        Err(e) => return Some(TaskEvent::Error(format!("Invalid request: {}", e))),
    };
    let task_id = request.detail.as_str().unwrap_or_default();

    let result = match request.kind.as_str() {
        "downloadTaskList" => {
            return Some(match manager.list() {
                Ok(tasks) => TaskEvent::DownloadTaskList(tasks),
                Err(e) => TaskEvent::Error(e.to_string()),
            })
        }
        "pauseDownloadTask" => manager.pause(task_id).map(|_| ()),
        "resumeDownloadTask" => manager.resume(task_id).map(|_| ()),
        "deleteDownloadTask" => manager.delete(task_id).await,
        other => {
            return Some(TaskEvent::Error(format!("Unknown request type: {}", other)));
        }
    };

    // Successful requests are answered by the broadcast events they cause.
    result.err().map(|e| TaskEvent::Error(e.to_string()))
}

/// Graceful shutdown signal handler.
///
/// Waits for SIGINT/SIGTERM before allowing the server to shut down.
async fn shutdown_signal() {
    // On Unix, listen for SIGINT and SIGTERM
    // On Windows, fall back to Ctrl+C only
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt())
            .expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown...");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_names() {
        assert_eq!(preview_extension("0123abcd.png"), Some("png"));
        assert_eq!(preview_extension("0123abcd.webp"), Some("webp"));
        assert_eq!(preview_extension("../secret.png"), None);
        assert_eq!(preview_extension("abc.task"), None);
        assert_eq!(preview_extension(".png"), None);
        assert_eq!(preview_extension("a/b.png"), None);
    }

    #[test]
    fn test_error_status_mapping() {
        let err = ApiError::from(DownloadError::MissingUrl);
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        let err = ApiError::from(DownloadError::NotFound("x".into()));
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        let err = ApiError::from(DownloadError::Stopped);
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_envelope_shape() {
        let Json(body) = ApiResponse::ok(vec![1, 2]);
        let value = serde_json::to_value(body).unwrap();
        assert_eq!(value, serde_json::json!({"success": true, "data": [1, 2]}));
    }

    fn test_manager(dir: &tempfile::TempDir) -> DownloadManager {
        use crate::config::MemorySettings;
        use crate::download::ManagerOptions;
        use crate::library::ModelFolders;
        use std::sync::Arc;

        DownloadManager::new(
            ManagerOptions::new(dir.path().join("downloads")),
            Arc::new(ModelFolders::default()),
            Arc::new(MemorySettings::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_ws_requests() {
        let dir = tempfile::TempDir::new().unwrap();
        let manager = test_manager(&dir);

        let reply = handle_request(&manager, r#"{"type":"downloadTaskList"}"#).await;
        assert_eq!(reply, Some(TaskEvent::DownloadTaskList(vec![])));

        let reply = handle_request(&manager, r#"{"type":"pauseDownloadTask","detail":"nope"}"#).await;
        assert!(matches!(reply, Some(TaskEvent::Error(msg)) if msg.contains("not found")));

        let reply = handle_request(&manager, r#"{"type":"shout"}"#).await;
        assert!(matches!(reply, Some(TaskEvent::Error(msg)) if msg.contains("shout")));

        let reply = handle_request(&manager, "not json").await;
        assert!(matches!(reply, Some(TaskEvent::Error(_))));
    }
}
