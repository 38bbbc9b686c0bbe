// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! HTTP API tests against a server bound to an ephemeral port.

mod common;

use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::oneshot;

use common::*;
use modeldock::server::Server;

struct RunningServer {
    base: String,
    stop: Option<oneshot::Sender<()>>,
    handle: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl RunningServer {
    async fn start(h: &Harness) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let (stop, stopped) = oneshot::channel::<()>();

        let server = Server::new(h.manager.clone(), 0);
        let handle = tokio::spawn(async move {
            server
                .serve(listener, async move {
                    let _ = stopped.await;
                })
                .await
        });
        Self {
            base,
            stop: Some(stop),
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}

#[tokio::test]
async fn test_health() -> Result<(), Box<dyn std::error::Error>> {
    let h = Harness::new(3);
    let server = RunningServer::start(&h).await;

    let body: Value = reqwest::get(server.url("/health")).await?.json().await?;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["maxWorkers"], 3);
    assert_eq!(body["activeDownloads"], 0);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_create_rejects_bad_requests() -> Result<(), Box<dyn std::error::Error>> {
    let h = Harness::new(1);
    let server = RunningServer::start(&h).await;
    let client = reqwest::Client::new();
    let url = server.url("/model-manager/download/task");

    // Unknown model type
    let response = client
        .post(&url)
        .json(&json!({
            "type": "vae",
            "pathIndex": 0,
            "fullname": "a.safetensors",
            "downloadUrl": "http://127.0.0.1:9/a",
        }))
        .send()
        .await?;
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await?;
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("PathIndex"));

    // Missing URL
    let response = client
        .post(&url)
        .json(&json!({
            "type": MODEL_TYPE,
            "pathIndex": 0,
            "fullname": "a.safetensors",
        }))
        .send()
        .await?;
    assert_eq!(response.status(), 400);

    // Not JSON at all
    let response = client
        .post(&url)
        .header("content-type", "application/json")
        .body("{")
        .send()
        .await?;
    assert_eq!(response.status(), 400);

    assert!(h.download_files().is_empty());
    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_unknown_task_is_404() -> Result<(), Box<dyn std::error::Error>> {
    let h = Harness::new(1);
    let server = RunningServer::start(&h).await;
    let client = reqwest::Client::new();

    let response = client
        .get(server.url("/model-manager/download/task/deadbeef"))
        .send()
        .await?;
    assert_eq!(response.status(), 404);

    let response = client
        .put(server.url("/model-manager/download/task/deadbeef/pause"))
        .send()
        .await?;
    assert_eq!(response.status(), 404);

    let response = client
        .delete(server.url("/model-manager/download/task/deadbeef"))
        .send()
        .await?;
    assert_eq!(response.status(), 404);

    let response = client
        .get(server.url("/model-manager/preview/download/..%2Fsecret.png"))
        .send()
        .await?;
    assert_eq!(response.status(), 404);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_task_lifecycle_over_http() -> Result<(), Box<dyn std::error::Error>> {
    let files = FileServer::start().await;
    let download_url = files.put(
        "api.bin",
        ServedFile::new(payload(40_000)).throttled(500, Duration::from_millis(20)),
    );

    let h = Harness::new(1);
    let server = RunningServer::start(&h).await;
    let client = reqwest::Client::new();

    // 1x1 transparent PNG
    let preview = "data:image/png;base64,iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAQAAAC1HAwCAAAAC0lEQVR42mNkYAAAAAYAAjCB0C8AAAAASUVORK5CYII=";
    let created: Value = client
        .post(server.url("/model-manager/download/task"))
        .json(&json!({
            "type": MODEL_TYPE,
            "pathIndex": "0",
            "fullname": "api.bin",
            "description": "from the api",
            "downloadPlatform": "other",
            "downloadUrl": download_url,
            "sizeBytes": "40000",
            "previewFile": preview,
        }))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(created["success"], true);
    let task_id = created["data"]["taskId"].as_str().unwrap().to_string();

    let listed: Value = client
        .get(server.url("/model-manager/download/task"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(listed["data"][0]["taskId"], task_id.as_str());
    assert_eq!(listed["data"][0]["totalSize"], 40_000);

    let preview_name = listed["data"][0]["preview"].as_str().unwrap().to_string();
    let response = client
        .get(server.url(&format!("/model-manager/preview/download/{}", preview_name)))
        .send()
        .await?;
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-type"], "image/png");

    let paused: Value = client
        .put(server.url(&format!("/model-manager/download/task/{}/pause", task_id)))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(paused["data"]["status"], "pause");

    assert!(wait_until(|| h.manager.active_count() == 0).await);
    let resumed: Value = client
        .put(server.url(&format!("/model-manager/download/task/{}/resume", task_id)))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(resumed["data"]["outcome"], "running");

    let response = client
        .delete(server.url(&format!("/model-manager/download/task/{}", task_id)))
        .send()
        .await?;
    assert_eq!(response.status(), 200);
    assert!(h.download_files().is_empty());

    server.stop().await;
    Ok(())
}
