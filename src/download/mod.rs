// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Resumable Model Downloads for modeldock
//!
//! This module provides background model file downloads with:
//! - A bounded number of concurrent transfers, the rest queued in order
//! - Pause/resume that never throws away bytes already on disk
//! - Tasks that survive restarts (records live next to the partial files)
//! - Live progress pushed to any number of listeners
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐
//! │ DownloadManager │────▶│ WorkerPool      │
//! │                 │     │ (N tokio tasks) │
//! └────────┬────────┘     └────────┬────────┘
//!          │                       │
//!          ▼                       ▼
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │ StatusRegistry  │◀────│ DownloadEngine  │────▶│ Notifier        │
//! │ (in memory)     │     │ (reqwest)       │     │ (broadcast)     │
//! └────────┬────────┘     └────────┬────────┘     └─────────────────┘
//!          │                       │
//!          ▼                       ▼
//! ┌─────────────────────────────────────────┐
//! │ TaskStore ({id}.task, {id}.download)    │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use modeldock::config::MemorySettings;
//! use modeldock::download::{DownloadManager, ManagerOptions, TaskContent};
//! use modeldock::library::ModelFolders;
//!
//! # async fn example(content: TaskContent) -> anyhow::Result<()> {
//! let folders = ModelFolders::default().with_folder("loras", "/models/loras");
//! let manager = DownloadManager::new(
//!     ManagerOptions::new("/var/lib/modeldock/downloads"),
//!     Arc::new(folders),
//!     Arc::new(MemorySettings::new()),
//! )?;
//!
//! let mut events = manager.subscribe();
//! let task_id = manager.create(content, None)?;
//!
//! while let Ok(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! manager.pause(&task_id)?;
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod events;
pub mod manager;
pub mod pool;
pub mod registry;
pub mod store;
pub mod types;

// Re-export commonly used items
pub use engine::{DownloadEngine, EngineOptions};
pub use events::{Notifier, TaskEvent};
pub use manager::{DownloadManager, ManagerOptions};
pub use pool::{WorkerPool, DEFAULT_MAX_WORKERS};
pub use registry::{StatusRegistry, TaskControl};
pub use store::TaskStore;
pub use types::{
    CreateTaskRequest, Platform, PreviewAsset, SubmitOutcome, TaskContent, TaskPhase, TaskStatus,
    NO_PREVIEW,
};
