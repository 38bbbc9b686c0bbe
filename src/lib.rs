// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! modeldock - resumable model file downloads
//!
//! Downloads large model files (checkpoints, LoRAs, embeddings) from
//! Civitai, HuggingFace or any URL into a local model library, with a
//! bounded number of transfers at once, pause/resume that keeps partial
//! bytes, and live progress for any number of listeners.
//!
//! # Core Modules
//!
//! - [`download`] - Task store, status registry, worker pool, engine and manager
//! - [`library`] - Where finished models land, plus their sidecar files
//! - [`config`] - Config file and the settings lookup
//! - [`server`] - HTTP routes and the WebSocket event stream
//! - [`error`] - Error taxonomy of the download subsystem
//! - [`locks`] - Poison-tolerant lock helpers

pub mod config;
pub mod download;
pub mod error;
pub mod library;
pub mod locks;
pub mod server;
pub mod utils;

// Re-export commonly used types
pub use config::{Config, MemorySettings, SettingsStore};
pub use download::{
    DownloadManager, ManagerOptions, SubmitOutcome, TaskContent, TaskEvent, TaskPhase, TaskStatus,
};
pub use error::{DownloadError, DownloadResult};
pub use library::{ModelFolders, PathResolver};
pub use server::Server;
