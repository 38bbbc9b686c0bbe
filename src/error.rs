// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for the download subsystem.
//!
//! Errors fall into three groups:
//!
//! - **Validation** - rejected synchronously when a task is created, the
//!   task never reaches the worker pool.
//! - **Not found** - an operation named a task id that has no record.
//! - **Transfer** - raised inside an engine run; the engine converts these
//!   into a paused task with the message attached, they never escape a worker.

use std::path::PathBuf;

/// Result alias used throughout the download modules.
pub type DownloadResult<T> = std::result::Result<T, DownloadError>;

/// Everything that can go wrong while creating, running or removing a task.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    /// The destination model file is already on disk.
    #[error("File already exists: {}", .0.display())]
    DestinationExists(PathBuf),

    /// A task record with the generated id is already on disk.
    #[error("Task {0} already exists")]
    TaskExists(String),

    /// The task has no source URL.
    #[error("No downloadUrl found")]
    MissingUrl,

    /// `pathIndex` does not point into the base directories of the model type.
    #[error("PathIndex {index} is not in {model_type}")]
    InvalidPathIndex { model_type: String, index: usize },

    /// `fullname` is empty, absolute, or climbs out of its base directory.
    #[error("Invalid model file name: {0}")]
    InvalidFullname(String),

    /// The preview asset could not be decoded or is not an image.
    #[error("Invalid preview image: {0}")]
    InvalidPreview(String),

    /// No task record exists for the id.
    #[error("Task {0} not found")]
    NotFound(String),

    /// The server answered with something other than 200/206.
    #[error("Failed to download {fullname}, status code: {status}")]
    HttpStatus { fullname: String, status: u16 },

    /// The server answered with an HTML page, usually a login redirect.
    #[error("{0} needs to be logged in to download. Please set the API-Key first.")]
    LoginRequired(String),

    /// The stream closed before all bytes arrived.
    #[error("Connection closed after {downloaded} of {total} bytes")]
    Incomplete { downloaded: u64, total: u64 },

    /// Network failure from the HTTP client.
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Local file I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A `.task` record could not be parsed.
    #[error("Corrupt task record: {0}")]
    Corrupt(#[from] serde_json::Error),

    /// The manager is shutting down and accepts no more work.
    #[error("Download manager is shut down")]
    Stopped,
}

impl DownloadError {
    /// Returns true for errors raised while validating a creation request.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            DownloadError::DestinationExists(_)
                | DownloadError::TaskExists(_)
                | DownloadError::MissingUrl
                | DownloadError::InvalidPathIndex { .. }
                | DownloadError::InvalidFullname(_)
                | DownloadError::InvalidPreview(_)
        )
    }

    /// Returns true when the error means "no such task".
    pub fn is_not_found(&self) -> bool {
        matches!(self, DownloadError::NotFound(_))
    }
}
