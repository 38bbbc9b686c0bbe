// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download types: the persisted task descriptor and the live status record.

use std::collections::HashMap;
use std::fmt;

use base64::Engine as _;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{DownloadError, DownloadResult};

/// Preview name reported when a task has no stored image.
pub const NO_PREVIEW: &str = "no-preview.png";

/// Lifecycle phase of a task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskPhase {
    /// Not transferring; needs an explicit resume.
    #[default]
    Pause,
    /// Submitted to the pool, no worker slot yet.
    Waiting,
    /// Streaming bytes.
    Doing,
}

impl fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskPhase::Pause => write!(f, "pause"),
            TaskPhase::Waiting => write!(f, "waiting"),
            TaskPhase::Doing => write!(f, "doing"),
        }
    }
}

/// Remote catalog a download URL belongs to. Selects the auth header.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Civitai,
    Huggingface,
    #[default]
    #[serde(other)]
    Other,
}

impl Platform {
    /// Settings key holding the API key for this platform, if it uses one.
    pub fn api_key_setting(&self) -> Option<&'static str> {
        match self {
            Platform::Civitai => Some("api_key.civitai"),
            Platform::Huggingface => Some("api_key.huggingface"),
            Platform::Other => None,
        }
    }
}

/// Immutable request parameters of a task, persisted as `{taskId}.task`.
///
/// The transport layer hands us loosely typed data (numbers as strings,
/// sizes as floats); the lenient field parsers below normalise it once here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskContent {
    /// Model category, e.g. "checkpoints" or "loras".
    #[serde(rename = "type")]
    pub model_type: String,
    /// Index into the base directories configured for `model_type`.
    #[serde(default, deserialize_with = "lenient_usize")]
    pub path_index: usize,
    /// File name relative to the base directory, may contain subdirectories.
    pub fullname: String,
    /// Written next to the model as a markdown sidecar on completion.
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub download_platform: Platform,
    #[serde(default)]
    pub download_url: String,
    /// Expected size; 0 means unknown until the first response arrives.
    #[serde(default, deserialize_with = "lenient_u64")]
    pub size_bytes: u64,
    /// Algorithm name to hex digest. Informational.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hashes: Option<HashMap<String, String>>,
}

impl TaskContent {
    /// Look up a digest by algorithm name, ignoring case.
    pub fn hash(&self, algorithm: &str) -> Option<&str> {
        self.hashes.as_ref().and_then(|hashes| {
            hashes
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(algorithm))
                .map(|(_, digest)| digest.as_str())
        })
    }
}

/// Live status of a task. Kept in memory only and rebuilt from the
/// task record plus the partial file size after a restart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub task_id: String,
    #[serde(rename = "type")]
    pub model_type: String,
    pub fullname: String,
    pub preview: String,
    pub status: TaskPhase,
    pub platform: Platform,
    pub downloaded_size: u64,
    pub total_size: u64,
    /// Percentage, 0-100.
    pub progress: f64,
    /// Bytes transferred since the previous progress sample.
    pub bps: u64,
    pub error: Option<String>,
}

impl TaskStatus {
    /// Build a status record for a task from its descriptor.
    pub fn from_content(
        task_id: impl Into<String>,
        content: &TaskContent,
        preview: impl Into<String>,
        downloaded_size: u64,
    ) -> Self {
        let mut status = Self {
            task_id: task_id.into(),
            model_type: content.model_type.clone(),
            fullname: content.fullname.clone(),
            preview: preview.into(),
            status: TaskPhase::default(),
            platform: content.download_platform,
            downloaded_size: 0,
            total_size: content.size_bytes,
            progress: 0.0,
            bps: 0,
            error: None,
        };
        status.set_downloaded(downloaded_size);
        status
    }

    /// Record a new downloaded byte count and recompute the percentage.
    pub fn set_downloaded(&mut self, downloaded_size: u64) {
        self.downloaded_size = downloaded_size;
        self.progress = if self.total_size > 0 {
            (downloaded_size as f64 / self.total_size as f64) * 100.0
        } else {
            0.0
        };
    }
}

/// Result of submitting a task to the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmitOutcome {
    /// Already running or queued; nothing was enqueued.
    Existing,
    /// A worker slot was free and picks the task up immediately.
    Running,
    /// Every worker is busy; the task sits in the queue.
    Waiting,
}

/// Preview image uploaded together with a creation request.
#[derive(Debug, Clone, PartialEq)]
pub struct PreviewAsset {
    /// MIME type, must start with `image/`.
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl PreviewAsset {
    pub fn new(content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            content_type: content_type.into(),
            bytes,
        }
    }

    /// Parse a `data:image/png;base64,....` URL.
    pub fn from_data_url(data_url: &str) -> DownloadResult<Self> {
        let rest = data_url
            .strip_prefix("data:")
            .ok_or_else(|| DownloadError::InvalidPreview("expected a data URL".into()))?;
        let (meta, payload) = rest
            .split_once(',')
            .ok_or_else(|| DownloadError::InvalidPreview("data URL has no payload".into()))?;
        let content_type = meta
            .strip_suffix(";base64")
            .ok_or_else(|| DownloadError::InvalidPreview("data URL is not base64".into()))?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(payload.trim())
            .map_err(|e| DownloadError::InvalidPreview(e.to_string()))?;
        Ok(Self::new(content_type, bytes))
    }

    /// File extension derived from the MIME subtype (`image/png` -> `png`).
    pub fn extension(&self) -> DownloadResult<&str> {
        let subtype = self.content_type.strip_prefix("image/").ok_or_else(|| {
            DownloadError::InvalidPreview(format!("expected image, got {}", self.content_type))
        })?;
        let subtype = subtype.split(['+', ';']).next().unwrap_or(subtype);
        if subtype.is_empty() || !subtype.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(DownloadError::InvalidPreview(self.content_type.clone()));
        }
        Ok(subtype)
    }
}

/// Body of a creation request: the task descriptor plus an optional
/// preview image as a base64 data URL.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    #[serde(flatten)]
    pub content: TaskContent,
    #[serde(default)]
    pub preview_file: Option<String>,
}

impl CreateTaskRequest {
    /// Split into the descriptor and the decoded preview.
    pub fn into_parts(self) -> DownloadResult<(TaskContent, Option<PreviewAsset>)> {
        let preview = match self.preview_file.as_deref().map(str::trim) {
            Some(data_url) if !data_url.is_empty() => Some(PreviewAsset::from_data_url(data_url)?),
            _ => None,
        };
        Ok((self.content, preview))
    }
}

fn lenient_number<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Null => Ok(0.0),
        serde_json::Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| D::Error::custom("number out of range")),
        serde_json::Value::String(s) if s.trim().is_empty() => Ok(0.0),
        serde_json::Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| D::Error::custom(format!("not a number: {}", s))),
        other => Err(D::Error::custom(format!("expected number, got {}", other))),
    }
}

fn lenient_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    let value = lenient_number(deserializer)?;
    if !value.is_finite() || value < 0.0 {
        return Err(D::Error::custom(format!("expected a non-negative size, got {}", value)));
    }
    Ok(value as u64)
}

fn lenient_usize<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    let value = lenient_number(deserializer)?;
    if !value.is_finite() || value < 0.0 || value.fract() != 0.0 {
        return Err(D::Error::custom(format!("expected a non-negative index, got {}", value)));
    }
    Ok(value as usize)
}
