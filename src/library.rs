// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The model library on disk: where finished files go and the sidecar
//! files that travel with them.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::config::Config;
use crate::download::PreviewAsset;
use crate::error::{DownloadError, DownloadResult};

/// Maps a model type and folder index to directories on disk.
pub trait PathResolver: Send + Sync {
    /// Ordered base directories configured for a model type. Empty if unknown.
    fn resolve_base_dirs(&self, model_type: &str) -> Vec<PathBuf>;

    /// Absolute destination of a model file.
    ///
    /// Fails if `path_index` is out of range or `fullname` would escape the
    /// base directory.
    fn resolve_destination(
        &self,
        model_type: &str,
        path_index: usize,
        fullname: &str,
    ) -> DownloadResult<PathBuf> {
        let relative = validate_fullname(fullname)?;
        let base_dirs = self.resolve_base_dirs(model_type);
        let base = base_dirs
            .get(path_index)
            .ok_or_else(|| DownloadError::InvalidPathIndex {
                model_type: model_type.to_string(),
                index: path_index,
            })?;
        Ok(base.join(relative))
    }
}

/// Folder table read from the config file.
#[derive(Debug, Clone, Default)]
pub struct ModelFolders {
    folders: BTreeMap<String, Vec<PathBuf>>,
}

impl ModelFolders {
    pub fn new(folders: BTreeMap<String, Vec<PathBuf>>) -> Self {
        Self { folders }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.model_folders.clone())
    }

    /// Add a base directory to a model type.
    pub fn with_folder(mut self, model_type: &str, dir: impl Into<PathBuf>) -> Self {
        self.folders
            .entry(model_type.to_string())
            .or_default()
            .push(dir.into());
        self
    }
}

impl PathResolver for ModelFolders {
    fn resolve_base_dirs(&self, model_type: &str) -> Vec<PathBuf> {
        self.folders.get(model_type).cloned().unwrap_or_default()
    }
}

/// `fullname` as a relative path that stays inside its base directory.
fn validate_fullname(fullname: &str) -> DownloadResult<PathBuf> {
    let normalized = fullname.trim().replace('\\', "/");
    let path = PathBuf::from(&normalized);
    let only_normal = path
        .components()
        .all(|component| matches!(component, Component::Normal(_)));
    if normalized.is_empty() || normalized.ends_with('/') || !only_normal {
        return Err(DownloadError::InvalidFullname(fullname.to_string()));
    }
    Ok(path)
}

/// Sidecar path next to a model file: same stem, different extension.
pub fn sidecar_path(model_path: &Path, extension: &str) -> PathBuf {
    model_path.with_extension(extension)
}

pub fn save_preview(path: &Path, asset: &PreviewAsset) -> io::Result<()> {
    fs::write(path, &asset.bytes)
}

pub fn save_description(path: &Path, text: &str) -> io::Result<()> {
    fs::write(path, text)
}

/// Move a file, creating the destination directory. Falls back to copy
/// and remove when a rename is not possible (different filesystems).
pub fn relocate(from: &Path, to: &Path) -> io::Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            tracing::debug!(
                "rename {:?} -> {:?} failed ({}), copying instead",
                from,
                to,
                rename_err
            );
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
    }
}

/// Lowercase hex SHA-256 of a file.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
