// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration and the settings lookup used by the download subsystem.
//!
//! The config lives at `~/.modeldock/config.json`. A missing file means
//! defaults; API keys can also come from the environment:
//!
//! - `MODELDOCK_CIVITAI_API_KEY`
//! - `MODELDOCK_HUGGINGFACE_API_KEY`

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::locks::{resilient_read, resilient_write};
use crate::utils::mask_sensitive;

/// Settings key of the Civitai API key.
pub const KEY_CIVITAI: &str = "api_key.civitai";
/// Settings key of the HuggingFace API key.
pub const KEY_HUGGINGFACE: &str = "api_key.huggingface";
/// Settings key of the concurrent download limit.
pub const KEY_MAX_TASK_COUNT: &str = "download.max_task_count";

pub const ENV_CIVITAI_API_KEY: &str = "MODELDOCK_CIVITAI_API_KEY";
pub const ENV_HUGGINGFACE_API_KEY: &str = "MODELDOCK_HUGGINGFACE_API_KEY";

/// Browser-like User-Agent. Some catalogs serve different content to
/// clients they do not recognise.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (iPad; CPU OS 12_2 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Mobile/15E148";

/// Read-only key/value lookup for runtime settings.
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;

    /// A non-empty string setting.
    fn get_str(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            _ => None,
        }
    }

    /// An integer setting. Numeric strings are accepted.
    fn get_i64(&self, key: &str) -> Option<i64> {
        match self.get(key)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// In-memory settings, for embedding the manager without a config file.
#[derive(Debug, Default)]
pub struct MemorySettings {
    values: RwLock<HashMap<String, Value>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, key: &str, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&self, key: &str, value: impl Into<Value>) {
        resilient_write(&self.values).insert(key.to_string(), value.into());
    }

    pub fn unset(&self, key: &str) {
        resilient_write(&self.values).remove(key);
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> Option<Value> {
        resilient_read(&self.values).get(key).cloned()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ApiKeys {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub civitai: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub huggingface: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadSettings {
    /// Concurrent downloads. Non-positive or absent means 5.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_task_count: Option<i64>,
    /// Milliseconds between progress updates.
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    /// Whole-request timeout. None disables it; long downloads are normal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_secs: Option<u64>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_progress_interval_ms() -> u64 {
    1000
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            max_task_count: None,
            progress_interval_ms: default_progress_interval_ms(),
            request_timeout_secs: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

impl DownloadSettings {
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Root for task files. Defaults to `~/.modeldock`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    /// Model type to its ordered list of base directories.
    #[serde(default)]
    pub model_folders: BTreeMap<String, Vec<PathBuf>>,
    #[serde(default)]
    pub api_keys: ApiKeys,
    #[serde(default)]
    pub download: DownloadSettings,
}

fn default_port() -> u16 {
    8787
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: default_bind_address(),
            data_dir: None,
            model_folders: BTreeMap::new(),
            api_keys: ApiKeys::default(),
            download: DownloadSettings::default(),
        }
    }
}

/// `~/.modeldock`, created if missing.
pub fn get_config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not find home directory")?;
    let config_dir = home.join(".modeldock");
    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)?;
    }
    Ok(config_dir)
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join("config.json"))
}

impl Config {
    /// Load from the default location and apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = default_config_path()?;
        Self::load_from(&path)
    }

    /// Load from `path` (defaults when missing) and apply environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse config: {}", path.display()))?
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Config::default()
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }

    /// Fill API keys from the given variable lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        if let Some(key) = non_empty(ENV_CIVITAI_API_KEY) {
            tracing::debug!("Civitai API key from environment: {}", mask_sensitive(&key, 4));
            self.api_keys.civitai = Some(key);
        }
        if let Some(key) = non_empty(ENV_HUGGINGFACE_API_KEY) {
            tracing::debug!("HuggingFace API key from environment: {}", mask_sensitive(&key, 4));
            self.api_keys.huggingface = Some(key);
        }
    }

    /// Resolved data directory.
    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => get_config_dir(),
        }
    }

    /// Where task records and partial files live.
    pub fn downloads_dir(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join("downloads"))
    }

    /// Copy safe to print: API keys masked.
    pub fn masked(&self) -> Self {
        let mut copy = self.clone();
        copy.api_keys.civitai = copy.api_keys.civitai.map(|k| mask_sensitive(&k, 4));
        copy.api_keys.huggingface = copy.api_keys.huggingface.map(|k| mask_sensitive(&k, 4));
        copy
    }
}

impl SettingsStore for Config {
    fn get(&self, key: &str) -> Option<Value> {
        match key {
            KEY_CIVITAI => self.api_keys.civitai.clone().map(Value::String),
            KEY_HUGGINGFACE => self.api_keys.huggingface.clone().map(Value::String),
            KEY_MAX_TASK_COUNT => self.download.max_task_count.map(Value::from),
            _ => None,
        }
    }
}
