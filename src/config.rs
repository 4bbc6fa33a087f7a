// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration for the pool, its engines and the download coordinator.
//!
//! Stored as JSON at `<config_dir>/reelpool/config.json`. Every field has a
//! default, so a missing file or a partial file both load.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Default number of engines kept in the pool.
pub const DEFAULT_POOL_SIZE: usize = 3;

/// Default byte budget of the shared content cache (100 MiB).
pub const DEFAULT_CACHE_SIZE_BYTES: u64 = 100 * 1024 * 1024;

/// Default number of transfers allowed to run at once.
pub const DEFAULT_MAX_PARALLEL_DOWNLOADS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub download: DownloadConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Engines created up front
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Byte budget of the shared LRU content cache
    #[serde(default = "default_cache_size_bytes")]
    pub cache_size_bytes: u64,
}

/// Construction-time settings applied to every playback engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_true")]
    pub repeat_one: bool,
    #[serde(default = "default_volume")]
    pub volume: f32,
    /// Initial flag of a new engine. Binding a slot turns it off; the host
    /// flips it when the slot becomes visible.
    #[serde(default)]
    pub play_when_ready: bool,
    /// Bytes read through the cache before an engine reports ready
    #[serde(default = "default_prefetch_bytes")]
    pub prefetch_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadConfig {
    #[serde(default = "default_max_parallel_downloads")]
    pub max_parallel_downloads: usize,
    /// Where the download index is persisted; `None` keeps it in memory.
    #[serde(default)]
    pub index_path: Option<PathBuf>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

fn default_cache_size_bytes() -> u64 {
    DEFAULT_CACHE_SIZE_BYTES
}

fn default_true() -> bool {
    true
}

fn default_volume() -> f32 {
    1.0
}

fn default_prefetch_bytes() -> u64 {
    256 * 1024
}

fn default_max_parallel_downloads() -> usize {
    DEFAULT_MAX_PARALLEL_DOWNLOADS
}

fn default_request_timeout_secs() -> u64 {
    300
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            cache_size_bytes: default_cache_size_bytes(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            repeat_one: true,
            volume: default_volume(),
            play_when_ready: false,
            prefetch_bytes: default_prefetch_bytes(),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_parallel_downloads: default_max_parallel_downloads(),
            index_path: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Config {
    /// Reject values the pool and coordinator cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.pool.pool_size < 1 {
            bail!("pool.pool_size must be at least 1 (got {})", self.pool.pool_size);
        }
        if self.download.max_parallel_downloads < 1 {
            bail!(
                "download.max_parallel_downloads must be at least 1 (got {})",
                self.download.max_parallel_downloads
            );
        }
        if !(0.0..=1.0).contains(&self.engine.volume) {
            bail!("engine.volume must be within [0, 1] (got {})", self.engine.volume);
        }
        Ok(())
    }

    /// Read a config file, falling back to defaults when it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).with_context(|| format!("Failed to write config: {:?}", path))?;
        Ok(())
    }
}

/// Directory holding the config file and, by default, the download index.
pub fn config_dir() -> Result<PathBuf> {
    let base = dirs::config_dir().context("Could not find config directory")?;
    Ok(base.join("reelpool"))
}

pub fn config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.json"))
}

pub fn default_index_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("downloads.json"))
}

pub fn load_config() -> Result<Config> {
    Config::load_from(&config_path()?)
}

pub fn save_config(config: &Config) -> Result<()> {
    config.save_to(&config_path()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.pool.pool_size, 3);
        assert_eq!(config.pool.cache_size_bytes, 100 * 1024 * 1024);
        assert_eq!(config.download.max_parallel_downloads, 3);
        assert!(config.engine.repeat_one);
        assert!(!config.engine.play_when_ready);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: Config = serde_json::from_str(r#"{"pool": {"pool_size": 5}}"#).unwrap();
        assert_eq!(config.pool.pool_size, 5);
        assert_eq!(config.pool.cache_size_bytes, DEFAULT_CACHE_SIZE_BYTES);
        assert_eq!(config.engine.volume, 1.0);
    }

    #[test]
    fn test_validate_rejects_zero_pool() {
        let mut config = Config::default();
        config.pool.pool_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.download.max_parallel_downloads = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.engine.volume = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_roundtrip_on_disk() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("nested").join("config.json");

        assert_eq!(Config::load_from(&path).unwrap(), Config::default());

        let mut config = Config::default();
        config.pool.pool_size = 4;
        config.download.index_path = Some(dir.path().join("downloads.json"));
        config.save_to(&path).unwrap();

        assert_eq!(Config::load_from(&path).unwrap(), config);
    }
}
