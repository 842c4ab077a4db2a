//! Configuration loading and defaults.

use anyhow::Result;
use serde::Deserialize;
use std::path::Path;

use crate::storage::page::PAGE_SIZE;

/// Runtime configuration for the storage engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// On-disk page size in bytes. Must equal [`PAGE_SIZE`] — the format
    /// is fixed, but a mismatched value in a config file should be
    /// caught as a config error rather than silently ignored.
    pub page_size: u32,

    /// Number of pages to preallocate in the backing file when a fresh
    /// store is created (meta page plus both sentinels need at least 3).
    /// Default 16.
    pub initial_pages: usize,

    /// Whether to `flush()` the backing mapping after every mutating
    /// tree operation. Default true; callers batching many inserts may
    /// turn this off and flush once at the end.
    pub sync_on_write: bool,

    /// Directory holding the backing file(s) for file-backed stores.
    /// Default ".".
    pub data_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            page_size: PAGE_SIZE as u32,
            initial_pages: 16,
            sync_on_write: true,
            data_dir: ".".to_string(),
        }
    }
}

impl Config {
    /// Load config from a TOML file. Defaults to `Config::default()`.
    /// Empty file returns default config.
    pub fn from_path(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)?;
        if s.trim().is_empty() {
            return Ok(Self::default());
        }
        let c: Config = toml::from_str(&s)?;
        c.validate()?;
        Ok(c)
    }

    /// Use default config. Convenience for tests and minimal setups.
    pub fn default_config() -> Self {
        Self::default()
    }

    fn validate(&self) -> Result<()> {
        if self.page_size as usize != PAGE_SIZE {
            anyhow::bail!("page_size must equal {PAGE_SIZE}, the engine's fixed page layout");
        }
        if self.initial_pages < 3 {
            anyhow::bail!("initial_pages must be at least 3 (meta page plus both sentinels)");
        }
        Ok(())
    }
}
