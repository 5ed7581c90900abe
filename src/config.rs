//! # Configuration
//!
//! Runtime configuration comes from environment variables, each with a
//! working default so the client runs without any setup:
//!
//! | Variable | Default | Purpose |
//! |---|---|---|
//! | `CACHE_DIR` | `storage/cache` | copies of ingested torrent files |
//! | `DOWNLOAD_DIR` | `storage/downloads` | downloaded content |
//! | `DB_PATH` | `storage/state.db` | persisted download state |
//!
//! Log filtering is handled separately through `RUST_LOG`.

use std::env;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};

/// Resolved application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory keeping a copy of every ingested torrent file
    pub cache_dir: PathBuf,
    /// Root directory for downloaded content
    pub download_dir: PathBuf,
    /// Path of the persisted state file
    pub db_path: PathBuf,
}

impl Config {
    /// Reads configuration from the environment, falling back to defaults.
    pub fn from_env() -> Config {
        Config {
            cache_dir: var_or("CACHE_DIR", "storage/cache"),
            download_dir: var_or("DOWNLOAD_DIR", "storage/downloads"),
            db_path: var_or("DB_PATH", "storage/state.db"),
        }
    }

    /// Creates the cache and download directories and the state file's
    /// parent directory.
    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.cache_dir)
            .with_context(|| format!("creating cache directory {}", self.cache_dir.display()))?;
        fs::create_dir_all(&self.download_dir)
            .with_context(|| format!("creating download directory {}", self.download_dir.display()))?;
        if let Some(parent) = self.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating state directory {}", parent.display()))?;
            }
        }
        Ok(())
    }
}

fn var_or(name: &str, default: &str) -> PathBuf {
    match env::var(name) {
        Ok(value) if !value.is_empty() => PathBuf::from(value),
        _ => PathBuf::from(default),
    }
}
