//! Application configuration management.
//!
//! Configuration covers the API credential, the remote base and per-key
//! table mappings, the cache TTL, the refresh worker-pool size and the
//! refresh timeouts.
//!
//! Configuration is stored at `~/.config/refcache/config.json`; the token
//! and base id can be overridden through `REFCACHE_API_TOKEN` and
//! `REFCACHE_BASE_ID` (a `.env` file is honored).

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "refcache";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Persisted cache file name
const CACHE_FILE: &str = "cache.json";

fn default_base_url() -> String {
    "https://api.airtable.com/v0".to_string()
}

/// Consider cached lists stale after 45 minutes.
/// Balances freshness with reducing API calls for slowly-changing data.
fn default_ttl_minutes() -> i64 {
    45
}

/// Bound on concurrent outbound requests during a refresh cycle, small
/// enough not to trip upstream rate limiting.
fn default_worker_pool_size() -> usize {
    3
}

fn default_task_timeout_secs() -> u64 {
    30
}

fn default_global_timeout_secs() -> u64 {
    120
}

/// Binds one cache key to the remote table/field that backs it.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TableMapping {
    pub key: String,
    #[serde(default)]
    pub table: String,
    #[serde(default)]
    pub field: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api_token: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub base_id: String,
    #[serde(default)]
    pub tables: Vec<TableMapping>,
    #[serde(default = "default_ttl_minutes")]
    pub ttl_minutes: i64,
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    #[serde(default = "default_global_timeout_secs")]
    pub global_timeout_secs: u64,
    /// Override for the persisted cache location; defaults to the user
    /// cache directory.
    #[serde(default)]
    pub cache_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_token: String::new(),
            base_url: default_base_url(),
            base_id: String::new(),
            tables: Vec::new(),
            ttl_minutes: default_ttl_minutes(),
            worker_pool_size: default_worker_pool_size(),
            task_timeout_secs: default_task_timeout_secs(),
            global_timeout_secs: default_global_timeout_secs(),
            cache_file: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load .env file if present (silently ignore if not found)
        let _ = dotenvy::dotenv();

        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            serde_json::from_str(&contents)?
        } else {
            Self::default()
        };

        if let Ok(token) = std::env::var("REFCACHE_API_TOKEN") {
            config.api_token = token;
        }
        if let Ok(base_id) = std::env::var("REFCACHE_BASE_ID") {
            config.base_id = base_id;
        }

        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir =
            dirs::config_dir().ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_file_path(&self) -> Result<PathBuf> {
        if let Some(ref path) = self.cache_file {
            return Ok(path.clone());
        }
        let cache_dir =
            dirs::cache_dir().ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME).join(CACHE_FILE))
    }

    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.ttl_minutes)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn global_timeout(&self) -> Duration {
        Duration::from_secs(self.global_timeout_secs)
    }
}
