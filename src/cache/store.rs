//! Thread-safe keyed store of cached value lists with TTL validity checks
//! and durable JSON persistence.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// One cached value list.
///
/// `values` is deduplicated and sorted ascending (case-sensitive); the whole
/// entry is replaced atomically on refresh, never patched in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub values: Vec<String>,
    #[serde(rename = "timestamp")]
    pub fetched_at: DateTime<Utc>,
}

impl CacheEntry {
    fn new(values: Vec<String>) -> Self {
        Self {
            values,
            fetched_at: Utc::now(),
        }
    }

    /// An entry exactly at the TTL boundary is already invalid.
    pub fn is_valid(&self, ttl: Duration) -> bool {
        Utc::now() - self.fetched_at < ttl
    }
}

/// Thread-safe store of `CacheEntry` objects keyed by lookup-list key.
///
/// One reader/writer lock guards the map; no I/O is ever performed while the
/// lock is held (persistence snapshots the map first and writes outside it).
pub struct CacheStore {
    entries: RwLock<HashMap<String, CacheEntry>>,
    path: PathBuf,
    ttl: Duration,
}

impl CacheStore {
    pub fn new(path: PathBuf, ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            path,
            ttl,
        }
    }

    /// Current values for `key`, plus whether they are still within TTL.
    /// Never blocks on I/O.
    pub fn get(&self, key: &str) -> Option<(Vec<String>, bool)> {
        let entries = self.entries.read().expect("cache lock poisoned");
        entries
            .get(key)
            .map(|e| (e.values.clone(), e.is_valid(self.ttl)))
    }

    /// Atomically replace the entry for `key`, stamping it with the current
    /// time. Triggers no I/O; persistence is explicit via `save_to_disk`.
    pub fn put(&self, key: &str, values: Vec<String>) {
        let mut entries = self.entries.write().expect("cache lock poisoned");
        entries.insert(key.to_string(), CacheEntry::new(values));
    }

    pub fn is_valid(&self, key: &str) -> bool {
        let entries = self.entries.read().expect("cache lock poisoned");
        entries.get(key).is_some_and(|e| e.is_valid(self.ttl))
    }

    /// Insert `value` into the entry for `key`, keeping the list sorted.
    /// Returns false when the value was already present or no entry exists
    /// for the key. The entry's timestamp is preserved: adding one value
    /// does not make a stale list fresh.
    pub fn insert_value(&self, key: &str, value: &str) -> bool {
        let mut entries = self.entries.write().expect("cache lock poisoned");
        let Some(entry) = entries.get_mut(key) else {
            return false;
        };
        match entry.values.binary_search_by(|v| v.as_str().cmp(value)) {
            Ok(_) => false,
            Err(pos) => {
                entry.values.insert(pos, value.to_string());
                true
            }
        }
    }

    /// Number of cached entries (valid or stale).
    pub fn len(&self) -> usize {
        self.entries.read().expect("cache lock poisoned").len()
    }

    fn tmp_path(&self) -> PathBuf {
        PathBuf::from(format!("{}.tmp", self.path.display()))
    }

    /// Serialize all entries to disk using write-temp-then-rename so a crash
    /// mid-write never corrupts the previous file.
    pub fn save_to_disk(&self) -> Result<()> {
        let snapshot: HashMap<String, CacheEntry> = {
            let entries = self.entries.read().expect("cache lock poisoned");
            entries.clone()
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create cache directory {}", parent.display()))?;
        }

        let contents = serde_json::to_string_pretty(&snapshot)?;
        let tmp = self.tmp_path();
        std::fs::write(&tmp, contents)
            .with_context(|| format!("Failed to write cache temp file {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to move cache file into place at {}", self.path.display()))?;

        debug!(path = %self.path.display(), entries = snapshot.len(), "Cache persisted");
        Ok(())
    }

    /// Load the persisted document, called once at startup.
    ///
    /// Lenient by design: entries that fail to parse (including unparsable
    /// timestamps) are skipped, and entries already past TTL are discarded
    /// rather than loaded as valid.
    pub fn load_from_disk(&self) -> Result<()> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "No persisted cache file");
            return Ok(());
        }

        let contents = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read cache file {}", self.path.display()))?;
        let raw: HashMap<String, serde_json::Value> = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse cache file {}", self.path.display()))?;

        let mut loaded = 0usize;
        let mut entries = self.entries.write().expect("cache lock poisoned");
        for (key, value) in raw {
            match serde_json::from_value::<CacheEntry>(value) {
                Ok(entry) if entry.is_valid(self.ttl) => {
                    entries.insert(key, entry);
                    loaded += 1;
                }
                Ok(_) => {
                    debug!(key = %key, "Discarding expired cache entry");
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping unparsable cache entry");
                }
            }
        }
        drop(entries);

        debug!(path = %self.path.display(), loaded, "Cache loaded");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, key: &str, age: Duration) {
        let mut entries = self.entries.write().expect("cache lock poisoned");
        if let Some(entry) = entries.get_mut(key) {
            entry.fetched_at = Utc::now() - age;
        }
    }
}
