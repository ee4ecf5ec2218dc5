//! Public facade over the cache store, refresh coordinator and table client.
//!
//! The rest of the application talks only to `ReferenceDataManager`:
//! `get_values` reconciles "give me data now" requests with the asynchronous
//! background refresh, `add_value_if_missing` handles best-effort inserts,
//! and `status` surfaces per-key errors for display.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::api::{FetchError, RemoteTables};
use crate::cache::CacheStore;
use crate::config::Config;
use crate::refresh::{RefreshCoordinator, TableDescriptor};

/// Diagnostics snapshot for the UI layer. Computing it never blocks on I/O
/// and never mutates state.
#[derive(Debug, Clone)]
pub struct Status {
    pub loading: bool,
    pub table_count: usize,
    pub cached_count: usize,
    pub errors: HashMap<String, String>,
    pub last_load_duration: Option<Duration>,
    pub estimated_remaining: Option<Duration>,
}

pub struct ReferenceDataManager {
    descriptors: HashMap<String, TableDescriptor>,
    store: Arc<CacheStore>,
    coordinator: Arc<RefreshCoordinator>,
    client: Arc<dyn RemoteTables>,
    errors: Arc<Mutex<HashMap<String, String>>>,
}

impl ReferenceDataManager {
    /// Build the manager from configuration and load the persisted cache.
    ///
    /// Keys whose table mapping is missing get a configuration error
    /// recorded once and are excluded from the registry; they are never
    /// retried automatically.
    pub fn new(config: &Config, client: Arc<dyn RemoteTables>) -> Result<Self> {
        let errors = Arc::new(Mutex::new(HashMap::new()));

        let mut descriptors = HashMap::new();
        for mapping in &config.tables {
            if mapping.key.is_empty() {
                warn!("Ignoring table mapping with empty key");
                continue;
            }
            if mapping.table.is_empty() || mapping.field.is_empty() {
                let err = FetchError::Config("no remote table mapping configured".to_string());
                warn!(key = %mapping.key, error = %err, "Key excluded from registry");
                errors
                    .lock()
                    .expect("error map poisoned")
                    .insert(mapping.key.clone(), err.to_string());
                continue;
            }
            descriptors.insert(
                mapping.key.clone(),
                TableDescriptor {
                    key: mapping.key.clone(),
                    table: mapping.table.clone(),
                    field: mapping.field.clone(),
                },
            );
        }

        let store = Arc::new(CacheStore::new(config.cache_file_path()?, config.ttl()));
        if let Err(e) = store.load_from_disk() {
            warn!(error = %e, "Failed to load persisted cache, starting cold");
        }

        let coordinator = Arc::new(RefreshCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&client),
            Arc::clone(&errors),
            config.worker_pool_size,
            config.task_timeout(),
            config.global_timeout(),
        ));

        Ok(Self {
            descriptors,
            store,
            coordinator,
            client,
            errors,
        })
    }

    /// Kick off the initial background refresh.
    pub fn start(&self) {
        info!(tables = self.descriptors.len(), "Starting reference-data manager");
        self.refresh_all(false);
    }

    /// Trigger a refresh cycle over the whole registry. Non-blocking; a
    /// no-op when a cycle is already in flight.
    pub fn refresh_all(&self, force: bool) {
        let descriptors: Vec<TableDescriptor> = self.descriptors.values().cloned().collect();
        self.coordinator.refresh_all(&descriptors, force);
    }

    fn cached_or_empty(&self, key: &str) -> Vec<String> {
        self.store.get(key).map(|(values, _)| values).unwrap_or_default()
    }

    fn record_error(&self, key: &str, message: String) {
        self.errors
            .lock()
            .expect("error map poisoned")
            .insert(key.to_string(), message);
    }

    /// Values for `key`, waiting up to `wait` for fresh data.
    ///
    /// Valid cache: returned immediately. Refresh in flight: waits for the
    /// key to become valid, up to `wait`. Otherwise a lone direct fetch,
    /// bypassing the worker pool, bounded by `wait`. On any failure or
    /// timeout the caller gets whatever is cached (possibly stale or empty);
    /// errors go to the error map, never to the caller.
    pub async fn get_values(&self, key: &str, wait: Duration) -> Vec<String> {
        if let Some((values, true)) = self.store.get(key) {
            return values;
        }

        let Some(descriptor) = self.descriptors.get(key) else {
            debug!(key, "No table registered for key");
            return self.cached_or_empty(key);
        };

        let deadline = Instant::now() + wait;

        while self.coordinator.is_loading() {
            let notified = self.coordinator.wait_handle().notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            // Re-check after registering so a wakeup between the loading
            // check and registration is not lost
            if let Some((values, true)) = self.store.get(key) {
                return values;
            }
            if !self.coordinator.is_loading() {
                break;
            }
            if timeout_at(deadline, notified).await.is_err() {
                debug!(key, "Timed out waiting for refresh, falling back to cache");
                return self.cached_or_empty(key);
            }
        }

        if let Some((values, true)) = self.store.get(key) {
            return values;
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(
            remaining,
            self.client
                .fetch_all_values(&descriptor.table, &descriptor.field),
        )
        .await
        {
            Ok(Ok(values)) => {
                self.store.put(key, values.clone());
                self.errors
                    .lock()
                    .expect("error map poisoned")
                    .remove(key);
                if let Err(e) = self.store.save_to_disk() {
                    warn!(error = %e, "Failed to persist cache after direct fetch");
                }
                values
            }
            Ok(Err(e)) => {
                warn!(key, error = %e, "Direct table refresh failed");
                self.record_error(key, e.to_string());
                self.cached_or_empty(key)
            }
            Err(_) => {
                warn!(key, "Direct table refresh timed out");
                self.record_error(key, FetchError::Timeout.to_string());
                self.cached_or_empty(key)
            }
        }
    }

    /// Add `value` to the remote table backing `key` unless it is already
    /// cached (case-sensitive match). Returns whether an insert happened.
    ///
    /// Best-effort with eventual consistency: two concurrent callers may
    /// both insert remotely, but the local list converges to a single copy
    /// because the cache insert checks membership first. When no entry is
    /// cached yet the local update is skipped and the next refresh picks
    /// the value up.
    pub async fn add_value_if_missing(&self, key: &str, value: &str) -> bool {
        let Some(descriptor) = self.descriptors.get(key) else {
            warn!(key, "Cannot add value for unregistered key");
            return false;
        };

        if let Some((values, _)) = self.store.get(key) {
            if values.iter().any(|v| v == value) {
                return false;
            }
        }

        match self
            .client
            .insert_value(&descriptor.table, &descriptor.field, value)
            .await
        {
            Ok(()) => {
                if self.store.insert_value(key, value) {
                    if let Err(e) = self.store.save_to_disk() {
                        warn!(error = %e, "Failed to persist cache after insert");
                    }
                }
                debug!(key, "Value added to remote table");
                true
            }
            Err(e) => {
                warn!(key, error = %e, "Failed to add value to remote table");
                self.record_error(key, e.to_string());
                false
            }
        }
    }

    /// Non-blocking diagnostics snapshot.
    pub fn status(&self) -> Status {
        Status {
            loading: self.coordinator.is_loading(),
            table_count: self.descriptors.len(),
            cached_count: self.store.len(),
            errors: self.errors.lock().expect("error map poisoned").clone(),
            last_load_duration: self.coordinator.last_duration(),
            estimated_remaining: self.coordinator.estimated_remaining(),
        }
    }
}
