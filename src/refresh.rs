//! Concurrent refresh coordinator.
//!
//! Runs a full or partial refresh cycle across the registered table
//! descriptors with bounded parallelism, a per-task timeout and a global
//! cycle deadline. Only one cycle runs at a time: a trigger that observes a
//! cycle in flight is a no-op.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::{FetchError, RemoteTables};
use crate::cache::CacheStore;

/// Identifies which remote table/field backs a given cache key.
/// Built once at startup from configuration; immutable thereafter.
#[derive(Debug, Clone)]
pub struct TableDescriptor {
    pub key: String,
    pub table: String,
    pub field: String,
}

/// Outcome of one table fetch within a refresh cycle.
struct RefreshResult {
    key: String,
    outcome: Result<Vec<String>, FetchError>,
    elapsed: Duration,
}

/// Progress bookkeeping for the current and most recent cycle.
#[derive(Debug, Default)]
struct CycleStats {
    started_at: Option<Instant>,
    total: usize,
    completed: usize,
    last_duration: Option<Duration>,
    last_succeeded: usize,
    last_failed: usize,
}

pub struct RefreshCoordinator {
    store: Arc<CacheStore>,
    client: Arc<dyn RemoteTables>,
    errors: Arc<Mutex<HashMap<String, String>>>,
    loading: Mutex<bool>,
    notify: Notify,
    stats: Mutex<CycleStats>,
    pool_size: usize,
    task_timeout: Duration,
    global_timeout: Duration,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<CacheStore>,
        client: Arc<dyn RemoteTables>,
        errors: Arc<Mutex<HashMap<String, String>>>,
        pool_size: usize,
        task_timeout: Duration,
        global_timeout: Duration,
    ) -> Self {
        Self {
            store,
            client,
            errors,
            loading: Mutex::new(false),
            notify: Notify::new(),
            stats: Mutex::new(CycleStats::default()),
            pool_size: pool_size.max(1),
            task_timeout,
            global_timeout,
        }
    }

    pub fn is_loading(&self) -> bool {
        *self.loading.lock().expect("loading flag poisoned")
    }

    /// Waiters register here and re-check the cache on every wakeup; the
    /// coordinator notifies after each applied result and at cycle end.
    pub fn wait_handle(&self) -> &Notify {
        &self.notify
    }

    /// Non-blocking trigger for a refresh cycle.
    ///
    /// Transitions `Idle -> Loading` and spawns the cycle; if a cycle is
    /// already in flight this is a no-op. Only descriptors whose cache entry
    /// is invalid are refreshed unless `force` is set.
    pub fn refresh_all(self: &Arc<Self>, descriptors: &[TableDescriptor], force: bool) {
        {
            let mut loading = self.loading.lock().expect("loading flag poisoned");
            if *loading {
                debug!("Refresh already in flight, ignoring trigger");
                return;
            }
            *loading = true;
        }

        let pending: Vec<TableDescriptor> = descriptors
            .iter()
            .filter(|d| force || !self.store.is_valid(&d.key))
            .cloned()
            .collect();

        {
            let mut stats = self.stats.lock().expect("stats poisoned");
            stats.started_at = Some(Instant::now());
            stats.total = pending.len();
            stats.completed = 0;
        }

        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            coordinator.run_cycle(pending).await;
        });
    }

    async fn run_cycle(self: Arc<Self>, pending: Vec<TableDescriptor>) {
        let started = Instant::now();
        let deadline = started + self.global_timeout;
        info!(tables = pending.len(), "Refresh cycle started");

        let mut outstanding: HashSet<String> = pending.iter().map(|d| d.key.clone()).collect();
        let semaphore = Arc::new(Semaphore::new(self.pool_size));
        let (tx, mut rx) = mpsc::channel::<RefreshResult>(pending.len().max(1));

        let mut handles = Vec::with_capacity(pending.len());
        for descriptor in pending {
            let client = Arc::clone(&self.client);
            let semaphore = Arc::clone(&semaphore);
            let tx = tx.clone();
            let task_timeout = self.task_timeout;
            handles.push(tokio::spawn(async move {
                // Closed only when the whole pool is dropped mid-cycle
                let Ok(_permit) = semaphore.acquire().await else {
                    return;
                };
                let start = Instant::now();
                let outcome = match tokio::time::timeout(
                    task_timeout,
                    client.fetch_all_values(&descriptor.table, &descriptor.field),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(FetchError::Timeout),
                };
                let _ = tx
                    .send(RefreshResult {
                        key: descriptor.key,
                        outcome,
                        elapsed: start.elapsed(),
                    })
                    .await;
            }));
        }
        drop(tx);

        let mut succeeded = 0usize;
        let mut failed = 0usize;
        while !outstanding.is_empty() {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(result)) => {
                    outstanding.remove(&result.key);
                    if self.apply_result(result) {
                        succeeded += 1;
                    } else {
                        failed += 1;
                    }
                    self.stats.lock().expect("stats poisoned").completed += 1;
                    self.notify.notify_waiters();
                }
                Ok(None) => {
                    // A task panicked or was aborted without reporting; its
                    // keys still need an error-map entry
                    warn!(remaining = outstanding.len(), "Refresh channel closed early");
                    let mut errors = self.errors.lock().expect("error map poisoned");
                    for key in outstanding.drain() {
                        errors.insert(key, "refresh task failed before reporting".to_string());
                        failed += 1;
                    }
                    break;
                }
                Err(_) => {
                    warn!(
                        remaining = outstanding.len(),
                        "Global refresh timeout, cancelling remaining tasks"
                    );
                    for handle in &handles {
                        handle.abort();
                    }
                    let mut errors = self.errors.lock().expect("error map poisoned");
                    for key in outstanding.drain() {
                        errors.insert(key, FetchError::Timeout.to_string());
                        failed += 1;
                    }
                    break;
                }
            }
        }

        if succeeded > 0 {
            if let Err(e) = self.store.save_to_disk() {
                warn!(error = %e, "Failed to persist cache after refresh");
            }
        }

        let duration = started.elapsed();
        {
            let mut stats = self.stats.lock().expect("stats poisoned");
            stats.started_at = None;
            stats.last_duration = Some(duration);
            stats.last_succeeded = succeeded;
            stats.last_failed = failed;
        }
        {
            let mut loading = self.loading.lock().expect("loading flag poisoned");
            *loading = false;
        }
        self.notify.notify_waiters();

        info!(
            succeeded,
            failed,
            duration_ms = duration.as_millis() as u64,
            "Refresh cycle complete"
        );
    }

    /// Apply one task result to the store and error map. Returns success.
    fn apply_result(&self, result: RefreshResult) -> bool {
        match result.outcome {
            Ok(values) => {
                debug!(
                    key = %result.key,
                    count = values.len(),
                    elapsed_ms = result.elapsed.as_millis() as u64,
                    "Table refreshed"
                );
                self.store.put(&result.key, values);
                self.errors
                    .lock()
                    .expect("error map poisoned")
                    .remove(&result.key);
                true
            }
            Err(e) => {
                warn!(
                    key = %result.key,
                    elapsed_ms = result.elapsed.as_millis() as u64,
                    error = %e,
                    "Table refresh failed"
                );
                self.errors
                    .lock()
                    .expect("error map poisoned")
                    .insert(result.key, e.to_string());
                false
            }
        }
    }

    /// Duration of the most recent completed cycle.
    pub fn last_duration(&self) -> Option<Duration> {
        self.stats.lock().expect("stats poisoned").last_duration
    }

    /// Rough time-to-completion estimate for the in-flight cycle, based on
    /// the average per-table time so far. `None` when idle or before the
    /// first table has completed.
    pub fn estimated_remaining(&self) -> Option<Duration> {
        let stats = self.stats.lock().expect("stats poisoned");
        let started = stats.started_at?;
        if stats.completed == 0 || stats.total <= stats.completed {
            return None;
        }
        let per_table = started.elapsed() / stats.completed as u32;
        Some(per_table * (stats.total - stats.completed) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tempfile::TempDir;

    enum Behavior {
        Values(Vec<String>),
        Fail(FetchError),
        Hang,
        Panic,
    }

    /// Fake remote table source with per-table call counting.
    struct FakeTables {
        behaviors: HashMap<String, Behavior>,
        calls: Mutex<HashMap<String, usize>>,
    }

    impl FakeTables {
        fn new(behaviors: Vec<(&str, Behavior)>) -> Self {
            Self {
                behaviors: behaviors
                    .into_iter()
                    .map(|(t, b)| (t.to_string(), b))
                    .collect(),
                calls: Mutex::new(HashMap::new()),
            }
        }

        fn calls_for(&self, table: &str) -> usize {
            *self.calls.lock().unwrap().get(table).unwrap_or(&0)
        }

        fn total_calls(&self) -> usize {
            self.calls.lock().unwrap().values().sum()
        }
    }

    #[async_trait]
    impl RemoteTables for FakeTables {
        async fn fetch_all_values(
            &self,
            table: &str,
            _field: &str,
        ) -> Result<Vec<String>, FetchError> {
            *self
                .calls
                .lock()
                .unwrap()
                .entry(table.to_string())
                .or_insert(0) += 1;
            match self.behaviors.get(table) {
                Some(Behavior::Values(v)) => Ok(v.clone()),
                Some(Behavior::Fail(e)) => Err(e.clone()),
                Some(Behavior::Hang) => futures::future::pending().await,
                Some(Behavior::Panic) => panic!("worker blew up"),
                None => Err(FetchError::Permanent(format!("unknown table {}", table))),
            }
        }

        async fn insert_value(
            &self,
            _table: &str,
            _field: &str,
            _value: &str,
        ) -> Result<(), FetchError> {
            Ok(())
        }
    }

    fn descriptor(key: &str) -> TableDescriptor {
        TableDescriptor {
            key: key.to_string(),
            table: format!("{}_table", key),
            field: "Name".to_string(),
        }
    }

    fn coordinator_with(
        dir: &TempDir,
        client: Arc<FakeTables>,
        task_timeout: Duration,
        global_timeout: Duration,
    ) -> (Arc<RefreshCoordinator>, Arc<CacheStore>) {
        let store = Arc::new(CacheStore::new(
            dir.path().join("cache.json"),
            chrono::Duration::minutes(45),
        ));
        let coordinator = Arc::new(RefreshCoordinator::new(
            Arc::clone(&store),
            client,
            Arc::new(Mutex::new(HashMap::new())),
            3,
            task_timeout,
            global_timeout,
        ));
        (coordinator, store)
    }

    async fn wait_idle(coordinator: &RefreshCoordinator) {
        while coordinator.is_loading() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn errors_snapshot(coordinator: &RefreshCoordinator) -> HashMap<String, String> {
        coordinator.errors.lock().unwrap().clone()
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_skips_valid_entries() {
        let dir = TempDir::new().unwrap();
        let client = Arc::new(FakeTables::new(vec![(
            "agencies_table",
            Behavior::Values(vec!["a".into()]),
        )]));
        let (coordinator, store) = coordinator_with(
            &dir,
            Arc::clone(&client),
            Duration::from_secs(30),
            Duration::from_secs(120),
        );
        store.put("agencies", vec!["a".into()]);

        coordinator.refresh_all(&[descriptor("agencies")], false);
        wait_idle(&coordinator).await;
        coordinator.refresh_all(&[descriptor("agencies")], false);
        wait_idle(&coordinator).await;

        assert_eq!(client.total_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_triggers_single_flight() {
        let dir = TempDir::new().unwrap();
        let client = Arc::new(FakeTables::new(vec![
            ("agencies_table", Behavior::Values(vec!["a".into()])),
            ("regions_table", Behavior::Values(vec!["n".into()])),
        ]));
        let (coordinator, _store) = coordinator_with(
            &dir,
            Arc::clone(&client),
            Duration::from_secs(30),
            Duration::from_secs(120),
        );
        let descriptors = vec![descriptor("agencies"), descriptor("regions")];

        // Second trigger lands while the first cycle is still marked loading
        coordinator.refresh_all(&descriptors, true);
        coordinator.refresh_all(&descriptors, true);
        wait_idle(&coordinator).await;

        assert_eq!(client.calls_for("agencies_table"), 1);
        assert_eq!(client.calls_for("regions_table"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_failure_isolation() {
        let dir = TempDir::new().unwrap();
        let client = Arc::new(FakeTables::new(vec![
            (
                "agencies_table",
                Behavior::Fail(FetchError::Permanent("table not found".into())),
            ),
            ("regions_table", Behavior::Values(vec!["north".into()])),
        ]));
        let (coordinator, store) = coordinator_with(
            &dir,
            client,
            Duration::from_secs(30),
            Duration::from_secs(120),
        );
        // A prior failure for the succeeding key must be cleared
        coordinator
            .errors
            .lock()
            .unwrap()
            .insert("regions".into(), "old error".into());

        coordinator.refresh_all(&[descriptor("agencies"), descriptor("regions")], true);
        wait_idle(&coordinator).await;

        let errors = errors_snapshot(&coordinator);
        assert!(errors.contains_key("agencies"));
        assert!(!errors.contains_key("regions"));

        let (values, valid) = store.get("regions").unwrap();
        assert_eq!(values, vec!["north"]);
        assert!(valid);
        assert!(store.get("agencies").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_task_timeout_marks_key() {
        let dir = TempDir::new().unwrap();
        let client = Arc::new(FakeTables::new(vec![
            ("agencies_table", Behavior::Hang),
            ("regions_table", Behavior::Values(vec!["north".into()])),
        ]));
        let (coordinator, store) = coordinator_with(
            &dir,
            client,
            Duration::from_secs(1),
            Duration::from_secs(120),
        );

        coordinator.refresh_all(&[descriptor("agencies"), descriptor("regions")], true);
        wait_idle(&coordinator).await;

        let errors = errors_snapshot(&coordinator);
        assert_eq!(
            errors.get("agencies").map(String::as_str),
            Some("request timed out")
        );
        assert!(store.get("regions").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_timeout_keeps_completed_results() {
        let dir = TempDir::new().unwrap();
        let client = Arc::new(FakeTables::new(vec![
            ("agencies_table", Behavior::Hang),
            ("regions_table", Behavior::Values(vec!["north".into()])),
        ]));
        // Per-task timeout larger than the global deadline, so the hanging
        // task is cut off by the cycle deadline instead.
        let (coordinator, store) = coordinator_with(
            &dir,
            client,
            Duration::from_secs(60),
            Duration::from_secs(2),
        );

        coordinator.refresh_all(&[descriptor("agencies"), descriptor("regions")], true);
        wait_idle(&coordinator).await;

        let errors = errors_snapshot(&coordinator);
        assert!(errors.contains_key("agencies"));
        let (values, _) = store.get("regions").unwrap();
        assert_eq!(values, vec!["north"]);
        assert!(coordinator.last_duration().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicked_worker_still_marks_its_key() {
        let dir = TempDir::new().unwrap();
        let client = Arc::new(FakeTables::new(vec![
            ("agencies_table", Behavior::Panic),
            ("regions_table", Behavior::Values(vec!["north".into()])),
        ]));
        let (coordinator, store) = coordinator_with(
            &dir,
            client,
            Duration::from_secs(30),
            Duration::from_secs(120),
        );

        coordinator.refresh_all(&[descriptor("agencies"), descriptor("regions")], true);
        wait_idle(&coordinator).await;

        let errors = errors_snapshot(&coordinator);
        assert!(errors.contains_key("agencies"));
        assert!(!errors.contains_key("regions"));
        let (values, _) = store.get("regions").unwrap();
        assert_eq!(values, vec!["north"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persists_only_after_success() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");

        let failing = Arc::new(FakeTables::new(vec![(
            "agencies_table",
            Behavior::Fail(FetchError::Transient("boom".into())),
        )]));
        let (coordinator, _store) = coordinator_with(
            &dir,
            failing,
            Duration::from_secs(30),
            Duration::from_secs(120),
        );
        coordinator.refresh_all(&[descriptor("agencies")], true);
        wait_idle(&coordinator).await;
        assert!(!path.exists());

        let ok = Arc::new(FakeTables::new(vec![(
            "agencies_table",
            Behavior::Values(vec!["a".into()]),
        )]));
        let (coordinator, _store) = coordinator_with(
            &dir,
            ok,
            Duration::from_secs(30),
            Duration::from_secs(120),
        );
        coordinator.refresh_all(&[descriptor("agencies")], true);
        wait_idle(&coordinator).await;
        assert!(path.exists());
    }
}
