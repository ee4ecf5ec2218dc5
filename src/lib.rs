//! Reference-data cache with concurrent refresh.
//!
//! Keeps a set of named, remotely-sourced lookup lists (used to populate
//! selection fields) fresh and available under load: a thread-safe
//! in-memory + on-disk [`CacheStore`] with per-entry TTL expiry, a
//! bounded-concurrency [`RefreshCoordinator`] that refreshes many tables in
//! parallel against a paginated REST API, and the
//! [`ReferenceDataManager`] facade serving cached values to concurrent
//! callers with bounded waits and graceful degradation to stale data.
//!
//! Typical lifecycle:
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use refcache::{Config, ReferenceDataManager, TableClient};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = Config::load()?;
//! let client = Arc::new(TableClient::new(&config)?);
//! let manager = ReferenceDataManager::new(&config, client)?;
//! manager.start();
//!
//! let agencies = manager.get_values("agencies", Duration::from_secs(5)).await;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod cache;
pub mod config;
pub mod manager;
pub mod refresh;

pub use api::{FetchError, RemoteTables, TableClient};
pub use cache::{CacheEntry, CacheStore};
pub use config::{Config, TableMapping};
pub use manager::{ReferenceDataManager, Status};
pub use refresh::{RefreshCoordinator, TableDescriptor};
