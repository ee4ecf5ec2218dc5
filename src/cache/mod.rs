//! Local caching module for reference-data value lists.
//!
//! This module provides the `CacheStore` holding one `CacheEntry` per lookup
//! key. Entries expire after a configurable TTL and the whole store mirrors
//! itself to a JSON document on disk, written atomically.

pub mod store;

pub use store::{CacheEntry, CacheStore};
