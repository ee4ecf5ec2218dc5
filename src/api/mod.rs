//! REST API client module for the remote reference-data service.
//!
//! This module provides the `TableClient` for paging through remote tables
//! and the `RemoteTables` trait the cache layer is written against.
//!
//! Requests authenticate with a bearer token and retry transient failures
//! with backoff; errors are classified by `FetchError`.

pub mod client;
pub mod error;

pub use client::{RemoteTables, TableClient};
pub use error::FetchError;
