//! Durable cache stores for offline support.
//!
//! This module provides the storage side of the offline cache controller:
//! - Named stores holding response snapshots keyed by request (method + URL)
//! - Atomic bulk population, used when a static generation is installed
//! - Lookup in one store or across all stores, oldest store first

mod storage;
mod traits;

pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{CachedResponse, EntryInfo, Request, RequestMode, Response};
