//! # Waypoint Store
//!
//! Persistence for the Waypoint offline layer, on SQLite.
//!
//! ## Features
//!
//! - **DurableStore**: `submissionsQueue` and `progressQueue` (append-only,
//!   FIFO by generated key) and `lessonCache` (upsert by natural id)
//! - **CacheStorage**: named response caches keyed by method + URL
//! - **Schema versioning**: each database records its applied version and
//!   refuses to open a newer one
//!
//! Every failure surfaces as `OfflineError::StorageUnavailable`; callers are
//! expected to log and carry on without durability.

pub mod caches;
pub mod durable;
pub mod schema;

pub use caches::{request_key, Cache, CacheEntry, CacheStorage};
pub use durable::{DurableStore, StoreKey, StoreName, StoreRecord};
pub use schema::StoreLocation;
