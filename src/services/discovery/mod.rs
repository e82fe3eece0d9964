//! Client-side discovery
//!
//! Wraps a [`ServiceRegistry`](crate::services::registry::ServiceRegistry) with a
//! TTL cache, per-service change callbacks and pluggable instance selection.

pub mod cache;
pub mod client;
pub mod error;
pub mod watcher;

pub use cache::{CacheKey, CacheStats, DiscoveryCache};
pub use client::ServiceDiscoveryClient;
pub use error::DiscoveryError;
pub use watcher::{WatchCallback, WatcherTable};
