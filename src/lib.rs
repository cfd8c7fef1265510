//! Reactive data and cache layer for an IoT device-management console.
//!
//! - [`cache`]: scope-namespaced, persistent cache store with per-collection
//!   change notifications
//! - [`api`]: HTTP transport and the stale-while-revalidate fetch wrapper
//! - [`binding`]: live `data / loading / error` views for UI sections

pub mod api;
pub mod binding;
pub mod cache;
pub mod collections;
pub mod config;
pub mod logging;

#[cfg(test)]
mod test_support;

pub use api::{CachedApiClient, FetchError, ReadRequest};
pub use binding::{BindingConfig, BindingPhase, DataBinding};
pub use cache::{CacheKey, CacheStore};
