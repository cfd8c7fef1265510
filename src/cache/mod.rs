//! Scoped, durable cache of collection reads.
//!
//! This module provides an API-agnostic caching mechanism that:
//! - Stores server payloads under keys built from collection, operation,
//!   record id and query parameters
//! - Partitions every entry by the authenticated scope
//! - Persists entries through a pluggable key/value backend, evicting the
//!   oldest entries when storage is full
//! - Notifies subscribers of a collection on every write and invalidation

mod key;
mod scope;
mod storage;
mod store;
mod traits;

pub use key::{canonical_query, CacheKey, Operation, QueryParams};
pub use scope::{ScopeProvider, SessionScope, StaticScope, ANONYMOUS_SCOPE};
pub use storage::{MemoryStorage, NoopStorage, PersistentStorage, SqliteStorage, StorageError, StorageResult};
pub use store::{CacheStore, ScopeTicket, StoreStats, Subscription, DEFAULT_EVICTION_BATCH, DEFAULT_PREFIX};
pub use traits::{CacheEntry, CacheResult, CacheSource, CollectionState};
