//! Core types shared by the cache store and the fetch wrapper.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::key::CacheKey;

/// A stored server response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
  pub key: CacheKey,
  /// Last known server payload
  pub value: Value,
  /// When the entry was last written
  pub timestamp: DateTime<Utc>,
  /// Scope (authenticated user) the entry belongs to
  pub scope: String,
}

/// Invalidation bookkeeping for one collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionState {
  pub name: String,
  pub last_invalidated: Option<DateTime<Utc>>,
  /// Number of notifications issued for this collection
  pub revision: u64,
}

/// Result from a read, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// Timestamp of the cache entry holding this data, if it was stored
  pub stored_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Fresh network data, stored at `stored_at` (None if the write was dropped).
  pub fn from_network(data: T, stored_at: Option<DateTime<Utc>>) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      stored_at,
    }
  }

  /// Data served from the cache.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      stored_at: Some(cached_at),
    }
  }
}

/// Indicates where data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Served from cache; a background refresh was started
  Cache,
}
