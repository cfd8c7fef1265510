//! Persistent key/value storage backends for cache entries.

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

/// Errors raised by a persistent storage backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
  #[error("storage quota exceeded: {needed} bytes needed, limit is {limit}")]
  QuotaExceeded { needed: usize, limit: usize },

  #[error("storage backend error: {0}")]
  Backend(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// String key/value storage that survives restarts.
///
/// Mirrors the browser `localStorage` contract: synchronous access and a
/// distinguishable quota-exceeded signal on writes.
pub trait PersistentStorage: Send + Sync {
  fn get_item(&self, key: &str) -> StorageResult<Option<String>>;

  /// Store a value. Returns `StorageError::QuotaExceeded` if the write would
  /// push the store over its quota.
  fn set_item(&self, key: &str, value: &str) -> StorageResult<()>;

  fn remove_item(&self, key: &str) -> StorageResult<()>;

  /// All keys currently stored.
  fn keys(&self) -> StorageResult<Vec<String>>;
}

/// Storage implementation that doesn't persist anything.
/// Used when persistence is disabled; the store then runs from memory only.
pub struct NoopStorage;

impl PersistentStorage for NoopStorage {
  fn get_item(&self, _key: &str) -> StorageResult<Option<String>> {
    Ok(None) // Always miss
  }

  fn set_item(&self, _key: &str, _value: &str) -> StorageResult<()> {
    Ok(()) // Discard
  }

  fn remove_item(&self, _key: &str) -> StorageResult<()> {
    Ok(())
  }

  fn keys(&self) -> StorageResult<Vec<String>> {
    Ok(Vec::new())
  }
}

/// In-process storage with an optional byte quota.
#[derive(Default)]
pub struct MemoryStorage {
  items: Mutex<HashMap<String, String>>,
  quota_bytes: Option<usize>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_quota(quota_bytes: usize) -> Self {
    Self {
      items: Mutex::new(HashMap::new()),
      quota_bytes: Some(quota_bytes),
    }
  }

  /// Bytes used by keys and values.
  pub fn used_bytes(&self) -> usize {
    self
      .items
      .lock()
      .map(|items| items.iter().map(|(k, v)| k.len() + v.len()).sum())
      .unwrap_or(0)
  }
}

impl PersistentStorage for MemoryStorage {
  fn get_item(&self, key: &str) -> StorageResult<Option<String>> {
    let items = self
      .items
      .lock()
      .map_err(|e| StorageError::Backend(format!("Lock poisoned: {}", e)))?;
    Ok(items.get(key).cloned())
  }

  fn set_item(&self, key: &str, value: &str) -> StorageResult<()> {
    let mut items = self
      .items
      .lock()
      .map_err(|e| StorageError::Backend(format!("Lock poisoned: {}", e)))?;

    if let Some(limit) = self.quota_bytes {
      let others: usize = items
        .iter()
        .filter(|(k, _)| k.as_str() != key)
        .map(|(k, v)| k.len() + v.len())
        .sum();
      let needed = others + key.len() + value.len();
      if needed > limit {
        return Err(StorageError::QuotaExceeded { needed, limit });
      }
    }

    items.insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn remove_item(&self, key: &str) -> StorageResult<()> {
    let mut items = self
      .items
      .lock()
      .map_err(|e| StorageError::Backend(format!("Lock poisoned: {}", e)))?;
    items.remove(key);
    Ok(())
  }

  fn keys(&self) -> StorageResult<Vec<String>> {
    let items = self
      .items
      .lock()
      .map_err(|e| StorageError::Backend(format!("Lock poisoned: {}", e)))?;
    Ok(items.keys().cloned().collect())
  }
}

/// SQLite-based storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
  quota_bytes: Option<usize>,
}

/// Schema for the key/value table.
const STORAGE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    written_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl SqliteStorage {
  /// Open (or create) the storage database at `path`.
  pub fn open(path: &Path, quota_bytes: Option<usize>) -> StorageResult<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        StorageError::Backend(format!("Failed to create cache directory: {}", e))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      StorageError::Backend(format!(
        "Failed to open cache database at {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::with_connection(conn, quota_bytes)
  }

  /// Storage that lives only as long as the process.
  pub fn open_in_memory(quota_bytes: Option<usize>) -> StorageResult<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| StorageError::Backend(format!("Failed to open in-memory database: {}", e)))?;
    Self::with_connection(conn, quota_bytes)
  }

  fn with_connection(conn: Connection, quota_bytes: Option<usize>) -> StorageResult<Self> {
    conn
      .execute_batch(STORAGE_SCHEMA)
      .map_err(|e| StorageError::Backend(format!("Failed to run cache migrations: {}", e)))?;

    Ok(Self {
      conn: Mutex::new(conn),
      quota_bytes,
    })
  }

  /// Get the default database path.
  pub fn default_path() -> Option<PathBuf> {
    let data_dir = dirs::data_dir().or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))?;
    Some(data_dir.join("edgecache").join("cache.db"))
  }

  fn lock(&self) -> StorageResult<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| StorageError::Backend(format!("Lock poisoned: {}", e)))
  }
}

impl PersistentStorage for SqliteStorage {
  fn get_item(&self, key: &str) -> StorageResult<Option<String>> {
    let conn = self.lock()?;
    conn
      .query_row(
        "SELECT value FROM kv_store WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| StorageError::Backend(format!("Failed to read {}: {}", key, e)))
  }

  fn set_item(&self, key: &str, value: &str) -> StorageResult<()> {
    let conn = self.lock()?;

    if let Some(limit) = self.quota_bytes {
      let others: i64 = conn
        .query_row(
          "SELECT COALESCE(SUM(length(CAST(key AS BLOB)) + length(CAST(value AS BLOB))), 0)
           FROM kv_store WHERE key != ?",
          params![key],
          |row| row.get(0),
        )
        .map_err(|e| StorageError::Backend(format!("Failed to compute storage usage: {}", e)))?;
      let needed = others.max(0) as usize + key.len() + value.len();
      if needed > limit {
        return Err(StorageError::QuotaExceeded { needed, limit });
      }
    }

    conn
      .execute(
        "INSERT OR REPLACE INTO kv_store (key, value, written_at) VALUES (?, ?, datetime('now'))",
        params![key, value],
      )
      .map_err(|e| StorageError::Backend(format!("Failed to store {}: {}", key, e)))?;

    Ok(())
  }

  fn remove_item(&self, key: &str) -> StorageResult<()> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM kv_store WHERE key = ?", params![key])
      .map_err(|e| StorageError::Backend(format!("Failed to remove {}: {}", key, e)))?;
    Ok(())
  }

  fn keys(&self) -> StorageResult<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT key FROM kv_store")
      .map_err(|e| StorageError::Backend(format!("Failed to prepare key query: {}", e)))?;

    let keys = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| StorageError::Backend(format!("Failed to list keys: {}", e)))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(keys)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_memory_quota() {
    let storage = MemoryStorage::with_quota(10);
    storage.set_item("a", "1234").unwrap();
    // Replacing a key only counts the new value
    storage.set_item("a", "123456789").unwrap();
    let err = storage.set_item("b", "xx").unwrap_err();
    assert!(matches!(err, StorageError::QuotaExceeded { limit: 10, .. }));

    storage.remove_item("a").unwrap();
    storage.set_item("b", "xx").unwrap();
    assert_eq!(storage.used_bytes(), 3);
  }

  #[test]
  fn test_sqlite_roundtrip_and_keys() {
    let storage = SqliteStorage::open_in_memory(None).unwrap();
    assert_eq!(storage.get_item("missing").unwrap(), None);

    storage.set_item("k1", "v1").unwrap();
    storage.set_item("k2", "v2").unwrap();
    storage.set_item("k1", "v1b").unwrap();
    assert_eq!(storage.get_item("k1").unwrap().as_deref(), Some("v1b"));

    let mut keys = storage.keys().unwrap();
    keys.sort();
    assert_eq!(keys, vec!["k1".to_string(), "k2".to_string()]);

    storage.remove_item("k2").unwrap();
    assert_eq!(storage.get_item("k2").unwrap(), None);
  }

  #[test]
  fn test_sqlite_quota() {
    let storage = SqliteStorage::open_in_memory(Some(12)).unwrap();
    storage.set_item("aa", "1234").unwrap();
    let err = storage.set_item("bb", "12345678").unwrap_err();
    assert!(matches!(err, StorageError::QuotaExceeded { needed: 16, limit: 12 }));
    assert_eq!(storage.get_item("bb").unwrap(), None);
  }

  #[test]
  fn test_sqlite_open_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");
    {
      let storage = SqliteStorage::open(&path, None).unwrap();
      storage.set_item("k", "v").unwrap();
    }
    let reopened = SqliteStorage::open(&path, None).unwrap();
    assert_eq!(reopened.get_item("k").unwrap().as_deref(), Some("v"));
  }
}
