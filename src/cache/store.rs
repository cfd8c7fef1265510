//! Scoped cache store with an in-memory mirror and per-collection
//! change notifications.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::key::CacheKey;
use super::scope::ScopeProvider;
use super::storage::{PersistentStorage, StorageError};
use super::traits::{CacheEntry, CollectionState};

/// Default namespace for persisted keys.
pub const DEFAULT_PREFIX: &str = "edgecache";

/// Default number of entries evicted when storage is full.
pub const DEFAULT_EVICTION_BATCH: usize = 5;

/// Segment marking a persisted collection invalidation,
/// `<prefix>:<scope>:collection:<name>`
const INVALIDATION_MARKER: &str = "collection";

/// Scope and session generation captured when an asynchronous fetch starts.
///
/// Writes carrying a ticket from a torn-down session are dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeTicket {
  pub scope: String,
  generation: u64,
}

/// Entry counts for the current scope.
#[derive(Debug, Clone)]
pub struct StoreStats {
  pub scope: String,
  pub memory_entries: usize,
  pub persisted_entries: usize,
  pub collections: Vec<CollectionState>,
}

/// Interest in one collection. Dropping it releases the listener.
#[derive(Debug)]
pub struct Subscription {
  rx: watch::Receiver<CollectionState>,
}

impl Subscription {
  /// Whether a notification arrived since the last `acknowledge`.
  /// Several unobserved notifications count as one.
  pub fn has_changed(&self) -> bool {
    self.rx.has_changed().unwrap_or(false)
  }

  /// Mark the latest notification as seen and return the collection state.
  pub fn acknowledge(&mut self) -> CollectionState {
    self.rx.borrow_and_update().clone()
  }

  /// Wait for the next notification. Returns false if the store is gone.
  pub async fn changed(&mut self) -> bool {
    self.rx.changed().await.is_ok()
  }
}

struct StoreInner {
  /// Memory mirror, keyed by persistent storage key
  entries: HashMap<String, CacheEntry>,
  collections: HashMap<String, watch::Sender<CollectionState>>,
  /// Persisted invalidations already read, keyed by marker key
  markers: HashMap<String, Option<DateTime<Utc>>>,
  /// Bumped on every teardown
  generation: u64,
  last_timestamp: Option<DateTime<Utc>>,
}

impl StoreInner {
  /// Monotonic clock: every write and invalidation gets a distinct,
  /// strictly increasing timestamp.
  fn next_timestamp(&mut self) -> DateTime<Utc> {
    let now = Utc::now();
    let ts = match self.last_timestamp {
      Some(prev) if now <= prev => prev + Duration::microseconds(1),
      _ => now,
    };
    self.last_timestamp = Some(ts);
    ts
  }

  fn channel(&mut self, name: &str) -> &watch::Sender<CollectionState> {
    self.collections.entry(name.to_string()).or_insert_with(|| {
      let (tx, _rx) = watch::channel(CollectionState {
        name: name.to_string(),
        ..Default::default()
      });
      tx
    })
  }

  fn notify(&mut self, collection: &str, invalidated_at: Option<DateTime<Utc>>) {
    self.channel(collection).send_modify(|state| {
      state.revision += 1;
      if let Some(at) = invalidated_at {
        state.last_invalidated = Some(at);
      }
    });
  }

  fn notified_invalidation(&self, collection: &str) -> Option<DateTime<Utc>> {
    self
      .collections
      .get(collection)
      .and_then(|tx| tx.borrow().last_invalidated)
  }
}

/// Process-wide store of fetched collections and detail records.
///
/// Entries are persisted through a [`PersistentStorage`] backend and mirrored
/// in memory. Every key is namespaced by the current scope, so two users never
/// share an entry. Writes never fail: on quota pressure the oldest entries are
/// evicted and the write retried once, after which the entry is kept in
/// memory only.
pub struct CacheStore {
  backend: Arc<dyn PersistentStorage>,
  scope: Arc<dyn ScopeProvider>,
  prefix: String,
  eviction_batch: usize,
  inner: Mutex<StoreInner>,
}

impl CacheStore {
  pub fn new(backend: Arc<dyn PersistentStorage>, scope: Arc<dyn ScopeProvider>) -> Self {
    Self {
      backend,
      scope,
      prefix: DEFAULT_PREFIX.to_string(),
      eviction_batch: DEFAULT_EVICTION_BATCH,
      inner: Mutex::new(StoreInner {
        entries: HashMap::new(),
        collections: HashMap::new(),
        markers: HashMap::new(),
        generation: 0,
        last_timestamp: None,
      }),
    }
  }

  /// Set the namespace used for persisted keys.
  pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
    self.prefix = prefix.into();
    self
  }

  /// Set how many entries are evicted when storage is full (at least one).
  pub fn with_eviction_batch(mut self, batch: usize) -> Self {
    self.eviction_batch = batch.max(1);
    self
  }

  pub fn scope_id(&self) -> String {
    self.scope.current_scope_id()
  }

  /// Capture the current scope for a write that completes later.
  pub fn ticket(&self) -> ScopeTicket {
    let inner = self.lock();
    ScopeTicket {
      scope: self.scope_id(),
      generation: inner.generation,
    }
  }

  /// Look up an entry. Only hydrates the memory mirror from storage.
  pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
    let scope = self.scope_id();
    let mut inner = self.lock();
    self.lookup(&mut inner, &scope, key)
  }

  /// Look up an entry written after the last invalidation of its collection.
  pub fn get_current(&self, key: &CacheKey) -> Option<CacheEntry> {
    let scope = self.scope_id();
    let mut inner = self.lock();
    let entry = self.lookup(&mut inner, &scope, key)?;
    match self.last_invalidated(&mut inner, &scope, &key.collection) {
      Some(at) if entry.timestamp <= at => {
        debug!(key = %key, "cache entry predates invalidation");
        None
      }
      _ => Some(entry),
    }
  }

  /// Store a value under the current scope and notify the collection.
  /// Returns the entry timestamp.
  pub fn set(&self, key: &CacheKey, value: Value) -> DateTime<Utc> {
    let scope = self.scope_id();
    let mut inner = self.lock();
    self.write(&mut inner, scope, key, value)
  }

  /// Store a value under the ticket's scope. Returns None, without writing,
  /// if the session the ticket was issued in has been torn down.
  pub fn set_with(&self, ticket: &ScopeTicket, key: &CacheKey, value: Value) -> Option<DateTime<Utc>> {
    let mut inner = self.lock();
    if ticket.generation != inner.generation {
      debug!(key = %key, scope = %ticket.scope, "dropping write from a closed session");
      return None;
    }
    Some(self.write(&mut inner, ticket.scope.clone(), key, value))
  }

  /// Mark every entry of `name` as stale and notify its subscribers.
  /// Entries are kept; readers compare them against the returned timestamp.
  ///
  /// The invalidation is persisted, so entries stored by an earlier process
  /// stay stale for later ones.
  pub fn invalidate_collection(&self, name: &str) -> DateTime<Utc> {
    let scope = self.scope_id();
    let mut inner = self.lock();
    let at = inner.next_timestamp();
    self.persist_invalidation(&mut inner, &scope, name, at);
    inner.notify(name, Some(at));
    info!(collection = name, "collection invalidated");
    at
  }

  pub fn subscribe(&self, name: &str) -> Subscription {
    let mut inner = self.lock();
    Subscription {
      rx: inner.channel(name).subscribe(),
    }
  }

  pub fn subscriber_count(&self, name: &str) -> usize {
    self
      .lock()
      .collections
      .get(name)
      .map(|tx| tx.receiver_count())
      .unwrap_or(0)
  }

  /// Notification state of `name`, with the invalidation time merged from
  /// storage for the current scope.
  pub fn collection_state(&self, name: &str) -> CollectionState {
    let scope = self.scope_id();
    let mut inner = self.lock();
    self.merged_state(&mut inner, &scope, name)
  }

  /// Delete one entry of the current scope.
  pub fn remove(&self, key: &CacheKey) {
    let storage_key = self.storage_key(&self.scope_id(), key);
    let mut inner = self.lock();
    inner.entries.remove(&storage_key);
    if let Err(e) = self.backend.remove_item(&storage_key) {
      warn!(key = %key, error = %e, "failed to remove persisted cache entry");
    }
  }

  /// End the current session: delete the scope's entries, reject writes
  /// from fetches started before now, and invalidate every known collection.
  ///
  /// Call before the scope provider switches to the next user.
  pub fn teardown(&self) {
    let scope = self.scope_id();
    let scope_prefix = self.scope_prefix(&scope);
    let mut inner = self.lock();

    let before = inner.entries.len();
    inner.entries.retain(|k, _| !k.starts_with(&scope_prefix));
    let cleared = before - inner.entries.len();
    inner.markers.retain(|k, _| !k.starts_with(&scope_prefix));
    let mut removed = 0;

    match self.backend.keys() {
      Ok(keys) => {
        for key in keys.iter().filter(|k| k.starts_with(&scope_prefix)) {
          match self.backend.remove_item(key) {
            Ok(()) => removed += 1,
            Err(e) => warn!(error = %e, "failed to remove persisted cache entry"),
          }
        }
      }
      Err(e) => warn!(error = %e, "failed to list persisted cache entries"),
    }

    inner.generation += 1;
    let at = inner.next_timestamp();
    let names: Vec<String> = inner.collections.keys().cloned().collect();
    for name in &names {
      inner.notify(name, Some(at));
    }

    info!(scope = %scope, cleared, removed, "cache scope torn down");
  }

  pub fn stats(&self) -> StoreStats {
    let scope = self.scope_id();
    let scope_prefix = self.scope_prefix(&scope);
    let marker_prefix = format!("{}{}:", scope_prefix, INVALIDATION_MARKER);
    let mut inner = self.lock();

    let memory_entries = inner
      .entries
      .keys()
      .filter(|k| k.starts_with(&scope_prefix))
      .count();
    let persisted = self.backend.keys().unwrap_or_default();
    let persisted_entries = persisted
      .iter()
      .filter(|k| k.starts_with(&scope_prefix) && !is_marker(k))
      .count();

    let mut names: BTreeSet<String> = inner.collections.keys().cloned().collect();
    names.extend(
      persisted
        .iter()
        .filter_map(|k| k.strip_prefix(&marker_prefix))
        .map(decode_segment),
    );
    let collections: Vec<CollectionState> = names
      .iter()
      .map(|name| self.merged_state(&mut inner, &scope, name))
      .collect();

    StoreStats {
      scope,
      memory_entries,
      persisted_entries,
      collections,
    }
  }

  fn lock(&self) -> MutexGuard<'_, StoreInner> {
    // The mirror stays usable even if a writer panicked mid-update
    self.inner.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn scope_prefix(&self, scope: &str) -> String {
    // Percent-encode so a scope containing ':' cannot alias another scope
    format!("{}:{}:", self.prefix, encode_segment(scope))
  }

  fn storage_key(&self, scope: &str, key: &CacheKey) -> String {
    format!("{}{}", self.scope_prefix(scope), key.cache_hash())
  }

  fn marker_key(&self, scope: &str, collection: &str) -> String {
    format!(
      "{}{}:{}",
      self.scope_prefix(scope),
      INVALIDATION_MARKER,
      encode_segment(collection)
    )
  }

  /// Latest invalidation of `collection`, from this process or from storage.
  fn last_invalidated(
    &self,
    inner: &mut StoreInner,
    scope: &str,
    collection: &str,
  ) -> Option<DateTime<Utc>> {
    let notified = inner.notified_invalidation(collection);
    notified.max(self.persisted_invalidation(inner, scope, collection))
  }

  fn persisted_invalidation(
    &self,
    inner: &mut StoreInner,
    scope: &str,
    collection: &str,
  ) -> Option<DateTime<Utc>> {
    let marker = self.marker_key(scope, collection);
    if let Some(at) = inner.markers.get(&marker) {
      return *at;
    }

    let at = match self.backend.get_item(&marker) {
      Ok(Some(raw)) => match serde_json::from_str::<DateTime<Utc>>(&raw) {
        Ok(at) => Some(at),
        Err(e) => {
          warn!(collection, error = %e, "ignoring unreadable invalidation marker");
          None
        }
      },
      Ok(None) => None,
      Err(e) => {
        warn!(collection, error = %e, "failed to read invalidation marker");
        None
      }
    };

    // Later writes in this process must sort after the stored invalidation
    if let Some(at) = at {
      if inner.last_timestamp.map_or(true, |last| last < at) {
        inner.last_timestamp = Some(at);
      }
    }
    inner.markers.insert(marker, at);
    at
  }

  fn persist_invalidation(&self, inner: &mut StoreInner, scope: &str, collection: &str, at: DateTime<Utc>) {
    let marker = self.marker_key(scope, collection);
    inner.markers.insert(marker.clone(), Some(at));

    let raw = match serde_json::to_string(&at) {
      Ok(raw) => raw,
      Err(e) => {
        warn!(collection, error = %e, "failed to serialize invalidation marker");
        return;
      }
    };

    let result = match self.backend.set_item(&marker, &raw) {
      Err(StorageError::QuotaExceeded { .. }) => {
        self.evict_oldest(inner, &marker);
        self.backend.set_item(&marker, &raw)
      }
      other => other,
    };
    if let Err(e) = result {
      warn!(collection, error = %e, "invalidation kept in memory only");
    }
  }

  fn merged_state(&self, inner: &mut StoreInner, scope: &str, name: &str) -> CollectionState {
    let mut state = inner
      .collections
      .get(name)
      .map(|tx| tx.borrow().clone())
      .unwrap_or_else(|| CollectionState {
        name: name.to_string(),
        ..Default::default()
      });
    state.last_invalidated = self.last_invalidated(inner, scope, name);
    state
  }

  fn lookup(&self, inner: &mut StoreInner, scope: &str, key: &CacheKey) -> Option<CacheEntry> {
    let storage_key = self.storage_key(scope, key);
    if let Some(entry) = inner.entries.get(&storage_key) {
      return (entry.key == *key).then(|| entry.clone());
    }

    let raw = match self.backend.get_item(&storage_key) {
      Ok(Some(raw)) => raw,
      Ok(None) => return None,
      Err(e) => {
        warn!(key = %key, error = %e, "failed to read persisted cache entry");
        return None;
      }
    };

    match serde_json::from_str::<CacheEntry>(&raw) {
      Ok(entry) if entry.scope == scope && entry.key == *key => {
        inner.entries.insert(storage_key, entry.clone());
        Some(entry)
      }
      Ok(_) => None,
      Err(e) => {
        warn!(key = %key, error = %e, "discarding unreadable cache entry");
        let _ = self.backend.remove_item(&storage_key);
        None
      }
    }
  }

  fn write(&self, inner: &mut StoreInner, scope: String, key: &CacheKey, value: Value) -> DateTime<Utc> {
    let timestamp = inner.next_timestamp();
    let storage_key = self.storage_key(&scope, key);
    let entry = CacheEntry {
      key: key.clone(),
      value,
      timestamp,
      scope,
    };

    self.persist(inner, &storage_key, &entry);
    inner.entries.insert(storage_key, entry);
    inner.notify(&key.collection, None);
    debug!(key = %key, "cache entry stored");

    timestamp
  }

  fn persist(&self, inner: &mut StoreInner, storage_key: &str, entry: &CacheEntry) {
    let raw = match serde_json::to_string(entry) {
      Ok(raw) => raw,
      Err(e) => {
        warn!(key = %entry.key, error = %e, "failed to serialize cache entry, keeping it in memory");
        return;
      }
    };

    match self.backend.set_item(storage_key, &raw) {
      Ok(()) => {}
      Err(StorageError::QuotaExceeded { needed, limit }) => {
        let evicted = self.evict_oldest(inner, storage_key);
        debug!(needed, limit, evicted, "storage full, evicted oldest cache entries");
        if let Err(e) = self.backend.set_item(storage_key, &raw) {
          warn!(key = %entry.key, error = %e, "cache write kept in memory only");
        }
      }
      Err(e) => {
        warn!(key = %entry.key, error = %e, "cache write kept in memory only");
      }
    }
  }

  /// Remove the oldest persisted entries in this store's namespace, across
  /// scopes. `protect` is the key being written and is never evicted.
  fn evict_oldest(&self, inner: &mut StoreInner, protect: &str) -> usize {
    let keys = match self.backend.keys() {
      Ok(keys) => keys,
      Err(e) => {
        warn!(error = %e, "failed to list persisted cache entries");
        return 0;
      }
    };

    let namespace = format!("{}:", self.prefix);
    // Unreadable entries sort first (None < Some)
    let mut candidates: Vec<(Option<DateTime<Utc>>, String)> = keys
      .into_iter()
      .filter(|k| k.starts_with(&namespace) && k != protect && !is_marker(k))
      .map(|k| {
        let timestamp = self
          .backend
          .get_item(&k)
          .ok()
          .flatten()
          .and_then(|raw| serde_json::from_str::<CacheEntry>(&raw).ok())
          .map(|entry| entry.timestamp);
        (timestamp, k)
      })
      .collect();
    candidates.sort();

    let mut evicted = 0;
    for (_, key) in candidates.into_iter().take(self.eviction_batch) {
      match self.backend.remove_item(&key) {
        Ok(()) => {
          inner.entries.remove(&key);
          evicted += 1;
        }
        Err(e) => warn!(error = %e, "failed to evict cache entry"),
      }
    }
    evicted
  }
}

fn encode_segment(segment: &str) -> String {
  url::form_urlencoded::byte_serialize(segment.as_bytes()).collect()
}

fn decode_segment(segment: &str) -> String {
  url::form_urlencoded::parse(format!("{}=", segment).as_bytes())
    .next()
    .map(|(name, _)| name.into_owned())
    .unwrap_or_else(|| segment.to_string())
}

fn is_marker(key: &str) -> bool {
  key.rsplit(':').nth(1) == Some(INVALIDATION_MARKER)
}
