//! Reactive data binding for UI sections.
//!
//! Like the TanStack Query `useQuery` hook, a [`DataBinding<T>`] gives one
//! UI section a standing `data / loading / error` view of a single cache key
//! and keeps it current:
//! - fetches on mount through the cached client
//! - refetches when the collection is invalidated
//! - adopts newer entries written by anyone else (background refreshes,
//!   other bindings) without a network call
//!
//! # Example
//!
//! ```ignore
//! let mut edges: DataBinding<Vec<Edge>> =
//!     DataBinding::new(&client, BindingConfig::list("edges"));
//! edges.mount();
//!
//! // In event loop tick
//! if edges.poll() {
//!     // State changed, trigger re-render
//! }
//!
//! // In render
//! if edges.loading() { render_spinner() }
//! if let Some(err) = edges.error() { render_error(err) }
//! if let Some(list) = edges.data() { render_list(list) }
//! ```

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::api::{CachedApiClient, FetchError, ReadRequest};
use crate::cache::{CacheKey, CacheResult, CacheStore, Operation, QueryParams, Subscription};

/// Converts a raw payload into the binding's data
pub type ProcessFn<T> = Arc<dyn Fn(Value) -> Result<T, String> + Send + Sync>;

pub type FetchFuture = BoxFuture<'static, Result<CacheResult<Value>, FetchError>>;

/// Fetch function called with `skip_cache`
pub type FetchFn = Arc<dyn Fn(bool) -> FetchFuture + Send + Sync>;

type FetchOutcome = Result<CacheResult<Value>, FetchError>;

/// What a binding is bound to.
pub struct BindingConfig<T> {
  pub collection: String,
  pub operation: Operation,
  pub id: Option<String>,
  pub query: QueryParams,
  /// Converts the raw payload. Defaults to `serde_json::from_value`.
  pub process: Option<ProcessFn<T>>,
}

impl<T> BindingConfig<T> {
  pub fn list(collection: impl Into<String>) -> Self {
    Self {
      collection: collection.into(),
      operation: Operation::List,
      id: None,
      query: QueryParams::new(),
      process: None,
    }
  }

  pub fn detail(collection: impl Into<String>, id: impl Into<String>) -> Self {
    Self {
      collection: collection.into(),
      operation: Operation::Detail,
      id: Some(id.into()),
      query: QueryParams::new(),
      process: None,
    }
  }

  pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.query.insert(key.into(), value.into());
    self
  }

  pub fn with_params(mut self, params: QueryParams) -> Self {
    self.query.extend(params);
    self
  }

  pub fn with_process<F>(mut self, process: F) -> Self
  where
    F: Fn(Value) -> Result<T, String> + Send + Sync + 'static,
  {
    self.process = Some(Arc::new(process));
    self
  }

  pub fn read_request(&self) -> ReadRequest {
    let request = match (&self.operation, &self.id) {
      (Operation::Detail, Some(id)) => ReadRequest::detail(&self.collection, id),
      _ => ReadRequest::list(&self.collection),
    };
    request.with_params(self.query.clone())
  }
}

/// Lifecycle of a binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingPhase {
  /// Not mounted yet
  Idle,
  /// A fetch is in flight
  Loading,
  /// Data is populated and no error is pending
  Ready,
  /// The last fetch failed; previous data, if any, is kept
  Errored,
  /// Torn down; no further state changes
  Unmounted,
}

/// Live view of one cache key.
///
/// Fetches run on spawned tasks and report back over a channel; the owner
/// calls [`poll`](Self::poll) from its event loop (or awaits
/// [`changed`](Self::changed)) to apply results and store notifications.
pub struct DataBinding<T> {
  collection: String,
  key: CacheKey,
  store: Arc<CacheStore>,
  fetch: FetchFn,
  process: ProcessFn<T>,
  phase: BindingPhase,
  data: Option<T>,
  error: Option<String>,
  receiver: Option<mpsc::UnboundedReceiver<FetchOutcome>>,
  subscription: Option<Subscription>,
  /// Collection invalidation already acted upon
  seen_invalidation: Option<DateTime<Utc>>,
  /// Timestamp of the cache entry the current data came from
  seen_entry_at: Option<DateTime<Utc>>,
}

enum Wake {
  Fetch(Option<FetchOutcome>),
  Store(bool),
}

impl<T> DataBinding<T>
where
  T: Serialize + DeserializeOwned + Send + 'static,
{
  /// Create a binding that fetches through the cached client.
  pub fn new(client: &CachedApiClient, config: BindingConfig<T>) -> Self {
    let fetch_client = client.clone();
    let base = config.read_request();
    let fetch: FetchFn = Arc::new(move |skip_cache: bool| -> FetchFuture {
      let client = fetch_client.clone();
      let request = base.clone().skip_cache(skip_cache);
      Box::pin(async move { client.read(request).await })
    });
    Self::with_fetcher(Arc::clone(client.store()), config, fetch)
  }

  /// Create a binding with a custom fetch function.
  ///
  /// Results whose `stored_at` is set are assumed to be in the store under
  /// this binding's key.
  pub fn with_fetcher(store: Arc<CacheStore>, config: BindingConfig<T>, fetch: FetchFn) -> Self {
    let key = config.read_request().key();
    let process: ProcessFn<T> = match config.process {
      Some(process) => process,
      None => Arc::new(decode::<T>),
    };

    Self {
      collection: config.collection,
      key,
      store,
      fetch,
      process,
      phase: BindingPhase::Idle,
      data: None,
      error: None,
      receiver: None,
      subscription: None,
      seen_invalidation: None,
      seen_entry_at: None,
    }
  }

  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  pub fn phase(&self) -> BindingPhase {
    self.phase
  }

  pub fn data(&self) -> Option<&T> {
    self.data.as_ref()
  }

  pub fn loading(&self) -> bool {
    self.phase == BindingPhase::Loading
  }

  pub fn error(&self) -> Option<&str> {
    self.error.as_deref()
  }

  /// Subscribe to the collection and start the first fetch.
  ///
  /// No-op unless the binding is idle.
  pub fn mount(&mut self) {
    if self.phase != BindingPhase::Idle {
      return;
    }
    self.subscribe();
    self.start_fetch(false);
  }

  /// Fetch again. With `skip_cache` the network is always hit.
  pub fn refresh_data(&mut self, skip_cache: bool) {
    match self.phase {
      BindingPhase::Unmounted => return,
      BindingPhase::Idle => self.subscribe(),
      _ => {}
    }
    self.start_fetch(skip_cache);
  }

  /// Replace the data locally and in the cache store, without a network call.
  pub fn update_data(&mut self, data: T) -> serde_json::Result<()> {
    let value = serde_json::to_value(&data)?;
    let at = self.store.set(&self.key, value);
    self.seen_entry_at = Some(at);

    if self.phase == BindingPhase::Unmounted {
      return Ok(());
    }
    self.data = Some(data);
    self.error = None;
    if self.phase != BindingPhase::Loading {
      self.phase = BindingPhase::Ready;
    }
    Ok(())
  }

  /// Release the subscription and ignore any fetch still in flight.
  pub fn unmount(&mut self) {
    self.phase = BindingPhase::Unmounted;
    self.receiver = None;
    self.subscription = None;
  }

  /// Apply finished fetches and store notifications.
  ///
  /// Returns `true` if the exposed state changed.
  /// Call this in your event loop tick handler.
  pub fn poll(&mut self) -> bool {
    if self.phase == BindingPhase::Unmounted {
      return false;
    }

    let mut changed = false;
    if let Some(receiver) = &mut self.receiver {
      match receiver.try_recv() {
        Ok(outcome) => {
          self.receiver = None;
          self.apply_outcome(outcome);
          changed = true;
        }
        Err(mpsc::error::TryRecvError::Empty) => {}
        Err(mpsc::error::TryRecvError::Disconnected) => {
          // Sender dropped without sending - treat as error
          self.receiver = None;
          self.fail("Request was cancelled".to_string());
          changed = true;
        }
      }
    }

    changed | self.poll_store(false)
  }

  /// Wait until the exposed state changes.
  ///
  /// Returns `false` once nothing can change any more (unmounted, or idle
  /// with no fetch in flight).
  pub async fn changed(&mut self) -> bool {
    loop {
      if self.poll() {
        return true;
      }

      let wake = match (&mut self.receiver, &mut self.subscription) {
        (Some(rx), Some(sub)) => tokio::select! {
          outcome = rx.recv() => Wake::Fetch(outcome),
          alive = sub.changed() => Wake::Store(alive),
        },
        (Some(rx), None) => Wake::Fetch(rx.recv().await),
        (None, Some(sub)) => Wake::Store(sub.changed().await),
        (None, None) => return false,
      };

      match wake {
        Wake::Fetch(Some(outcome)) => {
          self.receiver = None;
          self.apply_outcome(outcome);
          return true;
        }
        Wake::Fetch(None) => {
          self.receiver = None;
          self.fail("Request was cancelled".to_string());
          return true;
        }
        Wake::Store(true) => {
          if self.poll_store(true) {
            return true;
          }
        }
        Wake::Store(false) => self.subscription = None,
      }
    }
  }

  fn subscribe(&mut self) {
    let mut subscription = self.store.subscribe(&self.collection);
    self.seen_invalidation = subscription.acknowledge().last_invalidated;
    self.subscription = Some(subscription);
  }

  /// Internal: start the fetch operation, replacing any pending one
  fn start_fetch(&mut self, skip_cache: bool) {
    let (tx, rx) = mpsc::unbounded_channel();
    self.receiver = Some(rx);
    self.phase = BindingPhase::Loading;

    let future = (self.fetch)(skip_cache);
    tokio::spawn(async move {
      let result = future.await;
      // Ignore send errors - the binding may have been unmounted
      let _ = tx.send(result);
    });
  }

  fn apply_outcome(&mut self, outcome: FetchOutcome) {
    let result = match outcome {
      Ok(result) => result,
      Err(e) => {
        debug!(key = %self.key, error = %e, "fetch failed");
        self.fail(e.user_message());
        return;
      }
    };

    match (self.process)(result.data) {
      Ok(data) => {
        self.data = Some(data);
        self.error = None;
        self.phase = BindingPhase::Ready;
      }
      Err(message) => {
        self.fail(message);
        return;
      }
    }

    match result.stored_at {
      Some(at) => {
        self.seen_entry_at = Some(at);
        // A newer entry may have landed while this fetch was in flight
        self.adopt_newer_entry();
      }
      None => {
        let current = self.store.get(&self.key).map(|e| e.timestamp);
        self.seen_entry_at = current.or(self.seen_entry_at);
      }
    }
  }

  fn fail(&mut self, message: String) {
    self.error = Some(crate::api::truncate_message(&message));
    self.phase = BindingPhase::Errored;
  }

  /// React to a collection notification. `notified` means the subscription
  /// already reported the change.
  fn poll_store(&mut self, notified: bool) -> bool {
    let Some(subscription) = self.subscription.as_mut() else {
      return false;
    };
    if !notified && !subscription.has_changed() {
      return false;
    }

    let state = subscription.acknowledge();
    if state.last_invalidated != self.seen_invalidation {
      self.seen_invalidation = state.last_invalidated;
      debug!(key = %self.key, "collection invalidated, refetching");
      self.start_fetch(true);
      return true;
    }

    if self.phase == BindingPhase::Loading {
      return false;
    }
    self.adopt_newer_entry()
  }

  fn adopt_newer_entry(&mut self) -> bool {
    let Some(entry) = self.store.get(&self.key) else {
      return false;
    };
    if self.seen_entry_at.is_some_and(|seen| entry.timestamp <= seen) {
      return false;
    }
    self.seen_entry_at = Some(entry.timestamp);

    match (self.process)(entry.value) {
      Ok(data) => {
        self.data = Some(data);
        self.error = None;
        self.phase = BindingPhase::Ready;
        true
      }
      Err(message) => {
        warn!(key = %self.key, error = %message, "ignoring unreadable cache entry");
        false
      }
    }
  }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, String> {
  serde_json::from_value(value).map_err(|e| {
    debug!(error = %e, "payload did not match the expected shape");
    "Unexpected data format".to_string()
  })
}

impl<T: std::fmt::Debug> std::fmt::Debug for DataBinding<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("DataBinding")
      .field("key", &self.key)
      .field("phase", &self.phase)
      .field("data", &self.data)
      .field("error", &self.error)
      .finish_non_exhaustive()
  }
}
