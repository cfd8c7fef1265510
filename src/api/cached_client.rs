//! Collection API client with transparent caching.

use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::{CacheKey, CacheResult, CacheStore, Operation, QueryParams};

use super::client::{ApiRequest, Method, Transport};
use super::error::FetchError;

/// Parameters of one read call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
  pub collection: String,
  pub operation: Operation,
  pub id: Option<String>,
  pub query: QueryParams,
  /// Bypass the cache and always hit the network
  pub skip_cache: bool,
}

impl ReadRequest {
  pub fn list(collection: impl Into<String>) -> Self {
    Self {
      collection: collection.into(),
      operation: Operation::List,
      id: None,
      query: QueryParams::new(),
      skip_cache: false,
    }
  }

  pub fn detail(collection: impl Into<String>, id: impl Into<String>) -> Self {
    Self {
      collection: collection.into(),
      operation: Operation::Detail,
      id: Some(id.into()),
      query: QueryParams::new(),
      skip_cache: false,
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

  pub fn skip_cache(mut self, skip: bool) -> Self {
    self.skip_cache = skip;
    self
  }

  pub fn key(&self) -> CacheKey {
    let key = match (&self.operation, &self.id) {
      (Operation::Detail, Some(id)) => CacheKey::detail(&self.collection, id),
      _ => CacheKey::list(&self.collection),
    };
    key.with_query(&self.query)
  }

  pub fn api_request(&self) -> ApiRequest {
    let mut segments = vec![self.collection.clone()];
    if let (Operation::Detail, Some(id)) = (&self.operation, &self.id) {
      segments.push(id.clone());
    }
    ApiRequest::new(Method::Get, segments).with_query(self.query.clone())
  }
}

/// API client with transparent caching.
///
/// Reads are served from the cache store when possible, with a background
/// refresh on every hit. Writes always go to the network and invalidate the
/// affected collection before returning.
#[derive(Clone)]
pub struct CachedApiClient {
  transport: Arc<dyn Transport>,
  store: Arc<CacheStore>,
}

impl CachedApiClient {
  pub fn new(transport: Arc<dyn Transport>, store: Arc<CacheStore>) -> Self {
    Self { transport, store }
  }

  pub fn store(&self) -> &Arc<CacheStore> {
    &self.store
  }

  /// Read with a cache-first strategy.
  ///
  /// 1. `skip_cache`: fetch, store, return; errors leave the cache untouched
  /// 2. Hit: return the cached value immediately and refresh in the background
  /// 3. Miss: fetch inline, store, return
  ///
  /// An entry older than its collection's last invalidation counts as a miss.
  pub async fn read(&self, request: ReadRequest) -> Result<CacheResult<Value>, FetchError> {
    let (result, _refresh) = self.read_tracked(request).await?;
    Ok(result)
  }

  /// Same as [`read`](Self::read), also returning the background refresh
  /// started on a cache hit. Short-lived callers await it before exiting so
  /// the refreshed value reaches storage.
  pub async fn read_tracked(
    &self,
    request: ReadRequest,
  ) -> Result<(CacheResult<Value>, Option<JoinHandle<()>>), FetchError> {
    let key = request.key();

    if !request.skip_cache {
      if let Some(entry) = self.store.get_current(&key) {
        debug!(key = %key, "cache hit");
        let refresh = self.spawn_refresh(key, request.api_request());
        return Ok((CacheResult::from_cache(entry.value, entry.timestamp), Some(refresh)));
      }
      debug!(key = %key, "cache miss");
    }

    let ticket = self.store.ticket();
    let response = self.transport.request(request.api_request()).await?;
    let stored_at = self.store.set_with(&ticket, &key, response.data.clone());
    Ok((CacheResult::from_network(response.data, stored_at), None))
  }

  /// Warm the cache for a read without waiting for it.
  pub fn prefetch(&self, request: ReadRequest) -> JoinHandle<()> {
    self.spawn_refresh(request.key(), request.api_request())
  }

  /// Create a record in `collection`.
  pub async fn create(&self, collection: &str, body: Value) -> Result<Value, FetchError> {
    let request = ApiRequest::new(Method::Post, vec![collection.to_string()]).with_body(body);
    self.write(collection, request).await
  }

  /// Patch the record `id` of `collection`.
  pub async fn update(&self, collection: &str, id: &str, body: Value) -> Result<Value, FetchError> {
    let request = ApiRequest::new(Method::Patch, vec![collection.to_string(), id.to_string()])
      .with_body(body);
    self.write(collection, request).await
  }

  /// Delete the record `id` of `collection`.
  pub async fn delete(&self, collection: &str, id: &str) -> Result<Value, FetchError> {
    let request = ApiRequest::new(Method::Delete, vec![collection.to_string(), id.to_string()]);
    self.write(collection, request).await
  }

  async fn write(&self, collection: &str, request: ApiRequest) -> Result<Value, FetchError> {
    let method = request.method;
    let response = self.transport.request(request).await?;
    // Must happen before returning so readers see the invalidation
    self.store.invalidate_collection(collection);
    debug!(collection, %method, "write completed");
    Ok(response.data)
  }

  /// Start a detached fetch whose result only ever reaches the store.
  fn spawn_refresh(&self, key: CacheKey, request: ApiRequest) -> JoinHandle<()> {
    let store = Arc::clone(&self.store);
    let ticket = store.ticket();
    let pending = self.transport.request(request);

    tokio::spawn(async move {
      match pending.await {
        Ok(response) => {
          if store.set_with(&ticket, &key, response.data).is_some() {
            debug!(key = %key, "background refresh stored");
          }
        }
        Err(e) => {
          warn!(key = %key, error = %e, "background refresh failed");
        }
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{MemoryStorage, StaticScope};
  use crate::test_support::{eventually, memory_store, server_error, MockTransport, Reply};
  use futures::FutureExt;
  use serde_json::json;
  use std::time::Duration;
  use tokio::sync::Notify;

  fn setup() -> (Arc<MockTransport>, CachedApiClient) {
    let transport = MockTransport::new();
    let client = CachedApiClient::new(transport.clone(), memory_store());
    (transport, client)
  }

  #[tokio::test]
  async fn test_cache_hit_returns_without_awaiting_network() {
    let (transport, client) = setup();
    transport.reply(Method::Get, "/edges", Reply::Pending);
    client.store().set(&CacheKey::list("edges"), json!(["cached"]));

    let result = client
      .read(ReadRequest::list("edges"))
      .now_or_never()
      .expect("cache hit must not wait on the network")
      .unwrap();

    assert_eq!(result.data, json!(["cached"]));
    assert_eq!(result.source, crate::cache::CacheSource::Cache);
    // The background refresh was started
    assert_eq!(transport.calls(Method::Get, "/edges"), 1);
  }

  /// One short-lived client per command run, all sharing the same storage.
  fn client_over(transport: &Arc<MockTransport>, backend: &Arc<MemoryStorage>) -> CachedApiClient {
    let store = CacheStore::new(backend.clone(), Arc::new(StaticScope::new("tester")));
    CachedApiClient::new(transport.clone(), Arc::new(store))
  }

  #[tokio::test]
  async fn test_write_invalidates_reads_of_later_runs() {
    let transport = MockTransport::new();
    let backend = Arc::new(MemoryStorage::new());
    transport
      .reply(Method::Get, "/edges", Reply::Json(json!(["e-1"])))
      .reply(Method::Get, "/edges", Reply::Json(json!(["e-1", "e-2"])))
      .reply(Method::Post, "/edges", Reply::Json(json!({"id": "e-2"})));

    let first = client_over(&transport, &backend).read(ReadRequest::list("edges")).await.unwrap();
    assert_eq!(first.data, json!(["e-1"]));

    client_over(&transport, &backend)
      .create("edges", json!({"name": "e-2"}))
      .await
      .unwrap();

    let after = client_over(&transport, &backend).read(ReadRequest::list("edges")).await.unwrap();
    assert_eq!(after.source, crate::cache::CacheSource::Network);
    assert_eq!(after.data, json!(["e-1", "e-2"]));
  }

  #[tokio::test]
  async fn test_tracked_refresh_reaches_storage_before_exit() {
    let transport = MockTransport::new();
    let backend = Arc::new(MemoryStorage::new());
    let gate = Arc::new(Notify::new());
    transport.reply(Method::Get, "/locations", Reply::Gated(gate.clone(), Ok(json!(["l-2"]))));
    let key = CacheKey::list("locations");
    client_over(&transport, &backend).store().set(&key, json!(["l-1"]));

    let client = client_over(&transport, &backend);
    let (result, refresh) = client.read_tracked(ReadRequest::list("locations")).await.unwrap();
    assert_eq!(result.data, json!(["l-1"]));

    gate.notify_one();
    refresh.expect("a cache hit starts a refresh").await.unwrap();
    drop(client);

    let next = client_over(&transport, &backend);
    assert_eq!(next.store().get_current(&key).unwrap().value, json!(["l-2"]));
  }

  #[tokio::test]
  async fn test_cache_miss_fetches_and_stores() {
    let (transport, client) = setup();
    transport.reply(Method::Get, "/edges/e-1", Reply::Json(json!({"id": "e-1"})));

    let result = client.read(ReadRequest::detail("edges", "e-1")).await.unwrap();

    assert_eq!(result.source, crate::cache::CacheSource::Network);
    assert_eq!(result.data, json!({"id": "e-1"}));
    let entry = client.store().get(&CacheKey::detail("edges", "e-1")).unwrap();
    assert_eq!(entry.value, json!({"id": "e-1"}));
    assert_eq!(result.stored_at, Some(entry.timestamp));
  }

  #[tokio::test]
  async fn test_query_params_are_sent_and_keyed() {
    let (transport, client) = setup();
    transport.reply(Method::Get, "/things", Reply::Json(json!([])));

    let request = ReadRequest::list("things").with_query("location", "l-1");
    client.read(request.clone()).await.unwrap();

    assert_eq!(transport.requests()[0].query.get("location").map(String::as_str), Some("l-1"));
    assert!(client.store().get(&request.key()).is_some());
    assert!(client.store().get(&CacheKey::list("things")).is_none());
  }

  #[tokio::test]
  async fn test_background_refresh_updates_store_and_notifies() {
    let (transport, client) = setup();
    let key = CacheKey::list("edges");
    transport.reply(Method::Get, "/edges", Reply::Json(json!(["fresh"])));
    client.store().set(&key, json!(["stale"]));
    let mut sub = client.store().subscribe("edges");

    let result = client.read(ReadRequest::list("edges")).await.unwrap();
    assert_eq!(result.data, json!(["stale"]));

    let notified = tokio::time::timeout(Duration::from_secs(1), sub.changed()).await;
    assert_eq!(notified, Ok(true));
    assert_eq!(client.store().get(&key).unwrap().value, json!(["fresh"]));
  }

  #[tokio::test]
  async fn test_background_refresh_failure_is_not_surfaced() {
    let (transport, client) = setup();
    let key = CacheKey::list("edges");
    transport.reply(Method::Get, "/edges", Reply::Fail(server_error(500, "boom")));
    client.store().set(&key, json!(["cached"]));

    let handle = client.prefetch(ReadRequest::list("edges"));
    let result = client.read(ReadRequest::list("edges")).await.unwrap();
    handle.await.unwrap();

    assert_eq!(result.data, json!(["cached"]));
    assert_eq!(client.store().get(&key).unwrap().value, json!(["cached"]));
  }

  #[tokio::test]
  async fn test_skip_cache_returns_fresh_and_updates_cache() {
    let (transport, client) = setup();
    let key = CacheKey::list("edges");
    transport.reply(Method::Get, "/edges", Reply::Json(json!(["v2"])));
    client.store().set(&key, json!(["v1"]));

    let result = client
      .read(ReadRequest::list("edges").skip_cache(true))
      .await
      .unwrap();
    assert_eq!(result.data, json!(["v2"]));
    assert_eq!(result.source, crate::cache::CacheSource::Network);

    let cached = client
      .read(ReadRequest::list("edges"))
      .now_or_never()
      .unwrap()
      .unwrap();
    assert_eq!(cached.data, json!(["v2"]));
    assert_eq!(cached.source, crate::cache::CacheSource::Cache);
  }

  #[tokio::test]
  async fn test_skip_cache_failure_leaves_cache_untouched() {
    let (transport, client) = setup();
    let key = CacheKey::list("edges");
    transport.reply(Method::Get, "/edges", Reply::Fail(FetchError::Transport("offline".into())));
    let at = client.store().set(&key, json!(["v1"]));

    let err = client
      .read(ReadRequest::list("edges").skip_cache(true))
      .await
      .unwrap_err();

    assert!(err.is_transport());
    let entry = client.store().get(&key).unwrap();
    assert_eq!(entry.value, json!(["v1"]));
    assert_eq!(entry.timestamp, at);
  }

  #[tokio::test]
  async fn test_miss_error_propagates() {
    let (transport, client) = setup();
    transport.reply(Method::Get, "/locations", Reply::Fail(server_error(403, "Forbidden")));

    let err = client.read(ReadRequest::list("locations")).await.unwrap_err();
    assert_eq!(err.status(), Some(403));
    assert!(client.store().get(&CacheKey::list("locations")).is_none());
  }

  #[tokio::test]
  async fn test_invalidated_entry_is_fetched_inline() {
    let (transport, client) = setup();
    transport.reply(Method::Get, "/edges", Reply::Json(json!(["after"])));
    client.store().set(&CacheKey::list("edges"), json!(["before"]));
    client.store().invalidate_collection("edges");

    let result = client.read(ReadRequest::list("edges")).await.unwrap();
    assert_eq!(result.source, crate::cache::CacheSource::Network);
    assert_eq!(result.data, json!(["after"]));
  }

  #[tokio::test]
  async fn test_writes_invalidate_before_returning() {
    let (transport, client) = setup();
    transport
      .reply(Method::Post, "/edges", Reply::Json(json!({"id": "e-9"})))
      .reply(Method::Patch, "/edges/e-9", Reply::Json(json!({"id": "e-9", "name": "x"})))
      .reply(Method::Delete, "/edges/e-9", Reply::Json(Value::Null));
    let store = client.store().clone();

    let before = store.collection_state("edges").last_invalidated;
    let created = client.create("edges", json!({"name": "gw"})).await.unwrap();
    let after_create = store.collection_state("edges").last_invalidated;
    assert_eq!(created["id"], "e-9");
    assert!(after_create > before);

    client.update("edges", "e-9", json!({"name": "x"})).await.unwrap();
    let after_update = store.collection_state("edges").last_invalidated;
    assert!(after_update > after_create);

    client.delete("edges", "e-9").await.unwrap();
    let after_delete = store.collection_state("edges").last_invalidated;
    assert!(after_delete > after_update);

    let requests = transport.requests();
    assert_eq!(requests[0].body, Some(json!({"name": "gw"})));
    assert_eq!(requests[1].method, Method::Patch);
    assert_eq!(requests[2].method, Method::Delete);
  }

  #[tokio::test]
  async fn test_failed_write_does_not_invalidate() {
    let (transport, client) = setup();
    transport.reply(Method::Post, "/edges", Reply::Fail(server_error(422, "name is required")));

    let err = client.create("edges", json!({})).await.unwrap_err();

    assert_eq!(err.user_message(), "name is required (422)");
    assert_eq!(client.store().collection_state("edges").last_invalidated, None);
  }

  #[tokio::test]
  async fn test_late_refresh_after_teardown_is_dropped() {
    let (transport, client) = setup();
    let key = CacheKey::list("edges");
    let gate = Arc::new(Notify::new());
    transport.reply(Method::Get, "/edges", Reply::Gated(gate.clone(), Ok(json!(["late"]))));
    client.store().set(&key, json!(["cached"]));

    let handle = client.prefetch(ReadRequest::list("edges"));
    client.store().teardown();
    gate.notify_one();
    handle.await.unwrap();

    assert!(client.store().get(&key).is_none());
  }

  #[tokio::test]
  async fn test_last_write_wins_between_refresh_and_skip_cache() {
    let (transport, client) = setup();
    let key = CacheKey::list("edges");
    let gate = Arc::new(Notify::new());
    transport
      .reply(Method::Get, "/edges", Reply::Gated(gate.clone(), Ok(json!(["slow"]))))
      .reply(Method::Get, "/edges", Reply::Json(json!(["fast"])));
    client.store().set(&key, json!(["cached"]));

    // Hit: starts the slow background refresh
    client.read(ReadRequest::list("edges")).await.unwrap();
    let fresh = client
      .read(ReadRequest::list("edges").skip_cache(true))
      .await
      .unwrap();
    assert_eq!(fresh.data, json!(["fast"]));

    gate.notify_one();
    let store = client.store().clone();
    assert!(eventually(|| store.get(&key).map(|e| e.value) == Some(json!(["slow"]))).await);
  }
}
