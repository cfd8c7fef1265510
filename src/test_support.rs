//! Test doubles shared by unit tests.

use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use crate::api::{ApiRequest, ApiResponse, FetchError, Method, Transport, TransportFuture};
use crate::cache::{CacheStore, MemoryStorage, StaticScope};

/// Scripted reply for one request
#[derive(Clone)]
pub enum Reply {
  Json(Value),
  Fail(FetchError),
  /// Resolves once the gate is notified
  Gated(Arc<Notify>, Result<Value, FetchError>),
  /// Never resolves
  Pending,
}

/// Transport that answers from per-route reply queues.
///
/// Replies are consumed in order; the last one keeps being served.
#[derive(Default)]
pub struct MockTransport {
  routes: Mutex<HashMap<(Method, String), VecDeque<Reply>>>,
  calls: Mutex<Vec<ApiRequest>>,
}

impl MockTransport {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn reply(&self, method: Method, path: &str, reply: Reply) -> &Self {
    self
      .routes
      .lock()
      .unwrap()
      .entry((method, path.to_string()))
      .or_default()
      .push_back(reply);
    self
  }

  pub fn calls(&self, method: Method, path: &str) -> usize {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|r| r.method == method && r.path() == path)
      .count()
  }

  pub fn requests(&self) -> Vec<ApiRequest> {
    self.calls.lock().unwrap().clone()
  }
}

impl Transport for MockTransport {
  fn request(&self, request: ApiRequest) -> TransportFuture {
    let route = (request.method, request.path());
    self.calls.lock().unwrap().push(request);

    let reply = {
      let mut routes = self.routes.lock().unwrap();
      match routes.get_mut(&route) {
        Some(queue) if queue.len() > 1 => queue.pop_front(),
        Some(queue) => queue.front().cloned(),
        None => None,
      }
    };

    let ok = |data| ApiResponse { status: 200, data };
    match reply {
      Some(Reply::Json(data)) => Box::pin(async move { Ok(ok(data)) }),
      Some(Reply::Fail(err)) => Box::pin(async move { Err(err) }),
      Some(Reply::Gated(gate, result)) => Box::pin(async move {
        gate.notified().await;
        result.map(ok)
      }),
      Some(Reply::Pending) => Box::pin(futures::future::pending()),
      None => {
        let message = format!("no mock for {} {}", route.0, route.1);
        Box::pin(async move {
          Err(FetchError::Server {
            status: 404,
            message: Some(message),
          })
        })
      }
    }
  }
}

pub fn memory_store() -> Arc<CacheStore> {
  Arc::new(CacheStore::new(
    Arc::new(MemoryStorage::new()),
    Arc::new(StaticScope::new("tester")),
  ))
}

pub fn server_error(status: u16, message: &str) -> FetchError {
  FetchError::Server {
    status,
    message: Some(message.to_string()),
  }
}

/// Poll `check` until it returns true or a second passes.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
  for _ in 0..100 {
    if check() {
      return true;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  check()
}
