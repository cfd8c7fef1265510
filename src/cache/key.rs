//! Cache keys for collection reads.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Query parameters attached to a read. Sorted so that parameter order
/// never produces a different key.
pub type QueryParams = BTreeMap<String, String>;

/// Kind of read performed against a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
  /// All records of a collection (optionally filtered by query params)
  List,
  /// A single record addressed by id
  Detail,
}

impl Operation {
  pub fn as_str(self) -> &'static str {
    match self {
      Operation::List => "list",
      Operation::Detail => "detail",
    }
  }
}

impl fmt::Display for Operation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Identifies one cached read: collection, operation, record id and the
/// canonical form of its query parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
  pub collection: String,
  pub operation: Operation,
  pub id: Option<String>,
  /// Canonical `k=v&k2=v2` serialization of the query parameters
  pub query: String,
}

impl CacheKey {
  pub fn list(collection: impl Into<String>) -> Self {
    Self {
      collection: collection.into(),
      operation: Operation::List,
      id: None,
      query: String::new(),
    }
  }

  pub fn detail(collection: impl Into<String>, id: impl Into<String>) -> Self {
    Self {
      collection: collection.into(),
      operation: Operation::Detail,
      id: Some(id.into()),
      query: String::new(),
    }
  }

  pub fn with_query(mut self, params: &QueryParams) -> Self {
    self.query = canonical_query(params);
    self
  }

  /// SHA256 of the canonical key text, used as the persistent key suffix.
  pub fn cache_hash(&self) -> String {
    let id = self.id.as_deref().unwrap_or("");
    let mut hasher = Sha256::new();
    // Length-prefixed so no component can absorb its neighbour
    for part in [self.collection.as_str(), self.operation.as_str(), id, self.query.as_str()] {
      hasher.update(format!("{}:{}|", part.len(), part).as_bytes());
    }
    hex::encode(hasher.finalize())
  }

  /// Human readable description for logs and CLI output.
  pub fn description(&self) -> String {
    let mut out = match (&self.operation, &self.id) {
      (Operation::Detail, Some(id)) => format!("{} {}", self.collection, id),
      _ => format!("{} list", self.collection),
    };
    if !self.query.is_empty() {
      out.push_str(" ?");
      out.push_str(&self.query);
    }
    out
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.description())
  }
}

/// Serialize query params as `application/x-www-form-urlencoded`, keys sorted.
pub fn canonical_query(params: &QueryParams) -> String {
  let mut serializer = url::form_urlencoded::Serializer::new(String::new());
  for (k, v) in params {
    serializer.append_pair(k, v);
  }
  serializer.finish()
}
