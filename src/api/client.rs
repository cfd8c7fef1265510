use crate::api::error::FetchError;
use crate::cache::QueryParams;
use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use url::Url;

/// HTTP methods used against the collection API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
  Get,
  Post,
  Patch,
  Delete,
}

impl From<Method> for reqwest::Method {
  fn from(method: Method) -> Self {
    match method {
      Method::Get => reqwest::Method::GET,
      Method::Post => reqwest::Method::POST,
      Method::Patch => reqwest::Method::PATCH,
      Method::Delete => reqwest::Method::DELETE,
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Method::Get => "GET",
      Method::Post => "POST",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
    };
    f.write_str(name)
  }
}

/// A request relative to the API base URL
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
  pub method: Method,
  /// Path segments, e.g. `["edges", "e-1"]`
  pub segments: Vec<String>,
  pub query: QueryParams,
  pub body: Option<Value>,
}

impl ApiRequest {
  pub fn new(method: Method, segments: Vec<String>) -> Self {
    Self {
      method,
      segments,
      query: QueryParams::new(),
      body: None,
    }
  }

  pub fn with_query(mut self, query: QueryParams) -> Self {
    self.query = query;
    self
  }

  pub fn with_body(mut self, body: Value) -> Self {
    self.body = Some(body);
    self
  }

  /// Unescaped path, for logs and request matching
  pub fn path(&self) -> String {
    format!("/{}", self.segments.join("/"))
  }
}

/// A decoded response
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
  pub status: u16,
  pub data: Value,
}

pub type TransportFuture = BoxFuture<'static, Result<ApiResponse, FetchError>>;

/// Network collaborator used by the cached client.
///
/// Resolves with the decoded body on a 2xx response and fails with
/// `FetchError::Transport` when no response arrives or
/// `FetchError::Server` for any other status.
pub trait Transport: Send + Sync {
  fn request(&self, request: ApiRequest) -> TransportFuture;
}

/// Collection API client over HTTP
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  base_url: Url,
  token: Option<String>,
}

impl HttpTransport {
  pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
    let mut base_url =
      Url::parse(base_url).map_err(|e| eyre!("Invalid API url '{}': {}", base_url, e))?;
    if base_url.cannot_be_a_base() {
      return Err(eyre!("API url '{}' cannot be used as a base", base_url));
    }
    base_url.set_query(None);

    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url,
      token,
    })
  }

  /// Build the full URL for a request
  pub fn url_for(&self, request: &ApiRequest) -> Result<Url, FetchError> {
    let mut url = self.base_url.clone();
    {
      let mut segments = url
        .path_segments_mut()
        .map_err(|_| FetchError::Transport(format!("invalid base url {}", self.base_url)))?;
      segments.pop_if_empty();
      for segment in &request.segments {
        segments.push(segment);
      }
    }

    if !request.query.is_empty() {
      let mut pairs = url.query_pairs_mut();
      for (k, v) in &request.query {
        pairs.append_pair(k, v);
      }
    }

    Ok(url)
  }
}

impl Transport for HttpTransport {
  fn request(&self, request: ApiRequest) -> TransportFuture {
    let client = self.client.clone();
    let token = self.token.clone();
    let url = self.url_for(&request);

    Box::pin(async move { send(client, token, url?, request).await })
  }
}

async fn send(
  client: reqwest::Client,
  token: Option<String>,
  url: Url,
  request: ApiRequest,
) -> Result<ApiResponse, FetchError> {
  let mut builder = client
    .request(request.method.into(), url)
    .header(reqwest::header::ACCEPT, "application/json");
  if let Some(token) = &token {
    builder = builder.bearer_auth(token);
  }
  if let Some(body) = &request.body {
    builder = builder.json(body);
  }

  let response = builder
    .send()
    .await
    .map_err(|e| FetchError::Transport(e.to_string()))?;
  let status = response.status();
  let bytes = response
    .bytes()
    .await
    .map_err(|e| FetchError::Transport(e.to_string()))?;

  if !status.is_success() {
    return Err(FetchError::Server {
      status: status.as_u16(),
      message: extract_message(&bytes),
    });
  }

  let data = if bytes.iter().all(u8::is_ascii_whitespace) {
    Value::Null
  } else {
    serde_json::from_slice(&bytes).map_err(|e| FetchError::Decode(e.to_string()))?
  };

  Ok(ApiResponse {
    status: status.as_u16(),
    data,
  })
}

/// Pull a human readable message out of an error body.
///
/// Looks at `message`, `error` (string or `{message}`) and `detail`, and
/// falls back to a short plain-text body.
fn extract_message(body: &[u8]) -> Option<String> {
  if let Ok(json) = serde_json::from_slice::<Value>(body) {
    for field in ["message", "error", "detail"] {
      match json.get(field) {
        Some(Value::String(s)) if !s.trim().is_empty() => return Some(s.trim().to_string()),
        Some(Value::Object(inner)) => {
          if let Some(Value::String(s)) = inner.get("message") {
            return Some(s.trim().to_string());
          }
        }
        _ => {}
      }
    }
    return None;
  }

  let text = String::from_utf8_lossy(body);
  let text = text.trim();
  if text.is_empty() || text.starts_with('<') {
    None
  } else {
    Some(crate::api::error::truncate(text, 200))
  }
}
