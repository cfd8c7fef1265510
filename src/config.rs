use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::api::{CachedApiClient, HttpTransport};
use crate::cache::{
  CacheStore, NoopStorage, PersistentStorage, ScopeProvider, SqliteStorage, StaticScope,
  ANONYMOUS_SCOPE, DEFAULT_EVICTION_BATCH, DEFAULT_PREFIX,
};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base URL of the collection API, e.g. `https://console.example.com/api`
  pub url: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
  /// Identity used to namespace the cache. Derived from the token if unset.
  pub user: Option<String>,
}

fn default_timeout_secs() -> u64 {
  30
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Keep entries across runs. When false the cache lives in memory only.
  pub persist: bool,
  /// Database file (defaults to the platform data directory)
  pub path: Option<PathBuf>,
  pub quota_bytes: usize,
  /// Entries evicted per quota failure
  pub eviction_batch: usize,
  pub prefix: String,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      persist: true,
      path: None,
      quota_bytes: 5 * 1024 * 1024,
      eviction_batch: DEFAULT_EVICTION_BATCH,
      prefix: DEFAULT_PREFIX.to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Default filter when RUST_LOG is unset
  pub level: String,
  pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      dir: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./edgecache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/edgecache/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/edgecache/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("edgecache.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("edgecache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    if config.cache.quota_bytes == 0 {
      return Err(eyre!(
        "Invalid config file {}: cache.quota_bytes must be greater than zero",
        path.display()
      ));
    }

    Ok(config)
  }

  /// Get the API token from environment variables.
  ///
  /// Checks EDGECACHE_TOKEN first, then API_TOKEN as fallback.
  pub fn get_api_token() -> Result<String> {
    token_from(|name| std::env::var(name).ok()).ok_or_else(|| {
      eyre!("API token not found. Set EDGECACHE_TOKEN or API_TOKEN environment variable.")
    })
  }

  /// Scope the cache is namespaced by for this session.
  pub fn scope(&self, token: Option<&str>) -> StaticScope {
    match (&self.api.user, token) {
      (Some(user), _) => StaticScope::new(user.clone()),
      (None, Some(token)) => StaticScope::from_token(token),
      (None, None) => StaticScope::new(ANONYMOUS_SCOPE),
    }
  }

  /// Open the cache store described by the `cache` section.
  pub fn build_store(&self, scope: Arc<dyn ScopeProvider>) -> Result<Arc<CacheStore>> {
    let backend: Arc<dyn PersistentStorage> = if self.cache.persist {
      let path = match &self.cache.path {
        Some(path) => path.clone(),
        None => SqliteStorage::default_path()
          .ok_or_else(|| eyre!("Could not determine a data directory for the cache"))?,
      };
      let storage = SqliteStorage::open(&path, Some(self.cache.quota_bytes))
        .map_err(|e| eyre!("Failed to open cache at {}: {}", path.display(), e))?;
      Arc::new(storage)
    } else {
      Arc::new(NoopStorage)
    };

    let store = CacheStore::new(backend, scope)
      .with_prefix(self.cache.prefix.clone())
      .with_eviction_batch(self.cache.eviction_batch);
    Ok(Arc::new(store))
  }

  /// HTTP client plus store, ready to serve reads.
  pub fn build_client(&self, token: Option<String>) -> Result<CachedApiClient> {
    let scope = Arc::new(self.scope(token.as_deref()));
    let store = self.build_store(scope)?;
    let transport = HttpTransport::new(
      &self.api.url,
      token,
      Duration::from_secs(self.api.timeout_secs),
    )?;
    Ok(CachedApiClient::new(Arc::new(transport), store))
  }
}

fn token_from(lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
  ["EDGECACHE_TOKEN", "API_TOKEN"]
    .into_iter()
    .filter_map(lookup)
    .find(|token| !token.trim().is_empty())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheKey, ScopeProvider};
  use serde_json::json;
  use std::io::Write;
  use tempfile::{NamedTempFile, TempDir};

  fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
  }

  #[test]
  fn test_defaults_applied() {
    let file = write_config("api:\n  url: http://localhost:8080/api\n");
    let config = Config::load(Some(file.path())).unwrap();

    assert_eq!(config.api.url, "http://localhost:8080/api");
    assert_eq!(config.api.timeout_secs, 30);
    assert!(config.cache.persist);
    assert_eq!(config.cache.quota_bytes, 5 * 1024 * 1024);
    assert_eq!(config.cache.eviction_batch, 5);
    assert_eq!(config.cache.prefix, "edgecache");
    assert_eq!(config.logging.level, "info");
  }

  #[test]
  fn test_full_config() {
    let file = write_config(
      r#"
api:
  url: https://console.example.com/api
  timeout_secs: 5
  user: ops@example.com
cache:
  persist: false
  quota_bytes: 1024
  eviction_batch: 2
  prefix: console
logging:
  level: debug
  dir: /tmp/edgecache-logs
"#,
    );
    let config = Config::load(Some(file.path())).unwrap();

    assert_eq!(config.api.timeout_secs, 5);
    assert_eq!(config.api.user.as_deref(), Some("ops@example.com"));
    assert!(!config.cache.persist);
    assert_eq!(config.cache.eviction_batch, 2);
    assert_eq!(config.cache.prefix, "console");
    assert_eq!(config.logging.dir, Some(PathBuf::from("/tmp/edgecache-logs")));
  }

  #[test]
  fn test_missing_and_invalid_files() {
    let err = Config::load(Some(Path::new("/nonexistent/edgecache.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));

    let file = write_config("api: [not, a, map]\n");
    let err = Config::load(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("Failed to parse config file"));

    let file = write_config("api:\n  url: http://x\ncache:\n  quota_bytes: 0\n");
    assert!(Config::load(Some(file.path())).is_err());
  }

  #[test]
  fn test_token_lookup_order() {
    let token = token_from(|name| match name {
      "EDGECACHE_TOKEN" => Some("primary".into()),
      "API_TOKEN" => Some("fallback".into()),
      _ => None,
    });
    assert_eq!(token.as_deref(), Some("primary"));

    let token = token_from(|name| match name {
      "EDGECACHE_TOKEN" => Some("  ".into()),
      "API_TOKEN" => Some("fallback".into()),
      _ => None,
    });
    assert_eq!(token.as_deref(), Some("fallback"));

    assert_eq!(token_from(|_| None), None);
  }

  #[test]
  fn test_scope_prefers_configured_user() {
    let file = write_config("api:\n  url: http://x\n  user: alice\n");
    let config = Config::load(Some(file.path())).unwrap();
    assert_eq!(config.scope(Some("tok")).current_scope_id(), "alice");

    let file = write_config("api:\n  url: http://x\n");
    let config = Config::load(Some(file.path())).unwrap();
    assert_eq!(
      config.scope(Some("tok")).current_scope_id(),
      StaticScope::from_token("tok").current_scope_id()
    );
    assert_eq!(config.scope(None).current_scope_id(), ANONYMOUS_SCOPE);
  }

  #[test]
  fn test_build_store_persists_to_configured_path() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("nested").join("cache.db");
    let file = write_config(&format!(
      "api:\n  url: http://x\n  user: alice\ncache:\n  path: {}\n",
      db.display()
    ));
    let config = Config::load(Some(file.path())).unwrap();
    let key = CacheKey::list("edges");

    let store = config.build_store(Arc::new(config.scope(None))).unwrap();
    store.set(&key, json!(["e-1"]));
    drop(store);

    let reopened = config.build_store(Arc::new(config.scope(None))).unwrap();
    assert_eq!(reopened.get(&key).unwrap().value, json!(["e-1"]));
    assert!(db.exists());
  }

  #[test]
  fn test_build_client_without_persistence() {
    let file = write_config("api:\n  url: http://localhost:9/api\ncache:\n  persist: false\n");
    let config = Config::load(Some(file.path())).unwrap();

    let client = config.build_client(Some("tok".into())).unwrap();
    assert_eq!(client.store().stats().persisted_entries, 0);

    let file = write_config("api:\n  url: not a url\ncache:\n  persist: false\n");
    let config = Config::load(Some(file.path())).unwrap();
    assert!(config.build_client(None).is_err());
  }
}
