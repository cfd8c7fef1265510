//! Authenticated-user scope used to partition cache entries.

use sha2::{Digest, Sha256};
use std::sync::RwLock;

/// Scope id used when nobody is signed in.
pub const ANONYMOUS_SCOPE: &str = "anonymous";

/// Supplies the identity under which cache entries are namespaced.
pub trait ScopeProvider: Send + Sync {
  fn current_scope_id(&self) -> String;
}

/// A scope that never changes (one user per process).
#[derive(Debug, Clone)]
pub struct StaticScope(String);

impl StaticScope {
  pub fn new(id: impl Into<String>) -> Self {
    Self(id.into())
  }

  /// Derive a scope from an API token without keeping the token itself.
  pub fn from_token(token: &str) -> Self {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    let digest = hex::encode(hasher.finalize());
    Self(format!("token-{}", &digest[..16]))
  }
}

impl ScopeProvider for StaticScope {
  fn current_scope_id(&self) -> String {
    self.0.clone()
  }
}

/// A scope that follows login and logout.
#[derive(Debug, Default)]
pub struct SessionScope {
  user: RwLock<Option<String>>,
}

impl SessionScope {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn login(&self, user_id: impl Into<String>) {
    if let Ok(mut user) = self.user.write() {
      *user = Some(user_id.into());
    }
  }

  pub fn logout(&self) {
    if let Ok(mut user) = self.user.write() {
      *user = None;
    }
  }
}

impl ScopeProvider for SessionScope {
  fn current_scope_id(&self) -> String {
    self
      .user
      .read()
      .ok()
      .and_then(|u| u.clone())
      .unwrap_or_else(|| ANONYMOUS_SCOPE.to_string())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_token_scope_is_stable_and_opaque() {
    let a = StaticScope::from_token("secret-token").current_scope_id();
    let b = StaticScope::from_token("secret-token").current_scope_id();
    let c = StaticScope::from_token("other-token").current_scope_id();
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert!(!a.contains("secret"));
  }

  #[test]
  fn test_session_scope_login_logout() {
    let scope = SessionScope::new();
    assert_eq!(scope.current_scope_id(), ANONYMOUS_SCOPE);
    scope.login("alice");
    assert_eq!(scope.current_scope_id(), "alice");
    scope.logout();
    assert_eq!(scope.current_scope_id(), ANONYMOUS_SCOPE);
  }
}
