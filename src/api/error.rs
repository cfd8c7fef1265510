//! Errors surfaced by API calls.

use thiserror::Error;

/// Longest user-facing error message, in characters.
const MAX_MESSAGE_LEN: usize = 120;

/// Failure of a network call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
  /// No response was received (offline, DNS, timeout, refused)
  #[error("connection failed: {0}")]
  Transport(String),

  /// The server answered with a non-success status
  #[error("server returned {status}{}", describe(.message))]
  Server { status: u16, message: Option<String> },

  /// The response body could not be decoded
  #[error("unexpected response: {0}")]
  Decode(String),
}

fn describe(message: &Option<String>) -> String {
  message
    .as_deref()
    .map(|m| format!(": {}", m))
    .unwrap_or_default()
}

impl FetchError {
  pub fn is_transport(&self) -> bool {
    matches!(self, FetchError::Transport(_))
  }

  pub fn status(&self) -> Option<u16> {
    match self {
      FetchError::Server { status, .. } => Some(*status),
      _ => None,
    }
  }

  /// Short, human-readable description suitable for display.
  pub fn user_message(&self) -> String {
    let message = match self {
      FetchError::Transport(_) => "Connection failed".to_string(),
      FetchError::Server {
        status,
        message: Some(m),
      } if !m.trim().is_empty() => format!("{} ({})", m.trim(), status),
      FetchError::Server { status, .. } => format!("Request failed with status {}", status),
      FetchError::Decode(_) => "Unexpected response from server".to_string(),
    };
    truncate(&message, MAX_MESSAGE_LEN)
  }
}

/// Clamp any message to the user-facing length limit.
pub fn truncate_message(message: &str) -> String {
  truncate(message, MAX_MESSAGE_LEN)
}

/// Truncate on a character boundary, marking the cut with "...".
pub(crate) fn truncate(s: &str, max_len: usize) -> String {
  if s.chars().count() <= max_len {
    s.to_string()
  } else {
    let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
    format!("{}...", kept)
  }
}
