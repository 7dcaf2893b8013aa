//! Error types for network operations

use thiserror::Error;

/// Errors that can occur while talking to an upstream service
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
  /// A single attempt exceeded its timeout
  #[error("Request timeout after {0}ms")]
  Timeout(u64),

  /// Network connection failed
  #[error("Connection failed: {0}")]
  Connection(String),

  /// Upstream answered with a non-success status
  #[error("HTTP error: {status}")]
  Status { status: u16 },

  /// Response body could not be decoded
  #[error("Failed to decode response: {0}")]
  Decode(String),

  /// Invalid URL
  #[error("Invalid URL: {0}")]
  InvalidUrl(String),
}

impl From<reqwest::Error> for FetchError {
  fn from(e: reqwest::Error) -> Self {
    if let Some(status) = e.status() {
      FetchError::Status {
        status: status.as_u16(),
      }
    } else if e.is_decode() {
      FetchError::Decode(e.to_string())
    } else {
      FetchError::Connection(e.to_string())
    }
  }
}

impl From<url::ParseError> for FetchError {
  fn from(e: url::ParseError) -> Self {
    FetchError::InvalidUrl(e.to_string())
  }
}
