//! Transport-neutral request and response values.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::error::FetchError;

/// HTTP method of an outgoing request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
  #[default]
  Get,
  Post,
  Put,
  Delete,
  Head,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Delete => "DELETE",
      Method::Head => "HEAD",
    }
  }
}

/// An outgoing request. The full URL is the request identity used by caches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
  pub method: Method,
  pub url: String,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
}

impl FetchRequest {
  /// Create a GET request for the given URL.
  pub fn get(url: impl Into<String>) -> Self {
    Self {
      method: Method::Get,
      url: url.into(),
      headers: Vec::new(),
      body: None,
    }
  }

  /// Create a request with an explicit method.
  pub fn new(method: Method, url: impl Into<String>) -> Self {
    Self {
      method,
      ..Self::get(url)
    }
  }

  /// Add a header.
  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  /// Path component of the URL, used for rule classification.
  ///
  /// Relative URLs (no scheme) are treated as paths already.
  pub fn path(&self) -> String {
    match url::Url::parse(&self.url) {
      Ok(parsed) => parsed.path().to_string(),
      Err(_) => self
        .url
        .split(['?', '#'])
        .next()
        .unwrap_or_default()
        .to_string(),
    }
  }
}

/// A response received from the network or replayed from a cache bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchResponse {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl FetchResponse {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  /// Synthetic 503 returned when neither network nor cache can answer.
  pub fn unavailable() -> Self {
    Self {
      status: 503,
      headers: vec![("content-type".to_string(), "text/plain".to_string())],
      body: b"Service unavailable: offline and not cached".to_vec(),
    }
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  /// True for any 2xx status.
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Case-insensitive header lookup.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// Body as lossy UTF-8.
  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }

  /// Turn a non-2xx response into an error.
  pub fn error_for_status(self) -> Result<Self, FetchError> {
    if self.is_success() {
      Ok(self)
    } else {
      Err(FetchError::Status {
        status: self.status,
      })
    }
  }

  /// Decode the body as JSON.
  pub fn json<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
    serde_json::from_slice(&self.body).map_err(|e| FetchError::Decode(e.to_string()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_path_of_absolute_url() {
    let req = FetchRequest::get("https://example.com/assets/js/app.js?v=3");
    assert_eq!(req.path(), "/assets/js/app.js");
  }

  #[test]
  fn test_path_of_relative_url() {
    let req = FetchRequest::get("/css/core.css?x#frag");
    assert_eq!(req.path(), "/css/core.css");
  }

  #[test]
  fn test_error_for_status() {
    assert!(FetchResponse::new(204, "").error_for_status().is_ok());
    assert_eq!(
      FetchResponse::new(429, "").error_for_status(),
      Err(FetchError::Status { status: 429 })
    );
  }

  #[test]
  fn test_header_lookup_ignores_case() {
    let resp = FetchResponse::new(200, "").with_header("Content-Type", "text/css");
    assert_eq!(resp.header("content-type"), Some("text/css"));
    assert_eq!(resp.header("etag"), None);
  }
}
