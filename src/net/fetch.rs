//! Timeout-bounded fetch with fixed-delay retry.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::error::FetchError;
use super::transport::Transport;
use super::types::{FetchRequest, FetchResponse};

/// Wraps a transport with per-attempt timeouts and a fixed retry budget.
///
/// Cheap to clone; clones share the transport.
#[derive(Clone)]
pub struct NetworkFetchHelper {
  transport: Arc<dyn Transport>,
  /// Total attempts per fetch, including the first
  max_attempts: u32,
  /// Fixed wait between attempts
  retry_delay: Duration,
  /// Per-attempt timeout used by `fetch`
  default_timeout: Duration,
}

impl NetworkFetchHelper {
  pub fn new(transport: Arc<dyn Transport>) -> Self {
    Self {
      transport,
      max_attempts: 3,
      retry_delay: Duration::from_millis(1000),
      default_timeout: Duration::from_secs(10),
    }
  }

  pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
    self.max_attempts = max_attempts.max(1);
    self
  }

  pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
    self.retry_delay = retry_delay;
    self
  }

  pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
    self.default_timeout = timeout;
    self
  }

  /// Fetch with the configured default timeout.
  pub async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError> {
    self.fetch_with_timeout(request, self.default_timeout).await
  }

  /// Fetch, aborting each attempt after `timeout`.
  ///
  /// Waits `retry_delay` between attempts (not after the last one) and returns
  /// the last observed error once every attempt has failed. A non-2xx
  /// response is returned as-is; only transport failures are retried.
  pub async fn fetch_with_timeout(
    &self,
    request: FetchRequest,
    timeout: Duration,
  ) -> Result<FetchResponse, FetchError> {
    let timeout_ms = timeout.as_millis() as u64;
    let mut last_error = FetchError::Connection("No attempts made".into());

    for attempt in 1..=self.max_attempts {
      let result = tokio::time::timeout(timeout, self.transport.send(request.clone())).await;

      match result {
        Ok(Ok(response)) => return Ok(response),
        Ok(Err(e)) => {
          warn!("Fetch {} failed (attempt {}): {}", request.url, attempt, e);
          last_error = e;
        }
        Err(_) => {
          warn!(
            "Fetch {} timed out after {}ms (attempt {})",
            request.url, timeout_ms, attempt
          );
          last_error = FetchError::Timeout(timeout_ms);
        }
      }

      if attempt < self.max_attempts {
        debug!("Retrying {} in {:?}", request.url, self.retry_delay);
        tokio::time::sleep(self.retry_delay).await;
      }
    }

    Err(last_error)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::net::mock::MockTransport;
  use std::time::Instant;

  fn helper(transport: &Arc<MockTransport>) -> NetworkFetchHelper {
    NetworkFetchHelper::new(transport.clone())
      .with_max_attempts(3)
      .with_retry_delay(Duration::from_millis(20))
  }

  #[tokio::test]
  async fn test_success_on_first_attempt() {
    let transport = Arc::new(MockTransport::new());
    transport.respond("https://x/a", FetchResponse::new(200, "ok"));

    let resp = helper(&transport)
      .fetch(FetchRequest::get("https://x/a"))
      .await
      .unwrap();

    assert_eq!(resp.text(), "ok");
    assert_eq!(transport.calls("https://x/a"), 1);
  }

  #[tokio::test]
  async fn test_retries_then_succeeds() {
    let transport = Arc::new(MockTransport::new());
    transport.fail_next("https://x/a", 2);
    transport.respond("https://x/a", FetchResponse::new(200, "late"));

    let resp = helper(&transport)
      .fetch(FetchRequest::get("https://x/a"))
      .await
      .unwrap();

    assert_eq!(resp.text(), "late");
    assert_eq!(transport.calls("https://x/a"), 3);
  }

  #[tokio::test]
  async fn test_returns_last_error_when_exhausted() {
    let transport = Arc::new(MockTransport::new());
    transport.set_offline(true);

    let started = Instant::now();
    let err = helper(&transport)
      .fetch(FetchRequest::get("https://x/a"))
      .await
      .unwrap_err();

    assert!(matches!(err, FetchError::Connection(_)));
    assert_eq!(transport.calls("https://x/a"), 3);
    // Two waits between three attempts
    assert!(started.elapsed() >= Duration::from_millis(40));
  }

  #[tokio::test]
  async fn test_timeout_aborts_attempt() {
    let transport = Arc::new(MockTransport::new());
    transport.respond("https://x/slow", FetchResponse::new(200, "slow"));
    transport.set_latency(Duration::from_millis(200));

    let err = helper(&transport)
      .with_max_attempts(2)
      .fetch_with_timeout(FetchRequest::get("https://x/slow"), Duration::from_millis(20))
      .await
      .unwrap_err();

    assert_eq!(err, FetchError::Timeout(20));
    assert_eq!(transport.calls("https://x/slow"), 2);
  }

  #[tokio::test]
  async fn test_non_success_status_is_not_retried() {
    let transport = Arc::new(MockTransport::new());
    transport.respond("https://x/missing", FetchResponse::new(404, "nope"));

    let resp = helper(&transport)
      .fetch(FetchRequest::get("https://x/missing"))
      .await
      .unwrap();

    assert_eq!(resp.status, 404);
    assert_eq!(transport.calls("https://x/missing"), 1);
  }
}
