//! Scriptable in-memory transport for tests.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use super::error::FetchError;
use super::transport::Transport;
use super::types::{FetchRequest, FetchResponse};

#[derive(Default)]
struct MockState {
  responses: HashMap<String, FetchResponse>,
  /// Remaining forced failures per URL
  failures: HashMap<String, u32>,
  calls: HashMap<String, u32>,
  offline: bool,
  latency: Duration,
}

/// Transport that serves canned responses and records every call.
#[derive(Default)]
pub struct MockTransport {
  state: Mutex<MockState>,
}

impl MockTransport {
  pub fn new() -> Self {
    Self::default()
  }

  /// Serve `response` for every later call to `url`.
  pub fn respond(&self, url: &str, response: FetchResponse) {
    let mut state = self.state.lock().unwrap();
    state.responses.insert(url.to_string(), response);
  }

  /// Fail the next `n` calls to `url` with a connection error.
  pub fn fail_next(&self, url: &str, n: u32) {
    let mut state = self.state.lock().unwrap();
    state.failures.insert(url.to_string(), n);
  }

  /// Fail every call while set.
  pub fn set_offline(&self, offline: bool) {
    self.state.lock().unwrap().offline = offline;
  }

  /// Delay every response by `latency`.
  pub fn set_latency(&self, latency: Duration) {
    self.state.lock().unwrap().latency = latency;
  }

  /// Number of calls made to `url`.
  pub fn calls(&self, url: &str) -> u32 {
    let state = self.state.lock().unwrap();
    state.calls.get(url).copied().unwrap_or(0)
  }

  /// Number of calls made to any URL.
  pub fn total_calls(&self) -> u32 {
    self.state.lock().unwrap().calls.values().sum()
  }
}

impl Transport for MockTransport {
  fn send(&self, request: FetchRequest) -> BoxFuture<'static, Result<FetchResponse, FetchError>> {
    let (result, latency) = {
      let mut state = self.state.lock().unwrap();
      *state.calls.entry(request.url.clone()).or_default() += 1;

      let forced_failure = match state.failures.get_mut(&request.url) {
        Some(remaining) if *remaining > 0 => {
          *remaining -= 1;
          true
        }
        _ => false,
      };

      let result = if state.offline || forced_failure {
        Err(FetchError::Connection("mock network down".into()))
      } else if let Some(response) = state.responses.get(&request.url) {
        Ok(response.clone())
      } else {
        Ok(FetchResponse::new(404, "not found"))
      };

      (result, state.latency)
    };

    async move {
      if !latency.is_zero() {
        tokio::time::sleep(latency).await;
      }
      result
    }
    .boxed()
  }
}
