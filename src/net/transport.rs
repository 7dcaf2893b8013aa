//! Transport seam and the reqwest-backed implementation.

use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::Client;
use tracing::debug;

use super::error::FetchError;
use super::types::{FetchRequest, FetchResponse, Method};

/// Something that can send a single request.
///
/// The returned future owns everything it needs so callers can wrap it in a
/// timeout or spawn it. Dropping the future aborts the in-flight call.
pub trait Transport: Send + Sync {
  fn send(&self, request: FetchRequest) -> BoxFuture<'static, Result<FetchResponse, FetchError>>;
}

/// HTTP transport over a shared reqwest client.
#[derive(Clone)]
pub struct HttpTransport {
  client: Client,
}

impl HttpTransport {
  /// Create a new transport with the given default user agent.
  pub fn new(user_agent: &str) -> Result<Self, FetchError> {
    let client = Client::builder()
      .user_agent(user_agent)
      .gzip(true)
      .deflate(true)
      .build()
      .map_err(|e| FetchError::Connection(format!("Failed to build HTTP client: {}", e)))?;

    Ok(Self { client })
  }
}

impl Transport for HttpTransport {
  fn send(&self, request: FetchRequest) -> BoxFuture<'static, Result<FetchResponse, FetchError>> {
    let client = self.client.clone();

    async move {
      let method = match request.method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Delete => reqwest::Method::DELETE,
        Method::Head => reqwest::Method::HEAD,
      };

      debug!("{} {}", request.method.as_str(), request.url);

      let mut builder = client.request(method, &request.url);
      for (name, value) in &request.headers {
        builder = builder.header(name, value);
      }
      if let Some(body) = request.body {
        builder = builder.body(body);
      }

      let response = builder.send().await?;
      let status = response.status().as_u16();
      let headers = response
        .headers()
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
        .collect();
      let body = response.bytes().await?.to_vec();

      Ok(FetchResponse {
        status,
        headers,
        body,
      })
    }
    .boxed()
  }
}
