//! Geocoding API client (Nominatim-compatible).

use tracing::debug;
use url::Url;

use super::types::{ApiPlace, Coordinates, Place};
use crate::net::{FetchError, FetchRequest, NetworkFetchHelper};

/// Geocoding client. The upstream requires a descriptive client identifier
/// on every call and asks for at least ~1.2s between calls; the spacing is
/// enforced by the scheduler sitting in front of this client.
#[derive(Clone)]
pub struct GeocodingClient {
  helper: NetworkFetchHelper,
  base_url: String,
  user_agent: String,
}

impl GeocodingClient {
  pub fn new(helper: NetworkFetchHelper, base_url: &str, user_agent: &str) -> Self {
    Self {
      helper,
      base_url: base_url.trim_end_matches('/').to_string(),
      user_agent: user_agent.to_string(),
    }
  }

  /// URL for a forward search.
  pub fn search_url(&self, query: &str, limit: usize) -> Result<String, FetchError> {
    let url = Url::parse_with_params(
      &format!("{}/search", self.base_url),
      &[
        ("q", query),
        ("format", "jsonv2"),
        ("addressdetails", "1"),
        ("limit", limit.to_string().as_str()),
      ],
    )?;
    Ok(url.into())
  }

  /// URL for a reverse lookup.
  pub fn reverse_url(&self, coordinates: Coordinates) -> Result<String, FetchError> {
    let url = Url::parse_with_params(
      &format!("{}/reverse", self.base_url),
      &[
        ("lat", coordinates.latitude.to_string().as_str()),
        ("lon", coordinates.longitude.to_string().as_str()),
        ("format", "jsonv2"),
        ("addressdetails", "1"),
      ],
    )?;
    Ok(url.into())
  }

  /// Search places by free-text query.
  pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<Place>, FetchError> {
    let request = self.request(self.search_url(query, limit)?);
    let response = self.helper.fetch(request).await?.error_for_status()?;
    let places: Vec<ApiPlace> = response.json()?;

    let places: Vec<Place> = places.into_iter().filter_map(ApiPlace::into_place).collect();
    debug!("Geocoding '{}' returned {} places", query, places.len());
    Ok(places)
  }

  /// Resolve coordinates to the nearest named place.
  pub async fn reverse(&self, coordinates: Coordinates) -> Result<Place, FetchError> {
    let request = self.request(self.reverse_url(coordinates)?);
    let response = self.helper.fetch(request).await?.error_for_status()?;
    let place: ApiPlace = response.json()?;

    place
      .into_place()
      .ok_or_else(|| FetchError::Decode(format!("No usable place at {}", coordinates)))
  }

  fn request(&self, url: String) -> FetchRequest {
    FetchRequest::get(url)
      .with_header("User-Agent", self.user_agent.as_str())
      .with_header("Accept", "application/json")
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::net::mock::MockTransport;
  use crate::net::FetchResponse;
  use std::sync::Arc;
  use std::time::Duration;

  fn client(transport: &Arc<MockTransport>) -> GeocodingClient {
    let helper = NetworkFetchHelper::new(transport.clone())
      .with_max_attempts(1)
      .with_retry_delay(Duration::ZERO);
    GeocodingClient::new(helper, "https://geo.test/", "nimbus-test/1.0")
  }

  #[tokio::test]
  async fn test_search_parses_places() {
    let transport = Arc::new(MockTransport::new());
    let client = client(&transport);
    let url = client.search_url("Paris", 5).unwrap();
    transport.respond(
      &url,
      FetchResponse::new(
        200,
        r#"[{"lat":"48.85","lon":"2.35","display_name":"Paris, France","name":"Paris"}]"#,
      ),
    );

    let places = client.search("Paris", 5).await.unwrap();
    assert_eq!(places.len(), 1);
    assert_eq!(places[0].name, "Paris");
    assert!(url.starts_with("https://geo.test/search?q=Paris"));
  }

  #[tokio::test]
  async fn test_rate_limited_status_is_an_error() {
    let transport = Arc::new(MockTransport::new());
    let client = client(&transport);
    let url = client.reverse_url(Coordinates::new(1.0, 2.0)).unwrap();
    transport.respond(&url, FetchResponse::new(429, "slow down"));

    let err = client.reverse(Coordinates::new(1.0, 2.0)).await.unwrap_err();
    assert_eq!(err, FetchError::Status { status: 429 });
  }
}
