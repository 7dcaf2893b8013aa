//! Domain types returned by the upstream weather APIs.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A latitude/longitude pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
  pub latitude: f64,
  pub longitude: f64,
}

impl Coordinates {
  pub fn new(latitude: f64, longitude: f64) -> Self {
    Self {
      latitude,
      longitude,
    }
  }

  /// Whether both components are inside their valid ranges.
  pub fn is_valid(&self) -> bool {
    (-90.0..=90.0).contains(&self.latitude) && (-180.0..=180.0).contains(&self.longitude)
  }
}

impl fmt::Display for Coordinates {
  /// Four decimals is roughly 11m, plenty for a forecast grid cell.
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:.4},{:.4}", self.latitude, self.longitude)
  }
}

/// A geocoded place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Place {
  pub name: String,
  pub display_name: String,
  pub coordinates: Coordinates,
  pub country: Option<String>,
}

/// Forecast payload. Interpretation of the blocks is left to the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
  pub latitude: f64,
  pub longitude: f64,
  #[serde(default)]
  pub timezone: Option<String>,
  #[serde(default)]
  pub current: Value,
  #[serde(default)]
  pub hourly: Value,
  #[serde(default)]
  pub daily: Value,
}

// ============================================================================
// Geocoding API wire types
// ============================================================================

#[derive(Debug, Deserialize)]
pub(crate) struct ApiAddress {
  city: Option<String>,
  town: Option<String>,
  village: Option<String>,
  country: Option<String>,
}

/// Nominatim search/reverse result. Coordinates arrive as strings.
#[derive(Debug, Deserialize)]
pub(crate) struct ApiPlace {
  lat: String,
  lon: String,
  display_name: String,
  name: Option<String>,
  address: Option<ApiAddress>,
}

impl ApiPlace {
  pub(crate) fn into_place(self) -> Option<Place> {
    let latitude = self.lat.parse().ok()?;
    let longitude = self.lon.parse().ok()?;

    let locality = self.address.as_ref().and_then(|a| {
      a.city
        .clone()
        .or_else(|| a.town.clone())
        .or_else(|| a.village.clone())
    });
    let name = self
      .name
      .filter(|n| !n.is_empty())
      .or(locality)
      .unwrap_or_else(|| {
        self
          .display_name
          .split(',')
          .next()
          .unwrap_or_default()
          .trim()
          .to_string()
      });

    Some(Place {
      name,
      country: self.address.and_then(|a| a.country),
      display_name: self.display_name,
      coordinates: Coordinates::new(latitude, longitude),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_api_place_conversion() {
    let api: ApiPlace = serde_json::from_str(
      r#"{"lat":"48.8566","lon":"2.3522","display_name":"Paris, Ile-de-France, France",
          "name":"","address":{"city":"Paris","country":"France"}}"#,
    )
    .unwrap();

    let place = api.into_place().unwrap();
    assert_eq!(place.name, "Paris");
    assert_eq!(place.country.as_deref(), Some("France"));
    assert_eq!(place.coordinates, Coordinates::new(48.8566, 2.3522));
  }

  #[test]
  fn test_api_place_with_bad_coordinates_is_skipped() {
    let api: ApiPlace =
      serde_json::from_str(r#"{"lat":"north","lon":"2.0","display_name":"Nowhere"}"#).unwrap();
    assert!(api.into_place().is_none());
  }

  #[test]
  fn test_coordinates_display_and_validity() {
    let c = Coordinates::new(51.50735, -0.12776);
    assert_eq!(c.to_string(), "51.5074,-0.1278");
    assert!(c.is_valid());
    assert!(!Coordinates::new(91.0, 0.0).is_valid());
  }
}
