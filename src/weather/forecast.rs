//! Forecast API client (Open-Meteo-compatible).

use url::Url;

use super::types::{Coordinates, Forecast};
use crate::net::{FetchError, FetchRequest, NetworkFetchHelper};

const CURRENT_FIELDS: &str =
  "temperature_2m,relative_humidity_2m,apparent_temperature,weather_code,wind_speed_10m";
const HOURLY_FIELDS: &str = "temperature_2m,precipitation_probability,weather_code";
const DAILY_FIELDS: &str = "weather_code,temperature_2m_max,temperature_2m_min,sunrise,sunset";

#[derive(Clone)]
pub struct ForecastClient {
  helper: NetworkFetchHelper,
  base_url: String,
}

impl ForecastClient {
  pub fn new(helper: NetworkFetchHelper, base_url: &str) -> Self {
    Self {
      helper,
      base_url: base_url.to_string(),
    }
  }

  pub fn forecast_url(&self, coordinates: Coordinates) -> Result<String, FetchError> {
    let url = Url::parse_with_params(
      &self.base_url,
      &[
        ("latitude", coordinates.latitude.to_string().as_str()),
        ("longitude", coordinates.longitude.to_string().as_str()),
        ("current", CURRENT_FIELDS),
        ("hourly", HOURLY_FIELDS),
        ("daily", DAILY_FIELDS),
        ("timezone", "auto"),
      ],
    )?;
    Ok(url.into())
  }

  /// Current, hourly and daily forecast for a location.
  pub async fn forecast(&self, coordinates: Coordinates) -> Result<Forecast, FetchError> {
    let request = FetchRequest::get(self.forecast_url(coordinates)?);
    let response = self.helper.fetch(request).await?.error_for_status()?;
    response.json()
  }
}
