//! Upstream weather collaborators and the service facade used by the UI.

mod error;
mod forecast;
mod geocoding;
mod offline_cache;
mod service;
mod types;

pub use error::WeatherError;
pub use forecast::ForecastClient;
pub use geocoding::GeocodingClient;
pub use offline_cache::{OfflineKey, OfflineRecord, OfflineResultCache};
pub use service::{WeatherSchedulers, WeatherService};
pub use types::{Coordinates, Forecast, Place};
