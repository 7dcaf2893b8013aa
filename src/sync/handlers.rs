//! Per-kind mutation handlers and the registry that maps kinds to them.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::error::SyncError;
use super::mutation::MutationKind;
use crate::scheduler::{Priority, RequestScheduler};
use crate::weather::{
  Coordinates, ForecastClient, GeocodingClient, OfflineKey, OfflineResultCache, WeatherSchedulers,
};

/// Replays yield to interactive requests on the shared schedulers.
const REPLAY_PRIORITY: Priority = Priority::Low;

/// Replays one kind of mutation against its upstream.
pub trait MutationHandler: Send + Sync {
  fn handle<'a>(&'a self, payload: &'a Value) -> BoxFuture<'a, Result<(), SyncError>>;
}

/// Maps each mutation kind to its handler. Adding a kind is a registration.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
  handlers: HashMap<MutationKind, Arc<dyn MutationHandler>>,
}

impl HandlerRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Registry with the built-in weather, search and location handlers.
  ///
  /// Replays run through `schedulers`, so they share the rate limits of
  /// interactive calls to the same upstream.
  pub fn with_defaults(
    geocoder: GeocodingClient,
    forecaster: ForecastClient,
    schedulers: &WeatherSchedulers,
    offline: OfflineResultCache,
  ) -> Self {
    let mut registry = Self::new();
    registry.register(
      MutationKind::WeatherUpdate,
      Arc::new(WeatherUpdateHandler::new(
        forecaster,
        schedulers.forecast.clone(),
        offline.clone(),
      )),
    );
    registry.register(
      MutationKind::CitySearch,
      Arc::new(CitySearchHandler::new(
        geocoder.clone(),
        schedulers.geocoding.clone(),
        offline.clone(),
      )),
    );
    registry.register(
      MutationKind::LocationFetch,
      Arc::new(LocationFetchHandler::new(
        geocoder,
        schedulers.geocoding.clone(),
        offline,
      )),
    );
    registry
  }

  /// Register or replace the handler for `kind`.
  pub fn register(&mut self, kind: MutationKind, handler: Arc<dyn MutationHandler>) {
    self.handlers.insert(kind, handler);
  }

  pub fn get(&self, kind: MutationKind) -> Option<Arc<dyn MutationHandler>> {
    self.handlers.get(&kind).cloned()
  }
}

fn parse_payload<T: DeserializeOwned>(payload: &Value) -> Result<T, SyncError> {
  serde_json::from_value(payload.clone()).map_err(|e| SyncError::InvalidPayload(e.to_string()))
}

fn store<T: serde::Serialize>(
  offline: &OfflineResultCache,
  key: &OfflineKey,
  data: &T,
) -> Result<(), SyncError> {
  offline
    .put(key, data)
    .map_err(|e| SyncError::Storage(e.to_string()))
}

#[derive(Debug, Deserialize)]
struct CoordinatesPayload {
  latitude: f64,
  longitude: f64,
}

impl CoordinatesPayload {
  fn coordinates(&self) -> Result<Coordinates, SyncError> {
    let coordinates = Coordinates::new(self.latitude, self.longitude);
    if !coordinates.is_valid() {
      return Err(SyncError::InvalidPayload(format!(
        "Coordinates out of range: {}",
        coordinates
      )));
    }
    Ok(coordinates)
  }
}

#[derive(Debug, Deserialize)]
struct SearchPayload {
  query: String,
  #[serde(default = "default_search_limit")]
  limit: usize,
}

fn default_search_limit() -> usize {
  5
}

/// Refreshes the forecast for `{latitude, longitude}`.
pub struct WeatherUpdateHandler {
  forecaster: ForecastClient,
  scheduler: RequestScheduler,
  offline: OfflineResultCache,
}

impl WeatherUpdateHandler {
  pub fn new(
    forecaster: ForecastClient,
    scheduler: RequestScheduler,
    offline: OfflineResultCache,
  ) -> Self {
    Self {
      forecaster,
      scheduler,
      offline,
    }
  }
}

impl MutationHandler for WeatherUpdateHandler {
  fn handle<'a>(&'a self, payload: &'a Value) -> BoxFuture<'a, Result<(), SyncError>> {
    async move {
      let coordinates = parse_payload::<CoordinatesPayload>(payload)?.coordinates()?;
      let forecaster = self.forecaster.clone();
      let forecast = self
        .scheduler
        .enqueue(
          format!("replay:forecast:{}", coordinates),
          REPLAY_PRIORITY,
          move || async move { forecaster.forecast(coordinates).await },
        )
        .await?;
      debug!("Synced forecast for {}", coordinates);
      store(&self.offline, &OfflineKey::Forecast { coordinates }, &forecast)
    }
    .boxed()
  }
}

/// Replays a city search for `{query, limit?}`.
pub struct CitySearchHandler {
  geocoder: GeocodingClient,
  scheduler: RequestScheduler,
  offline: OfflineResultCache,
}

impl CitySearchHandler {
  pub fn new(
    geocoder: GeocodingClient,
    scheduler: RequestScheduler,
    offline: OfflineResultCache,
  ) -> Self {
    Self {
      geocoder,
      scheduler,
      offline,
    }
  }
}

impl MutationHandler for CitySearchHandler {
  fn handle<'a>(&'a self, payload: &'a Value) -> BoxFuture<'a, Result<(), SyncError>> {
    async move {
      let SearchPayload { query, limit } = parse_payload(payload)?;
      if query.trim().is_empty() {
        return Err(SyncError::InvalidPayload("Empty search query".into()));
      }
      let geocoder = self.geocoder.clone();
      let owned = query.clone();
      let places = self
        .scheduler
        .enqueue(
          format!("replay:search:{}", query),
          REPLAY_PRIORITY,
          move || async move { geocoder.search(&owned, limit).await },
        )
        .await?;
      debug!("Synced search '{}' ({} places)", query, places.len());
      store(&self.offline, &OfflineKey::Search { query }, &places)
    }
    .boxed()
  }
}

/// Resolves `{latitude, longitude}` to a place name.
pub struct LocationFetchHandler {
  geocoder: GeocodingClient,
  scheduler: RequestScheduler,
  offline: OfflineResultCache,
}

impl LocationFetchHandler {
  pub fn new(
    geocoder: GeocodingClient,
    scheduler: RequestScheduler,
    offline: OfflineResultCache,
  ) -> Self {
    Self {
      geocoder,
      scheduler,
      offline,
    }
  }
}

impl MutationHandler for LocationFetchHandler {
  fn handle<'a>(&'a self, payload: &'a Value) -> BoxFuture<'a, Result<(), SyncError>> {
    async move {
      let coordinates = parse_payload::<CoordinatesPayload>(payload)?.coordinates()?;
      let geocoder = self.geocoder.clone();
      let place = self
        .scheduler
        .enqueue(
          format!("replay:reverse:{}", coordinates),
          REPLAY_PRIORITY,
          move || async move { geocoder.reverse(coordinates).await },
        )
        .await?;
      debug!("Synced location {} -> {}", coordinates, place.name);
      store(&self.offline, &OfflineKey::Location { coordinates }, &place)
    }
    .boxed()
  }
}
