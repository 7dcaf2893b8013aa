//! Facade that routes weather calls through the schedulers and degrades to
//! stored results plus a queued replay when the network is unavailable.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use super::error::WeatherError;
use super::forecast::ForecastClient;
use super::geocoding::GeocodingClient;
use super::offline_cache::{OfflineKey, OfflineResultCache};
use super::types::{Coordinates, Forecast, Place};
use crate::cache::CacheResult;
use crate::net::FetchError;
use crate::scheduler::{Priority, QueueConfig, RequestScheduler, ScheduleError};
use crate::sync::{Connectivity, MutationKind, OfflineSyncQueue};

/// One scheduler per upstream, each tuned to that upstream's limits.
#[derive(Clone)]
pub struct WeatherSchedulers {
  pub geocoding: RequestScheduler,
  pub forecast: RequestScheduler,
}

impl WeatherSchedulers {
  pub fn new(geocoding: QueueConfig, forecast: QueueConfig) -> Self {
    Self {
      geocoding: RequestScheduler::new("geocoding", geocoding),
      forecast: RequestScheduler::new("forecast", forecast),
    }
  }
}

/// What to replay later if a call cannot complete now.
struct Replay {
  kind: MutationKind,
  payload: Value,
}

/// Weather operations used by the front end.
///
/// Cheap to clone; clones share schedulers, queue and storage.
#[derive(Clone)]
pub struct WeatherService {
  geocoder: GeocodingClient,
  forecaster: ForecastClient,
  schedulers: WeatherSchedulers,
  sync: OfflineSyncQueue,
  offline: OfflineResultCache,
  connectivity: Arc<dyn Connectivity>,
}

impl WeatherService {
  pub fn new(
    geocoder: GeocodingClient,
    forecaster: ForecastClient,
    schedulers: WeatherSchedulers,
    sync: OfflineSyncQueue,
    offline: OfflineResultCache,
    connectivity: Arc<dyn Connectivity>,
  ) -> Self {
    Self {
      geocoder,
      forecaster,
      schedulers,
      sync,
      offline,
      connectivity,
    }
  }

  pub fn schedulers(&self) -> &WeatherSchedulers {
    &self.schedulers
  }

  pub fn sync(&self) -> &OfflineSyncQueue {
    &self.sync
  }

  /// Search places by name.
  pub async fn search_cities(
    &self,
    query: &str,
    limit: usize,
  ) -> Result<CacheResult<Vec<Place>>, WeatherError> {
    let geocoder = self.geocoder.clone();
    let owned = query.to_string();

    self
      .run(
        &self.schedulers.geocoding,
        Priority::High,
        OfflineKey::Search {
          query: query.to_string(),
        },
        search_replay(query, limit),
        move || async move { geocoder.search(&owned, limit).await },
      )
      .await
  }

  /// Search several queries as one batch, with one outcome per query in
  /// input order.
  pub async fn search_many(
    &self,
    queries: &[String],
    limit: usize,
  ) -> Vec<Result<CacheResult<Vec<Place>>, WeatherError>> {
    let keys: Vec<OfflineKey> = queries
      .iter()
      .map(|query| OfflineKey::Search {
        query: query.clone(),
      })
      .collect();

    if !self.connectivity.is_online() {
      return queries
        .iter()
        .zip(&keys)
        .map(|(query, key)| self.deferred(key, search_replay(query, limit), Priority::Medium))
        .collect();
    }

    let requests: Vec<_> = queries
      .iter()
      .map(|query| {
        let geocoder = self.geocoder.clone();
        let owned = query.clone();
        (format!("search:{}", query), move || async move {
          geocoder.search(&owned, limit).await
        })
      })
      .collect();

    let outcomes = self
      .schedulers
      .geocoding
      .batch(requests, Priority::Medium)
      .await;

    outcomes
      .into_iter()
      .zip(queries.iter().zip(&keys))
      .map(|(outcome, (query, key))| {
        self.settle(key, search_replay(query, limit), Priority::Medium, outcome)
      })
      .collect()
  }

  /// Name of the place at `coordinates`.
  pub async fn reverse_geocode(
    &self,
    coordinates: Coordinates,
  ) -> Result<CacheResult<Place>, WeatherError> {
    let geocoder = self.geocoder.clone();

    self
      .run(
        &self.schedulers.geocoding,
        Priority::High,
        OfflineKey::Location { coordinates },
        coordinates_replay(MutationKind::LocationFetch, coordinates),
        move || async move { geocoder.reverse(coordinates).await },
      )
      .await
  }

  /// Forecast at `coordinates`.
  pub async fn forecast(
    &self,
    coordinates: Coordinates,
  ) -> Result<CacheResult<Forecast>, WeatherError> {
    let forecaster = self.forecaster.clone();

    self
      .run(
        &self.schedulers.forecast,
        Priority::High,
        OfflineKey::Forecast { coordinates },
        coordinates_replay(MutationKind::WeatherUpdate, coordinates),
        move || async move { forecaster.forecast(coordinates).await },
      )
      .await
  }

  async fn run<T, F, Fut>(
    &self,
    scheduler: &RequestScheduler,
    priority: Priority,
    key: OfflineKey,
    replay: Replay,
    executor: F,
  ) -> Result<CacheResult<T>, WeatherError>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
  {
    if !self.connectivity.is_online() {
      return self.deferred(&key, replay, priority);
    }

    let outcome = scheduler
      .enqueue(key.description(), priority, executor)
      .await;
    self.settle(&key, replay, priority, outcome)
  }

  /// Turn a scheduler outcome into served data.
  fn settle<T>(
    &self,
    key: &OfflineKey,
    replay: Replay,
    priority: Priority,
    outcome: Result<T, ScheduleError<FetchError>>,
  ) -> Result<CacheResult<T>, WeatherError>
  where
    T: Serialize + DeserializeOwned,
  {
    match outcome {
      Ok(data) => {
        if let Err(e) = self.offline.put(key, &data) {
          warn!("Failed to store offline {}: {}", key.description(), e);
        }
        Ok(CacheResult::from_network(data))
      }
      Err(e) => {
        warn!("Request for {} failed: {}", key.description(), e);
        if is_retryable(&e) {
          self.defer(replay, priority);
        }
        self.stored(key).ok_or(WeatherError::Request(e))
      }
    }
  }

  /// Offline: queue the replay and serve whatever is stored.
  fn deferred<T: DeserializeOwned>(
    &self,
    key: &OfflineKey,
    replay: Replay,
    priority: Priority,
  ) -> Result<CacheResult<T>, WeatherError> {
    debug!("Offline, deferring {}", key.description());
    self.defer(replay, priority);
    self
      .stored(key)
      .ok_or_else(|| WeatherError::Offline(key.description()))
  }

  fn defer(&self, replay: Replay, priority: Priority) {
    if let Err(e) = self.sync.queue_mutation(replay.kind, replay.payload, priority) {
      warn!("Failed to queue {} for later: {}", replay.kind, e);
    }
  }

  fn stored<T: DeserializeOwned>(&self, key: &OfflineKey) -> Option<CacheResult<T>> {
    match self.offline.get(key) {
      Ok(record) => record.map(|r| CacheResult::offline(r.data, r.cached_at)),
      Err(e) => {
        warn!("Failed to read offline {}: {}", key.description(), e);
        None
      }
    }
  }
}

fn search_replay(query: &str, limit: usize) -> Replay {
  Replay {
    kind: MutationKind::CitySearch,
    payload: json!({ "query": query, "limit": limit }),
  }
}

fn coordinates_replay(kind: MutationKind, coordinates: Coordinates) -> Replay {
  Replay {
    kind,
    payload: json!({
      "latitude": coordinates.latitude,
      "longitude": coordinates.longitude,
    }),
  }
}

/// Failures worth replaying later. Client errors and bad payloads would fail
/// the same way again. Replays are bounded by the sync queue's retry count.
fn is_retryable(error: &ScheduleError<FetchError>) -> bool {
  match error {
    ScheduleError::QueueFull { .. } | ScheduleError::ExecutorPanicked => true,
    ScheduleError::QueueCleared => false,
    ScheduleError::Executor(FetchError::Timeout(_) | FetchError::Connection(_)) => true,
    ScheduleError::Executor(FetchError::Status { status }) => *status == 429 || *status >= 500,
    ScheduleError::Executor(_) => false,
  }
}
