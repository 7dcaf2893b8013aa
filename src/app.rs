use chrono::{DateTime, Utc};
use clap::Subcommand;
use color_eyre::Result;
use std::fmt::Write;
use std::sync::Arc;
use tokio::sync::broadcast::error::TryRecvError;
use tracing::{debug, info, warn};

use crate::cache::{CacheResult, CacheRules, CacheStrategyEngine};
use crate::config::Config;
use crate::net::{FetchRequest, NetworkFetchHelper, Transport};
use crate::storage::{CacheStore, KeyValueStore};
use crate::sync::{HandlerRegistry, OfflineSyncQueue, OnlineFlag, SyncResult};
use crate::tasks::BackgroundTasks;
use crate::weather::{
  Coordinates, Forecast, ForecastClient, GeocodingClient, OfflineResultCache, Place,
  WeatherError, WeatherSchedulers, WeatherService,
};

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
  /// Search places by name; several queries are sent as one batch
  Search {
    #[arg(required = true)]
    queries: Vec<String>,

    #[arg(short, long, default_value_t = 5)]
    limit: usize,
  },

  /// Name the place at a location
  #[command(allow_negative_numbers = true)]
  Locate { latitude: f64, longitude: f64 },

  /// Forecast for a location
  #[command(allow_negative_numbers = true)]
  Forecast { latitude: f64, longitude: f64 },

  /// Replay queued offline requests
  Sync {
    /// Keep replaying on an interval until interrupted
    #[arg(long)]
    watch: bool,
  },

  /// List queued offline requests
  Pending {
    /// Drop every queued request
    #[arg(long)]
    clear: bool,
  },

  /// Fetch a resource through the asset cache
  Fetch { url: String },

  /// Store resources ahead of time and drop outdated buckets
  Precache { urls: Vec<String> },

  /// Inspect or maintain the asset cache
  Cache {
    #[command(subcommand)]
    action: CacheAction,
  },
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheAction {
  /// Entry counts per bucket
  Stats,
  /// Remove entries older than their bucket's max age
  Prune,
  /// Delete buckets from earlier cache versions
  Activate,
}

/// Every long-lived component, built once per process and passed explicitly.
pub struct AppContext<S: CacheStore + KeyValueStore + 'static> {
  config: Config,
  service: WeatherService,
  engine: CacheStrategyEngine<S>,
  tasks: BackgroundTasks,
}

impl<S: CacheStore + KeyValueStore + 'static> AppContext<S> {
  /// Wire the components over one store and one transport.
  pub fn new(config: Config, store: Arc<S>, transport: Arc<dyn Transport>, online: bool) -> Self {
    let connectivity = Arc::new(OnlineFlag::new(online));
    let helper = NetworkFetchHelper::new(transport)
      .with_max_attempts(config.network.max_attempts)
      .with_retry_delay(config.retry_delay())
      .with_default_timeout(config.network_timeout());

    let geocoder = GeocodingClient::new(
      helper.clone(),
      &config.api.geocoding_url,
      &config.api.user_agent,
    );
    let forecaster = ForecastClient::new(helper.clone(), &config.api.forecast_url);
    let offline = OfflineResultCache::new(store.clone());

    let tasks = BackgroundTasks::new();

    let schedulers = WeatherSchedulers::new(
      config.schedulers.geocoding.queue_config(),
      config.schedulers.forecast.queue_config(),
    );
    let handlers = HandlerRegistry::with_defaults(
      geocoder.clone(),
      forecaster.clone(),
      &schedulers,
      offline.clone(),
    );
    let sync = OfflineSyncQueue::new(
      store.clone(),
      handlers,
      connectivity.clone(),
      config.sync.sync_config(),
    )
    .with_tasks(tasks.clone());
    let service = WeatherService::new(geocoder, forecaster, schedulers, sync, offline, connectivity);

    let rules = CacheRules::new(&config.cache.prefix, &config.cache.version);
    let engine = CacheStrategyEngine::new(store, rules, helper)
      .with_revalidate_timeout(config.revalidate_timeout())
      .with_tasks(tasks.clone());

    Self {
      config,
      service,
      engine,
      tasks,
    }
  }

  /// Let background refreshes and sync passes started by commands finish,
  /// up to the configured drain timeout.
  pub async fn finish(&self) {
    let abandoned = self.tasks.drain(self.config.drain_timeout()).await;
    if abandoned > 0 {
      warn!("{} background tasks did not finish before exit", abandoned);
    }
  }

  /// Run one command and return its rendered output.
  pub async fn run(&self, command: Command) -> Result<String> {
    debug!("Running {:?}", command);

    match command {
      Command::Search { queries, limit } => Ok(self.search(&queries, limit).await),
      Command::Locate {
        latitude,
        longitude,
      } => Ok(self.locate(Coordinates::new(latitude, longitude)).await),
      Command::Forecast {
        latitude,
        longitude,
      } => Ok(self.forecast(Coordinates::new(latitude, longitude)).await),
      Command::Sync { watch } => self.sync(watch).await,
      Command::Pending { clear } => self.pending(clear),
      Command::Fetch { url } => self.fetch(&url).await,
      Command::Precache { urls } => self.precache(urls).await,
      Command::Cache { action } => self.cache(action),
    }
  }

  async fn search(&self, queries: &[String], limit: usize) -> String {
    let outcomes = if queries.len() == 1 {
      vec![self.service.search_cities(&queries[0], limit).await]
    } else {
      self.service.search_many(queries, limit).await
    };

    let mut out = String::new();
    for (query, outcome) in queries.iter().zip(outcomes) {
      match outcome {
        Ok(result) => {
          let _ = writeln!(
            out,
            "{}: {} places {}",
            query,
            result.data.len(),
            provenance(&result)
          );
          for place in &result.data {
            let _ = writeln!(out, "  {}", render_place(place));
          }
        }
        Err(e) => {
          let _ = writeln!(out, "{}: {}", query, e);
        }
      }
    }

    self.note_deferred();
    out.trim_end().to_string()
  }

  async fn locate(&self, coordinates: Coordinates) -> String {
    let output = match self.service.reverse_geocode(coordinates).await {
      Ok(result) => format!("{} {}", render_place(&result.data), provenance(&result)),
      Err(e) => failure(coordinates, &e),
    };
    self.note_deferred();
    output
  }

  async fn forecast(&self, coordinates: Coordinates) -> String {
    let output = match self.service.forecast(coordinates).await {
      Ok(result) => render_forecast(&result),
      Err(e) => failure(coordinates, &e),
    };
    self.note_deferred();
    output
  }

  async fn sync(&self, watch: bool) -> Result<String> {
    let queue = self.service.sync();

    if !watch {
      return Ok(render_sync(&queue.process_pending().await));
    }

    info!("Watching {} pending requests", queue.pending_count());
    let task = queue.spawn_auto_sync();
    tokio::signal::ctrl_c().await?;
    task.abort();

    Ok(format!("Stopped; {} still pending", queue.pending_count()))
  }

  fn pending(&self, clear: bool) -> Result<String> {
    let queue = self.service.sync();

    if clear {
      let count = queue.clear()?;
      return Ok(format!("Cleared {} pending requests", count));
    }

    let pending = queue.pending();
    if pending.is_empty() {
      return Ok("Nothing pending".to_string());
    }

    let mut out = String::new();
    for mutation in &pending {
      let queued = DateTime::<Utc>::from_timestamp_millis(mutation.timestamp)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "?".to_string());
      let _ = writeln!(
        out,
        "{}  {:<15} {:<6} retries {}  queued {}  {}",
        mutation.id,
        mutation.kind.to_string(),
        mutation.priority.to_string(),
        mutation.retry_count,
        queued,
        mutation.payload
      );
    }
    Ok(out.trim_end().to_string())
  }

  async fn fetch(&self, url: &str) -> Result<String> {
    let url = self.config.cache.absolute_url(url)?;
    let request = FetchRequest::get(url.as_str());
    let bucket = self.engine.rules().resolve(&request.path()).bucket.clone();

    let result = self.engine.handle(request).await;
    Ok(format!(
      "{} {} bytes from {} [{}]",
      result.data.status,
      result.data.body.len(),
      provenance(&result),
      bucket
    ))
  }

  async fn precache(&self, urls: Vec<String>) -> Result<String> {
    let urls = if urls.is_empty() {
      self.config.cache.precache.clone()
    } else {
      urls
    };
    let urls = urls
      .iter()
      .map(|url| self.config.cache.absolute_url(url))
      .collect::<Result<Vec<_>>>()?;

    let mut updates = self.engine.subscribe_stats();
    let stored = self.engine.precache(&urls).await;
    let deleted = self.engine.activate()?;

    let mut latest = None;
    loop {
      match updates.try_recv() {
        Ok(stats) => latest = Some(stats),
        Err(TryRecvError::Lagged(_)) => continue,
        Err(_) => break,
      }
    }
    if let Some(stats) = latest {
      let entries: usize = stats.iter().map(|b| b.entries).sum();
      debug!("Cache holds {} entries in {} buckets", entries, stats.len());
    }

    Ok(format!(
      "Stored {}/{} resources, removed {} outdated buckets",
      stored,
      urls.len(),
      deleted.len()
    ))
  }

  fn cache(&self, action: CacheAction) -> Result<String> {
    match action {
      CacheAction::Stats => {
        let stats = self.engine.stats()?;
        if stats.is_empty() {
          return Ok("Cache is empty".to_string());
        }

        let mut out = String::new();
        for bucket in stats {
          let rule = self.engine.rules().for_bucket(&bucket.bucket);
          let _ = writeln!(
            out,
            "{:<28} {:>5} entries  {}",
            bucket.bucket,
            bucket.entries,
            rule
              .map(|r| format!("{} (max age {}s)", r.strategy, r.max_age.as_secs()))
              .unwrap_or_else(|| "outdated".to_string())
          );
        }
        Ok(out.trim_end().to_string())
      }
      CacheAction::Prune => {
        let removed = self.engine.prune_expired()?;
        Ok(format!("Removed {} expired entries", removed))
      }
      CacheAction::Activate => {
        let deleted = self.engine.activate()?;
        if deleted.is_empty() {
          Ok("No outdated buckets".to_string())
        } else {
          Ok(format!("Removed {}", deleted.join(", ")))
        }
      }
    }
  }

  /// Ask for a background wake-up while anything is still queued.
  fn note_deferred(&self) {
    let queue = self.service.sync();
    if queue.pending_count() > 0 && !queue.register_background_sync() {
      debug!("{} requests wait for `nimbus sync`", queue.pending_count());
    }
  }
}

fn provenance<T>(result: &CacheResult<T>) -> String {
  match result.cached_at {
    Some(at) => format!("({}, stored {})", result.source, at.format("%Y-%m-%d %H:%M")),
    None => format!("({})", result.source),
  }
}

fn render_place(place: &Place) -> String {
  format!("{}  [{}]  {}", place.name, place.coordinates, place.display_name)
}

fn render_forecast(result: &CacheResult<Forecast>) -> String {
  let forecast = &result.data;
  let mut out = format!(
    "Forecast at {:.4},{:.4} ({}) {}",
    forecast.latitude,
    forecast.longitude,
    forecast.timezone.as_deref().unwrap_or("UTC"),
    provenance(result)
  );

  if let Some(current) = forecast.current.as_object() {
    for (field, value) in current {
      let _ = write!(out, "\n  {:<24} {}", field, value);
    }
  }
  if let Some(days) = forecast.daily.get("time").and_then(|t| t.as_array()) {
    let _ = write!(out, "\n  {} days of daily data", days.len());
  }
  out
}

fn render_sync(result: &SyncResult) -> String {
  let mut out = format!(
    "{}: {} processed, {} failed",
    if result.success { "Synced" } else { "Sync incomplete" },
    result.processed,
    result.failed
  );
  for error in &result.errors {
    let _ = write!(out, "\n  {}", error);
  }
  out
}

fn failure(coordinates: Coordinates, error: &WeatherError) -> String {
  format!("{}: {}", coordinates, error)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::net::mock::MockTransport;
  use crate::net::FetchResponse;
  use crate::storage::SqliteStore;
  use std::time::Duration;

  fn test_config() -> Config {
    let mut config = Config::default();
    config.network.max_attempts = 1;
    config.schedulers.geocoding.min_delay_ms = 0;
    config.cache.origin = "https://app.test".to_string();
    config
  }

  fn context(
    transport: &Arc<MockTransport>,
    online: bool,
  ) -> AppContext<SqliteStore> {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    AppContext::new(test_config(), store, transport.clone(), online)
  }

  #[tokio::test]
  async fn test_search_renders_places() {
    let transport = Arc::new(MockTransport::new());
    let ctx = context(&transport, true);
    let geocoder = GeocodingClient::new(
      NetworkFetchHelper::new(transport.clone()),
      &ctx.config.api.geocoding_url,
      "unused",
    );
    transport.respond(
      &geocoder.search_url("Oslo", 5).unwrap(),
      FetchResponse::new(
        200,
        r#"[{"lat":"59.91","lon":"10.75","display_name":"Oslo, Norway","name":"Oslo"}]"#,
      ),
    );

    let out = ctx
      .run(Command::Search {
        queries: vec!["Oslo".into()],
        limit: 5,
      })
      .await
      .unwrap();

    assert!(out.starts_with("Oslo: 1 places (network)"));
    assert!(out.contains("Oslo, Norway"));
  }

  #[tokio::test]
  async fn test_offline_forecast_is_queued_and_listed() {
    let transport = Arc::new(MockTransport::new());
    let ctx = context(&transport, false);

    let out = ctx
      .run(Command::Forecast {
        latitude: 59.91,
        longitude: 10.75,
      })
      .await
      .unwrap();
    assert!(out.contains("Offline and no cached forecast"));

    let pending = ctx.run(Command::Pending { clear: false }).await.unwrap();
    assert!(pending.contains("weather-update"));

    let sync = ctx.run(Command::Sync { watch: false }).await.unwrap();
    assert!(sync.starts_with("Sync incomplete"));

    let cleared = ctx.run(Command::Pending { clear: true }).await.unwrap();
    assert_eq!(cleared, "Cleared 1 pending requests");
    assert_eq!(transport.total_calls(), 0);
  }

  #[tokio::test]
  async fn test_fetch_resolves_relative_url_and_reports_bucket() {
    let transport = Arc::new(MockTransport::new());
    let ctx = context(&transport, true);
    transport.respond("https://app.test/css/core.css", FetchResponse::new(200, "body{}"));

    let first = ctx
      .run(Command::Fetch {
        url: "/css/core.css".into(),
      })
      .await
      .unwrap();
    let second = ctx
      .run(Command::Fetch {
        url: "/css/core.css".into(),
      })
      .await
      .unwrap();

    assert_eq!(first, "200 6 bytes from (network) [nimbus-css-core-v1]");
    assert!(second.contains("cache (fresh)"));
    assert_eq!(transport.calls("https://app.test/css/core.css"), 1);

    let stats = ctx
      .run(Command::Cache {
        action: CacheAction::Stats,
      })
      .await
      .unwrap();
    assert!(stats.contains("nimbus-css-core-v1"));
    assert!(stats.contains("cache-first"));
  }

  #[tokio::test]
  async fn test_finish_lets_background_refresh_land() {
    let transport = Arc::new(MockTransport::new());
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let ctx = AppContext::new(test_config(), store.clone(), transport.clone(), true);
    let app_js = "https://app.test/js/app.js";
    transport.respond(app_js, FetchResponse::new(200, "v1"));

    let first = ctx.run(Command::Fetch { url: "/js/app.js".into() }).await.unwrap();
    assert!(first.contains("(network)"));

    transport.respond(app_js, FetchResponse::new(200, "version-two"));
    transport.set_latency(Duration::from_millis(30));
    let second = ctx.run(Command::Fetch { url: "/js/app.js".into() }).await.unwrap();
    assert!(second.starts_with("200 2 bytes"));

    ctx.finish().await;
    let stored = store.get_entry("nimbus-js-app-v1", app_js).unwrap().unwrap();
    assert_eq!(stored.response.text(), "version-two");
  }

  #[tokio::test]
  async fn test_precache_uses_configured_defaults() {
    let transport = Arc::new(MockTransport::new());
    let ctx = context(&transport, true);
    transport.respond("https://app.test/index.html", FetchResponse::new(200, "<html>"));
    transport.respond("https://app.test/css/core.css", FetchResponse::new(200, "x"));

    let out = ctx.run(Command::Precache { urls: vec![] }).await.unwrap();

    // The default app.js is not served by the mock
    assert_eq!(out, "Stored 2/3 resources, removed 0 outdated buckets");
  }
}
