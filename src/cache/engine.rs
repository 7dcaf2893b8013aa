//! Strategy engine that sits between resource requests and the network.

use color_eyre::Result;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

use super::rules::{CacheRule, CacheRules, CacheStrategy};
use super::traits::CacheResult;
use crate::net::{FetchRequest, FetchResponse, Method, NetworkFetchHelper};
use crate::storage::{CacheStore, CachedResponse};
use crate::tasks::BackgroundTasks;

/// Entry count of one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BucketStats {
  pub bucket: String,
  pub entries: usize,
}

/// Serves intercepted requests from versioned buckets or the network,
/// according to the rule each request path matches.
///
/// `handle` never fails: every failure degrades to a stale entry or a
/// synthetic 503 response.
pub struct CacheStrategyEngine<S: CacheStore> {
  store: Arc<S>,
  rules: Arc<CacheRules>,
  helper: NetworkFetchHelper,
  /// How long a stale-while-revalidate miss waits for the network
  revalidate_timeout: Duration,
  stats_tx: broadcast::Sender<Vec<BucketStats>>,
  /// Background revalidations outlive the request that started them
  tasks: BackgroundTasks,
}

impl<S: CacheStore> Clone for CacheStrategyEngine<S> {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      rules: Arc::clone(&self.rules),
      helper: self.helper.clone(),
      revalidate_timeout: self.revalidate_timeout,
      stats_tx: self.stats_tx.clone(),
      tasks: self.tasks.clone(),
    }
  }
}

impl<S: CacheStore + 'static> CacheStrategyEngine<S> {
  pub fn new(store: Arc<S>, rules: CacheRules, helper: NetworkFetchHelper) -> Self {
    let (stats_tx, _) = broadcast::channel(16);
    Self {
      store,
      rules: Arc::new(rules),
      helper,
      revalidate_timeout: Duration::from_secs(3),
      stats_tx,
      tasks: BackgroundTasks::new(),
    }
  }

  /// Track background revalidations in `tasks` instead of a private set.
  pub fn with_tasks(mut self, tasks: BackgroundTasks) -> Self {
    self.tasks = tasks;
    self
  }

  /// Set how long a stale-while-revalidate miss waits for the network.
  pub fn with_revalidate_timeout(mut self, timeout: Duration) -> Self {
    self.revalidate_timeout = timeout;
    self
  }

  pub fn rules(&self) -> &CacheRules {
    &self.rules
  }

  /// Serve a request according to its matching rule.
  pub async fn handle(&self, request: FetchRequest) -> CacheResult<FetchResponse> {
    if request.method != Method::Get {
      return self.passthrough(request).await;
    }

    let rule = self.rules.resolve(&request.path()).clone();
    debug!(
      "{} -> {} ({}, max age {:?})",
      request.url, rule.bucket, rule.strategy, rule.max_age
    );

    match rule.strategy {
      CacheStrategy::CacheFirst => self.cache_first(request, &rule).await,
      CacheStrategy::StaleWhileRevalidate => self.stale_while_revalidate(request, &rule).await,
      CacheStrategy::NetworkFirst => self.network_first(request, &rule).await,
    }
  }

  /// Fresh cache without network; otherwise network, then any cache.
  async fn cache_first(
    &self,
    request: FetchRequest,
    rule: &CacheRule,
  ) -> CacheResult<FetchResponse> {
    let url = request.url.clone();
    let cached = self.read(&rule.bucket, &url);

    if let Some(entry) = &cached {
      if is_fresh(entry, rule.max_age) {
        return CacheResult::from_cache(entry.response.clone(), entry.cached_at, false);
      }
    }

    match self.helper.fetch(request).await {
      Ok(response) => {
        self.write(&rule.bucket, &url, &response);
        CacheResult::from_network(response)
      }
      Err(e) => {
        warn!("Network failed for {}: {}", url, e);
        fallback(cached)
      }
    }
  }

  /// Always refresh in the background; answer from fresh cache, else race the
  /// refresh against a short timeout, else serve stale.
  async fn stale_while_revalidate(
    &self,
    request: FetchRequest,
    rule: &CacheRule,
  ) -> CacheResult<FetchResponse> {
    let url = request.url.clone();
    let cached = self.read(&rule.bucket, &url);
    let revalidation = self.spawn_revalidation(request, rule.bucket.clone());

    if let Some(entry) = &cached {
      if is_fresh(entry, rule.max_age) {
        return CacheResult::from_cache(entry.response.clone(), entry.cached_at, false);
      }
    }

    // The refresh keeps running in the background if the timeout wins
    match tokio::time::timeout(self.revalidate_timeout, revalidation).await {
      Ok(Ok(response)) => CacheResult::from_network(response),
      Ok(_) => fallback_stale(cached),
      Err(_) => {
        debug!(
          "Revalidation of {} exceeded {:?}",
          url, self.revalidate_timeout
        );
        fallback_stale(cached)
      }
    }
  }

  /// Network first; any cached entry when the network fails.
  async fn network_first(
    &self,
    request: FetchRequest,
    rule: &CacheRule,
  ) -> CacheResult<FetchResponse> {
    let url = request.url.clone();

    match self.helper.fetch(request).await {
      Ok(response) => {
        self.write(&rule.bucket, &url, &response);
        CacheResult::from_network(response)
      }
      Err(e) => {
        warn!("Network failed for {}: {}", url, e);
        fallback(self.read(&rule.bucket, &url))
      }
    }
  }

  /// Non-GET requests are never cached.
  async fn passthrough(&self, request: FetchRequest) -> CacheResult<FetchResponse> {
    let url = request.url.clone();
    let method = request.method;
    match self.helper.fetch(request).await {
      Ok(response) => CacheResult::from_network(response),
      Err(e) => {
        warn!("Network failed for {} {}: {}", method.as_str(), url, e);
        CacheResult::unavailable(FetchResponse::unavailable())
      }
    }
  }

  /// Refresh `request` in the background. The receiver yields the response
  /// if the refresh succeeds; it is dropped unsent on failure.
  fn spawn_revalidation(
    &self,
    request: FetchRequest,
    bucket: String,
  ) -> oneshot::Receiver<FetchResponse> {
    let (tx, rx) = oneshot::channel();
    let engine = self.clone();

    self.tasks.spawn(async move {
      let url = request.url.clone();
      match engine.helper.fetch(request).await {
        Ok(response) => {
          engine.write(&bucket, &url, &response);
          let _ = tx.send(response);
        }
        Err(e) => warn!("Background revalidation of {} failed: {}", url, e),
      }
    });
    rx
  }

  /// Fetch and store each URL in its bucket. Returns how many were stored.
  pub async fn precache(&self, urls: &[String]) -> usize {
    let mut stored = 0;

    for url in urls {
      let request = FetchRequest::get(url.as_str());
      let bucket = self.rules.resolve(&request.path()).bucket.clone();

      match self.helper.fetch(request).await {
        Ok(response) if response.is_success() => {
          self.write(&bucket, url, &response);
          stored += 1;
        }
        Ok(response) => warn!("Precache of {} returned {}", url, response.status),
        Err(e) => warn!("Precache of {} failed: {}", url, e),
      }
    }

    info!("Precached {}/{} resources", stored, urls.len());
    stored
  }

  /// Delete every bucket not named by the current rule table.
  ///
  /// Returns the names of the deleted buckets.
  pub fn activate(&self) -> Result<Vec<String>> {
    let current = self.rules.bucket_names();
    let mut deleted = Vec::new();

    for bucket in self.store.bucket_names()? {
      if !current.contains(&bucket) {
        let entries = self.store.delete_bucket(&bucket)?;
        info!("Deleted outdated bucket {} ({} entries)", bucket, entries);
        deleted.push(bucket);
      }
    }

    if !deleted.is_empty() {
      self.publish_stats();
    }
    Ok(deleted)
  }

  /// Remove entries older than their bucket's max age.
  pub fn prune_expired(&self) -> Result<usize> {
    let mut removed = 0;

    for rule in self.rules.iter() {
      for (url, cached_at) in self.store.list_entries(&rule.bucket)? {
        let age = (chrono::Utc::now() - cached_at).to_std().unwrap_or_default();
        if age > rule.max_age && self.store.delete_entry(&rule.bucket, &url)? {
          removed += 1;
        }
      }
    }

    if removed > 0 {
      info!("Pruned {} expired cache entries", removed);
      self.publish_stats();
    }
    Ok(removed)
  }

  /// Entry counts per bucket.
  pub fn stats(&self) -> Result<Vec<BucketStats>> {
    self
      .store
      .bucket_names()?
      .into_iter()
      .map(|bucket| {
        let entries = self.store.list_entries(&bucket)?.len();
        Ok(BucketStats { bucket, entries })
      })
      .collect()
  }

  /// Receive bucket statistics after every cache write.
  pub fn subscribe_stats(&self) -> broadcast::Receiver<Vec<BucketStats>> {
    self.stats_tx.subscribe()
  }

  fn read(&self, bucket: &str, url: &str) -> Option<CachedResponse> {
    match self.store.get_entry(bucket, url) {
      Ok(entry) => entry,
      Err(e) => {
        warn!("Cache read failed for {}: {}", url, e);
        None
      }
    }
  }

  /// Store a successful response; anything else is left out of the cache.
  fn write(&self, bucket: &str, url: &str, response: &FetchResponse) {
    if !response.is_success() {
      debug!("Not caching {} ({})", url, response.status);
      return;
    }

    match self
      .store
      .put_entry(bucket, url, &CachedResponse::new(response.clone()))
    {
      Ok(()) => self.publish_stats(),
      Err(e) => warn!("Cache write failed for {}: {}", url, e),
    }
  }

  fn publish_stats(&self) {
    if self.stats_tx.receiver_count() == 0 {
      return;
    }
    match self.stats() {
      Ok(stats) => {
        // Lagging or departed observers are not our concern
        let _ = self.stats_tx.send(stats);
      }
      Err(e) => warn!("Failed to collect cache stats: {}", e),
    }
  }
}

fn is_fresh(entry: &CachedResponse, max_age: Duration) -> bool {
  entry
    .age()
    .to_std()
    .map(|age| age <= max_age)
    .unwrap_or(false)
}

/// Network failed: any cached entry, else the synthetic 503.
fn fallback(cached: Option<CachedResponse>) -> CacheResult<FetchResponse> {
  match cached {
    Some(entry) => CacheResult::offline(entry.response, entry.cached_at),
    None => CacheResult::unavailable(FetchResponse::unavailable()),
  }
}

/// Revalidation failed or was slow: the stale entry, else the synthetic 503.
fn fallback_stale(cached: Option<CachedResponse>) -> CacheResult<FetchResponse> {
  match cached {
    Some(entry) => CacheResult::from_cache(entry.response, entry.cached_at, true),
    None => CacheResult::unavailable(FetchResponse::unavailable()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheSource;
  use crate::net::mock::MockTransport;
  use crate::storage::MemoryStore;
  use chrono::Utc;

  const ORIGIN: &str = "https://app.test";

  struct Fixture {
    transport: Arc<MockTransport>,
    store: Arc<MemoryStore>,
    engine: CacheStrategyEngine<MemoryStore>,
  }

  fn fixture() -> Fixture {
    let transport = Arc::new(MockTransport::new());
    let store = Arc::new(MemoryStore::new());
    let helper = NetworkFetchHelper::new(transport.clone())
      .with_max_attempts(2)
      .with_retry_delay(Duration::from_millis(1));
    let engine = CacheStrategyEngine::new(store.clone(), CacheRules::new("nimbus", "v1"), helper)
      .with_revalidate_timeout(Duration::from_millis(50));
    Fixture {
      transport,
      store,
      engine,
    }
  }

  fn url(path: &str) -> String {
    format!("{}{}", ORIGIN, path)
  }

  /// Seed an entry stored `age` ago.
  fn seed(store: &MemoryStore, bucket: &str, url: &str, body: &str, age: chrono::Duration) {
    let entry = CachedResponse {
      response: FetchResponse::new(200, body),
      cached_at: Utc::now() - age,
    };
    store.put_entry(bucket, url, &entry).unwrap();
  }

  #[tokio::test]
  async fn test_cache_first_hits_network_once_within_max_age() {
    let f = fixture();
    let core = url("/assets/css/core.css");
    f.transport.respond(&core, FetchResponse::new(200, "body{}"));

    let first = f.engine.handle(FetchRequest::get(core.as_str())).await;
    let second = f.engine.handle(FetchRequest::get(core.as_str())).await;

    assert_eq!(first.source, CacheSource::Network);
    assert_eq!(second.source, CacheSource::CacheFresh);
    assert_eq!(second.data.text(), "body{}");
    assert_eq!(f.transport.calls(&core), 1);
  }

  #[tokio::test]
  async fn test_cache_first_refetches_expired_entry() {
    let f = fixture();
    let core = url("/css/core.css");
    seed(&f.store, "nimbus-css-core-v1", &core, "old", chrono::Duration::days(31));
    f.transport.respond(&core, FetchResponse::new(200, "new"));

    let result = f.engine.handle(FetchRequest::get(core.as_str())).await;

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.text(), "new");
    let stored = f.store.get_entry("nimbus-css-core-v1", &core).unwrap().unwrap();
    assert_eq!(stored.response.text(), "new");
  }

  #[tokio::test]
  async fn test_cache_first_serves_expired_entry_when_offline() {
    let f = fixture();
    let font = url("/fonts/inter.woff2");
    seed(&f.store, "nimbus-fonts-v1", &font, "glyphs", chrono::Duration::days(400));
    f.transport.set_offline(true);

    let result = f.engine.handle(FetchRequest::get(font.as_str())).await;

    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.data.text(), "glyphs");
  }

  #[tokio::test]
  async fn test_cache_first_without_cache_or_network_is_503() {
    let f = fixture();
    f.transport.set_offline(true);

    let result = f
      .engine
      .handle(FetchRequest::get(url("/vendor/chart.js")))
      .await;

    assert_eq!(result.source, CacheSource::Unavailable);
    assert_eq!(result.data.status, 503);
  }

  #[tokio::test]
  async fn test_swr_serves_fresh_cache_and_updates_in_background() {
    let f = fixture();
    let app = url("/js/app.js");
    seed(&f.store, "nimbus-js-app-v1", &app, "v1", chrono::Duration::minutes(1));
    f.transport.respond(&app, FetchResponse::new(200, "v2"));

    let first = f.engine.handle(FetchRequest::get(app.as_str())).await;
    assert_eq!(first.source, CacheSource::CacheFresh);
    assert_eq!(first.data.text(), "v1");

    tokio::time::sleep(Duration::from_millis(20)).await;

    let second = f.engine.handle(FetchRequest::get(app.as_str())).await;
    assert_eq!(second.source, CacheSource::CacheFresh);
    assert_eq!(second.data.text(), "v2");
  }

  #[tokio::test]
  async fn test_swr_background_update_lands_once_tasks_are_drained() {
    let f = fixture();
    let tasks = BackgroundTasks::new();
    let engine = f.engine.clone().with_tasks(tasks.clone());
    let app = url("/js/app.js");
    seed(&f.store, "nimbus-js-app-v1", &app, "v1", chrono::Duration::minutes(1));
    f.transport.respond(&app, FetchResponse::new(200, "v2"));
    f.transport.set_latency(Duration::from_millis(30));

    let served = engine.handle(FetchRequest::get(app.as_str())).await;
    assert_eq!(served.data.text(), "v1");
    assert_eq!(tasks.len(), 1);

    assert_eq!(tasks.drain(Duration::from_secs(1)).await, 0);
    let stored = f.store.get_entry("nimbus-js-app-v1", &app).unwrap().unwrap();
    assert_eq!(stored.response.text(), "v2");
  }

  #[tokio::test]
  async fn test_swr_stale_entry_replaced_by_network_answer() {
    let f = fixture();
    let theme = url("/css/themes/ocean.css");
    seed(&f.store, "nimbus-css-conditional-v1", &theme, "old", chrono::Duration::days(8));
    f.transport.respond(&theme, FetchResponse::new(200, "new"));

    let result = f.engine.handle(FetchRequest::get(theme.as_str())).await;

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.text(), "new");
    assert_eq!(f.transport.calls(&theme), 1);
  }

  #[tokio::test]
  async fn test_swr_stale_entry_when_network_down() {
    let f = fixture();
    let icon = url("/icons/sun.png");
    seed(&f.store, "nimbus-images-v1", &icon, "png", chrono::Duration::days(45));
    f.transport.set_offline(true);

    let result = f.engine.handle(FetchRequest::get(icon.as_str())).await;

    assert_eq!(result.source, CacheSource::CacheStale);
    assert_eq!(result.data.text(), "png");
  }

  #[tokio::test]
  async fn test_swr_slow_network_times_out_but_still_caches() {
    let f = fixture();
    let app = url("/js/main.js");
    f.transport.respond(&app, FetchResponse::new(200, "late"));
    f.transport.set_latency(Duration::from_millis(100));

    let result = f.engine.handle(FetchRequest::get(app.as_str())).await;
    assert_eq!(result.source, CacheSource::Unavailable);

    tokio::time::sleep(Duration::from_millis(150)).await;
    let stored = f.store.get_entry("nimbus-js-app-v1", &app).unwrap().unwrap();
    assert_eq!(stored.response.text(), "late");
  }

  #[tokio::test]
  async fn test_network_first_falls_back_to_cache() {
    let f = fixture();
    let api = url("/api/alerts");
    seed(&f.store, "nimbus-api-v1", &api, "[]", chrono::Duration::hours(2));
    f.transport.set_offline(true);

    let result = f.engine.handle(FetchRequest::get(api.as_str())).await;

    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.data.text(), "[]");
    // Every retry was attempted before falling back
    assert_eq!(f.transport.calls(&api), 2);
  }

  #[tokio::test]
  async fn test_network_first_success_refreshes_cache() {
    let f = fixture();
    let api = url("/api/alerts");
    seed(&f.store, "nimbus-api-v1", &api, "[]", chrono::Duration::seconds(1));
    f.transport.respond(&api, FetchResponse::new(200, "[1]"));

    let result = f.engine.handle(FetchRequest::get(api.as_str())).await;

    assert_eq!(result.source, CacheSource::Network);
    let stored = f.store.get_entry("nimbus-api-v1", &api).unwrap().unwrap();
    assert_eq!(stored.response.text(), "[1]");
  }

  #[tokio::test]
  async fn test_error_responses_are_not_cached() {
    let f = fixture();
    let page = url("/about.html");
    f.transport.respond(&page, FetchResponse::new(500, "boom"));

    let result = f.engine.handle(FetchRequest::get(page.as_str())).await;

    assert_eq!(result.data.status, 500);
    assert!(f.store.get_entry("nimbus-static-v1", &page).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_non_get_bypasses_cache() {
    let f = fixture();
    let api = url("/api/alerts");
    seed(&f.store, "nimbus-api-v1", &api, "[]", chrono::Duration::seconds(1));
    f.transport.set_offline(true);

    let result = f
      .engine
      .handle(FetchRequest::new(Method::Post, api.as_str()))
      .await;

    assert_eq!(result.source, CacheSource::Unavailable);
  }

  #[tokio::test]
  async fn test_activate_removes_old_versions() {
    let f = fixture();
    seed(&f.store, "nimbus-css-core-v0", "a", "x", chrono::Duration::zero());
    seed(&f.store, "nimbus-css-core-v1", "b", "x", chrono::Duration::zero());

    let deleted = f.engine.activate().unwrap();

    assert_eq!(deleted, vec!["nimbus-css-core-v0"]);
    assert_eq!(f.store.bucket_names().unwrap(), vec!["nimbus-css-core-v1"]);
  }

  #[tokio::test]
  async fn test_prune_and_stats() {
    let f = fixture();
    seed(&f.store, "nimbus-api-v1", "old", "x", chrono::Duration::hours(1));
    seed(&f.store, "nimbus-api-v1", "new", "x", chrono::Duration::seconds(5));
    seed(&f.store, "nimbus-fonts-v1", "font", "x", chrono::Duration::days(2));

    assert_eq!(f.engine.prune_expired().unwrap(), 1);
    assert_eq!(
      f.engine.stats().unwrap(),
      vec![
        BucketStats {
          bucket: "nimbus-api-v1".into(),
          entries: 1
        },
        BucketStats {
          bucket: "nimbus-fonts-v1".into(),
          entries: 1
        },
      ]
    );
  }

  #[tokio::test]
  async fn test_precache_and_stats_subscription() {
    let f = fixture();
    let mut stats = f.engine.subscribe_stats();
    let core = url("/css/core.css");
    let missing = url("/css/base.css");
    f.transport.respond(&core, FetchResponse::new(200, "x"));

    let stored = f.engine.precache(&[core.clone(), missing]).await;

    assert_eq!(stored, 1);
    let pushed = stats.recv().await.unwrap();
    assert_eq!(
      pushed,
      vec![BucketStats {
        bucket: "nimbus-css-core-v1".into(),
        entries: 1
      }]
    );
  }
}
