use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::scheduler::QueueConfig;
use crate::sync::SyncConfig;

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
  pub api: ApiConfig,
  pub network: NetworkConfig,
  pub schedulers: SchedulersConfig,
  pub sync: SyncSection,
  pub cache: CacheConfig,
  pub storage: StorageConfig,
  pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiConfig {
  pub forecast_url: String,
  pub geocoding_url: String,
  /// Client identifier sent to the geocoding service, which rejects
  /// anonymous clients
  pub user_agent: String,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      forecast_url: "https://api.open-meteo.com/v1/forecast".to_string(),
      geocoding_url: "https://nominatim.openstreetmap.org".to_string(),
      user_agent: format!("nimbus/{}", env!("CARGO_PKG_VERSION")),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct NetworkConfig {
  /// Per-attempt timeout
  pub timeout_ms: u64,
  pub max_attempts: u32,
  pub retry_delay_ms: u64,
  /// How long background refreshes and sync passes may run after a command
  /// has produced its output
  pub drain_timeout_ms: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      timeout_ms: 10_000,
      max_attempts: 3,
      retry_delay_ms: 1000,
      drain_timeout_ms: 15_000,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct SchedulerConfig {
  pub max_concurrent: usize,
  pub min_delay_ms: u64,
  pub batch_window_ms: u64,
  pub max_queue_size: usize,
}

impl SchedulerConfig {
  pub fn queue_config(&self) -> QueueConfig {
    QueueConfig {
      max_concurrent: self.max_concurrent.max(1),
      min_delay: Duration::from_millis(self.min_delay_ms),
      batch_window: Duration::from_millis(self.batch_window_ms),
      max_queue_size: self.max_queue_size,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulersConfig {
  pub geocoding: SchedulerConfig,
  pub forecast: SchedulerConfig,
}

impl Default for SchedulersConfig {
  fn default() -> Self {
    Self {
      geocoding: SchedulerConfig {
        max_concurrent: 1,
        min_delay_ms: 1200,
        batch_window_ms: 100,
        max_queue_size: 10,
      },
      forecast: SchedulerConfig {
        max_concurrent: 2,
        min_delay_ms: 100,
        batch_window_ms: 50,
        max_queue_size: 20,
      },
    }
  }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SyncSection {
  pub max_retry_count: u32,
  pub retry_delay_ms: u64,
}

impl Default for SyncSection {
  fn default() -> Self {
    Self {
      max_retry_count: 3,
      retry_delay_ms: 5000,
    }
  }
}

impl SyncSection {
  pub fn sync_config(&self) -> SyncConfig {
    SyncConfig {
      max_retry_count: self.max_retry_count,
      retry_delay: Duration::from_millis(self.retry_delay_ms),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Base for relative resource URLs given to `fetch` and `precache`
  pub origin: String,
  pub prefix: String,
  /// Bumping this orphans every existing bucket on the next `activate`
  pub version: String,
  pub revalidate_timeout_ms: u64,
  /// Resources stored by `precache` when no URLs are given
  pub precache: Vec<String>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      origin: "http://localhost:8080".to_string(),
      prefix: "nimbus".to_string(),
      version: "v1".to_string(),
      revalidate_timeout_ms: 3000,
      precache: vec![
        "/index.html".to_string(),
        "/css/core.css".to_string(),
        "/js/app.js".to_string(),
      ],
    }
  }
}

impl CacheConfig {
  /// Resolve `url` against the configured origin unless already absolute.
  pub fn absolute_url(&self, url: &str) -> Result<String> {
    if url::Url::parse(url).is_ok() {
      return Ok(url.to_string());
    }
    let base = url::Url::parse(&self.origin)
      .map_err(|e| eyre!("Invalid cache origin {}: {}", self.origin, e))?;
    let joined = base
      .join(url)
      .map_err(|e| eyre!("Invalid resource URL {}: {}", url, e))?;
    Ok(joined.into())
  }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
  /// Database file; defaults to the user data directory
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
  /// Filter used when RUST_LOG is unset
  pub level: String,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./nimbus.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/nimbus/config.yaml
  ///
  /// Built-in defaults are used when no file exists.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    Ok(config.with_env_overrides())
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("nimbus.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("nimbus").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Apply NIMBUS_USER_AGENT when set.
  fn with_env_overrides(mut self) -> Self {
    if let Ok(agent) = std::env::var("NIMBUS_USER_AGENT") {
      if !agent.trim().is_empty() {
        self.api.user_agent = agent;
      }
    }
    self
  }

  pub fn network_timeout(&self) -> Duration {
    Duration::from_millis(self.network.timeout_ms)
  }

  pub fn retry_delay(&self) -> Duration {
    Duration::from_millis(self.network.retry_delay_ms)
  }

  pub fn drain_timeout(&self) -> Duration {
    Duration::from_millis(self.network.drain_timeout_ms)
  }

  pub fn revalidate_timeout(&self) -> Duration {
    Duration::from_millis(self.cache.revalidate_timeout_ms)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn test_defaults() {
    let config = Config::default();
    let geocoding = config.schedulers.geocoding.queue_config();

    assert_eq!(geocoding.max_concurrent, 1);
    assert_eq!(geocoding.min_delay, Duration::from_millis(1200));
    assert_eq!(config.sync.sync_config().max_retry_count, 3);
    assert_eq!(config.cache.version, "v1");
    assert_eq!(config.log.level, "info");
    assert_eq!(config.drain_timeout(), Duration::from_secs(15));
  }

  #[test]
  fn test_partial_file_keeps_other_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("config.yaml");
    std::fs::write(
      &path,
      "cache:\n  version: v7\nschedulers:\n  forecast:\n    max_concurrent: 4\n    min_delay_ms: 0\n    batch_window_ms: 10\n    max_queue_size: 5\n",
    )
    .unwrap();

    let config = Config::load_from_path(&path).unwrap();

    assert_eq!(config.cache.version, "v7");
    assert_eq!(config.cache.prefix, "nimbus");
    assert_eq!(config.schedulers.forecast.max_concurrent, 4);
    assert_eq!(config.schedulers.geocoding.min_delay_ms, 1200);
    assert_eq!(config.network.max_attempts, 3);
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("absent.yaml");
    assert!(Config::load(Some(path.as_path())).is_err());
  }

  #[test]
  fn test_invalid_yaml_is_an_error() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("config.yaml");
    std::fs::write(&path, "network: [unclosed").unwrap();
    assert!(Config::load_from_path(&path).is_err());
  }

  #[test]
  fn test_absolute_url() {
    let cache = CacheConfig::default();
    assert_eq!(
      cache.absolute_url("/css/core.css").unwrap(),
      "http://localhost:8080/css/core.css"
    );
    assert_eq!(
      cache.absolute_url("https://cdn.test/a.js").unwrap(),
      "https://cdn.test/a.js"
    );
  }
}
