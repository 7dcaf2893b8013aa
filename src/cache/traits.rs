//! Provenance attached to every answer the engine and the weather service
//! hand back.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// An intercepted response or weather result, tagged with how it was
/// obtained so callers can tell a live answer from a degraded one.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  pub data: T,
  pub source: CacheSource,
  /// Store time of the cached copy; `None` for live or synthetic answers
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Answered by the upstream on this request.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Answered from a bucket, within its max age or past it.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      cached_at: Some(cached_at),
    }
  }

  /// The upstream could not be reached; this is the last stored copy.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }

  /// Nothing could answer; `data` is the synthetic 503.
  pub fn unavailable(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Unavailable,
      cached_at: None,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheSource {
  Network,
  /// Within the bucket's max age
  CacheFresh,
  /// Past max age, served because revalidation failed or was slow
  CacheStale,
  Offline,
  Unavailable,
}

impl fmt::Display for CacheSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let label = match self {
      CacheSource::Network => "network",
      CacheSource::CacheFresh => "cache (fresh)",
      CacheSource::CacheStale => "cache (stale)",
      CacheSource::Offline => "cache (offline)",
      CacheSource::Unavailable => "unavailable",
    };
    f.write_str(label)
  }
}
