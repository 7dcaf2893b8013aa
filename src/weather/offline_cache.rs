//! Last known good upstream results, served while offline.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::warn;

use super::types::Coordinates;
use crate::storage::KeyValueStore;

/// Which upstream result a record holds.
#[derive(Clone, Debug, PartialEq)]
pub enum OfflineKey {
  /// Forward geocoding search
  Search { query: String },
  /// Forecast for a location
  Forecast { coordinates: Coordinates },
  /// Reverse geocoding of a location
  Location { coordinates: Coordinates },
}

impl OfflineKey {
  /// Stable storage key.
  pub fn storage_key(&self) -> String {
    let input = match self {
      Self::Search { query } => format!("search:{}", normalize_query(query)),
      Self::Forecast { coordinates } => format!("forecast:{}", coordinates),
      Self::Location { coordinates } => format!("location:{}", coordinates),
    };

    // SHA256 keeps arbitrary user queries to a fixed-length key
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("offline.{}", hex::encode(hasher.finalize()))
  }

  pub fn description(&self) -> String {
    match self {
      Self::Search { query } => format!("search '{}'", query),
      Self::Forecast { coordinates } => format!("forecast at {}", coordinates),
      Self::Location { coordinates } => format!("location at {}", coordinates),
    }
  }
}

/// Trims and lowercases so "Paris " and "paris" share a record.
fn normalize_query(query: &str) -> String {
  query.trim().to_lowercase()
}

/// A stored result with its age.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineRecord<T> {
  pub data: T,
  pub cached_at: DateTime<Utc>,
}

/// Key/value backed store of the latest successful upstream results.
#[derive(Clone)]
pub struct OfflineResultCache {
  store: Arc<dyn KeyValueStore>,
}

impl OfflineResultCache {
  pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
    Self { store }
  }

  pub fn put<T: Serialize>(&self, key: &OfflineKey, data: &T) -> Result<()> {
    let record = OfflineRecord {
      data,
      cached_at: Utc::now(),
    };
    let json = serde_json::to_string(&record)
      .map_err(|e| eyre!("Failed to serialize {}: {}", key.description(), e))?;
    self.store.set(&key.storage_key(), &json)
  }

  /// Read a record. Unreadable records are treated as missing.
  pub fn get<T: DeserializeOwned>(&self, key: &OfflineKey) -> Result<Option<OfflineRecord<T>>> {
    let Some(json) = self.store.get(&key.storage_key())? else {
      return Ok(None);
    };

    match serde_json::from_str(&json) {
      Ok(record) => Ok(Some(record)),
      Err(e) => {
        warn!("Discarding unreadable offline {}: {}", key.description(), e);
        Ok(None)
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::storage::MemoryStore;

  #[test]
  fn test_query_normalization_shares_key() {
    let a = OfflineKey::Search {
      query: "  Paris".into(),
    };
    let b = OfflineKey::Search {
      query: "paris ".into(),
    };
    assert_eq!(a.storage_key(), b.storage_key());
    assert!(a.storage_key().starts_with("offline."));
  }

  #[test]
  fn test_kinds_do_not_collide() {
    let coordinates = Coordinates::new(1.0, 2.0);
    assert_ne!(
      OfflineKey::Forecast { coordinates }.storage_key(),
      OfflineKey::Location { coordinates }.storage_key()
    );
  }

  #[test]
  fn test_put_then_get() {
    let cache = OfflineResultCache::new(Arc::new(MemoryStore::new()));
    let key = OfflineKey::Search {
      query: "oslo".into(),
    };

    cache.put(&key, &vec!["Oslo".to_string()]).unwrap();
    let record: OfflineRecord<Vec<String>> = cache.get(&key).unwrap().unwrap();
    assert_eq!(record.data, vec!["Oslo"]);
  }

  #[test]
  fn test_corrupt_record_reads_as_missing() {
    let store = Arc::new(MemoryStore::new());
    let key = OfflineKey::Search {
      query: "rome".into(),
    };
    store.set(&key.storage_key(), "{not json").unwrap();

    let cache = OfflineResultCache::new(store);
    let record: Option<OfflineRecord<Vec<String>>> = cache.get(&key).unwrap();
    assert!(record.is_none());
  }
}
