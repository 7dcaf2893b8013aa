//! In-memory storage backend.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use super::traits::{CacheStore, CachedResponse, KeyValueStore};

/// Process-local storage. Nothing survives a restart; used when persistence is
/// disabled and in tests.
#[derive(Default)]
pub struct MemoryStore {
  values: RwLock<HashMap<String, String>>,
  buckets: RwLock<BTreeMap<String, BTreeMap<String, CachedResponse>>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl KeyValueStore for MemoryStore {
  fn get(&self, key: &str) -> Result<Option<String>> {
    let values = self.values.read().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(values.get(key).cloned())
  }

  fn set(&self, key: &str, value: &str) -> Result<()> {
    let mut values = self.values.write().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    values.insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    let mut values = self.values.write().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    values.remove(key);
    Ok(())
  }
}

impl CacheStore for MemoryStore {
  fn get_entry(&self, bucket: &str, url: &str) -> Result<Option<CachedResponse>> {
    let buckets = self.buckets.read().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(buckets.get(bucket).and_then(|b| b.get(url)).cloned())
  }

  fn put_entry(&self, bucket: &str, url: &str, entry: &CachedResponse) -> Result<()> {
    let mut buckets = self.buckets.write().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    buckets
      .entry(bucket.to_string())
      .or_default()
      .insert(url.to_string(), entry.clone());
    Ok(())
  }

  fn delete_entry(&self, bucket: &str, url: &str) -> Result<bool> {
    let mut buckets = self.buckets.write().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let Some(entries) = buckets.get_mut(bucket) else {
      return Ok(false);
    };
    let removed = entries.remove(url).is_some();
    if entries.is_empty() {
      buckets.remove(bucket);
    }
    Ok(removed)
  }

  fn list_entries(&self, bucket: &str) -> Result<Vec<(String, DateTime<Utc>)>> {
    let buckets = self.buckets.read().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(
      buckets
        .get(bucket)
        .map(|entries| {
          entries
            .iter()
            .map(|(url, entry)| (url.clone(), entry.cached_at))
            .collect()
        })
        .unwrap_or_default(),
    )
  }

  fn bucket_names(&self) -> Result<Vec<String>> {
    let buckets = self.buckets.read().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(buckets.keys().cloned().collect())
  }

  fn delete_bucket(&self, bucket: &str) -> Result<usize> {
    let mut buckets = self.buckets.write().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(buckets.remove(bucket).map(|b| b.len()).unwrap_or(0))
  }
}
