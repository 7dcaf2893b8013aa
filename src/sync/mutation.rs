//! Persisted mutation records and pass results.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::scheduler::Priority;

/// What a pending mutation does once replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MutationKind {
  WeatherUpdate,
  CitySearch,
  LocationFetch,
  /// Tag written by a newer or foreign build; never has a handler
  #[serde(other)]
  Unknown,
}

impl fmt::Display for MutationKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      MutationKind::WeatherUpdate => write!(f, "weather-update"),
      MutationKind::CitySearch => write!(f, "city-search"),
      MutationKind::LocationFetch => write!(f, "location-fetch"),
      MutationKind::Unknown => write!(f, "unknown"),
    }
  }
}

impl std::str::FromStr for MutationKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "weather-update" => Ok(MutationKind::WeatherUpdate),
      "city-search" => Ok(MutationKind::CitySearch),
      "location-fetch" => Ok(MutationKind::LocationFetch),
      other => Err(format!("Unknown mutation type: {}", other)),
    }
  }
}

/// A mutation waiting to be replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMutation {
  pub id: String,
  #[serde(rename = "type")]
  pub kind: MutationKind,
  pub payload: Value,
  /// Milliseconds since the Unix epoch when the mutation was queued
  pub timestamp: i64,
  #[serde(default)]
  pub retry_count: u32,
  #[serde(default)]
  pub priority: Priority,
}

/// Outcome of one processing pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
  /// A pass ran and every attempted mutation succeeded
  pub success: bool,
  pub processed: usize,
  pub failed: usize,
  pub errors: Vec<String>,
}

impl SyncResult {
  /// Result for a pass that did not run.
  pub fn skipped(reason: &str) -> Self {
    Self {
      success: false,
      processed: 0,
      failed: 0,
      errors: vec![reason.to_string()],
    }
  }
}
