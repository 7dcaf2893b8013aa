//! Priority classes shared by the scheduler and the sync queue.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Priority class. Declaration order is urgency order: `High < Medium < Low`.
#[derive(
  Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
  High,
  #[default]
  Medium,
  Low,
}

impl fmt::Display for Priority {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Priority::High => write!(f, "high"),
      Priority::Medium => write!(f, "medium"),
      Priority::Low => write!(f, "low"),
    }
  }
}

impl std::str::FromStr for Priority {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "high" => Ok(Priority::High),
      "medium" => Ok(Priority::Medium),
      "low" => Ok(Priority::Low),
      other => Err(format!("Unknown priority: {}", other)),
    }
  }
}
