//! Cache strategy engine for intercepted resource fetches.
//!
//! This module:
//! - Classifies requests by path into versioned buckets with a fixed rule table
//! - Applies cache-first, stale-while-revalidate or network-first per bucket
//! - Computes staleness on read from each entry's stored timestamp
//! - Degrades to stale or synthetic responses instead of failing

mod engine;
mod rules;
mod traits;

pub use engine::{BucketStats, CacheStrategyEngine};
pub use rules::{CacheRule, CacheRules, CacheStrategy};
pub use traits::{CacheResult, CacheSource};
