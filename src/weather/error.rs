use thiserror::Error;

use crate::net::FetchError;
use crate::scheduler::ScheduleError;

/// Why the weather service could not serve any data.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WeatherError {
  /// Offline with no stored result to fall back on
  #[error("Offline and no cached {0}")]
  Offline(String),

  /// The scheduled request failed and nothing was cached
  #[error("{0}")]
  Request(#[from] ScheduleError<FetchError>),
}
