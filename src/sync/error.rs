use thiserror::Error;

use super::mutation::MutationKind;
use crate::net::FetchError;
use crate::scheduler::ScheduleError;

/// Why a single mutation attempt failed.
#[derive(Error, Debug)]
pub enum SyncError {
  #[error("No handler registered for {0}")]
  NoHandler(MutationKind),

  #[error("Invalid payload: {0}")]
  InvalidPayload(String),

  #[error(transparent)]
  Fetch(#[from] FetchError),

  #[error("Replay not run: {0}")]
  Scheduler(String),

  #[error("Storage error: {0}")]
  Storage(String),
}

impl From<ScheduleError<FetchError>> for SyncError {
  fn from(error: ScheduleError<FetchError>) -> Self {
    match error {
      ScheduleError::Executor(e) => SyncError::Fetch(e),
      other => SyncError::Scheduler(other.to_string()),
    }
  }
}
