//! Errors surfaced to callers of the scheduler.

use thiserror::Error;

/// Why a scheduled request did not produce a value.
///
/// `E` is the executor's own error type, passed through untouched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError<E> {
  /// The queue was at capacity; the request was never added
  #[error("Request queue is full ({capacity} pending)")]
  QueueFull { capacity: usize },

  /// The request was still queued when `clear()` ran
  #[error("Request was cleared from the queue before dispatch")]
  QueueCleared,

  /// The executor panicked before producing an outcome
  #[error("Request executor panicked")]
  ExecutorPanicked,

  /// The executor ran and failed
  #[error("{0}")]
  Executor(E),
}
