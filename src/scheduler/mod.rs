//! Priority/rate-limited request scheduling for upstream APIs.
//!
//! One `RequestScheduler` is built per upstream service so each carries its own
//! concurrency cap and minimum spacing between dispatches.

mod error;
mod priority;
mod queue;

pub use error::ScheduleError;
pub use priority::Priority;
pub use queue::{QueueConfig, RequestScheduler, SchedulerStats};
