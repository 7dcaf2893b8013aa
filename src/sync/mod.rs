//! Durable offline mutation queue.
//!
//! Mutations that could not reach their upstream are persisted as one JSON
//! list and replayed through per-kind handlers once connectivity returns.
//! Each failure bumps a retry counter; a mutation that reaches the bound is
//! dropped and reported in the pass result.

mod connectivity;
mod error;
mod handlers;
mod mutation;
mod queue;

pub use connectivity::{BackgroundSync, Connectivity, OnlineFlag};
pub use error::SyncError;
pub use handlers::{
  CitySearchHandler, HandlerRegistry, LocationFetchHandler, MutationHandler, WeatherUpdateHandler,
};
pub use mutation::{MutationKind, PendingMutation, SyncResult};
pub use queue::{OfflineSyncQueue, SyncConfig, MAX_RETRY_COUNT, PENDING_MUTATIONS_KEY, RETRY_DELAY};
