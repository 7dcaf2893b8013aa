//! Network primitives shared by every other layer.
//!
//! - `FetchRequest` / `FetchResponse`: transport-neutral request and response values
//! - `Transport`: the seam between the crate and an actual HTTP stack
//! - `NetworkFetchHelper`: timeout-bounded fetch with fixed-delay retry

mod error;
mod fetch;
#[cfg(test)]
pub mod mock;
mod transport;
mod types;

pub use error::FetchError;
pub use fetch::NetworkFetchHelper;
pub use transport::{HttpTransport, Transport};
pub use types::{FetchRequest, FetchResponse, Method};
