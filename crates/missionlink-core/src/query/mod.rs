//! Resource query layer.
//!
//! A `Query<K, T>` tracks one resource as `{data, loading, error}` and
//! re-fetches whenever its dependency key changes. All queries of an
//! application share one `QueryClient`, which caches values for a short
//! freshness window, joins concurrent fetches of the same key, and retries
//! transient failures.

mod client;
#[allow(clippy::module_inception)]
mod query;
mod retry;
mod state;

pub use client::QueryClient;
pub use query::{MutationEffect, Query};
pub use retry::RetryPolicy;
pub use state::{QueryPhase, QueryState};
