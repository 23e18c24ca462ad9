//! Core library for missionlink.
//!
//! Client-side data layer of the volunteer-matching application:
//!
//! - `api`: client for the remote data API (table reads and writes, RPC)
//! - `models`: missions, registrations, profiles, impact, notifications
//! - `offline`: offline cache manager with per-route caching strategies
//! - `query`: `{data, loading, error}` queries with a shared cache
//! - `resources`: the application's resources built on `query`
//! - `store`: durable single-value slots
//! - `config`: configuration file and environment overrides

pub mod api;
pub mod clock;
pub mod config;
pub mod models;
pub mod offline;
pub mod query;
pub mod resources;
pub mod store;
pub mod utils;

pub use api::{ApiError, DataApiClient, Filter};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use offline::{
    DiskCacheStorage, FetchError, HttpFetcher, MemoryCacheStorage, OfflineCacheManager, Request,
    Response, WorkerState,
};
pub use query::{MutationEffect, Query, QueryClient, QueryPhase, QueryState, RetryPolicy};
pub use resources::ResourceContext;
pub use store::LocalValue;
