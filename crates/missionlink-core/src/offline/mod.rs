//! Offline cache manager.
//!
//! Intercepts application requests and serves them from named cache
//! partitions according to per-route strategies:
//!
//! - images: cache-first, 60 entries / 30 days
//! - scripts and styles: stale-while-revalidate
//! - navigations: network-first with an offline page fallback
//! - any other GET: generic lookup across partitions, copy into `dynamic-v1`
//!
//! Data API requests and non-GET requests always go straight to the network.

pub mod disk;
pub mod expiration;
pub mod fetcher;
pub mod manager;
pub mod request;
pub mod storage;
mod strategy;

pub use disk::DiskCacheStorage;
pub use expiration::ExpirationPolicy;
pub use fetcher::{FetchError, Fetcher, HttpFetcher};
pub use manager::{
    CacheNames, ManagerBuilder, OfflineCacheManager, PartitionStats, WorkerState, DEFAULT_PRECACHE,
    IMAGE_CACHE, OFFLINE_PAGE, PAGE_CACHE, STATIC_RESOURCE_CACHE,
};
pub use request::{Destination, Request, RequestMode, Response, ResponseType};
pub use storage::{CacheEntry, CacheStorage, MemoryCacheStorage, StorageError};
