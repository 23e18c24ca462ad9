use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use reqwest::Method;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::clock::{Clock, SystemClock};

use super::expiration::ExpirationPolicy;
use super::fetcher::{FetchError, Fetcher, HttpFetcher};
use super::request::{Destination, Request, Response};
use super::storage::{CacheEntry, CacheStorage, MemoryCacheStorage, StorageError};
use super::strategy::{Strategy, StrategyContext};

// ============================================================================
// Constants
// ============================================================================

/// Cache generation baked into the static and dynamic partition names.
pub const CACHE_VERSION: &str = "v1";

pub const IMAGE_CACHE: &str = "images";
pub const STATIC_RESOURCE_CACHE: &str = "static-resources";
pub const PAGE_CACHE: &str = "pages";

/// Image partition ceiling.
const IMAGE_MAX_ENTRIES: usize = 60;

/// Navigation document partition ceiling.
const PAGE_MAX_ENTRIES: usize = 50;

/// Max age of image and page entries.
const MAX_AGE_DAYS: i64 = 30;

/// Page served for failed navigations with nothing cached.
pub const OFFLINE_PAGE: &str = "/offline.html";

/// Application shell cached at install time.
pub const DEFAULT_PRECACHE: &[&str] = &[
    "/",
    "/index.html",
    "/manifest.json",
    OFFLINE_PAGE,
    "/icons/icon-192x192.png",
    "/icons/icon-512x512.png",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Parsed,
    Installing,
    Installed,
    Activating,
    Activated,
    /// Installation failed; this manager never activates
    Redundant,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerState::Parsed => write!(f, "parsed"),
            WorkerState::Installing => write!(f, "installing"),
            WorkerState::Installed => write!(f, "installed"),
            WorkerState::Activating => write!(f, "activating"),
            WorkerState::Activated => write!(f, "activated"),
            WorkerState::Redundant => write!(f, "redundant"),
        }
    }
}

/// Names of the partitions owned by one cache generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheNames {
    pub static_cache: String,
    pub dynamic_cache: String,
}

impl CacheNames {
    pub fn generation(version: &str) -> Self {
        Self {
            static_cache: format!("static-{}", version),
            dynamic_cache: format!("dynamic-{}", version),
        }
    }

    fn is_current(&self, name: &str) -> bool {
        name == self.static_cache || name == self.dynamic_cache
    }
}

impl Default for CacheNames {
    fn default() -> Self {
        Self::generation(CACHE_VERSION)
    }
}

/// Entry count of one partition.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionStats {
    pub name: String,
    pub entries: usize,
    pub newest: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RouteMatch {
    Image,
    StyleOrScript,
    Navigation,
}

impl RouteMatch {
    fn matches(&self, request: &Request) -> bool {
        match self {
            RouteMatch::Image => request.destination == Destination::Image,
            RouteMatch::StyleOrScript => matches!(
                request.destination,
                Destination::Style | Destination::Script
            ),
            RouteMatch::Navigation => request.is_navigation(),
        }
    }
}

struct Route {
    matcher: RouteMatch,
    strategy: Strategy,
}

pub struct ManagerBuilder {
    origin: Url,
    storage: Option<Arc<dyn CacheStorage>>,
    fetcher: Option<Arc<dyn Fetcher>>,
    clock: Arc<dyn Clock>,
    names: CacheNames,
    precache: Vec<String>,
    api_host: Option<String>,
}

impl ManagerBuilder {
    pub fn storage(mut self, storage: Arc<dyn CacheStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Cache generation, e.g. `v2` after a redeploy.
    pub fn generation(mut self, version: &str) -> Self {
        self.names = CacheNames::generation(version);
        self
    }

    /// Asset paths (relative to the origin) or absolute URLs to cache at install.
    pub fn precache<S: AsRef<str>>(mut self, assets: &[S]) -> Self {
        self.precache = assets.iter().map(|s| s.as_ref().to_string()).collect();
        self
    }

    /// Host of the data API; its requests always go to the network.
    pub fn api_host(mut self, host: &str) -> Self {
        self.api_host = Some(host.to_string());
        self
    }

    pub fn build(self) -> Result<OfflineCacheManager, FetchError> {
        let resolve = |asset: &str| -> Result<Url, FetchError> {
            self.origin.join(asset).map_err(|e| FetchError::Install {
                url: asset.to_string(),
                reason: e.to_string(),
            })
        };
        let precache = self
            .precache
            .iter()
            .map(|asset| resolve(asset.as_str()))
            .collect::<Result<Vec<_>, _>>()?;
        let offline_page = resolve(OFFLINE_PAGE)?;

        let fetcher = match self.fetcher {
            Some(f) => f,
            None => Arc::new(HttpFetcher::new(&self.origin)?),
        };
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryCacheStorage::new()));

        let offline_key = Request::get(offline_page.as_str())
            .map(|r| r.cache_key())
            .map_err(|e| FetchError::Install {
                url: offline_page.to_string(),
                reason: e.to_string(),
            })?;

        let routes = vec![
            Route {
                matcher: RouteMatch::Image,
                strategy: Strategy::cache_first(
                    IMAGE_CACHE,
                    ExpirationPolicy::new(IMAGE_MAX_ENTRIES, MAX_AGE_DAYS),
                ),
            },
            Route {
                matcher: RouteMatch::StyleOrScript,
                strategy: Strategy::stale_while_revalidate(STATIC_RESOURCE_CACHE),
            },
            Route {
                matcher: RouteMatch::Navigation,
                strategy: Strategy::network_first(
                    PAGE_CACHE,
                    ExpirationPolicy::new(PAGE_MAX_ENTRIES, MAX_AGE_DAYS),
                )
                .with_fallback(&self.names.static_cache, offline_key),
            },
        ];

        Ok(OfflineCacheManager {
            ctx: Arc::new(StrategyContext {
                storage,
                fetcher,
                clock: self.clock,
                origin: self.origin.origin(),
                pending: Mutex::new(Vec::new()),
            }),
            state: RwLock::new(WorkerState::Parsed),
            names: self.names,
            precache,
            api_host: self.api_host,
            routes,
        })
    }
}

/// Request interceptor keeping the application usable offline.
///
/// Lifecycle: `install` fills the static partition, `activate` purges
/// partitions of older generations, then `handle_fetch` serves requests.
pub struct OfflineCacheManager {
    ctx: Arc<StrategyContext>,
    state: RwLock<WorkerState>,
    names: CacheNames,
    precache: Vec<Url>,
    api_host: Option<String>,
    routes: Vec<Route>,
}

impl OfflineCacheManager {
    pub fn builder(app_origin: Url) -> ManagerBuilder {
        ManagerBuilder {
            origin: app_origin,
            storage: None,
            fetcher: None,
            clock: Arc::new(SystemClock),
            names: CacheNames::default(),
            precache: DEFAULT_PRECACHE.iter().map(|s| s.to_string()).collect(),
            api_host: None,
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn names(&self) -> &CacheNames {
        &self.names
    }

    fn set_state(&self, to: WorkerState) {
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = to;
    }

    fn transition(
        &self,
        from: WorkerState,
        to: WorkerState,
        action: &'static str,
    ) -> Result<(), FetchError> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if *state != from {
            return Err(FetchError::InvalidState {
                action,
                state: state.to_string(),
            });
        }
        *state = to;
        Ok(())
    }

    /// Fetch every precache asset and store them together. Any failure leaves
    /// the static partition untouched and the manager redundant.
    pub async fn install(&self) -> Result<(), FetchError> {
        self.transition(WorkerState::Parsed, WorkerState::Installing, "install")?;
        info!(assets = self.precache.len(), cache = %self.names.static_cache, "Installing offline cache");

        let now = self.ctx.now();
        let fetches = self.precache.iter().map(|url| async move {
            let request = Request::get(url.as_str()).map_err(|e| FetchError::Install {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
            let response = self
                .ctx
                .fetcher
                .fetch(&request)
                .await
                .map_err(|e| FetchError::Install {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;
            if !response.ok() {
                return Err(FetchError::Install {
                    url: url.to_string(),
                    reason: format!("status {}", response.status),
                });
            }
            Ok(CacheEntry::new(request.cache_key(), response, now))
        });

        let result = match try_join_all(fetches).await {
            Ok(entries) => self
                .ctx
                .storage
                .put_all(&self.names.static_cache, entries)
                .await
                .map_err(|e| FetchError::Install {
                    url: self.names.static_cache.clone(),
                    reason: e.to_string(),
                }),
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                self.set_state(WorkerState::Installed);
                info!("Offline cache installed");
                Ok(())
            }
            Err(e) => {
                self.set_state(WorkerState::Redundant);
                error!(error = %e, "Offline cache installation failed");
                Err(e)
            }
        }
    }

    /// Delete every partition outside the current generation.
    /// Returns the deleted partition names.
    pub async fn activate(&self) -> Result<Vec<String>, FetchError> {
        self.transition(WorkerState::Installed, WorkerState::Activating, "activate")?;

        let mut deleted = Vec::new();
        match self.ctx.storage.partitions().await {
            Ok(names) => {
                for name in names.into_iter().filter(|n| !self.names.is_current(n)) {
                    match self.ctx.storage.delete_partition(&name).await {
                        Ok(_) => {
                            info!(cache = %name, "Deleted obsolete cache");
                            deleted.push(name);
                        }
                        Err(e) => warn!(cache = %name, error = %e, "Failed to delete obsolete cache"),
                    }
                }
            }
            Err(e) => warn!(error = %e, "Failed to list caches during activation"),
        }

        self.set_state(WorkerState::Activated);
        info!(deleted = deleted.len(), "Offline cache activated");
        Ok(deleted)
    }

    /// Take control again with a static partition installed by an earlier run.
    /// Returns false when a fresh install is needed.
    pub async fn resume(&self) -> Result<bool, FetchError> {
        if self.state() != WorkerState::Parsed {
            return Err(FetchError::InvalidState {
                action: "resume",
                state: self.state().to_string(),
            });
        }
        for url in &self.precache {
            let key = Request::get(url.as_str())
                .map(|r| r.cache_key())
                .map_err(|e| FetchError::Install {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;
            if self
                .ctx
                .lookup(&self.names.static_cache, &key, None)
                .await
                .is_none()
            {
                debug!(url = %url, "Precache entry missing, cannot resume");
                return Ok(false);
            }
        }
        self.set_state(WorkerState::Activated);
        info!("Offline cache resumed");
        Ok(true)
    }

    fn is_api_request(&self, request: &Request) -> bool {
        match (&self.api_host, request.url.host_str()) {
            (Some(api), Some(host)) => api.eq_ignore_ascii_case(host),
            _ => false,
        }
    }

    /// Serve an intercepted request.
    pub async fn handle_fetch(&self, request: &Request) -> Result<Response, FetchError> {
        if request.method != Method::GET {
            debug!(method = %request.method, url = %request.url, "Passing through non-GET request");
            return self.ctx.fetcher.fetch(request).await;
        }
        if self.is_api_request(request) {
            return self.ctx.fetcher.fetch(request).await;
        }
        if self.state() != WorkerState::Activated {
            return self.ctx.fetcher.fetch(request).await;
        }

        if let Some(route) = self.routes.iter().find(|r| r.matcher.matches(request)) {
            return route.strategy.handle(&self.ctx, request).await;
        }

        let key = request.cache_key();
        if let Some(hit) = self.ctx.lookup_any(&key).await {
            debug!(url = %request.url, "Served from cache");
            return Ok(hit.response);
        }
        let response = self.ctx.fetcher.fetch(request).await?;
        self.ctx
            .store(&self.names.dynamic_cache, request, &response, None)
            .await;
        Ok(response)
    }

    /// Wait for background revalidations to finish.
    pub async fn wait_until_idle(&self) {
        loop {
            let handles = {
                let mut pending = self.ctx.pending.lock().unwrap_or_else(|e| e.into_inner());
                std::mem::take(&mut *pending)
            };
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    warn!(error = %e, "Background revalidation task failed");
                }
            }
        }
    }

    pub async fn stats(&self) -> Result<Vec<PartitionStats>, StorageError> {
        let mut stats = Vec::new();
        for name in self.ctx.storage.partitions().await? {
            let entries = self.ctx.storage.entries(&name).await?;
            stats.push(PartitionStats {
                newest: entries.iter().map(|e| e.stored_at).max(),
                entries: entries.len(),
                name,
            });
        }
        Ok(stats)
    }
}
