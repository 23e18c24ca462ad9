//! Caching strategies applied to routed requests.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Origin;

use crate::clock::Clock;

use super::expiration::ExpirationPolicy;
use super::fetcher::{FetchError, Fetcher};
use super::request::{Request, Response};
use super::storage::{CacheEntry, CacheStorage};

/// Dependencies shared by the manager, its strategies and background tasks.
pub(crate) struct StrategyContext {
    pub storage: Arc<dyn CacheStorage>,
    pub fetcher: Arc<dyn Fetcher>,
    pub clock: Arc<dyn Clock>,
    pub origin: Origin,
    pub pending: Mutex<Vec<JoinHandle<()>>>,
}

impl StrategyContext {
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn is_same_origin(&self, request: &Request) -> bool {
        request.url.origin() == self.origin
    }

    /// Cached entry for `key`, ignoring entries past their max age.
    /// Storage failures read as a miss.
    pub async fn lookup(
        &self,
        partition: &str,
        key: &str,
        expiration: Option<&ExpirationPolicy>,
    ) -> Option<CacheEntry> {
        match self.storage.get(partition, key).await {
            Ok(Some(entry)) if expiration.map_or(false, |p| p.is_expired(&entry, self.now())) => {
                debug!(partition = partition, key = key, "Cached entry expired");
                None
            }
            Ok(entry) => entry,
            Err(e) => {
                warn!(partition = partition, error = %e, "Cache read failed");
                None
            }
        }
    }

    /// First entry for `key` in any partition.
    pub async fn lookup_any(&self, key: &str) -> Option<CacheEntry> {
        let partitions = match self.storage.partitions().await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "Failed to list cache partitions");
                return None;
            }
        };
        for partition in partitions {
            if let Some(entry) = self.lookup(&partition, key, None).await {
                return Some(entry);
            }
        }
        None
    }

    /// Store a copy of `response` when it may be cached. Failures are logged, never returned.
    pub async fn store(
        &self,
        partition: &str,
        request: &Request,
        response: &Response,
        expiration: Option<&ExpirationPolicy>,
    ) {
        if !response.is_cacheable() || !self.is_same_origin(request) {
            debug!(url = %request.url, status = response.status, "Response not cacheable");
            return;
        }

        let entry = CacheEntry::new(request.cache_key(), response.clone(), self.now());
        if let Err(e) = self.storage.put(partition, entry).await {
            warn!(partition = partition, url = %request.url, error = %e, "Cache write failed");
            return;
        }

        if let Some(policy) = expiration {
            if let Err(e) = policy.enforce(self.storage.as_ref(), partition, self.now()).await {
                warn!(partition = partition, error = %e, "Cache expiration failed");
            }
        }
    }

    pub fn track(&self, handle: JoinHandle<()>) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    CacheFirst,
    StaleWhileRevalidate,
    NetworkFirst,
}

/// A strategy bound to the partition it reads and writes.
#[derive(Debug, Clone)]
pub struct Strategy {
    pub kind: StrategyKind,
    pub partition: String,
    pub expiration: Option<ExpirationPolicy>,
    /// Partition and key served when network and cache both miss
    pub fallback: Option<(String, String)>,
}

impl Strategy {
    pub fn cache_first(partition: &str, expiration: ExpirationPolicy) -> Self {
        Self {
            kind: StrategyKind::CacheFirst,
            partition: partition.to_string(),
            expiration: Some(expiration),
            fallback: None,
        }
    }

    pub fn stale_while_revalidate(partition: &str) -> Self {
        Self {
            kind: StrategyKind::StaleWhileRevalidate,
            partition: partition.to_string(),
            expiration: None,
            fallback: None,
        }
    }

    pub fn network_first(partition: &str, expiration: ExpirationPolicy) -> Self {
        Self {
            kind: StrategyKind::NetworkFirst,
            partition: partition.to_string(),
            expiration: Some(expiration),
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, partition: &str, key: String) -> Self {
        self.fallback = Some((partition.to_string(), key));
        self
    }

    pub(crate) async fn handle(
        &self,
        ctx: &Arc<StrategyContext>,
        request: &Request,
    ) -> Result<Response, FetchError> {
        match self.kind {
            StrategyKind::CacheFirst => self.cache_first_fetch(ctx, request).await,
            StrategyKind::StaleWhileRevalidate => self.revalidating_fetch(ctx, request).await,
            StrategyKind::NetworkFirst => self.network_first_fetch(ctx, request).await,
        }
    }

    async fn cache_first_fetch(
        &self,
        ctx: &StrategyContext,
        request: &Request,
    ) -> Result<Response, FetchError> {
        let key = request.cache_key();
        if let Some(hit) = ctx
            .lookup(&self.partition, &key, self.expiration.as_ref())
            .await
        {
            debug!(partition = %self.partition, url = %request.url, "Cache hit");
            return Ok(hit.response);
        }

        let response = ctx.fetcher.fetch(request).await?;
        ctx.store(&self.partition, request, &response, self.expiration.as_ref())
            .await;
        Ok(response)
    }

    async fn revalidating_fetch(
        &self,
        ctx: &Arc<StrategyContext>,
        request: &Request,
    ) -> Result<Response, FetchError> {
        let key = request.cache_key();
        let Some(hit) = ctx
            .lookup(&self.partition, &key, self.expiration.as_ref())
            .await
        else {
            let response = ctx.fetcher.fetch(request).await?;
            ctx.store(&self.partition, request, &response, self.expiration.as_ref())
                .await;
            return Ok(response);
        };

        let background = Arc::clone(ctx);
        let strategy = self.clone();
        let request = request.clone();
        let handle = tokio::spawn(async move {
            match background.fetcher.fetch(&request).await {
                Ok(response) => {
                    background
                        .store(
                            &strategy.partition,
                            &request,
                            &response,
                            strategy.expiration.as_ref(),
                        )
                        .await;
                    debug!(url = %request.url, "Revalidated cached resource");
                }
                Err(e) => debug!(url = %request.url, error = %e, "Revalidation failed"),
            }
        });
        ctx.track(handle);

        Ok(hit.response)
    }

    async fn network_first_fetch(
        &self,
        ctx: &StrategyContext,
        request: &Request,
    ) -> Result<Response, FetchError> {
        let error = match ctx.fetcher.fetch(request).await {
            Ok(response) => {
                ctx.store(&self.partition, request, &response, self.expiration.as_ref())
                    .await;
                return Ok(response);
            }
            Err(e) => e,
        };

        warn!(url = %request.url, error = %error, "Network unavailable, falling back to cache");
        let key = request.cache_key();
        if let Some(hit) = ctx
            .lookup(&self.partition, &key, self.expiration.as_ref())
            .await
        {
            return Ok(hit.response);
        }

        if let Some((partition, key)) = &self.fallback {
            if let Some(page) = ctx.lookup(partition, key, None).await {
                debug!(url = %request.url, "Serving offline page");
                return Ok(page.response);
            }
        }

        Err(error)
    }
}
