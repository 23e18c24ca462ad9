//! Shared cache and request de-duplication for resource queries.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::debug;

use crate::api::ApiError;
use crate::clock::{Clock, SystemClock};

use super::RetryPolicy;

/// How long a cached value is served without refetching.
const DEFAULT_STALE_TIME_SECS: u64 = 30;

type AnyValue = Arc<dyn Any + Send + Sync>;
type FetchOutcome = Result<AnyValue, Arc<ApiError>>;
type SharedFetch = Shared<BoxFuture<'static, FetchOutcome>>;

struct CacheSlot {
    value: AnyValue,
    fetched_at: DateTime<Utc>,
}

struct InFlight {
    id: u64,
    fetch: SharedFetch,
}

struct ClientInner {
    cache: Mutex<HashMap<String, CacheSlot>>,
    in_flight: Mutex<HashMap<String, InFlight>>,
    next_id: AtomicU64,
    clock: Arc<dyn Clock>,
    stale_time: chrono::Duration,
    retry: RetryPolicy,
}

impl ClientInner {
    /// Insert a value, dropping every slot that has gone stale.
    fn store(&self, key: &str, value: AnyValue) {
        let now = self.clock.now();
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.retain(|_, slot| now - slot.fetched_at < self.stale_time);
        cache.insert(
            key.to_string(),
            CacheSlot {
                value,
                fetched_at: now,
            },
        );
    }

    fn finish(&self, key: &str, id: u64, outcome: &FetchOutcome) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        // A forced fetch may have replaced this one; only the registered fetch commits
        if in_flight.get(key).map(|f| f.id) != Some(id) {
            return;
        }
        in_flight.remove(key);
        if let Ok(value) = outcome {
            self.store(key, Arc::clone(value));
        }
    }
}

/// Cache shared by every query of the application.
///
/// Values are keyed by query key and served while younger than the stale
/// time. Concurrent fetches of one key share a single request. Fetches retry
/// transient failures according to the client's `RetryPolicy`.
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<ClientInner>,
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryClient {
    pub fn new() -> Self {
        Self::with_options(
            Arc::new(SystemClock),
            Duration::from_secs(DEFAULT_STALE_TIME_SECS),
            RetryPolicy::default(),
        )
    }

    pub fn with_options(clock: Arc<dyn Clock>, stale_time: Duration, retry: RetryPolicy) -> Self {
        let stale_time = chrono::Duration::from_std(stale_time)
            .unwrap_or_else(|_| chrono::Duration::seconds(DEFAULT_STALE_TIME_SECS as i64));
        Self {
            inner: Arc::new(ClientInner {
                cache: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                clock,
                stale_time,
                retry,
            }),
        }
    }

    /// Fresh cached value of `key`, if it holds a `T`.
    pub fn get_cached<T: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<T>> {
        let cache = self.inner.cache.lock().unwrap_or_else(|e| e.into_inner());
        let slot = cache.get(key)?;
        if self.inner.clock.now() - slot.fetched_at >= self.inner.stale_time {
            return None;
        }
        Arc::clone(&slot.value).downcast::<T>().ok()
    }

    /// Replace the cached value of `key`, e.g. after a local patch.
    pub fn set_cached<T: Send + Sync + 'static>(&self, key: &str, value: T) {
        self.inner.store(key, Arc::new(value));
    }

    /// Drop every cached value whose key starts with `prefix`.
    pub fn invalidate(&self, prefix: &str) -> usize {
        let mut cache = self.inner.cache.lock().unwrap_or_else(|e| e.into_inner());
        let before = cache.len();
        cache.retain(|key, _| !key.starts_with(prefix));
        let removed = before - cache.len();
        if removed > 0 {
            debug!(prefix = prefix, removed = removed, "Invalidated cached queries");
        }
        removed
    }

    /// Fetch the value of `key`.
    ///
    /// Unless `force` is set, a fresh cached value is returned directly and a
    /// fetch already in flight for `key` is joined instead of starting another.
    pub async fn fetch<T, F, Fut>(&self, key: &str, force: bool, fetcher: F) -> Result<Arc<T>, Arc<ApiError>>
    where
        T: Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
    {
        if !force {
            if let Some(value) = self.get_cached::<T>(key) {
                debug!(key = key, "Query served from cache");
                return Ok(value);
            }
        }

        let fetch = {
            let mut in_flight = self.inner.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            match in_flight.get(key) {
                Some(existing) if !force => {
                    debug!(key = key, "Joining in-flight query");
                    existing.fetch.clone()
                }
                _ => {
                    let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
                    let fetch = self.start(key.to_string(), id, fetcher);
                    in_flight.insert(
                        key.to_string(),
                        InFlight {
                            id,
                            fetch: fetch.clone(),
                        },
                    );
                    fetch
                }
            }
        };

        let value = fetch.await?;
        value.downcast::<T>().map_err(|_| {
            Arc::new(ApiError::InvalidResponse(format!(
                "Cached value for {} has an unexpected type",
                key
            )))
        })
    }

    fn start<T, F, Fut>(&self, key: String, id: u64, fetcher: F) -> SharedFetch
    where
        T: Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        async move {
            debug!(key = %key, "Query fetch started");
            let outcome: FetchOutcome = inner
                .retry
                .run(&key, &fetcher)
                .await
                .map(|value| Arc::new(value) as AnyValue)
                .map_err(Arc::new);
            inner.finish(&key, id, &outcome);
            outcome
        }
        .boxed()
        .shared()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use std::sync::atomic::AtomicUsize;

    fn client_with_clock() -> (QueryClient, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap(),
        ));
        let client = QueryClient::with_options(
            clock.clone(),
            Duration::from_secs(30),
            RetryPolicy::none(),
        );
        (client, clock)
    }

    fn counting_fetcher(
        calls: &Arc<AtomicUsize>,
        value: &'static str,
    ) -> impl Fn() -> BoxFuture<'static, Result<String, ApiError>> + Send + Sync + 'static {
        let calls = Arc::clone(calls);
        move || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok::<_, ApiError>(value.to_string())
            }
            .boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_fetches_share_one_request() {
        let (client, _) = client_with_clock();
        let calls = Arc::new(AtomicUsize::new(0));

        let (a, b) = tokio::join!(
            client.fetch("missions:all", false, counting_fetcher(&calls, "rows")),
            client.fetch("missions:all", false, counting_fetcher(&calls, "rows")),
        );

        assert_eq!(*a.unwrap(), "rows");
        assert_eq!(*b.unwrap(), "rows");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_value_served_from_cache_until_stale() {
        let (client, clock) = client_with_clock();
        let calls = Arc::new(AtomicUsize::new(0));

        client.fetch("badges:u1", false, counting_fetcher(&calls, "b")).await.unwrap();
        client.fetch("badges:u1", false, counting_fetcher(&calls, "b")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        clock.advance(chrono::Duration::seconds(31));
        client.fetch("badges:u1", false, counting_fetcher(&calls, "b")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_bypasses_cache() {
        let (client, _) = client_with_clock();
        let calls = Arc::new(AtomicUsize::new(0));
        client.fetch("profile:u1", false, counting_fetcher(&calls, "p")).await.unwrap();
        client.fetch("profile:u1", true, counting_fetcher(&calls, "p")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let (client, _) = client_with_clock();
        let failed: Result<Arc<String>, _> = client
            .fetch("impact:u1", false, || async {
                Err(ApiError::NotFound("impact".to_string()))
            })
            .await;
        assert!(failed.is_err());
        assert!(client.get_cached::<String>("impact:u1").is_none());
    }

    #[test]
    fn test_invalidate_by_prefix() {
        let (client, _) = client_with_clock();
        client.set_cached("registrations:u1", vec![1]);
        client.set_cached("registrations:u2", vec![2]);
        client.set_cached("profile:u1", 3);

        assert_eq!(client.invalidate("registrations:"), 2);
        assert!(client.get_cached::<Vec<i32>>("registrations:u1").is_none());
        assert_eq!(*client.get_cached::<i32>("profile:u1").unwrap(), 3);
    }

    #[tokio::test]
    async fn test_stale_slots_are_pruned_on_write() {
        let (client, clock) = client_with_clock();
        client.set_cached("missions:a", 1);
        client.set_cached("missions:b", 2);

        clock.advance(chrono::Duration::seconds(31));
        client
            .fetch("profile:u1", false, || async { Ok::<_, ApiError>(3) })
            .await
            .unwrap();

        let cache = client.inner.cache.lock().unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.contains_key("profile:u1"));
    }

    #[test]
    fn test_type_mismatch_reads_as_miss() {
        let (client, _) = client_with_clock();
        client.set_cached("missions:all", 7u32);
        assert!(client.get_cached::<String>("missions:all").is_none());
    }
}
