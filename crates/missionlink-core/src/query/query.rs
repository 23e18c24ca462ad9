use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::api::ApiError;

use super::{QueryClient, QueryState};

type QueryFn<K, T> = Arc<dyn Fn(K) -> BoxFuture<'static, Result<T, ApiError>> + Send + Sync>;

/// What to do with a query's data after a successful mutation.
pub enum MutationEffect<T> {
    /// Discard cached values of this query and fetch again
    Refetch,
    /// Like `Refetch`, also discarding cached values of the named queries
    /// whose data derives from the mutated rows
    RefetchWith(Vec<String>),
    /// Patch the current data in place
    Patch(Box<dyn FnOnce(&mut T) + Send>),
}

impl<T> MutationEffect<T> {
    pub fn patch(f: impl FnOnce(&mut T) + Send + 'static) -> Self {
        MutationEffect::Patch(Box::new(f))
    }

    pub fn refetch_with(queries: &[&str]) -> Self {
        MutationEffect::RefetchWith(queries.iter().map(|q| q.to_string()).collect())
    }
}

struct QueryInner<K, T> {
    client: QueryClient,
    name: String,
    fetcher: QueryFn<K, T>,
    /// Also serializes generation bumps and commits
    key: Mutex<Option<K>>,
    /// Bumped by every fetch start or reset; only the latest may commit
    generation: AtomicU64,
    state: watch::Sender<QueryState<T>>,
}

/// One logical resource keyed by its dependency `K`.
///
/// The query fetches whenever its key changes and publishes
/// `QueryState` snapshots to subscribers. Cloning yields another handle to
/// the same query.
pub struct Query<K, T> {
    inner: Arc<QueryInner<K, T>>,
}

impl<K, T> Clone for Query<K, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, T> Query<K, T>
where
    K: Clone + PartialEq + Serialize + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new<F, Fut>(client: QueryClient, name: &str, fetcher: F) -> Self
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
    {
        let (state, _) = watch::channel(QueryState::idle());
        Self {
            inner: Arc::new(QueryInner {
                client,
                name: name.to_string(),
                fetcher: Arc::new(move |key: K| -> BoxFuture<'static, Result<T, ApiError>> {
                    fetcher(key).boxed()
                }),
                key: Mutex::new(None),
                generation: AtomicU64::new(0),
                state,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn key(&self) -> Option<K> {
        self.lock_key().clone()
    }

    pub fn state(&self) -> QueryState<T> {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<QueryState<T>> {
        self.inner.state.subscribe()
    }

    /// Shared-cache key of `key`: the query name plus the key as JSON.
    fn cache_key(&self, key: &K) -> String {
        let encoded = serde_json::to_string(key).unwrap_or_default();
        format!("{}:{}", self.inner.name, encoded)
    }

    fn lock_key(&self) -> std::sync::MutexGuard<'_, Option<K>> {
        self.inner.key.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a new generation; the caller holds the key lock.
    fn begin(&self, update: impl FnOnce(&mut QueryState<T>)) -> u64 {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.state.send_modify(update);
        generation
    }

    /// Point the query at a new dependency key.
    ///
    /// `None` resets the query to idle without fetching. An unchanged key is
    /// a no-op. Completes when the triggered fetch has committed or been
    /// superseded.
    pub async fn set_key(&self, key: Option<K>) {
        let generation = {
            let mut current = self.lock_key();
            if *current == key {
                return;
            }
            current.clone_from(&key);
            match key {
                Some(_) => self.begin(|s| s.start()),
                None => self.begin(|s| *s = QueryState::idle()),
            }
        };

        match key {
            Some(key) => self.run(key, generation, false).await,
            None => debug!(query = %self.inner.name, "Query reset to idle"),
        }
    }

    /// Fetch the current key again, bypassing the shared cache.
    pub async fn refetch(&self) {
        let started = {
            let current = self.lock_key();
            current
                .clone()
                .map(|key| (key, self.begin(|s| s.start())))
        };
        match started {
            Some((key, generation)) => self.run(key, generation, true).await,
            None => debug!(query = %self.inner.name, "Refetch ignored, no key"),
        }
    }

    async fn run(&self, key: K, generation: u64, force: bool) {
        let fetcher = Arc::clone(&self.inner.fetcher);
        let fetch_key = key.clone();
        let result = self
            .inner
            .client
            .fetch(&self.cache_key(&key), force, move || fetcher(fetch_key.clone()))
            .await;

        let _current = self.lock_key();
        if self.inner.generation.load(Ordering::SeqCst) != generation {
            debug!(query = %self.inner.name, "Discarding superseded fetch");
            return;
        }

        match result {
            Ok(data) => self.inner.state.send_modify(|s| s.succeed(T::clone(&data))),
            Err(e) => {
                warn!(query = %self.inner.name, error = %e, "Query failed");
                self.inner.state.send_modify(|s| s.fail(e.to_string()));
            }
        }
    }

    /// Hold the query in `loading` without a key, e.g. while an upstream
    /// dependency is still resolving.
    pub fn set_pending(&self) {
        self.clear_key(|s| s.start());
    }

    /// Fail the query without fetching.
    pub fn set_error(&self, message: impl Into<String>) {
        let message = message.into();
        self.clear_key(|s| s.fail(message));
    }

    fn clear_key(&self, update: impl FnOnce(&mut QueryState<T>)) {
        let mut current = self.lock_key();
        *current = None;
        self.begin(update);
    }

    /// Run a server call, then apply `effect` to this query.
    ///
    /// On failure the query state is left untouched and the error returned.
    pub async fn mutate<R, Fut>(&self, op: Fut, effect: MutationEffect<T>) -> Result<R, ApiError>
    where
        Fut: Future<Output = Result<R, ApiError>>,
    {
        let output = match op.await {
            Ok(output) => output,
            Err(e) => {
                warn!(query = %self.inner.name, error = %e, "Mutation failed");
                return Err(e);
            }
        };

        match effect {
            MutationEffect::Refetch => {
                self.inner.client.invalidate(&cache_prefix(&self.inner.name));
                self.refetch().await;
            }
            MutationEffect::RefetchWith(derived) => {
                for name in &derived {
                    self.inner.client.invalidate(&cache_prefix(name));
                }
                self.inner.client.invalidate(&cache_prefix(&self.inner.name));
                self.refetch().await;
            }
            MutationEffect::Patch(patch) => {
                let mut patched = None;
                self.inner.state.send_modify(|s| {
                    if let Some(data) = s.data.as_mut() {
                        patch(data);
                        patched = Some(data.clone());
                    }
                });
                if let (Some(data), Some(key)) = (patched, self.key()) {
                    self.inner.client.set_cached(&self.cache_key(&key), data);
                }
            }
        }
        Ok(output)
    }
}

/// Shared-cache key prefix of every key of the query `name`.
fn cache_prefix(name: &str) -> String {
    format!("{}:", name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{QueryPhase, RetryPolicy};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn client() -> QueryClient {
        QueryClient::with_options(
            Arc::new(crate::clock::SystemClock),
            Duration::from_secs(60),
            RetryPolicy::none(),
        )
    }

    /// Query returning `n * 10` for key `n` after `n` milliseconds.
    fn slow_query(calls: Arc<AtomicUsize>) -> Query<u64, u64> {
        Query::new(client(), "numbers", move |n: u64| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(n)).await;
                Ok(n * 10)
            }
        })
    }

    #[tokio::test]
    async fn test_none_key_stays_idle() {
        let query = slow_query(Arc::new(AtomicUsize::new(0)));
        query.set_key(None).await;
        let state = query.state();
        assert_eq!(state.phase, QueryPhase::Idle);
        assert!(!state.loading);
        assert!(state.data.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_loading_success_with_empty_collection() {
        let query: Query<String, Vec<String>> =
            Query::new(client(), "missions", |_category: String| async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(Vec::new())
            });
        let mut rx = query.subscribe();
        assert!(rx.borrow().is_idle());

        let runner = query.clone();
        let task = tokio::spawn(async move { runner.set_key(Some("all".to_string())).await });

        rx.changed().await.unwrap();
        {
            let loading = rx.borrow_and_update();
            assert!(loading.loading);
            assert_eq!(loading.phase, QueryPhase::Loading);
            assert!(loading.error.is_none());
        }

        task.await.unwrap();
        let done = query.state();
        assert!(!done.loading);
        assert_eq!(done.phase, QueryPhase::Success);
        assert_eq!(done.data, Some(Vec::new()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_key_does_not_refetch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let query = slow_query(calls.clone());
        query.set_key(Some(1)).await;
        query.set_key(Some(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(query.state().data, Some(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_fetch_never_commits() {
        let query = slow_query(Arc::new(AtomicUsize::new(0)));

        // Key 50 starts first but finishes after key 5
        let slow = query.clone();
        let slow_task = tokio::spawn(async move { slow.set_key(Some(50)).await });
        while !query.state().loading {
            tokio::task::yield_now().await;
        }
        query.set_key(Some(5)).await;
        assert_eq!(query.state().data, Some(50));

        slow_task.await.unwrap();
        let state = query.state();
        assert_eq!(state.data, Some(50));
        assert_eq!(query.key(), Some(5));
        assert!(!state.loading);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_sets_error_and_keeps_data() {
        let fail = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = fail.clone();
        let query: Query<u8, String> = Query::new(client(), "profile", move |_| {
            let fail = flag.load(Ordering::SeqCst);
            async move {
                if fail {
                    Err(ApiError::ServerError("down".to_string()))
                } else {
                    Ok("ada".to_string())
                }
            }
        });

        query.set_key(Some(1)).await;
        fail.store(true, Ordering::SeqCst);
        query.refetch().await;

        let state = query.state();
        assert_eq!(state.phase, QueryPhase::Error);
        assert!(state.error.unwrap().contains("down"));
        assert_eq!(state.data, Some("ada".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_mutation_leaves_data_untouched() {
        let calls = Arc::new(AtomicUsize::new(0));
        let query = slow_query(calls.clone());
        query.set_key(Some(2)).await;
        let before = query.state();

        let result: Result<(), _> = query
            .mutate(
                async { Err(ApiError::AccessDenied("not yours".to_string())) },
                MutationEffect::Refetch,
            )
            .await;

        assert!(matches!(result, Err(ApiError::AccessDenied(_))));
        assert_eq!(query.state(), before);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutation_refetch_bypasses_cache() {
        let calls = Arc::new(AtomicUsize::new(0));
        let query = slow_query(calls.clone());
        query.set_key(Some(3)).await;
        query
            .mutate(async { Ok(()) }, MutationEffect::Refetch)
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutation_patch_updates_data_without_fetch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let query = slow_query(calls.clone());
        query.set_key(Some(4)).await;
        query
            .mutate(async { Ok(()) }, MutationEffect::patch(|n: &mut u64| *n += 1))
            .await
            .unwrap();
        assert_eq!(query.state().data, Some(41));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Re-pointing at the same key later reads the patched cache entry
        query.set_key(None).await;
        query.set_key(Some(4)).await;
        assert_eq!(query.state().data, Some(41));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutation_refetch_drops_derived_queries() {
        let shared = client();
        let calls = Arc::new(AtomicUsize::new(0));
        let missions = {
            let shared = shared.clone();
            let calls = calls.clone();
            move || {
                let calls = calls.clone();
                Query::new(shared.clone(), "missions", move |_: u8| {
                    let calls = calls.clone();
                    async move { Ok(calls.fetch_add(1, Ordering::SeqCst) as u64) }
                })
            }
        };
        let list: Query<u8, u64> = missions();
        list.set_key(Some(0)).await;

        let registrations: Query<u8, u64> =
            Query::new(shared.clone(), "registrations", |_: u8| async { Ok(1) });
        registrations.set_key(Some(0)).await;
        registrations
            .mutate(async { Ok(()) }, MutationEffect::refetch_with(&["missions"]))
            .await
            .unwrap();

        // A fresh handle on the same key must not see the pre-mutation rows
        let fresh: Query<u8, u64> = missions();
        fresh.set_key(Some(0)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(fresh.state().data, Some(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_key_changes_settle_on_last_key() {
        for _ in 0..50 {
            let query: Query<u64, u64> = Query::new(client(), "numbers", |n: u64| async move {
                tokio::task::yield_now().await;
                Ok(n * 10)
            });
            let tasks: Vec<_> = (1..=8u64)
                .map(|n| {
                    let query = query.clone();
                    tokio::spawn(async move { query.set_key(Some(n % 3 + 1)).await })
                })
                .collect();
            for task in tasks {
                task.await.unwrap();
            }

            let key = query.key().unwrap();
            let state = query.state();
            assert!(!state.loading);
            assert_eq!(state.data, Some(key * 10));
        }
    }

    #[tokio::test]
    async fn test_pending_and_error_without_fetch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let query = slow_query(calls.clone());
        query.set_pending();
        assert!(query.state().loading);
        query.set_error("Profile has no location");
        let state = query.state();
        assert!(!state.loading);
        assert_eq!(state.error.as_deref(), Some("Profile has no location"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
