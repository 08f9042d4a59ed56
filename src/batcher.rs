//! The batcher: routes each requested key to the current open batch, arms
//! the closing triggers, and exposes the public loading operations.
//!
//! A batcher is the unit of configuration and is expected to be short-lived,
//! typically one per incoming request, shared (via its cheap `Clone`) across
//! that request's resolution tree. Entries in the batch registry are never
//! removed; they are bounded by the batcher's lifetime.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::batch::{error_at, Batch, BatchStatus};
use crate::error::LoadError;
use crate::key::{DirectKeys, JsonKeys, KeyMode};

/// The parallel result/error arrays returned by one fetch invocation.
///
/// The error array is either positional (one entry per key, `None` for
/// success) or a single element that applies to every key in the batch.
pub type FetchOutput<V, E> = (Vec<V>, Vec<Option<E>>);

/// The user-supplied batch fetch function: given N keys, produce N results
/// and N (or 1) errors. Invoked at most once per batch, with the distinct
/// keys routed into that batch before closure, in insertion order.
///
/// The engine imposes no deadline on `fetch` and never retries it; both are
/// the implementation's own responsibility.
#[async_trait]
pub trait Fetcher<K, V>: Send + Sync + 'static {
    /// The fetch-level error type. `Clone` because a single error may be
    /// delivered to every caller waiting on the batch.
    type Error: Clone + Send + Sync + 'static;

    async fn fetch(&self, keys: &[K]) -> FetchOutput<V, Self::Error>;
}

/// Construction-time configuration for a [`Batcher`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatcherConfig {
    /// Hard cap on keys per batch. A batch that reaches this size closes
    /// immediately and its fetch is dispatched without waiting for the
    /// window. Must be greater than zero.
    pub max_batch_size: usize,

    /// Maximum time a batch stays open while below capacity, measured from
    /// its first key.
    pub batch_window: Duration,

    /// Cache successful results and serve repeat lookups without batch
    /// interaction. Failed keys are never cached.
    pub cache_results: bool,

    /// Publish each successful result to registered subscribers when its
    /// batch completes.
    pub publish_results: bool,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        BatcherConfig {
            max_batch_size: 100,
            batch_window: Duration::from_millis(2),
            cache_results: true,
            publish_results: true,
        }
    }
}

type Subscriber<V> = Arc<dyn Fn(&V) + Send + Sync>;

struct Inner<K, V, F, S>
where
    F: Fetcher<K, V>,
    S: KeyMode<K>,
{
    fetcher: F,
    config: BatcherConfig,

    /// Monotonically increasing; advanced only by compare-and-swap, so a
    /// stale advance from a thread that lost a race is a no-op.
    current_batch_id: AtomicU32,
    batches: DashMap<u32, Arc<Batch<K, V, F::Error, S::CacheKey>>>,

    /// Success-only result cache. First writer wins; entries are never
    /// evicted or invalidated at this layer.
    cache: DashMap<S::CacheKey, V>,
    subscribers: RwLock<Vec<Subscriber<V>>>,
}

/// Batches many small concurrent point lookups into fewer calls to a
/// [`Fetcher`], optionally caching resolved results.
///
/// `Batcher` is a cheap handle over shared state; clone it freely. The key
/// mode parameter `S` defaults to [`DirectKeys`] and is selected by the
/// constructor ([`Batcher::new`] vs [`Batcher::with_json_keys`]); the loading
/// operations are identical in both modes.
///
/// All operations must be called from within a Tokio runtime: closing a
/// batch spawns its fetch as a detached task, and the first key in a batch
/// arms a detached window timer.
pub struct Batcher<K, V, F, S = DirectKeys>
where
    F: Fetcher<K, V>,
    S: KeyMode<K>,
{
    inner: Arc<Inner<K, V, F, S>>,
}

impl<K, V, F, S> Clone for Batcher<K, V, F, S>
where
    F: Fetcher<K, V>,
    S: KeyMode<K>,
{
    fn clone(&self) -> Self {
        Batcher {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Where a key landed after routing. `Ready` short-circuits (cache hit or
/// key serialization failure); `Pending` holds everything the thunk needs to
/// wait, read its slot, and populate the cache.
enum Routed<K, V, F, S>
where
    F: Fetcher<K, V>,
    S: KeyMode<K>,
{
    Ready(Result<V, LoadError<F::Error>>),
    Pending {
        inner: Arc<Inner<K, V, F, S>>,
        batch: Arc<Batch<K, V, F::Error, S::CacheKey>>,
        index: usize,
        cache_key: S::CacheKey,
    },
}

impl<K, V, F> Batcher<K, V, F, DirectKeys>
where
    K: Eq + std::hash::Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    F: Fetcher<K, V>,
{
    /// Create a batcher for keys that support direct comparison. For key
    /// types that can't implement `Eq + Hash` sensibly, use
    /// [`Batcher::with_json_keys`] instead.
    pub fn new(fetcher: F, config: BatcherConfig) -> Self {
        Self::with_key_mode(fetcher, config)
    }
}

impl<K, V, F> Batcher<K, V, F, JsonKeys>
where
    K: Serialize + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    F: Fetcher<K, V>,
{
    /// Create a batcher that deduplicates and caches by each key's JSON
    /// serialization rather than by direct comparison. This allows key types
    /// (say, structs full of vectors) that would otherwise not be usable.
    pub fn with_json_keys(fetcher: F, config: BatcherConfig) -> Self {
        Self::with_key_mode(fetcher, config)
    }
}

impl<K, V, F, S> Batcher<K, V, F, S>
where
    K: Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    F: Fetcher<K, V>,
    S: KeyMode<K>,
{
    fn with_key_mode(fetcher: F, config: BatcherConfig) -> Self {
        assert!(
            config.max_batch_size > 0,
            "max_batch_size must be greater than zero"
        );

        Batcher {
            inner: Arc::new(Inner {
                fetcher,
                config,
                current_batch_id: AtomicU32::new(0),
                batches: DashMap::new(),
                cache: DashMap::new(),
                subscribers: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Load the value for `key`, batched with concurrent loads and served
    /// from the cache when possible. A repeat of a key already in the open
    /// batch shares that key's slot: the fetch function sees the key once
    /// and every caller receives the same outcome.
    pub async fn load(&self, key: K) -> Result<V, LoadError<F::Error>> {
        self.load_thunk(key).await
    }

    /// Route `key` immediately, but defer waiting until the returned future
    /// is awaited. Use this to issue many lookups before committing to wait
    /// on any of them, maximizing batch fill before the first caller blocks.
    ///
    /// Dropping the returned future does not abort the batch or the fetch
    /// for other waiters.
    pub fn load_thunk(
        &self,
        key: K,
    ) -> impl Future<Output = Result<V, LoadError<F::Error>>> + Send + 'static {
        let routed = self.route(key);

        async move {
            match routed {
                Routed::Ready(result) => result,
                Routed::Pending {
                    inner,
                    batch,
                    index,
                    cache_key,
                } => {
                    batch.done.cancelled().await;
                    let resolved = batch.resolved(index);

                    if inner.config.cache_results {
                        if let Ok(value) = &resolved {
                            // First writer wins; concurrent identical writes
                            // are idempotent.
                            inner
                                .cache
                                .entry(cache_key)
                                .or_insert_with(|| value.clone());
                        }
                    }

                    resolved
                }
            }
        }
    }

    /// Load many keys at once. Every key is routed before any waiting
    /// happens, so the keys land in as few batches as the configuration
    /// allows, and the output preserves the input ordering regardless of
    /// internal batch membership.
    pub async fn load_all(&self, keys: Vec<K>) -> Vec<Result<V, LoadError<F::Error>>> {
        self.load_all_thunk(keys).await
    }

    /// The thunked form of [`load_all`](Batcher::load_all): all keys are
    /// routed immediately, waiting is deferred until the returned future is
    /// awaited.
    pub fn load_all_thunk(
        &self,
        keys: Vec<K>,
    ) -> impl Future<Output = Vec<Result<V, LoadError<F::Error>>>> + Send + 'static {
        let thunks: Vec<_> = keys.into_iter().map(|key| self.load_thunk(key)).collect();

        async move {
            let mut results = Vec::with_capacity(thunks.len());
            for thunk in thunks {
                results.push(thunk.await);
            }
            results
        }
    }

    /// Seed the cache for `key` without consulting the fetch function.
    /// First writer wins; a no-op if caching is disabled or the key fails to
    /// serialize.
    pub fn prime(&self, key: K, value: V) {
        if !self.inner.config.cache_results {
            return;
        }

        let Ok(cache_key) = S::cache_key(&key) else {
            return;
        };

        self.inner.cache.entry(cache_key).or_insert(value);
    }

    /// Register a function to be called with every successful result this
    /// batcher resolves from here on. Already-completed batches are not
    /// replayed. Subscribers only run if `publish_results` is enabled.
    pub fn register_result_subscriber(&self, subscriber: impl Fn(&V) + Send + Sync + 'static) {
        self.inner.subscribers.write().push(Arc::new(subscriber));
    }

    /// Decide where `key` goes: the cache, an immediate error, or a slot in
    /// the current batch. Everything here is synchronous; a caller suspends
    /// only on the batch's completion signal.
    fn route(&self, key: K) -> Routed<K, V, F, S> {
        let cache_key = match S::cache_key(&key) {
            Ok(cache_key) => cache_key,
            Err(err) => {
                return Routed::Ready(Err(LoadError::KeySerialization(Arc::new(err))));
            }
        };

        if self.inner.config.cache_results {
            if let Some(value) = self.inner.cache.get(&cache_key) {
                trace!("cache hit");
                return Routed::Ready(Ok(value.clone()));
            }
        }

        let (batch, index) = self.route_key(key, &cache_key);
        Routed::Pending {
            inner: Arc::clone(&self.inner),
            batch,
            index,
            cache_key,
        }
    }

    /// Find the open batch this key belongs to and insert it if it isn't
    /// already present. The batch lock is held for at most a linear scan of
    /// the batch's keys, and never across the fetch or any await.
    fn route_key(
        &self,
        key: K,
        cache_key: &S::CacheKey,
    ) -> (Arc<Batch<K, V, F::Error, S::CacheKey>>, usize) {
        let inner = &self.inner;

        loop {
            let id = inner.current_batch_id.load(Ordering::Acquire);

            // Get-or-create through the registry's entry API, so a creation
            // race has exactly one winner and never two live batches for the
            // same id.
            let batch: Arc<_> = inner
                .batches
                .entry(id)
                .or_insert_with(|| Arc::new(Batch::new(id, inner.config.max_batch_size)))
                .clone();

            let mut core = batch.core.lock();

            // Assigned to a batch that already closed: advance the id (a
            // no-op if another thread got there first) and retry.
            if core.status == BatchStatus::Closed {
                drop(core);
                self.advance_batch_id(id);
                continue;
            }

            // Dedup: a key already in the open batch shares its slot.
            if let Some(index) = core.cache_keys.iter().position(|c| c == cache_key) {
                return (batch.clone(), index);
            }

            let index = core.keys.len();
            core.keys.push(key);
            core.cache_keys.push(cache_key.clone());

            // The first key arms the window timer.
            if index == 0 {
                self.arm_window_timer(&batch);
            }

            if core.keys.len() == inner.config.max_batch_size {
                core.status = BatchStatus::Closed;
                let keys = std::mem::take(&mut core.keys);
                drop(core);

                debug!(batch_id = id, size = keys.len(), "batch reached capacity");
                self.dispatch(Arc::clone(&batch), keys);
                self.advance_batch_id(id);
            } else {
                drop(core);
            }

            return (batch, index);
        }
    }

    fn advance_batch_id(&self, from: u32) {
        let _ = self.inner.current_batch_id.compare_exchange(
            from,
            from + 1,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Arm the timeout closing path. If the capacity path closes the batch
    /// first, the timer task finds it closed and does nothing.
    fn arm_window_timer(&self, batch: &Arc<Batch<K, V, F::Error, S::CacheKey>>) {
        let inner = Arc::clone(&self.inner);
        let batch = Arc::clone(batch);
        let window = inner.config.batch_window;

        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if let Some(keys) = batch.close_for_timeout() {
                Inner::run_fetch(inner, batch, keys).await;
            }
        });
    }

    /// Dispatch the fetch as a detached task, so thunks make progress
    /// without being awaited and the closing caller never blocks on the
    /// fetch itself.
    fn dispatch(&self, batch: Arc<Batch<K, V, F::Error, S::CacheKey>>, keys: Vec<K>) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(Inner::run_fetch(inner, batch, keys));
    }
}

impl<K, V, F, S> Inner<K, V, F, S>
where
    K: Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    F: Fetcher<K, V>,
    S: KeyMode<K>,
{
    /// Invoke the fetch function once with the batch's keys, fan the outcome
    /// back to the batch, and notify subscribers. Runs for exactly one task
    /// per batch, outside any lock, so subscriber callbacks and the fetch
    /// itself cannot serialize unrelated batches.
    async fn run_fetch(
        inner: Arc<Self>,
        batch: Arc<Batch<K, V, F::Error, S::CacheKey>>,
        keys: Vec<K>,
    ) {
        trace!(batch_id = batch.id, keys = keys.len(), "dispatching fetch");
        let (results, errors) = inner.fetcher.fetch(&keys).await;

        if inner.config.publish_results {
            inner.publish(&results, &errors);
        }

        batch.complete(results, errors);
    }

    /// Pass every result that resolved without an error to each subscriber.
    /// Only a snapshot of the subscriber list is taken under the lock, so a
    /// subscriber may itself register further subscribers.
    fn publish(&self, results: &[V], errors: &[Option<F::Error>]) {
        let subscribers = self.subscribers.read().clone();
        if subscribers.is_empty() {
            return;
        }

        for (index, result) in results.iter().enumerate() {
            if error_at(errors, index).is_some() {
                continue;
            }

            for subscriber in &subscribers {
                subscriber(result);
            }
        }
    }
}
