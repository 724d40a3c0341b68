//! Provides a stale-while-revalidate cache around an arbitrary async fetch operation.
//!
//! A [Cache] wraps a [Fetcher] (the user supplied logic which computes values) behind a
//! key-addressed store and decides, per lookup, between three answers:
//!
//! * **fresh** - the stored value is young enough and returned as is,
//! * **stale** - the stored value is older than the fresh window but still usable: it is
//!   returned immediately while a refresh is started in the background,
//! * **expired** (or absent) - the caller has to wait for a fetch.
//!
//! Using stale data this way keeps response times low even when the underlying fetch is slow,
//! while short fresh windows still keep the data reasonably up to date. Of course this is only
//! applicable where slightly outdated data is acceptable - which, for the typical "expensive
//! lookup against a remote system" workload, it usually is.
//!
//! No matter how many callers miss or refresh the same key at the same time, the fetcher runs
//! at most once per key: all concurrent callers join the already running fetch and observe its
//! result, success or failure alike. Failures are never retried by the cache itself - the next
//! lookup after a failed fetch simply tries again.
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde::Serialize;

use crate::error::{CacheError, CacheResult};
use crate::fetcher::Fetcher;
use crate::storage::{CacheRecord, MemoryStorage, StorageEngine};
use crate::stringify;

/// Contains the default fresh window applied unless [CacheBuilder::fresh] is used.
pub const DEFAULT_FRESH: Duration = Duration::from_secs(5 * 60);

/// Callback invoked after every successful refresh with the key and the freshly stored value.
///
/// A failure of this callback is reported to the error observer and otherwise ignored - it never
/// affects the outcome of the refresh itself.
pub type RefreshHook<K, V> = Box<dyn Fn(&K, &V) -> anyhow::Result<()> + Send + Sync>;

/// Observer which receives errors the cache swallows on purpose.
///
/// This covers rejections of background refreshes (the caller already got a stale value and
/// cannot be reached anymore) and failures of the [RefreshHook]. The default observer logs via
/// [log::warn]. Injecting an own observer keeps the cache free of hidden side channels and
/// permits tests to assert on swallowed errors.
pub type ErrorObserver = Box<dyn Fn(&str, &CacheError) + Send + Sync>;

/// A fetch which is currently running, shared between all callers awaiting it.
type SharedFetch<V> = Shared<BoxFuture<'static, CacheResult<V>>>;

/// A storage read which is currently running, shared between all callers awaiting it.
type SharedRead<V> = Shared<BoxFuture<'static, CacheResult<Option<CacheRecord<V>>>>>;

/// Counts cache activity. See [CacheStats].
#[derive(Default)]
struct Counters {
    fresh_hits: AtomicUsize,
    stale_hits: AtomicUsize,
    misses: AtomicUsize,
    fetches: AtomicUsize,
    background_failures: AtomicUsize,
}

/// Provides a snapshot of the activity counters of a cache.
///
/// # Examples
/// ```
/// # use recache::cache::Cache;
/// # use recache::fetcher;
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let cache = Cache::new(fetcher::keyed(|key: u64| async move { Ok(key * 2) }));
///
/// let _ = cache.get(3).await.unwrap();
/// let _ = cache.get(3).await.unwrap();
///
/// let stats = cache.stats();
/// assert_eq!(stats.misses, 1);
/// assert_eq!(stats.fresh_hits, 1);
/// assert_eq!(stats.hit_rate().round() as i32, 50);
/// # });
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of lookups answered from a value within its fresh window.
    pub fresh_hits: usize,
    /// Number of lookups answered from a stale value (each also triggered a background refresh).
    pub stale_hits: usize,
    /// Number of lookups which found no usable value and had to await a fetch.
    pub misses: usize,
    /// Number of fetcher invocations (foreground and background combined).
    pub fetches: usize,
    /// Number of background refreshes which failed (their errors were swallowed).
    pub background_failures: usize,
}

impl CacheStats {
    /// Returns the share of lookups answered without awaiting the fetcher, in percent.
    pub fn hit_rate(&self) -> f32 {
        match self.fresh_hits + self.stale_hits + self.misses {
            0 => 0.,
            reads => (self.fresh_hits + self.stale_hits) as f32 / reads as f32 * 100.,
        }
    }
}

/// The shared interior of a cache.
///
/// All clones of a [Cache] and all futures spawned by it operate on one `Inner` via [Arc].
struct Inner<K, V, H> {
    fetcher: Box<dyn Fetcher<K, H, Value = V>>,
    storage: Arc<dyn StorageEngine<V>>,
    fresh: Option<Duration>,
    stale: Option<Duration>,
    active: Mutex<HashMap<String, SharedFetch<V>>>,
    reads: Mutex<HashMap<String, SharedRead<V>>>,
    on_refresh: Option<RefreshHook<K, V>>,
    on_error: ErrorObserver,
    counters: Counters,
}

/// Provides a stale-while-revalidate cache around a [Fetcher].
///
/// The generic parameters are the key type `K`, the value type `V` and an optional helper type
/// `H` which callers may pass along to the fetcher (e.g. a request context). A cache without
/// keys (storing one single value) uses `K = ()`.
///
/// A cache is cheap to clone - all clones share the same storage and collapse their fetches
/// together.
///
/// # Examples
/// ```
/// # use recache::cache::Cache;
/// # use recache::fetcher;
/// # use std::time::Duration;
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// // Values are considered fresh for a minute. Within the following nine minutes, a cached
/// // value is still served instantly, but a background refresh is started. After that, a
/// // lookup has to await the fetcher again.
/// let cache = Cache::builder(fetcher::keyed(|user_id: u64| async move {
///     Ok(format!("user-{}", user_id))
/// }))
/// .fresh(Duration::from_secs(60))
/// .stale(Duration::from_secs(600))
/// .build();
///
/// assert_eq!(cache.get(42).await.unwrap(), "user-42");
/// # });
/// ```
pub struct Cache<K, V, H = ()> {
    inner: Arc<Inner<K, V, H>>,
}

impl<K, V, H> Clone for Cache<K, V, H> {
    fn clone(&self) -> Self {
        Cache {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Builds a [Cache], permitting to customize freshness windows, storage and callbacks.
///
/// Obtained via [Cache::builder]. All settings are optional: the defaults are a fresh window of
/// five minutes, a stale limit of twice the fresh window and a private [MemoryStorage] sized to
/// the stale limit.
pub struct CacheBuilder<K, V, H = ()> {
    fetcher: Box<dyn Fetcher<K, H, Value = V>>,
    fresh: Option<Option<Duration>>,
    stale: Option<Option<Duration>>,
    storage: Option<Arc<dyn StorageEngine<V>>>,
    on_refresh: Option<RefreshHook<K, V>>,
    on_error: Option<ErrorObserver>,
}

impl<K, V, H> CacheBuilder<K, V, H>
where
    K: Serialize + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    H: Send + 'static,
{
    /// Specifies how long a stored value is served without any side effect.
    pub fn fresh(mut self, fresh: Duration) -> Self {
        self.fresh = Some(Some(fresh));
        self
    }

    /// Specifies that stored values never become stale.
    ///
    /// Such a cache only ever re-fetches after an explicit [invalidate](Cache::invalidate) or
    /// once the storage engine itself dropped an entry.
    pub fn never_fresh(mut self) -> Self {
        self.fresh = Some(None);
        self
    }

    /// Specifies the maximal age up to which a stored value may be served at all.
    ///
    /// Between the fresh window and this limit, values are served stale while being refreshed
    /// in the background.
    pub fn stale(mut self, stale: Duration) -> Self {
        self.stale = Some(Some(stale));
        self
    }

    /// Specifies that stored values never expire.
    ///
    /// Stale values are then served (and refreshed in the background) indefinitely. The built-in
    /// storage engine will never prune in this mode.
    pub fn never_stale(mut self) -> Self {
        self.stale = Some(None);
        self
    }

    /// Attaches an external storage engine instead of the built-in in-memory one.
    ///
    /// The engine may be shared with other caches or processes - the cache does not assume
    /// exclusive ownership. Third-party stores are attached by implementing [StorageEngine] in
    /// a thin adapter.
    pub fn storage(mut self, storage: Arc<dyn StorageEngine<V>>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Registers a callback which is invoked after every successful refresh.
    ///
    /// Errors returned by the callback are handed to the error observer and never propagated.
    pub fn on_refresh<F>(mut self, hook: F) -> Self
    where
        F: Fn(&K, &V) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_refresh = Some(Box::new(hook));
        self
    }

    /// Registers an observer for errors the cache swallows (see [ErrorObserver]).
    ///
    /// By default, swallowed errors are logged as warnings.
    pub fn on_background_error<F>(mut self, observer: F) -> Self
    where
        F: Fn(&str, &CacheError) + Send + Sync + 'static,
    {
        self.on_error = Some(Box::new(observer));
        self
    }

    /// Creates the cache.
    pub fn build(self) -> Cache<K, V, H> {
        let fresh = self.fresh.unwrap_or(Some(DEFAULT_FRESH));
        let stale = match self.stale {
            Some(stale) => stale,
            None => fresh.map(|fresh| fresh * 2),
        };
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStorage::new(stale)));
        let on_error: ErrorObserver = self.on_error.unwrap_or_else(|| {
            Box::new(|key, error| {
                log::warn!("Background refresh of '{}' failed: {:#}", key, error.inner());
            })
        });

        Cache {
            inner: Arc::new(Inner {
                fetcher: self.fetcher,
                storage,
                fresh,
                stale,
                active: Mutex::new(HashMap::new()),
                reads: Mutex::new(HashMap::new()),
                on_refresh: self.on_refresh,
                on_error,
                counters: Counters::default(),
            }),
        }
    }
}

impl<K, V, H> Cache<K, V, H>
where
    K: Serialize + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    H: Send + 'static,
{
    /// Creates a cache with default settings around the given fetcher.
    ///
    /// # Examples
    /// ```
    /// # use recache::cache::Cache;
    /// # use recache::fetcher;
    /// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
    /// let cache = Cache::new(fetcher::keyed(|key: u64| async move { Ok(key * 2) }));
    /// assert_eq!(cache.get(21).await.unwrap(), 42);
    /// # });
    /// ```
    pub fn new(fetcher: impl Fetcher<K, H, Value = V>) -> Self {
        Self::builder(fetcher).build()
    }

    /// Provides a builder to customize freshness windows, storage and callbacks.
    pub fn builder(fetcher: impl Fetcher<K, H, Value = V>) -> CacheBuilder<K, V, H> {
        CacheBuilder {
            fetcher: Box::new(fetcher),
            fresh: None,
            stale: None,
            storage: None,
            on_refresh: None,
            on_error: None,
        }
    }

    /// Returns the value for the given key, fetching or refreshing as required.
    ///
    /// A fresh value is returned without any side effect. A stale (but not yet expired) value
    /// is returned immediately as well, but a refresh is started in the background - an error
    /// of such a refresh is invisible to any caller, as the stale value remains in use until it
    /// either gets replaced or expires. For an expired or unknown key, this awaits the fetch
    /// and returns its outcome.
    ///
    /// Concurrent lookups for the same key share a single fetch and a single storage read.
    pub async fn get(&self, key: K) -> CacheResult<V>
    where
        H: Default,
    {
        self.get_with(key, H::default()).await
    }

    /// Behaves like [get](Cache::get), additionally passing a helper along to the fetcher.
    pub async fn get_with(&self, key: K, helper: H) -> CacheResult<V> {
        let keystr = stringify::canonical_key(&key)?;

        if let Some(record) = self.read_record(&keystr).await? {
            if self.inner.is_fresh(&record) {
                let _ = self.inner.counters.fresh_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(record.into_data());
            }

            if self.inner.is_valid(&record) {
                let _ = self.inner.counters.stale_hits.fetch_add(1, Ordering::Relaxed);
                self.spawn_refresh(keystr, key, helper);
                return Ok(record.into_data());
            }
        }

        let _ = self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
        self.run_refresh(keystr, key, helper).await
    }

    /// Stores the given value directly, bypassing the fetcher.
    ///
    /// The value counts as freshly fetched, so subsequent lookups within the fresh window are
    /// answered from it without invoking the fetcher.
    ///
    /// # Examples
    /// ```
    /// # use recache::cache::Cache;
    /// # use recache::fetcher;
    /// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
    /// let cache = Cache::new(fetcher::keyed(|key: u64| async move { Ok(key * 2) }));
    ///
    /// cache.set(7, 99).await.unwrap();
    /// assert_eq!(cache.get(7).await.unwrap(), 99);
    /// # });
    /// ```
    pub async fn set(&self, key: K, value: V) -> CacheResult<()> {
        let keystr = stringify::canonical_key(&key)?;
        self.inner.store(&keystr, value).await
    }

    /// Forces a fetch for the given key, regardless of the freshness of any stored value.
    ///
    /// If a fetch for this key is already running, its result is awaited instead of starting a
    /// second one.
    pub async fn refresh(&self, key: K) -> CacheResult<V>
    where
        H: Default,
    {
        self.refresh_with(key, H::default()).await
    }

    /// Behaves like [refresh](Cache::refresh), additionally passing a helper along.
    pub async fn refresh_with(&self, key: K, helper: H) -> CacheResult<V> {
        let keystr = stringify::canonical_key(&key)?;
        self.run_refresh(keystr, key, helper).await
    }

    /// Drops the stored value for the given key - or all stored values if `None` is given.
    ///
    /// # Examples
    /// ```
    /// # use recache::cache::Cache;
    /// # use recache::fetcher;
    /// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
    /// let cache = Cache::new(fetcher::keyed(|key: u64| async move { Ok(key * 2) }));
    ///
    /// cache.set(7, 99).await.unwrap();
    /// cache.invalidate(Some(7)).await.unwrap();
    ///
    /// // The stored value is gone, so the fetcher computes a new one...
    /// assert_eq!(cache.get(7).await.unwrap(), 14);
    /// # });
    /// ```
    pub async fn invalidate(&self, key: Option<K>) -> CacheResult<()> {
        match key {
            Some(key) => {
                let keystr = stringify::canonical_key(&key)?;
                self.inner
                    .storage
                    .delete(&keystr)
                    .await
                    .map_err(CacheError::from)
            }
            None => self.clear().await,
        }
    }

    /// Drops all stored values.
    pub async fn clear(&self) -> CacheResult<()> {
        self.inner.storage.clear().await.map_err(CacheError::from)
    }

    /// Provides a snapshot of the activity counters of this cache.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            fresh_hits: self.inner.counters.fresh_hits.load(Ordering::Relaxed),
            stale_hits: self.inner.counters.stale_hits.load(Ordering::Relaxed),
            misses: self.inner.counters.misses.load(Ordering::Relaxed),
            fetches: self.inner.counters.fetches.load(Ordering::Relaxed),
            background_failures: self
                .inner
                .counters
                .background_failures
                .load(Ordering::Relaxed),
        }
    }

    /// Reads the stored record for the given canonical key.
    ///
    /// Concurrent reads for the same key are collapsed into one storage access. Otherwise a
    /// burst of first-time lookups against a slow storage backend would each miss and then each
    /// try to refresh on their own - the in-flight tracker only protects callers which reach it,
    /// so the read in front of it has to be collapsed as well.
    async fn read_record(&self, keystr: &str) -> CacheResult<Option<CacheRecord<V>>> {
        let read = {
            let mut reads = self.inner.locked_reads();
            match reads.get(keystr) {
                Some(running) => running.clone(),
                None => {
                    let inner = Arc::clone(&self.inner);
                    let owned_key = keystr.to_owned();
                    let read: SharedRead<V> = async move {
                        let result = inner.storage.get(&owned_key).await.map_err(CacheError::from);
                        let _ = inner.locked_reads().remove(&owned_key);
                        result
                    }
                    .boxed()
                    .shared();
                    let _ = reads.insert(keystr.to_owned(), read.clone());
                    read
                }
            }
        };

        read.await
    }

    /// Joins the running fetch for the given canonical key or starts a new one.
    ///
    /// The lookup and the registration below happen under a single lock acquisition with no
    /// suspension point in between - this is what makes the at-most-one-fetch-per-key guarantee
    /// hold. The registered future removes its own entry in the very poll which observes the
    /// fetcher settling, so a caller arriving later can never join an already settled fetch.
    async fn run_refresh(&self, keystr: String, key: K, helper: H) -> CacheResult<V> {
        let fetch = {
            let mut active = self.inner.locked_active();
            match active.get(&keystr) {
                Some(running) => running.clone(),
                None => {
                    let _ = self.inner.counters.fetches.fetch_add(1, Ordering::Relaxed);
                    let inner = Arc::clone(&self.inner);
                    let owned_key = keystr.clone();
                    let fetch: SharedFetch<V> = async move {
                        let result = inner.fetch_and_store(&owned_key, key, helper).await;
                        let _ = inner.locked_active().remove(&owned_key);
                        result
                    }
                    .boxed()
                    .shared();
                    let _ = active.insert(keystr, fetch.clone());
                    fetch
                }
            }
        };

        fetch.await
    }

    /// Starts a refresh without awaiting it.
    ///
    /// The caller already received a (stale) value, so a rejection of this refresh cannot be
    /// delivered anywhere - it is handed to the error observer instead.
    fn spawn_refresh(&self, keystr: String, key: K, helper: H) {
        let cache = self.clone();
        crate::spawn!(async move {
            if let Err(error) = cache.run_refresh(keystr.clone(), key, helper).await {
                let _ = cache
                    .inner
                    .counters
                    .background_failures
                    .fetch_add(1, Ordering::Relaxed);
                (cache.inner.on_error)(&keystr, &error);
            }
        });
    }
}

impl<K, V, H> Inner<K, V, H>
where
    K: Serialize + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    H: Send + 'static,
{
    /// Invokes the fetcher and persists its result.
    ///
    /// A failed fetch stores nothing. A failure while storing interrupts the refresh just like
    /// a fetch failure would. The refresh hook runs after the value was successfully stored.
    async fn fetch_and_store(&self, keystr: &str, key: K, helper: H) -> CacheResult<V> {
        let value = self
            .fetcher
            .fetch(key.clone(), helper)
            .await
            .map_err(CacheError::from)?;

        self.store(keystr, value.clone()).await?;

        if let Some(on_refresh) = &self.on_refresh {
            if let Err(error) = on_refresh(&key, &value) {
                (self.on_error)(keystr, &CacheError::from(error));
            }
        }

        Ok(value)
    }

    async fn store(&self, keystr: &str, value: V) -> CacheResult<()> {
        self.storage
            .set(keystr, CacheRecord::new(value))
            .await
            .map_err(CacheError::from)
    }

    fn is_fresh(&self, record: &CacheRecord<V>) -> bool {
        match self.fresh {
            None => true,
            Some(fresh) => record.age() < fresh,
        }
    }

    fn is_valid(&self, record: &CacheRecord<V>) -> bool {
        match self.stale {
            None => true,
            Some(stale) => record.age() < stale,
        }
    }

    fn locked_active(&self) -> MutexGuard<'_, HashMap<String, SharedFetch<V>>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn locked_reads(&self) -> MutexGuard<'_, HashMap<String, SharedRead<V>>> {
        self.reads.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
