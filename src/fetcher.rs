//! Provides the fetcher abstraction which computes the values kept in a cache.
//!
//! A [Fetcher] is the piece of user logic a [Cache](crate::cache::Cache) wraps: given a key (and
//! optionally a helper, e.g. a database connection or request context), it produces a fresh
//! value. Fetchers come in three arities:
//!
//! * unkeyed - the cache stores a single value (`K = ()`, `H = ()`), see [value],
//! * keyed - one value per key (`H = ()`), see [keyed],
//! * keyed with helper - the caller passes an additional helper along, see [keyed_with_helper].
//!
//! All three are plain async closures wrapped into small adapter types, so that the arity is
//! fixed by the generic parameters of the cache instead of being inspected at runtime. Types
//! which want to carry state of their own can implement [Fetcher] directly.
use async_trait::async_trait;
use std::future::Future;

/// Computes the value to be cached for a given key.
///
/// Failures are simply propagated - the cache never retries a failed fetch on its own. Note that
/// the key and helper are passed by value: the cache clones the key where it needs to keep one
/// (e.g. for the refresh callback), so the fetcher is free to consume it.
#[async_trait]
pub trait Fetcher<K, H>: Send + Sync + 'static {
    /// The type of the values produced by this fetcher.
    type Value: Clone + Send + Sync + 'static;

    /// Produces a fresh value for the given key.
    async fn fetch(&self, key: K, helper: H) -> anyhow::Result<Self::Value>;
}

/// Adapts an async closure without arguments, for caches which store a single value.
///
/// See [value].
pub struct ValueFn<F> {
    fetch: F,
}

/// Adapts an async closure taking the key, for caches keyed without a helper.
///
/// See [keyed].
pub struct KeyFn<F> {
    fetch: F,
}

/// Adapts an async closure taking key and helper.
///
/// See [keyed_with_helper].
pub struct KeyHelperFn<F> {
    fetch: F,
}

/// Wraps an async closure into a [Fetcher] for an unkeyed (singleton) cache.
///
/// # Examples
/// ```
/// # use recache::cache::Cache;
/// # use recache::fetcher;
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let cache = Cache::new(fetcher::value(|| async { Ok(42) }));
/// assert_eq!(cache.get(()).await.unwrap(), 42);
/// # });
/// ```
pub fn value<F, Fut, V>(fetch: F) -> ValueFn<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    ValueFn { fetch }
}

/// Wraps an async closure into a [Fetcher] for a keyed cache.
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
pub fn keyed<F, Fut, K, V>(fetch: F) -> KeyFn<F>
where
    F: Fn(K) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    K: Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    KeyFn { fetch }
}

/// Wraps an async closure into a [Fetcher] for a keyed cache whose callers pass a helper along.
///
/// # Examples
/// ```
/// # use recache::cache::Cache;
/// # use recache::fetcher;
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let cache = Cache::new(fetcher::keyed_with_helper(|key: u64, factor: u64| async move {
///     Ok(key * factor)
/// }));
/// assert_eq!(cache.get_with(21, 2).await.unwrap(), 42);
/// # });
/// ```
pub fn keyed_with_helper<F, Fut, K, H, V>(fetch: F) -> KeyHelperFn<F>
where
    F: Fn(K, H) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    K: Send + 'static,
    H: Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    KeyHelperFn { fetch }
}

#[async_trait]
impl<F, Fut, V> Fetcher<(), ()> for ValueFn<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    type Value = V;

    async fn fetch(&self, _key: (), _helper: ()) -> anyhow::Result<V> {
        (self.fetch)().await
    }
}

#[async_trait]
impl<F, Fut, K, V> Fetcher<K, ()> for KeyFn<F>
where
    F: Fn(K) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    K: Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    type Value = V;

    async fn fetch(&self, key: K, _helper: ()) -> anyhow::Result<V> {
        (self.fetch)(key).await
    }
}

#[async_trait]
impl<F, Fut, K, H, V> Fetcher<K, H> for KeyHelperFn<F>
where
    F: Fn(K, H) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    K: Send + 'static,
    H: Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    type Value = V;

    async fn fetch(&self, key: K, helper: H) -> anyhow::Result<V> {
        (self.fetch)(key, helper).await
    }
}

#[cfg(test)]
mod tests {
    use super::Fetcher;

    #[test]
    fn closures_of_all_arities_are_adapted() {
        crate::testing::test_async(async {
            let unkeyed = super::value(|| async { Ok("constant") });
            assert_eq!(unkeyed.fetch((), ()).await.unwrap(), "constant");

            let keyed = super::keyed(|key: u64| async move { Ok(key + 1) });
            assert_eq!(keyed.fetch(41, ()).await.unwrap(), 42);

            let assisted =
                super::keyed_with_helper(|key: u64, offset: u64| async move { Ok(key + offset) });
            assert_eq!(assisted.fetch(40, 2).await.unwrap(), 42);
        });
    }

    #[test]
    fn fetch_errors_are_passed_through() {
        crate::testing::test_async(async {
            let failing = super::keyed(|_key: u64| async move {
                anyhow::Result::<u64>::Err(anyhow::anyhow!("no backend"))
            });

            assert_eq!(
                failing.fetch(1, ()).await.unwrap_err().to_string(),
                "no backend"
            );
        });
    }
}
