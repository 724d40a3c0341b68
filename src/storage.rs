//! Provides the storage abstraction behind a cache along with the built-in in-memory engine.
//!
//! A [Cache](crate::cache::Cache) never talks to its backing store directly - it only depends on
//! the [StorageEngine] capability (get/set/delete/clear of a [CacheRecord] under a canonical
//! string key). The default engine is [MemoryStorage], an in-process store which expires entries
//! by age. External backends (think of memcached or Redis) are attached by implementing
//! [StorageEngine] in a thin adapter - the cache deliberately makes no attempt to guess what
//! kind of client it was given.
//!
//! An engine may be shared: several caches (or in case of an external backend, several
//! processes) can operate on the same store. The cache tolerates entries appearing or
//! disappearing underneath it.
#[cfg(test)]
use mock_instant::global::Instant;
#[cfg(not(test))]
use std::time::Instant;

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

/// Represents a single cached value along with the time it was produced.
///
/// Records are immutable: a refresh never updates a record in place but always stores a newly
/// constructed one.
#[derive(Clone, Debug)]
pub struct CacheRecord<V> {
    data: V,
    fetched: Instant,
}

impl<V> CacheRecord<V> {
    /// Creates a record for a value which was produced just now.
    pub fn new(data: V) -> Self {
        CacheRecord {
            data,
            fetched: Instant::now(),
        }
    }

    /// Provides access to the cached value.
    pub fn data(&self) -> &V {
        &self.data
    }

    /// Unwraps the record into the cached value.
    pub fn into_data(self) -> V {
        self.data
    }

    /// Returns the age of this record, i.e. the time elapsed since the value was produced.
    pub fn age(&self) -> Duration {
        self.fetched.elapsed()
    }
}

/// Provides the capability a cache requires from its backing store.
///
/// Keys are always canonical strings (see [crate::stringify]). Implementations are free to be
/// effectively synchronous - an in-process engine simply never suspends within these methods.
///
/// Note that an engine is not required to enforce any lifetime or capacity policy of its own.
/// The cache applies its freshness rules to whatever a [get](StorageEngine::get) returns, so an
/// engine which never evicts is merely wasteful, not incorrect.
#[async_trait]
pub trait StorageEngine<V>: Send + Sync {
    /// Returns the record stored for the given key, if any.
    async fn get(&self, key: &str) -> anyhow::Result<Option<CacheRecord<V>>>;

    /// Stores the given record for the given key, replacing any previous one.
    async fn set(&self, key: &str, record: CacheRecord<V>) -> anyhow::Result<()>;

    /// Deletes the record stored for the given key, if any.
    async fn delete(&self, key: &str) -> anyhow::Result<()>;

    /// Deletes all records in this store.
    async fn clear(&self) -> anyhow::Result<()>;
}

/// An occupied slot keeps its node, a vacant one points to the next vacant slot (if any),
/// forming the free list.
enum Slot<V> {
    Occupied(Node<V>),
    Vacant(Option<usize>),
}

/// A stored record linked into the expiry list via slot indices.
struct Node<V> {
    key: String,
    record: CacheRecord<V>,
    expires: Option<Instant>,
    prev: Option<usize>,
    next: Option<usize>,
}

/// The mutable interior of a [MemoryStorage].
///
/// Nodes live in an index-addressed arena instead of pointing at each other, which gives us
/// O(1) relinking without fighting the borrow checker over a cyclic ownership graph. Invariants:
/// the list reachable from `oldest` via `next` ends in `newest` and visits every entry of
/// `index`; `oldest` and `newest` are `None` iff the store is empty; list order equals
/// insertion/refresh order, which (with a constant max age) equals ascending expiry order.
struct Store<V> {
    index: HashMap<String, usize>,
    slots: Vec<Slot<V>>,
    free: Option<usize>,
    oldest: Option<usize>,
    newest: Option<usize>,
}

/// Provides the built-in storage engine: an in-process store with time-based expiry.
///
/// Every write re-appends the entry at the "newest" end of an internal linked list, so the list
/// stays ordered by expiry and pruning only ever inspects the oldest entries. Pruning runs
/// opportunistically after each write. With `max_age` set to `None`, entries never expire and
/// no pruning takes place.
///
/// # Examples
/// ```
/// # use recache::storage::{CacheRecord, MemoryStorage, StorageEngine};
/// # use std::time::Duration;
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let storage = MemoryStorage::new(Some(Duration::from_secs(600)));
///
/// storage.set("answer", CacheRecord::new(42)).await.unwrap();
/// assert_eq!(*storage.get("answer").await.unwrap().unwrap().data(), 42);
///
/// storage.delete("answer").await.unwrap();
/// assert!(storage.get("answer").await.unwrap().is_none());
/// # });
/// ```
pub struct MemoryStorage<V> {
    max_age: Option<Duration>,
    store: Mutex<Store<V>>,
}

impl<V> MemoryStorage<V> {
    /// Creates an engine whose entries expire `max_age` after each write.
    ///
    /// Passing `None` disables expiry entirely.
    pub fn new(max_age: Option<Duration>) -> Self {
        MemoryStorage {
            max_age,
            store: Mutex::new(Store {
                index: HashMap::new(),
                slots: Vec::new(),
                free: None,
                oldest: None,
                newest: None,
            }),
        }
    }

    /// Returns the number of currently stored entries.
    ///
    /// Note that this may include entries which are already past their expiry but have not yet
    /// been pruned, as pruning only happens on writes.
    pub fn len(&self) -> usize {
        self.locked().index.len()
    }

    /// Determines if the store is completely empty.
    pub fn is_empty(&self) -> bool {
        self.locked().index.is_empty()
    }

    fn locked(&self) -> MutexGuard<'_, Store<V>> {
        // A poisoned lock only indicates that another caller panicked mid-operation. The store
        // itself repairs all links before releasing the guard, so we keep going.
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<V> Store<V> {
    fn node(&self, index: usize) -> &Node<V> {
        match &self.slots[index] {
            Slot::Occupied(node) => node,
            Slot::Vacant(_) => unreachable!("linked entry points at a vacant slot"),
        }
    }

    fn node_mut(&mut self, index: usize) -> &mut Node<V> {
        match &mut self.slots[index] {
            Slot::Occupied(node) => node,
            Slot::Vacant(_) => unreachable!("linked entry points at a vacant slot"),
        }
    }

    /// Appends a new node at the "newest" end of the list, reusing a vacant slot if possible.
    fn append(&mut self, key: String, record: CacheRecord<V>, expires: Option<Instant>) {
        let node = Node {
            key: key.clone(),
            record,
            expires,
            prev: self.newest,
            next: None,
        };

        let index = match self.free {
            Some(index) => {
                self.free = match &self.slots[index] {
                    Slot::Vacant(next_free) => *next_free,
                    Slot::Occupied(_) => unreachable!("free list points at an occupied slot"),
                };
                self.slots[index] = Slot::Occupied(node);
                index
            }
            None => {
                self.slots.push(Slot::Occupied(node));
                self.slots.len() - 1
            }
        };

        match self.newest {
            Some(newest) => self.node_mut(newest).next = Some(index),
            None => self.oldest = Some(index),
        }
        self.newest = Some(index);
        let _ = self.index.insert(key, index);
    }

    /// Unlinks the entry stored for the given key, repairing neighbours and endpoints.
    fn remove(&mut self, key: &str) {
        let index = match self.index.remove(key) {
            Some(index) => index,
            None => return,
        };

        let (prev, next) = {
            let node = self.node(index);
            (node.prev, node.next)
        };

        if let Some(prev) = prev {
            self.node_mut(prev).next = next;
        }
        if let Some(next) = next {
            self.node_mut(next).prev = prev;
        }
        if self.newest == Some(index) {
            self.newest = prev;
        }
        if self.oldest == Some(index) {
            self.oldest = next;
        }

        self.slots[index] = Slot::Vacant(self.free);
        self.free = Some(index);
    }

    /// Deletes expired entries, walking from the oldest end of the list.
    ///
    /// As list order matches expiry order, this stops at the first entry which is still alive
    /// and therefore only ever touches entries which are actually expired.
    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.oldest {
            let node = self.node(oldest);
            match node.expires {
                Some(expires) if expires < now => {
                    let key = node.key.clone();
                    self.remove(&key);
                }
                _ => break,
            }
        }
    }
}

#[async_trait]
impl<V: Clone + Send + Sync> StorageEngine<V> for MemoryStorage<V> {
    async fn get(&self, key: &str) -> anyhow::Result<Option<CacheRecord<V>>> {
        let store = self.locked();
        Ok(store
            .index
            .get(key)
            .map(|index| store.node(*index).record.clone()))
    }

    async fn set(&self, key: &str, record: CacheRecord<V>) -> anyhow::Result<()> {
        let now = Instant::now();
        let expires = self.max_age.map(|max_age| now + max_age);

        let mut store = self.locked();
        store.remove(key);
        store.append(key.to_owned(), record, expires);
        store.prune(now);

        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.locked().remove(key);
        Ok(())
    }

    async fn clear(&self) -> anyhow::Result<()> {
        let mut store = self.locked();

        // Dropping the arena wholesale releases all nodes without walking the list to unlink
        // them one by one.
        store.index.clear();
        store.slots.clear();
        store.free = None;
        store.oldest = None;
        store.newest = None;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{CacheRecord, MemoryStorage, StorageEngine};
    use mock_instant::global::MockClock;
    use std::time::Duration;

    #[test]
    fn stored_records_can_be_read_back() {
        let _clock = crate::testing::lock_clock();
        crate::testing::test_async(async {
            let storage = MemoryStorage::new(Some(Duration::from_secs(60)));

            storage.set("foo", CacheRecord::new("bar")).await.unwrap();
            storage.set("baz", CacheRecord::new("qux")).await.unwrap();

            assert_eq!(*storage.get("foo").await.unwrap().unwrap().data(), "bar");
            assert_eq!(*storage.get("baz").await.unwrap().unwrap().data(), "qux");
            assert!(storage.get("unknown").await.unwrap().is_none());
            assert_eq!(storage.len(), 2);
        });
    }

    #[test]
    fn overwriting_relinks_the_entry_as_newest() {
        let _clock = crate::testing::lock_clock();
        crate::testing::test_async(async {
            let storage = MemoryStorage::new(Some(Duration::from_secs(60)));

            storage.set("a", CacheRecord::new(1)).await.unwrap();
            MockClock::advance(Duration::from_secs(10));
            storage.set("b", CacheRecord::new(2)).await.unwrap();

            // Re-writing "a" moves it behind "b" in the expiry list and restarts its lifetime...
            MockClock::advance(Duration::from_secs(30));
            storage.set("a", CacheRecord::new(3)).await.unwrap();
            assert_eq!(storage.len(), 2);

            // ...so once "b" expires, a write prunes "b" but keeps "a".
            MockClock::advance(Duration::from_secs(55));
            storage.set("c", CacheRecord::new(4)).await.unwrap();

            assert!(storage.get("b").await.unwrap().is_none());
            assert_eq!(*storage.get("a").await.unwrap().unwrap().data(), 3);
            assert_eq!(*storage.get("c").await.unwrap().unwrap().data(), 4);
        });
    }

    #[test]
    fn pruning_only_removes_expired_entries() {
        let _clock = crate::testing::lock_clock();
        crate::testing::test_async(async {
            let storage = MemoryStorage::new(Some(Duration::from_secs(60)));

            storage.set("old", CacheRecord::new(1)).await.unwrap();
            MockClock::advance(Duration::from_secs(30));
            storage.set("young", CacheRecord::new(2)).await.unwrap();

            // "old" is now 70s old, "young" only 40s...
            MockClock::advance(Duration::from_secs(40));
            storage.set("new", CacheRecord::new(3)).await.unwrap();

            assert!(storage.get("old").await.unwrap().is_none());
            assert!(storage.get("young").await.unwrap().is_some());
            assert!(storage.get("new").await.unwrap().is_some());
            assert_eq!(storage.len(), 2);
        });
    }

    #[test]
    fn deleting_repairs_the_list() {
        let _clock = crate::testing::lock_clock();
        crate::testing::test_async(async {
            let storage = MemoryStorage::new(Some(Duration::from_secs(60)));

            storage.set("a", CacheRecord::new(1)).await.unwrap();
            storage.set("b", CacheRecord::new(2)).await.unwrap();
            storage.set("c", CacheRecord::new(3)).await.unwrap();

            // Remove the middle entry, then both endpoints...
            storage.delete("b").await.unwrap();
            storage.delete("a").await.unwrap();
            storage.delete("c").await.unwrap();
            assert!(storage.is_empty());

            // The store remains fully usable, recycling the vacated slots.
            storage.set("d", CacheRecord::new(4)).await.unwrap();
            storage.set("e", CacheRecord::new(5)).await.unwrap();
            assert_eq!(*storage.get("d").await.unwrap().unwrap().data(), 4);
            assert_eq!(*storage.get("e").await.unwrap().unwrap().data(), 5);
            assert_eq!(storage.len(), 2);
        });
    }

    #[test]
    fn clear_empties_the_store() {
        let _clock = crate::testing::lock_clock();
        crate::testing::test_async(async {
            let storage = MemoryStorage::new(Some(Duration::from_secs(60)));

            storage.set("a", CacheRecord::new(1)).await.unwrap();
            storage.set("b", CacheRecord::new(2)).await.unwrap();
            storage.clear().await.unwrap();

            assert!(storage.is_empty());
            assert!(storage.get("a").await.unwrap().is_none());

            storage.set("c", CacheRecord::new(3)).await.unwrap();
            assert_eq!(*storage.get("c").await.unwrap().unwrap().data(), 3);
        });
    }

    #[test]
    fn unbounded_stores_never_prune() {
        let _clock = crate::testing::lock_clock();
        crate::testing::test_async(async {
            let storage = MemoryStorage::new(None);

            storage.set("eternal", CacheRecord::new(1)).await.unwrap();
            MockClock::advance(Duration::from_secs(60 * 60 * 24 * 365));
            storage.set("other", CacheRecord::new(2)).await.unwrap();

            assert!(storage.get("eternal").await.unwrap().is_some());
            assert_eq!(storage.len(), 2);
        });
    }

    #[test]
    fn record_age_tracks_the_clock() {
        let _clock = crate::testing::lock_clock();
        let record = CacheRecord::new(42);
        MockClock::advance(Duration::from_secs(90));

        assert!(record.age() >= Duration::from_secs(90));
        assert_eq!(record.into_data(), 42);
    }
}
