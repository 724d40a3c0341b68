//! recache provides a stale-while-revalidate cache for async lookups.
//!
//! The cache wraps an arbitrary async **fetcher** (e.g. a database query or an HTTP call) behind
//! a key-addressed store. Lookups within the **fresh** window are answered instantly from the
//! store. Once a value turns **stale**, it is still answered instantly, but a refresh is started
//! in the background. Only an **expired** (or unknown) value forces the caller to await the
//! fetcher. Concurrent lookups for the same key always collapse into a single fetch.
//!
//! # Example
//!
//! ```
//! use recache::cache::Cache;
//! use recache::fetcher;
//! use std::time::Duration;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let cache = Cache::builder(fetcher::keyed(|user_id: u64| async move {
//!     // Talk to the slow upstream system here...
//!     Ok(format!("user-{}", user_id))
//! }))
//! .fresh(Duration::from_secs(60))
//! .stale(Duration::from_secs(600))
//! .build();
//!
//! assert_eq!(cache.get(42).await.unwrap(), "user-42");
//! # });
//! ```
//!
//! Keys can be any [serde::Serialize] type - logically equal keys collapse to the same entry, no
//! matter how their fields are ordered (see [stringify]). The backing store is replaceable via
//! [storage::StorageEngine], e.g. to share entries with other processes through an external
//! system.
#![deny(
    warnings,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_results
)]

pub mod cache;
pub mod error;
pub mod fetcher;
pub mod storage;
pub mod stringify;

pub use crate::cache::{Cache, CacheBuilder, CacheStats};
pub use crate::error::{CacheError, CacheResult};
pub use crate::fetcher::Fetcher;
pub use crate::storage::{CacheRecord, MemoryStorage, StorageEngine};

use simplelog::{ConfigBuilder, LevelFilter, SimpleLogger};
use std::sync::Once;

/// Initializes the logging framework.
///
/// This is entirely optional: the cache logs through the [log] facade and works with whatever
/// logger the embedding application installed. Applications without a logger of their own can
/// call this to get sensibly formatted terminal output.
pub fn init_logging() {
    static INIT_LOGGING: Once = Once::new();

    // We need to guard this as e.g. the tests would otherwise initialize the logging system
    // several times...
    INIT_LOGGING.call_once(|| {
        if let Err(error) = SimpleLogger::init(
            LevelFilter::Debug,
            ConfigBuilder::new()
                .set_time_format_rfc3339()
                .set_thread_level(LevelFilter::Trace)
                .set_target_level(LevelFilter::Error)
                .build(),
        ) {
            panic!("Failed to initialize logging system: {}", error);
        }
    });
}

/// Spawns a future via `tokio::spawn` while discarding the returned join handle.
///
/// Used for fire-and-forget work like background refreshes, where nobody awaits the task and
/// keeping the handle around would only trip the unused-results lint.
#[macro_export]
macro_rules! spawn {
    ($e:expr) => {{
        std::mem::drop(tokio::spawn($e));
    }};
}

#[cfg(test)]
mod testing {
    use std::future::Future;
    use std::sync::{Mutex, MutexGuard, PoisonError};

    lazy_static::lazy_static! {
        /// Serializes tests which manipulate the mocked clock, as the clock is process-global.
        static ref CLOCK: Mutex<()> = Mutex::new(());
    }

    /// Grabs the lock guarding the mocked clock.
    ///
    /// Every test which advances (or depends on) the clock has to hold this guard for its whole
    /// duration - otherwise a concurrently running test could age its entries mid-assertion.
    pub fn lock_clock() -> MutexGuard<'static, ()> {
        CLOCK.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Executes the given future on a single-threaded runtime.
    ///
    /// Using the current-thread flavor keeps background refreshes on the test thread, so a short
    /// sleep reliably drives them to completion.
    pub fn test_async<F: Future>(future: F) -> F::Output {
        super::init_logging();

        match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime.block_on(future),
            _ => panic!("Unable to start a tokio runtime for a test!"),
        }
    }
}
