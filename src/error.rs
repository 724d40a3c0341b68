//! Provides the error type reported by cache lookups.
//!
//! A failed fetch has to be delivered to **every** caller which joined the collapsed fetch for
//! the affected key. A plain [anyhow::Error] cannot do this, as it isn't cloneable. Therefore we
//! wrap it into an [Arc] so that the very same underlying error can be handed out many times.
use std::fmt;
use std::sync::Arc;

/// Represents an error which occurred while computing or storing a cached value.
///
/// This is a cheaply cloneable wrapper around [anyhow::Error]. Cloning is required as a single
/// fetch may serve many concurrent callers, all of which receive the same error if the fetch
/// fails.
///
/// # Examples
/// ```
/// # use recache::error::CacheError;
/// let error = CacheError::from(anyhow::anyhow!("upstream unavailable"));
/// let other = error.clone();
///
/// assert_eq!(error.to_string(), "upstream unavailable");
/// assert_eq!(other.to_string(), "upstream unavailable");
/// ```
#[derive(Clone)]
pub struct CacheError {
    error: Arc<anyhow::Error>,
}

/// Represents the result of a cache operation.
pub type CacheResult<T> = Result<T, CacheError>;

impl CacheError {
    /// Creates an error from a plain message.
    pub fn msg<M: fmt::Display + fmt::Debug + Send + Sync + 'static>(message: M) -> Self {
        anyhow::Error::msg(message).into()
    }

    /// Provides access to the underlying [anyhow::Error].
    pub fn inner(&self) -> &anyhow::Error {
        &self.error
    }
}

impl From<anyhow::Error> for CacheError {
    fn from(error: anyhow::Error) -> Self {
        CacheError {
            error: Arc::new(error),
        }
    }
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error, f)
    }
}

impl fmt::Debug for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.error, f)
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.error.as_ref().as_ref())
    }
}
