//! The error surface returned to individual `load` callers.

use std::sync::Arc;

use thiserror::Error;

/// The error returned from a single keyed lookup.
///
/// The generic parameter `E` is the error type of the [`Fetcher`] backing the
/// batcher. Fetcher errors are `Clone` because a single error may fan out to
/// every caller waiting on the same batch; the engine itself never retries,
/// suppresses, or logs them.
///
/// [`Fetcher`]: crate::Fetcher
#[derive(Debug, Clone, Error)]
pub enum LoadError<E> {
    /// The fetch function reported an error for this key, or a single error
    /// covering the whole batch.
    #[error("{0}")]
    Fetch(E),

    /// JSON key mode only: the key could not be serialized for deduplication
    /// and cache keying. Returned immediately to the affected caller; the key
    /// never enters a batch and no other caller is affected.
    ///
    /// Wrapped in an `Arc` because `serde_json::Error` is not `Clone`, and a
    /// thunk holding this error may be resolved alongside others.
    #[error("failed to serialize key for batching: {0}")]
    KeySerialization(Arc<serde_json::Error>),

    /// The fetch function returned fewer results than it was given keys,
    /// with no error covering the missing position. This is a contract
    /// violation in the fetch function, surfaced to the orphaned caller.
    #[error("batch fetch returned no result for this key")]
    MissingResult,
}

impl<E> LoadError<E> {
    /// Returns the underlying fetch error, if this is a fetch-level failure.
    pub fn fetch_error(&self) -> Option<&E> {
        match self {
            LoadError::Fetch(err) => Some(err),
            _ => None,
        }
    }
}
