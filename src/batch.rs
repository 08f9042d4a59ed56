//! The batch itself: a time- and size-bounded collection of pending keys,
//! plus the completion signal shared by every caller waiting on any of them.
//!
//! A batch is owned exclusively by its batcher and moves through exactly one
//! state transition, `Open -> Closed`, performed under the batch's own lock.
//! Whichever path performs that transition (capacity reached, or the window
//! timer expiring) takes the accumulated keys with it and becomes the one
//! path responsible for running the fetch. Once the fetch completes, the
//! outcome is written in full and the completion token is cancelled; waiters
//! therefore never observe a partially written outcome.

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::LoadError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BatchStatus {
    Open,
    Closed,
}

/// The lock-guarded, mutable portion of a batch. `keys` and `cache_keys` are
/// parallel and append-only while the batch is open; a key's index here is
/// its index into the eventual outcome.
pub(crate) struct BatchCore<K, C> {
    pub(crate) status: BatchStatus,
    pub(crate) keys: Vec<K>,
    pub(crate) cache_keys: Vec<C>,
}

/// The parallel result/error arrays produced by one fetch invocation, written
/// exactly once per batch.
pub(crate) struct BatchOutcome<V, E> {
    pub(crate) results: Vec<V>,
    pub(crate) errors: Vec<Option<E>>,
}

pub(crate) struct Batch<K, V, E, C> {
    pub(crate) id: u32,
    pub(crate) core: Mutex<BatchCore<K, C>>,
    outcome: RwLock<Option<BatchOutcome<V, E>>>,

    /// One-shot broadcast: cancelled exactly once, after `outcome` is
    /// written. Waiters observe completion permanently.
    pub(crate) done: CancellationToken,
}

impl<K, V, E, C> Batch<K, V, E, C> {
    pub(crate) fn new(id: u32, capacity: usize) -> Self {
        Batch {
            id,
            core: Mutex::new(BatchCore {
                status: BatchStatus::Open,
                keys: Vec::with_capacity(capacity),
                cache_keys: Vec::with_capacity(capacity),
            }),
            outcome: RwLock::new(None),
            done: CancellationToken::new(),
        }
    }

    /// The timeout closing path. Returns the accumulated keys if this call
    /// performed the `Open -> Closed` transition, or `None` if the capacity
    /// path won the race and the fetch is already someone else's job.
    pub(crate) fn close_for_timeout(&self) -> Option<Vec<K>> {
        let mut core = self.core.lock();
        if core.status != BatchStatus::Open {
            return None;
        }
        core.status = BatchStatus::Closed;
        let keys = std::mem::take(&mut core.keys);
        drop(core);

        debug!(batch_id = self.id, size = keys.len(), "batch window elapsed");
        Some(keys)
    }

    /// Store the fetch outcome and wake every waiter. Runs for exactly one
    /// task per batch, and never under the batch lock.
    pub(crate) fn complete(&self, results: Vec<V>, errors: Vec<Option<E>>) {
        *self.outcome.write() = Some(BatchOutcome { results, errors });
        self.done.cancel();
    }
}

impl<K, V: Clone, E: Clone, C> Batch<K, V, E, C> {
    /// Read the result at `index`. Only valid after `done` has fired.
    pub(crate) fn resolved(&self, index: usize) -> Result<V, LoadError<E>> {
        let guard = self.outcome.read();
        let outcome = guard
            .as_ref()
            .expect("completion signal fired before the batch outcome was written");
        outcome.keyed_result(index)
    }
}

impl<V: Clone, E: Clone> BatchOutcome<V, E> {
    /// Fan a position in the parallel arrays back out to a single caller's
    /// `Result`.
    fn keyed_result(&self, index: usize) -> Result<V, LoadError<E>> {
        if let Some(err) = error_at(&self.errors, index) {
            return Err(LoadError::Fetch(err));
        }

        match self.results.get(index) {
            Some(value) => Ok(value.clone()),
            None => Err(LoadError::MissingResult),
        }
    }
}

/// The error-shaping rule: a one-element error array applies to every key in
/// the batch (a fetch-level failure); otherwise errors are positional.
///
/// Note that a single-key batch with one real per-key error is
/// indistinguishable from a batch-wide failure under this rule. That
/// conflation is deliberate and load-bearing for callers; do not "fix" it.
pub(crate) fn error_at<E: Clone>(errors: &[Option<E>], index: usize) -> Option<E> {
    if errors.len() == 1 {
        errors[0].clone()
    } else {
        errors.get(index).cloned().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(results: Vec<&str>, errors: Vec<Option<&str>>) -> BatchOutcome<String, String> {
        BatchOutcome {
            results: results.into_iter().map(String::from).collect(),
            errors: errors.into_iter().map(|e| e.map(String::from)).collect(),
        }
    }

    #[test]
    fn positional_errors_only_hit_their_own_index() {
        let out = outcome(vec!["a", "b", "c"], vec![None, Some("missing"), None]);

        assert_eq!(out.keyed_result(0).unwrap(), "a");
        assert!(matches!(
            out.keyed_result(1),
            Err(LoadError::Fetch(e)) if e == "missing"
        ));
        assert_eq!(out.keyed_result(2).unwrap(), "c");
    }

    #[test]
    fn single_error_applies_to_every_key() {
        let out = outcome(vec![], vec![Some("backend down")]);

        for index in 0..3 {
            assert!(matches!(
                out.keyed_result(index),
                Err(LoadError::Fetch(e)) if e == "backend down"
            ));
        }
    }

    #[test]
    fn single_nil_error_means_success_for_all() {
        let out = outcome(vec!["a", "b"], vec![None]);

        assert_eq!(out.keyed_result(0).unwrap(), "a");
        assert_eq!(out.keyed_result(1).unwrap(), "b");
    }

    #[test]
    fn short_result_array_surfaces_missing_result() {
        let out = outcome(vec!["a"], vec![None, None]);

        assert_eq!(out.keyed_result(0).unwrap(), "a");
        assert!(matches!(out.keyed_result(1), Err(LoadError::MissingResult)));
    }

    #[test]
    fn empty_error_array_is_all_success() {
        let out = outcome(vec!["a", "b"], vec![]);

        assert_eq!(out.keyed_result(0).unwrap(), "a");
        assert_eq!(out.keyed_result(1).unwrap(), "b");
    }

    #[test]
    fn timeout_close_wins_only_once() {
        let batch: Batch<u32, String, String, u32> = Batch::new(0, 4);
        {
            let mut core = batch.core.lock();
            core.keys.push(7);
            core.cache_keys.push(7);
        }

        let keys = batch.close_for_timeout().expect("first close wins");
        assert_eq!(keys, vec![7]);
        assert!(batch.close_for_timeout().is_none());
    }
}
