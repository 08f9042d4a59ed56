//! These tests are intended to ensure that the fetch function is called the
//! correct number of times, with the correct keys, for different
//! configurations.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use keybatch::{Batcher, BatcherConfig, FetchOutput, Fetcher};

/// Stringifies each key and records every invocation's batch size.
#[derive(Default)]
struct Stringify {
    calls: Arc<AtomicUsize>,
    batch_sizes: Arc<Mutex<Vec<usize>>>,
}

impl Stringify {
    fn new() -> Self {
        Self::default()
    }

    fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }

    fn batch_sizes(&self) -> Arc<Mutex<Vec<usize>>> {
        Arc::clone(&self.batch_sizes)
    }
}

#[async_trait]
impl Fetcher<u32, String> for Stringify {
    type Error = String;

    async fn fetch(&self, keys: &[u32]) -> FetchOutput<String, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.batch_sizes.lock().unwrap().push(keys.len());

        let results = keys.iter().map(u32::to_string).collect();
        let errors = keys.iter().map(|_| None).collect();
        (results, errors)
    }
}

fn config(max_batch_size: usize, window_ms: u64) -> BatcherConfig {
    BatcherConfig {
        max_batch_size,
        batch_window: Duration::from_millis(window_ms),
        cache_results: true,
        publish_results: false,
    }
}

#[tokio::test]
async fn concurrent_loads_share_one_fetch() {
    let fetcher = Stringify::new();
    let calls = fetcher.calls();
    let batcher = Batcher::new(fetcher, config(100, 20));

    let (a, b) = tokio::join!(batcher.load(10), batcher.load(20));

    assert_eq!(a.unwrap(), "10");
    assert_eq!(b.unwrap(), "20");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn duplicate_keys_occupy_one_slot() {
    let fetcher = Stringify::new();
    let calls = fetcher.calls();
    let sizes = fetcher.batch_sizes();
    let batcher = Batcher::new(fetcher, config(100, 20));

    let (a, b, c, d) = tokio::join!(
        batcher.load(10),
        batcher.load(10),
        batcher.load(10),
        batcher.load(20),
    );

    assert_eq!(a.unwrap(), "10");
    assert_eq!(b.unwrap(), "10");
    assert_eq!(c.unwrap(), "10");
    assert_eq!(d.unwrap(), "20");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // The fetch saw each distinct key exactly once.
    assert_eq!(*sizes.lock().unwrap(), vec![2]);
}

#[tokio::test]
async fn capacity_close_opens_a_new_batch() {
    let fetcher = Stringify::new();
    let calls = fetcher.calls();
    let sizes = fetcher.batch_sizes();
    let batcher = Batcher::new(fetcher, config(2, 30));

    // The first two keys fill a batch and trigger an immediate fetch; the
    // third opens a new batch that closes on its window instead.
    let thunks = vec![
        batcher.load_thunk(1),
        batcher.load_thunk(2),
        batcher.load_thunk(3),
    ];

    let results: Vec<String> = futures::future::join_all(thunks)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();
    assert_eq!(results, vec!["1", "2", "3"]);

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(*sizes.lock().unwrap(), vec![2, 1]);
}

#[tokio::test]
async fn timeout_closes_a_below_capacity_batch() {
    let fetcher = Stringify::new();
    let calls = fetcher.calls();
    let sizes = fetcher.batch_sizes();
    let batcher = Batcher::new(fetcher, config(100, 50));

    let start = Instant::now();
    let result = batcher.load(7).await;

    assert_eq!(result.unwrap(), "7");
    assert!(start.elapsed() >= Duration::from_millis(40));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(*sizes.lock().unwrap(), vec![1]);
}

#[tokio::test]
async fn load_all_preserves_input_ordering() {
    let fetcher = Stringify::new();
    let calls = fetcher.calls();
    let sizes = fetcher.batch_sizes();
    let batcher = Batcher::new(fetcher, config(100, 20));

    let results = batcher.load_all(vec![5, 1, 5, 9]).await;
    let results: Vec<String> = results.into_iter().map(Result::unwrap).collect();

    assert_eq!(results, vec!["5", "1", "5", "9"]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(*sizes.lock().unwrap(), vec![3]);
}

/// Spawn several independent tasks and confirm a single fetch fulfills all
/// of them.
#[tokio::test(flavor = "multi_thread")]
async fn concurrent_tasks_land_in_one_batch() {
    let fetcher = Stringify::new();
    let calls = fetcher.calls();
    let batcher = Batcher::new(fetcher, config(100, 40));

    let tasks: Vec<_> = (0..4u32)
        .map(|key| {
            let batcher = batcher.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(key as u64 * 2)).await;
                batcher.load(key).await.unwrap()
            })
        })
        .collect();

    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await.unwrap());
    }

    assert_eq!(results, vec!["0", "1", "2", "3"]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn sequential_loads_open_separate_batches() {
    let fetcher = Stringify::new();
    let calls = fetcher.calls();
    let batcher = Batcher::new(fetcher, config(100, 10));

    assert_eq!(batcher.load(1).await.unwrap(), "1");
    assert_eq!(batcher.load(2).await.unwrap(), "2");

    // The first batch closed on its window before the second key arrived.
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

/// A fetch that returns fewer results than keys, with no covering error.
struct ShortFetch;

#[async_trait]
impl Fetcher<u32, String> for ShortFetch {
    type Error = String;

    async fn fetch(&self, keys: &[u32]) -> FetchOutput<String, String> {
        (vec![keys[0].to_string()], keys.iter().map(|_| None).collect())
    }
}

#[tokio::test]
async fn short_fetch_surfaces_missing_result() {
    let batcher = Batcher::new(ShortFetch, config(100, 10));

    let (a, b) = tokio::join!(batcher.load(1), batcher.load(2));

    assert_eq!(a.unwrap(), "1");
    assert!(matches!(b, Err(keybatch::LoadError::MissingResult)));
}
