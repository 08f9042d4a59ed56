//! Keybatch batches many small, concurrent point lookups ("fetch item by
//! key") into fewer, larger backend calls, and optionally caches resolved
//! results so repeated lookups of the same key are free. It exists to defeat
//! the N+1 query problem inherent to graph-shaped APIs: a single incoming
//! request may trigger hundreds of independent "load related entity by id"
//! calls from unrelated parts of a response tree, and without batching each
//! one becomes its own backend round trip.
//!
//! ## Overview
//!
//! Suppose you have an API to fetch user data by id, and the API supports
//! batching: you can supply multiple ids in one request and get results for
//! all of them. Adapt it to the [`Fetcher`] trait, which takes the batched
//! keys and returns parallel result and error arrays:
//!
//! ```
//! use async_trait::async_trait;
//! use keybatch::{FetchOutput, Fetcher};
//!
//! #[derive(Debug, Clone)]
//! struct User {
//!     id: u64,
//!     name: String,
//! }
//!
//! struct UserFetcher;
//!
//! #[async_trait]
//! impl Fetcher<u64, User> for UserFetcher {
//!     type Error = String;
//!
//!     async fn fetch(&self, keys: &[u64]) -> FetchOutput<User, String> {
//!         // One backend call for the whole batch.
//!         let users = keys
//!             .iter()
//!             .map(|&id| User { id, name: format!("user-{id}") })
//!             .collect();
//!         let errors = keys.iter().map(|_| None).collect();
//!         (users, errors)
//!     }
//! }
//! ```
//!
//! The error array is positional (one entry per key) unless it has exactly
//! one element, in which case that single error applies to every key in the
//! batch; use that form for fetch-level failures like a lost connection.
//!
//! Then create a [`Batcher`], typically one per incoming request so the
//! cache is request-scoped, and load keys through it from as many
//! concurrent tasks as you like:
//!
//! ```
//! # use async_trait::async_trait;
//! # use keybatch::{FetchOutput, Fetcher};
//! # #[derive(Debug, Clone)]
//! # struct User { id: u64, name: String }
//! # struct UserFetcher;
//! # #[async_trait]
//! # impl Fetcher<u64, User> for UserFetcher {
//! #     type Error = String;
//! #     async fn fetch(&self, keys: &[u64]) -> FetchOutput<User, String> {
//! #         (keys.iter().map(|&id| User { id, name: String::new() }).collect(),
//! #          keys.iter().map(|_| None).collect())
//! #     }
//! # }
//! use keybatch::{Batcher, BatcherConfig};
//!
//! # async fn example() {
//! let users = Batcher::new(UserFetcher, BatcherConfig::default());
//!
//! // These two lookups land in the same batch: one backend call.
//! let (a, b) = tokio::join!(users.load(1), users.load(2));
//! # let _ = (a, b);
//!
//! // A repeat lookup is a cache hit; no batch interaction at all.
//! let again = users.load(1).await;
//! # let _ = again;
//! # }
//! ```
//!
//! A batch closes when it reaches `max_batch_size` or when `batch_window`
//! elapses after its first key, whichever comes first; closing invokes the
//! fetch function exactly once with the batch's distinct keys and fans the
//! results back out to every waiting caller.
//!
//! ## Thunks
//!
//! [`Batcher::load_thunk`] routes its key immediately but defers waiting
//! until the returned future is awaited. This lets a single task issue
//! lookups against several batchers before blocking on any of them, so
//! every batch fills as much as possible first:
//!
//! ```
//! # use async_trait::async_trait;
//! # use keybatch::{Batcher, BatcherConfig, FetchOutput, Fetcher};
//! # struct Echo;
//! # #[async_trait]
//! # impl Fetcher<u32, String> for Echo {
//! #     type Error = String;
//! #     async fn fetch(&self, keys: &[u32]) -> FetchOutput<String, String> {
//! #         (keys.iter().map(u32::to_string).collect(), vec![])
//! #     }
//! # }
//! # async fn example() {
//! # let batcher = Batcher::new(Echo, BatcherConfig::default());
//! let one = batcher.load_thunk(1);
//! let two = batcher.load_thunk(2);
//! // ...issue more lookups, then resolve:
//! let one = one.await;
//! let two = two.await;
//! # let _ = (one, two);
//! # }
//! ```
//!
//! ## Key modes
//!
//! Dedup and cache keying compare keys directly by default, which requires
//! `K: Eq + Hash + Clone`. For key types that can't provide that (a
//! query-parameters struct full of vectors, say), construct the batcher with
//! [`Batcher::with_json_keys`]: keys are serialized with `serde_json` and
//! compared as strings, so any `Serialize` key works and structural equality
//! falls out of the serialization. The loading operations are identical in
//! both modes.
//!
//! ## Design notes
//!
//! Batching and caching are fully transparent on the error path: a failed
//! lookup looks exactly like a direct, unbatched failed lookup. The engine
//! never retries a fetch, never evicts a cache entry, and never imposes a
//! deadline on the fetch function; failed keys are simply not cached, so the
//! next lookup for one retries in a fresh batch.
//!
//! The fetch for a closed batch runs as a detached task, so a thunk that is
//! never awaited still lets the rest of its batch complete, and dropping a
//! pending load does not abort the batch for the other waiters.

mod batch;
mod batcher;
mod error;
mod key;

pub use batcher::{Batcher, BatcherConfig, FetchOutput, Fetcher};
pub use error::LoadError;
pub use key::{DirectKeys, JsonKeys, KeyMode};
