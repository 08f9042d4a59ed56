//! Key-mode strategies: how keys are deduplicated within a batch and how they
//! are keyed in the result cache.
//!
//! Most key types implement `Eq + Hash + Clone` and should use [`DirectKeys`],
//! which compares keys directly. Key types that can't sensibly do so (say, a
//! query-parameters struct full of vectors, where equality should be
//! structural) can use [`JsonKeys`], which serializes each key with
//! `serde_json` and compares the serialized strings instead. The two modes are
//! selected once at construction time and differ only in dedup and cache
//! keying; the public loading operations are identical.

use std::hash::Hash;

use serde::Serialize;

/// Strategy for turning a lookup key into the value used for in-batch
/// deduplication and result caching.
///
/// Implemented by the [`DirectKeys`] and [`JsonKeys`] markers; selected via
/// the batcher's constructor rather than carried at runtime.
pub trait KeyMode<K>: Send + Sync + 'static {
    /// The comparable form of a key. For [`DirectKeys`] this is the key
    /// itself; for [`JsonKeys`] it is the key's JSON text.
    type CacheKey: Eq + Hash + Clone + Send + Sync + 'static;

    /// Produce the comparable form of `key`.
    ///
    /// Only [`JsonKeys`] can fail here; a failure is reported to the single
    /// caller that supplied the key, without entering any batch.
    fn cache_key(key: &K) -> Result<Self::CacheKey, serde_json::Error>;
}

/// Key mode for keys that support direct comparison. Requires
/// `K: Eq + Hash + Clone`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectKeys;

impl<K> KeyMode<K> for DirectKeys
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    type CacheKey = K;

    fn cache_key(key: &K) -> Result<K, serde_json::Error> {
        Ok(key.clone())
    }
}

/// Key mode for keys that do not support direct comparison. Keys are
/// serialized to JSON and compared as strings, so any `Serialize` type works,
/// and two structurally-equal keys occupy the same batch slot.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonKeys;

impl<K> KeyMode<K> for JsonKeys
where
    K: Serialize + Send + Sync + 'static,
{
    type CacheKey = String;

    fn cache_key(key: &K) -> Result<String, serde_json::Error> {
        serde_json::to_string(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct QueryKey {
        ids: Vec<u64>,
        include_hidden: bool,
    }

    #[test]
    fn structurally_equal_keys_serialize_identically() {
        let a = QueryKey {
            ids: vec![1, 2, 3],
            include_hidden: false,
        };
        let b = QueryKey {
            ids: vec![1, 2, 3],
            include_hidden: false,
        };

        let ka = <JsonKeys as KeyMode<QueryKey>>::cache_key(&a).unwrap();
        let kb = <JsonKeys as KeyMode<QueryKey>>::cache_key(&b).unwrap();
        assert_eq!(ka, kb);
    }

    #[test]
    fn distinct_keys_serialize_differently() {
        let a = QueryKey {
            ids: vec![1, 2, 3],
            include_hidden: false,
        };
        let b = QueryKey {
            ids: vec![1, 2, 3],
            include_hidden: true,
        };

        let ka = <JsonKeys as KeyMode<QueryKey>>::cache_key(&a).unwrap();
        let kb = <JsonKeys as KeyMode<QueryKey>>::cache_key(&b).unwrap();
        assert_ne!(ka, kb);
    }

    #[test]
    fn direct_keys_pass_through() {
        let key = 42u32;
        assert_eq!(<DirectKeys as KeyMode<u32>>::cache_key(&key).unwrap(), 42);
    }
}
