// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The sharded cache façade.
//!
//! This module provides the main [`Cache`] type and its builder. The façade
//! hashes each key once with xxH3 and dispatches to one of 256 buckets;
//! everything else - storage, lookup, eviction - happens inside the bucket.

use xxhash_rust::xxh3::xxh3_64;

use crate::bucket::{Bucket, EvictionPolicy};
use crate::entry::Entry;

/// Number of buckets in a [`Cache`].
///
/// Fixed: it keeps dispatch a single mask and trades lock contention against
/// per-bucket index overhead.
pub const BUCKET_COUNT: usize = 256;

/// Minimum effective capacity of a [`Cache`] in bytes (256 buckets at 256
/// bytes each).
pub const MIN_CAPACITY: usize = BUCKET_COUNT * 256;

/// A fixed-capacity byte cache with 256 lock-sharded buckets.
///
/// Keys and values are opaque byte sequences. Every entry lives inside one
/// bucket's pre-allocated ring buffer; storing an entry never allocates per
/// entry, and memory consumption never exceeds the configured capacity.
/// When a bucket runs out of room, its oldest entries are reclaimed by a
/// second-chance walk driven by each entry's recently-used bit.
///
/// All operations take `&self` and are safe to call from many threads;
/// operations on the same bucket serialize through that bucket's
/// reader/writer lock.
///
/// # Examples
///
/// ```
/// let cache = flatcache::Cache::new(64 * 1024);
///
/// assert!(cache.set(b"flatcache", b"is awesome"));
/// assert_eq!(cache.get(b"flatcache").as_deref(), Some(&b"is awesome"[..]));
///
/// assert!(cache.remove(b"flatcache"));
/// assert!(!cache.contains(b"flatcache"));
/// ```
pub struct Cache {
    buckets: Box<[Bucket]>,
    cap: usize,
}

impl Cache {
    /// Creates a cache with the given capacity in bytes.
    ///
    /// The effective capacity is floored at [`MIN_CAPACITY`]; each bucket
    /// receives `capacity / 256` bytes.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let cap = capacity.max(MIN_CAPACITY);
        let bucket_cap = cap / BUCKET_COUNT;
        Self {
            buckets: (0..BUCKET_COUNT).map(|_| Bucket::new(bucket_cap)).collect(),
            cap,
        }
    }

    /// Creates a new builder for configuring a `Cache`.
    ///
    /// # Examples
    ///
    /// ```
    /// let cache = flatcache::Cache::builder()
    ///     .capacity(1024 * 1024)
    ///     .build();
    /// assert_eq!(cache.capacity(), 1024 * 1024);
    /// ```
    #[must_use]
    pub fn builder() -> CacheBuilder {
        CacheBuilder::new()
    }

    /// The effective cache capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Resizes the cache, dropping all entries.
    pub fn reset(&mut self, capacity: usize) {
        let cap = capacity.max(MIN_CAPACITY);
        let bucket_cap = cap / BUCKET_COUNT;
        for bucket in &self.buckets {
            bucket.reset(bucket_cap);
        }
        self.cap = cap;
    }

    /// Total number of live entries.
    ///
    /// Takes every bucket's read lock in turn, so this is not meant for
    /// high-frequency calls.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.iter().map(Bucket::len).sum()
    }

    /// Returns `true` if the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.len() == 0)
    }

    /// Stores the `(key, val)` entry.
    ///
    /// Always succeeds unless the encoded entry exceeds one bucket's byte
    /// capacity (1/256 of the cache capacity); then nothing changes and
    /// `false` is returned. The contents of `key` and `val` are copied; the
    /// caller's buffers may be reused freely afterwards.
    pub fn set(&self, key: &[u8], val: &[u8]) -> bool {
        let key_hash = xxh3_64(key);
        self.bucket_for(key_hash).set(key, key_hash, val)
    }

    /// Returns a copy of the value stored under `key`.
    ///
    /// Marks the entry recently used. For a zero-copy read, see
    /// [`get_with`](Cache::get_with).
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let key_hash = xxh3_64(key);
        let mut val = None;
        self.bucket_for(key_hash)
            .get(key, key_hash, Some(&mut |v: &[u8]| val = Some(v.to_vec())), false);
        val
    }

    /// Returns `true` if an entry matching `key` exists.
    ///
    /// Marks the entry recently used.
    #[must_use]
    pub fn contains(&self, key: &[u8]) -> bool {
        let key_hash = xxh3_64(key);
        self.bucket_for(key_hash).get(key, key_hash, None, false)
    }

    /// Zero-copy lookup: on a hit, `visitor` is invoked with the value
    /// bytes and `true` is returned.
    ///
    /// The borrowed view is only valid for the duration of the call, which
    /// runs while the bucket's lock is held: the visitor must not reenter
    /// the cache or block. When `peek` is set, the entry's recently-used
    /// bit is left untouched.
    ///
    /// # Examples
    ///
    /// ```
    /// let cache = flatcache::Cache::new(0);
    /// cache.set(b"key", b"value");
    ///
    /// let mut len = 0;
    /// assert!(cache.get_with(b"key", |val| len = val.len(), false));
    /// assert_eq!(len, 5);
    /// ```
    pub fn get_with<F: FnOnce(&[u8])>(&self, key: &[u8], visitor: F, peek: bool) -> bool {
        let key_hash = xxh3_64(key);
        let mut visitor = Some(visitor);
        self.bucket_for(key_hash).get(
            key,
            key_hash,
            Some(&mut |v: &[u8]| {
                if let Some(visit) = visitor.take() {
                    visit(v);
                }
            }),
            peek,
        )
    }

    /// Deletes the entry matching `key`; `false` if there was none.
    pub fn remove(&self, key: &[u8]) -> bool {
        let key_hash = xxh3_64(key);
        self.bucket_for(key_hash).del(key, key_hash)
    }

    /// Installs (or, with `None`, clears) the eviction predicate on every
    /// bucket.
    ///
    /// The predicate is consulted when a bucket must reclaim entries to
    /// host a new one: `true` reclaims the candidate immediately, `false`
    /// keeps it, subject to the walk's bounded retry budget. Without a
    /// predicate, entries not recently used are reclaimed first.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    ///
    /// let cache = flatcache::Cache::new(0);
    /// let policy: flatcache::EvictionPolicy = Arc::new(|entry| !entry.recently_used());
    /// cache.set_eviction_policy(Some(policy));
    /// ```
    pub fn set_eviction_policy(&self, should_evict: Option<EvictionPolicy>) {
        for bucket in &self.buckets {
            bucket.set_eviction_policy(should_evict.clone());
        }
    }

    /// Walks all live entries bucket by bucket, in each bucket's insertion
    /// order.
    ///
    /// Stops as soon as the visitor returns `false`. The visitor runs while
    /// a bucket lock is held and must not reenter the cache.
    pub fn dump<F: FnMut(Entry<'_>) -> bool>(&self, mut visitor: F) {
        for bucket in &self.buckets {
            if !bucket.dump(&mut visitor) {
                break;
            }
        }
    }

    #[expect(clippy::cast_possible_truncation, reason = "the remainder is below 256")]
    fn bucket_for(&self, key_hash: u64) -> &Bucket {
        &self.buckets[(key_hash % BUCKET_COUNT as u64) as usize]
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("capacity", &self.cap)
            .field("buckets", &self.buckets.len())
            .finish_non_exhaustive()
    }
}

/// Builder for configuring a [`Cache`].
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// let policy: flatcache::EvictionPolicy = Arc::new(|entry| entry.value().is_empty());
/// let cache = flatcache::Cache::builder()
///     .capacity(512 * 1024)
///     .eviction_policy(policy)
///     .build();
/// ```
#[derive(Default)]
pub struct CacheBuilder {
    capacity: usize,
    should_evict: Option<EvictionPolicy>,
}

impl CacheBuilder {
    /// Creates a builder with the minimum capacity and no eviction
    /// predicate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the desired capacity in bytes (floored at [`MIN_CAPACITY`]).
    #[must_use]
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Installs an eviction predicate; see
    /// [`Cache::set_eviction_policy`].
    #[must_use]
    pub fn eviction_policy(mut self, should_evict: EvictionPolicy) -> Self {
        self.should_evict = Some(should_evict);
        self
    }

    /// Builds the cache.
    #[must_use]
    pub fn build(self) -> Cache {
        let cache = Cache::new(self.capacity);
        if self.should_evict.is_some() {
            cache.set_eviction_policy(self.should_evict);
        }
        cache
    }
}
