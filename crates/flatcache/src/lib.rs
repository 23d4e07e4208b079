// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A fixed-capacity, in-process byte cache that stays off the allocator.
//!
//! This crate provides [`Cache`], a key/value store for opaque byte
//! sequences designed for high-throughput workloads with a hard memory
//! budget. It combines several techniques:
//!
//! 1. **Pre-allocated ring storage:** every entry - header, key, value -
//!    lives inside one of 256 fixed-size byte rings allocated up front.
//!    Storing or reading an entry performs no per-entry heap allocation.
//! 2. **Compact offset index:** each bucket maps key hashes to byte offsets
//!    through a [`hashbrown`] map whose key and value slots are narrowed to
//!    the bucket's capacity (16/24/32/64-bit), shrinking index overhead.
//! 3. **Second-chance eviction:** a clock-like walk over the oldest entries
//!    reclaims space on demand, guided by a per-entry recently-used bit and
//!    bounded to eight retries per insertion, approximating LRU with
//!    constant worst-case work.
//! 4. **Lock sharding:** one `parking_lot` reader/writer lock per bucket;
//!    keys are dispatched by xxH3 hash, so disjoint keys rarely contend.
//!
//! # Architecture
//!
//! ```text
//!            Cache
//!              | xxh3(key) % 256
//!              v
//!     +-----------------+
//!     | Bucket (RwLock) |  x 256
//!     |  OffsetMap -----+--> hash -> offset
//!     |  Fifo ----------+--> [entry|entry|entry|...]  (no-split ring)
//!     +-----------------+
//! ```
//!
//! Entries are self-describing records packed in insertion order; the index
//! stores only an offset, so a bucket's whole footprint is its ring plus a
//! compact map. Overwrites happen in place when the new contents fit the
//! existing region, otherwise the old record is tombstoned and reclaimed
//! when the ring wraps around to it.
//!
//! # Trade-offs
//!
//! | Property | Behavior |
//! | :--- | :--- |
//! | Memory | Never exceeds the configured capacity. |
//! | Eviction | Approximate LRU (second chance), not exact. |
//! | Large entries | Rejected when bigger than 1/256 of capacity. |
//! | TTL | None; entries live until evicted or removed. |
//!
//! # Example
//!
//! ```
//! use flatcache::Cache;
//!
//! let cache = Cache::new(1024 * 1024);
//!
//! cache.set(b"greeting", b"hello world");
//!
//! // Copy-out read.
//! assert_eq!(cache.get(b"greeting").as_deref(), Some(&b"hello world"[..]));
//!
//! // Zero-copy read: the view borrows bucket storage for the callback only.
//! let mut first = 0;
//! cache.get_with(b"greeting", |val| first = val[0], false);
//! assert_eq!(first, b'h');
//! ```

mod bucket;
mod cache;
mod entry;
mod fifo;
mod vmap;

pub use bucket::EvictionPolicy;
pub use cache::{BUCKET_COUNT, Cache, CacheBuilder, MIN_CAPACITY};
pub use entry::Entry;
