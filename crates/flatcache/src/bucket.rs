// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Cache shard implementation.
//!
//! Each bucket owns a ring buffer holding the encoded entries, a compact
//! index mapping key hashes to entry offsets, and an optional eviction
//! predicate, all behind one `parking_lot::RwLock`. Lookups take the read
//! lock; mutations and the eviction walk take the write lock.
//!
//! Entries are addressed by byte offset, never by pointer, so nothing held
//! in the index can dangle across ring-buffer wraps or resets.

use std::sync::Arc;

use parking_lot::RwLock;
use xxhash_rust::xxh3::xxh3_64;

use crate::entry::{self, DELETED, Entry, EntryMut, EntryRef, RECENTLY_USED};
use crate::fifo::Fifo;
use crate::vmap::OffsetMap;

/// Retries granted to recently-used entries during one eviction walk before
/// remaining candidates are reclaimed unconditionally.
const PUSH_BUDGET: u32 = 8;

/// Predicate consulted during the eviction walk.
///
/// Returning `true` reclaims the candidate entry immediately; returning
/// `false` keeps it (subject to the walk's retry budget). Installed via
/// [`Cache::set_eviction_policy`](crate::Cache::set_eviction_policy).
pub type EvictionPolicy = Arc<dyn Fn(Entry<'_>) -> bool + Send + Sync>;

/// A single cache shard: compact index + entry ring + eviction policy.
pub(crate) struct Bucket {
    inner: RwLock<BucketInner>,
}

impl Bucket {
    /// Creates a bucket with the given byte capacity.
    #[must_use]
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(BucketInner::new(capacity)),
        }
    }

    /// Recreates the ring buffer with a new capacity and empties the index.
    pub(crate) fn reset(&self, capacity: usize) {
        let mut inner = self.inner.write();
        inner.queue.reset(capacity);
        inner.index = OffsetMap::new(capacity.saturating_sub(1));
    }

    /// Installs or clears the eviction predicate.
    pub(crate) fn set_eviction_policy(&self, should_evict: Option<EvictionPolicy>) {
        self.inner.write().should_evict = should_evict;
    }

    /// Stores `val` under `key`, overwriting any previous entry.
    ///
    /// Fails only when the encoded entry cannot fit this bucket at all.
    pub(crate) fn set(&self, key: &[u8], key_hash: u64, val: &[u8]) -> bool {
        self.inner.write().set(key, key_hash, val)
    }

    /// Looks `key` up and hands the value bytes to `visitor`.
    ///
    /// Unless `peek` is set, a hit marks the entry recently used. The mark
    /// is written under a briefly-held write lock, re-validating the lookup,
    /// and is skipped whenever the flag is already set so that steady-state
    /// hits stay on the shared read path. A mark lost to a concurrent
    /// overwrite only makes the entry look cold to the next eviction pass.
    pub(crate) fn get(
        &self,
        key: &[u8],
        key_hash: u64,
        visitor: Option<&mut dyn FnMut(&[u8])>,
        peek: bool,
    ) -> bool {
        let needs_mark = {
            let inner = self.inner.read();
            let Some(offset) = inner.index.get(key_hash) else {
                return false;
            };
            let ent = EntryRef::new(inner.queue.slice(offset));
            if ent.key() != key {
                return false;
            }
            if let Some(visit) = visitor {
                visit(ent.value());
            }
            !peek && !ent.has_flag(RECENTLY_USED)
        };

        if needs_mark {
            let mut inner = self.inner.write();
            inner.mark_recently_used(key, key_hash);
        }
        true
    }

    /// Deletes the entry matching `key`. Returns `false` if there is none.
    pub(crate) fn del(&self, key: &[u8], key_hash: u64) -> bool {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        if let Some(offset) = inner.index.get(key_hash) {
            let region = inner.queue.slice_mut(offset);
            let size = EntryRef::new(region).size();
            let mut ent = EntryMut::new(&mut region[..size]);
            if ent.view().key() == key {
                ent.add_flag(DELETED);
                inner.index.del(key_hash);
                return true;
            }
        }
        false
    }

    /// Walks live entries in insertion order, stopping early (and returning
    /// `false`) when the visitor does.
    pub(crate) fn dump(&self, visitor: &mut dyn FnMut(Entry<'_>) -> bool) -> bool {
        let inner = self.inner.read();
        let mut remaining = inner.queue.size();
        let mut offset = inner.queue.front();
        while remaining > 0 {
            let ent = EntryRef::new(inner.queue.slice(offset));
            let size = ent.size();
            if !ent.has_flag(DELETED) && !visitor(ent.to_entry()) {
                return false;
            }
            offset += size;
            remaining -= size;
        }
        true
    }

    /// Number of live entries.
    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.inner.read().index.len()
    }

    /// Bytes currently occupied in the ring buffer.
    #[cfg(test)]
    pub(crate) fn used_bytes(&self) -> usize {
        self.inner.read().queue.size()
    }
}

struct BucketInner {
    index: OffsetMap,
    queue: Fifo,
    should_evict: Option<EvictionPolicy>,
    /// Staging space for survivors re-circulated during eviction; retained
    /// across calls so the walk does not allocate after warm-up.
    scratch: Vec<u8>,
}

impl BucketInner {
    fn new(capacity: usize) -> Self {
        Self {
            index: OffsetMap::new(capacity.saturating_sub(1)),
            queue: Fifo::new(capacity),
            should_evict: None,
            scratch: Vec::new(),
        }
    }

    fn set(&mut self, key: &[u8], key_hash: u64, val: &[u8]) -> bool {
        if entry::entry_size(key.len(), val.len(), 0) > self.queue.cap() {
            return false;
        }

        if let Some(offset) = self.index.get(key_hash) {
            let region = self.queue.slice_mut(offset);
            let size = EntryRef::new(region).size();
            let mut ent = EntryMut::new(&mut region[..size]);

            if ent.view().key() == key && ent.update_value(val) {
                ent.add_flag(RECENTLY_USED);
                return true;
            }

            // The slot may hold a different key (truncated-hash collision)
            // or a value too large for the spare. Rewrite the whole region
            // when the new contents fit and the re-encoded header occupies
            // exactly the same bytes; a changed header width would change
            // the entry size and desynchronize the front-to-back walk.
            let body = ent.view().body_size();
            if body >= key.len() + val.len() {
                let spare = body - key.len() - val.len();
                if entry::entry_size(key.len(), val.len(), spare) == size {
                    ent.init(key, val, spare);
                    ent.add_flag(RECENTLY_USED);
                    return true;
                }
            }

            ent.add_flag(DELETED);
        }

        if let Some(offset) = self.insert_entry(key, val, 0) {
            self.index.set(key_hash, offset);
            return true;
        }
        false
    }

    fn mark_recently_used(&mut self, key: &[u8], key_hash: u64) {
        if let Some(offset) = self.index.get(key_hash) {
            let region = self.queue.slice_mut(offset);
            let size = EntryRef::new(region).size();
            let mut ent = EntryMut::new(&mut region[..size]);
            if ent.view().key() == key {
                ent.add_flag(RECENTLY_USED);
            }
        }
    }

    /// Allocates and initializes a fresh entry, reclaiming entries from the
    /// front of the ring as needed.
    ///
    /// Recently-used survivors are re-pushed to the back (their flag
    /// cleared) at most [`PUSH_BUDGET`] times per call; afterwards any
    /// remaining candidate is reclaimed unconditionally, which bounds the
    /// work per insertion.
    ///
    /// # Panics
    ///
    /// Panics when popping or re-pushing an entry fails; both indicate a
    /// corrupted ring layout.
    fn insert_entry(&mut self, key: &[u8], val: &[u8], spare: usize) -> Option<usize> {
        let size = entry::entry_size(key.len(), val.len(), spare);
        if size > self.queue.cap() {
            return None;
        }

        let mut push_budget = PUSH_BUDGET;
        loop {
            if let Some(offset) = self.queue.push(&[], size) {
                let region = self.queue.slice_mut(offset);
                EntryMut::new(&mut region[..size]).init(key, val, spare);
                return Some(offset);
            }

            // No contiguous room: examine the oldest entry.
            let front = self.queue.front();
            let (ent_size, tombstone, evict, old_hash) = {
                let ent = EntryRef::new(self.queue.slice(front));
                let ent_size = ent.size();
                if ent.has_flag(DELETED) {
                    (ent_size, true, false, 0)
                } else {
                    let old_hash = xxh3_64(ent.key());
                    let evict = if push_budget == 0 {
                        true
                    } else if let Some(should_evict) = &self.should_evict {
                        should_evict(ent.to_entry())
                    } else {
                        !ent.has_flag(RECENTLY_USED)
                    };
                    (ent_size, false, evict, old_hash)
                }
            };

            if tombstone {
                assert!(self.queue.pop(ent_size).is_some(), "pop of front entry failed");
                continue;
            }
            if evict {
                self.index.del(old_hash);
                assert!(self.queue.pop(ent_size).is_some(), "pop of front entry failed");
                continue;
            }

            // Survivor: clear its flag and re-circulate it to the back.
            push_budget -= 1;
            self.scratch.clear();
            self.scratch.extend_from_slice(&self.queue.slice(front)[..ent_size]);
            EntryMut::new(&mut self.scratch).remove_flag(RECENTLY_USED);
            assert!(self.queue.pop(ent_size).is_some(), "pop of front entry failed");
            let new_offset = self
                .queue
                .push(&self.scratch, 0)
                .expect("re-push of popped entry failed");
            self.index.set(old_hash, new_offset);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn hash(key: &[u8]) -> u64 {
        xxh3_64(key)
    }

    fn get_copy(bkt: &Bucket, key: &[u8], key_hash: u64) -> Option<Vec<u8>> {
        let mut out = None;
        let found = bkt.get(key, key_hash, Some(&mut |val: &[u8]| out = Some(val.to_vec())), false);
        assert_eq!(found, out.is_some());
        out
    }

    fn dump_keys(bkt: &Bucket) -> Vec<Vec<u8>> {
        let mut keys = Vec::new();
        assert!(bkt.dump(&mut |ent| {
            keys.push(ent.key().to_vec());
            true
        }));
        keys
    }

    #[test]
    fn set_get_del() {
        let bkt = Bucket::new(100);
        let (k, h) = (b"key".as_slice(), hash(b"key"));

        assert!(bkt.set(k, h, b"val"));
        assert_eq!(get_copy(&bkt, k, h).as_deref(), Some(b"val".as_slice()));

        assert!(bkt.del(k, h));
        assert!(!bkt.get(k, h, None, false), "deleted, should get nothing");
        assert!(!bkt.del(k, h), "re-delete should fail");

        // In-place overwrite, then an overwrite that needs a fresh region.
        assert!(bkt.set(k, h, b"val"));
        assert!(bkt.set(k, h, b"val"));
        assert!(bkt.set(k, h, b"valval"));
        assert_eq!(get_copy(&bkt, k, h).as_deref(), Some(b"valval".as_slice()));
        assert_eq!(dump_keys(&bkt).len(), 1, "one live entry after overwrites");

        // Entry too large for the whole bucket.
        assert!(!bkt.set(k, h, &[0u8; 101]));
    }

    #[test]
    fn churn_stays_within_capacity() {
        let bkt = Bucket::new(100);
        let mut rng = StdRng::seed_from_u64(7);

        for i in 0..100 {
            let mut key = vec![0u8; (rng.next_u32() as usize) % 50];
            rng.fill_bytes(&mut key);
            let h = hash(&key);
            assert!(bkt.set(&key, h, &[]));
            if i % 2 == 0 {
                bkt.get(&key, h, None, false);
            } else {
                bkt.del(&key, h);
            }
            assert!(bkt.used_bytes() <= 100);
        }
    }

    #[test]
    fn eviction_drops_oldest_first() {
        // Each entry is 8 bytes; five fill the bucket exactly.
        let bkt = Bucket::new(40);
        for i in 0..6u8 {
            let key = [b'k', b'0' + i];
            let val = [b'v', b'0' + i];
            assert!(bkt.set(&key, hash(&key), &val));
        }

        let keys = dump_keys(&bkt);
        let expected: Vec<Vec<u8>> =
            (1..6u8).map(|i| vec![b'k', b'0' + i]).collect();
        assert_eq!(keys, expected, "k0 evicted, the rest in insertion order");
    }

    #[test]
    fn recently_used_entry_survives_one_pass() {
        let bkt = Bucket::new(64);
        for i in 0..8u8 {
            let key = [b'k', b'0' + i];
            assert!(bkt.set(&key, hash(&key), b"vv"));
        }

        // Touch k0; its untouched peer k1 is next in line.
        assert!(bkt.get(b"k0", hash(b"k0"), None, false));

        let key = *b"k8";
        assert!(bkt.set(&key, hash(&key), b"vv"));

        assert!(bkt.get(b"k0", hash(b"k0"), None, true), "touched entry survives");
        assert!(!bkt.get(b"k1", hash(b"k1"), None, true), "cold peer evicted");
        assert!(bkt.get(b"k8", hash(b"k8"), None, true));
    }

    #[test]
    fn peek_does_not_protect_from_eviction() {
        let bkt = Bucket::new(64);
        for i in 0..8u8 {
            let key = [b'k', b'0' + i];
            assert!(bkt.set(&key, hash(&key), b"vv"));
        }

        assert!(bkt.get(b"k0", hash(b"k0"), None, true));

        let key = *b"k8";
        assert!(bkt.set(&key, hash(&key), b"vv"));

        assert!(!bkt.get(b"k0", hash(b"k0"), None, true), "peeked entry still cold");
    }

    #[test]
    fn forced_eviction_after_budget_exhausted() {
        let bkt = Bucket::new(64);
        for i in 0..8u8 {
            let key = [b'k', b'0' + i];
            assert!(bkt.set(&key, hash(&key), b"vv"));
            assert!(bkt.get(&key, hash(&key), None, false), "mark every entry");
        }

        // Everything is recently used; insertions must still terminate and
        // succeed once the budget runs out.
        for i in 0..8u8 {
            let key = [b'n', b'0' + i];
            assert!(bkt.set(&key, hash(&key), b"vv"));
        }
        for i in 0..8u8 {
            let key = [b'n', b'0' + i];
            assert!(bkt.get(&key, hash(&key), None, true), "new entries all present");
        }
    }

    #[test]
    fn custom_eviction_policy_consulted() {
        let bkt = Bucket::new(40);
        let policy: EvictionPolicy = Arc::new(|ent| ent.key() != b"p0");
        bkt.set_eviction_policy(Some(policy));

        for i in 0..6u8 {
            let key = [b'p', b'0' + i];
            assert!(bkt.set(&key, hash(&key), b"vv"));
        }

        // The policy shielded p0, so the walk reclaimed p1 instead.
        assert!(bkt.get(b"p0", hash(b"p0"), None, true));
        assert!(!bkt.get(b"p1", hash(b"p1"), None, true));
    }

    #[test]
    fn collision_displaces_older_key() {
        let bkt = Bucket::new(256);
        let fabricated = 0xfeed_face_cafe_beef;

        assert!(bkt.set(b"alpha", fabricated, b"one"));
        assert!(bkt.set(b"omega", fabricated, b"two"));

        assert_eq!(get_copy(&bkt, b"omega", fabricated).as_deref(), Some(b"two".as_slice()));
        assert!(!bkt.get(b"alpha", fabricated, None, false), "displaced key misses on byte compare");
    }

    #[test]
    fn collision_delete_checks_key_bytes() {
        let bkt = Bucket::new(256);
        let fabricated = 0x0123_4567_89ab_cdef;

        assert!(bkt.set(b"alpha", fabricated, b"one"));
        assert!(!bkt.del(b"omega", fabricated), "same slot, different key bytes");
        assert!(bkt.del(b"alpha", fabricated));
    }

    #[test]
    fn overwrite_shrinking_key_header() {
        let bkt = Bucket::new(2048);
        let fabricated = 0x1111_2222_3333_4444;

        // 300-byte key: 2-byte key-length slot.
        let long_key = vec![b'L'; 300];
        assert!(bkt.set(&long_key, fabricated, b"x"));

        // A colliding 1-byte key would fit the body, but its re-encoded
        // header would be narrower, so the region must not be rewritten in
        // place.
        assert!(bkt.set(b"s", fabricated, b"y"));
        assert_eq!(get_copy(&bkt, b"s", fabricated).as_deref(), Some(b"y".as_slice()));

        // The walk stays aligned: every surviving entry is still decodable.
        let keys = dump_keys(&bkt);
        assert_eq!(keys, vec![b"s".to_vec()]);
    }

    #[test]
    fn reset_drops_entries() {
        let bkt = Bucket::new(100);
        let (k, h) = (b"key".as_slice(), hash(b"key"));
        assert!(bkt.set(k, h, b"val"));

        bkt.reset(200);
        assert!(!bkt.get(k, h, None, false));
        assert_eq!(bkt.len(), 0);
        assert_eq!(bkt.used_bytes(), 0);
    }

    #[test]
    fn dump_skips_tombstones() {
        let bkt = Bucket::new(100);
        for key in [b"a1", b"a2", b"a3"] {
            assert!(bkt.set(key, hash(key), b"v"));
        }
        assert!(bkt.del(b"a2", hash(b"a2")));

        let keys = dump_keys(&bkt);
        assert_eq!(keys, vec![b"a1".to_vec(), b"a3".to_vec()]);
    }

    #[test]
    fn dump_stops_when_visitor_declines() {
        let bkt = Bucket::new(100);
        for key in [b"a1", b"a2", b"a3"] {
            assert!(bkt.set(key, hash(key), b"v"));
        }

        let mut seen = 0;
        assert!(!bkt.dump(&mut |_| {
            seen += 1;
            false
        }));
        assert_eq!(seen, 1);
    }
}
