// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Compact hash-to-offset index.
//!
//! Buckets map a 64-bit key hash to the entry's byte offset inside the ring
//! buffer. Offsets are bounded by the bucket's byte capacity, so the value
//! slot can usually be much narrower than a `usize`; small buckets can also
//! truncate the key to the top half of the hash. Each narrowing is a
//! concrete map specialization behind an enum, keeping dispatch predictable.
//!
//! Truncated keys collide more often than full hashes. That is fine: the
//! bucket always compares the stored key bytes against the probe key, so the
//! index is a hint, never an authority.

// Offsets are checked against the variant's range at construction time; the
// narrowing casts below follow that bound.
#![expect(
    clippy::cast_possible_truncation,
    reason = "offsets are bounded by the bucket capacity the variant was sized for"
)]

use hashbrown::HashMap;

/// Maps a 64-bit key hash to an entry offset, with key and value slots
/// narrowed to fit the bucket's capacity.
pub(crate) enum OffsetMap {
    /// Offsets below 2^16; key truncated to the hash's top 32 bits.
    U16(HashMap<u32, u16>),
    /// Offsets below 2^24, packed into a `u32`; key truncated likewise.
    U24(HashMap<u32, u32>),
    /// Offsets below 2^32; full 64-bit key.
    U32(HashMap<u64, u32>),
    /// Unbounded offsets; full 64-bit key.
    U64(HashMap<u64, u64>),
}

/// Top half of the hash, used as the key in the narrow variants.
fn narrow(hash: u64) -> u32 {
    (hash >> 32) as u32
}

impl OffsetMap {
    /// Creates an empty index able to hold offsets up to `max_offset`.
    #[must_use]
    pub(crate) fn new(max_offset: usize) -> Self {
        if max_offset as u64 <= u64::from(u16::MAX) {
            Self::U16(HashMap::new())
        } else if (max_offset as u64) < (1 << 24) {
            Self::U24(HashMap::new())
        } else if max_offset as u64 <= u64::from(u32::MAX) {
            Self::U32(HashMap::new())
        } else {
            Self::U64(HashMap::new())
        }
    }

    #[must_use]
    pub(crate) fn get(&self, hash: u64) -> Option<usize> {
        match self {
            Self::U16(m) => m.get(&narrow(hash)).map(|&v| usize::from(v)),
            Self::U24(m) => m.get(&narrow(hash)).map(|&v| v as usize),
            Self::U32(m) => m.get(&hash).map(|&v| v as usize),
            Self::U64(m) => m.get(&hash).map(|&v| v as usize),
        }
    }

    pub(crate) fn set(&mut self, hash: u64, offset: usize) {
        match self {
            Self::U16(m) => {
                m.insert(narrow(hash), offset as u16);
            }
            Self::U24(m) => {
                m.insert(narrow(hash), offset as u32);
            }
            Self::U32(m) => {
                m.insert(hash, offset as u32);
            }
            Self::U64(m) => {
                m.insert(hash, offset as u64);
            }
        }
    }

    pub(crate) fn del(&mut self, hash: u64) {
        match self {
            Self::U16(m) => {
                m.remove(&narrow(hash));
            }
            Self::U24(m) => {
                m.remove(&narrow(hash));
            }
            Self::U32(m) => {
                m.remove(&hash);
            }
            Self::U64(m) => {
                m.remove(&hash);
            }
        }
    }

    /// Number of indexed entries.
    #[must_use]
    pub(crate) fn len(&self) -> usize {
        match self {
            Self::U16(m) => m.len(),
            Self::U24(m) => m.len(),
            Self::U32(m) => m.len(),
            Self::U64(m) => m.len(),
        }
    }
}
