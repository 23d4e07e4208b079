// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! In-place entry codec.
//!
//! An entry is a self-describing record packed directly into bucket storage:
//!
//! ```text
//! +---------+---------+---------+---------+-----+-------+--------+
//! | control | key len | val len |  spare  | key | value | unused |
//! |  1 byte |   kw    |   vw    |   vw    |     |       | spare  |
//! +---------+---------+---------+---------+-----+-------+--------+
//! ```
//!
//! The control byte holds the flag nibble in its upper half and two 2-bit
//! width selectors in its lower half: bits 2-3 select the key-length width
//! `kw`, bits 0-1 select the value-length width `vw`. A selector `w` denotes
//! `1 << w` bytes, so lengths are stored in 1, 2, 4, or 8 bytes. `val len`
//! and `spare` share `vw`, chosen from their sum, which is what allows the
//! value to grow into the spare region without re-encoding widths.
//!
//! Multi-byte lengths are little-endian.

/// Flag bit: the entry was deleted and awaits reclamation.
pub(crate) const DELETED: u8 = 1;
/// Flag bit: the entry was recently accessed.
pub(crate) const RECENTLY_USED: u8 = 2;

/// Decoded header fields of an entry.
#[derive(Clone, Copy)]
struct Layout {
    hdr: usize,
    key_len: usize,
    val_len: usize,
    spare: usize,
}

/// Exact byte size of an entry holding the given key/value/spare lengths.
#[must_use]
pub(crate) fn entry_size(key_len: usize, val_len: usize, spare: usize) -> usize {
    let (kw, _) = width_of(key_len);
    let (vw, _) = width_of(val_len + spare);
    1 + kw + vw * 2 + key_len + val_len + spare
}

/// Number of bytes (and the 2-bit selector) needed to store `len`.
fn width_of(len: usize) -> (usize, u8) {
    if len <= usize::from(u8::MAX) {
        (1, 0)
    } else if len <= usize::from(u16::MAX) {
        (2, 1)
    } else if len as u64 <= u64::from(u32::MAX) {
        (4, 2)
    } else {
        (8, 3)
    }
}

#[expect(
    clippy::cast_possible_truncation,
    reason = "lengths above u64::MAX are unrepresentable; narrowing follows the encoded width"
)]
fn read_uint(buf: &[u8], width: usize) -> usize {
    match width {
        1 => usize::from(buf[0]),
        2 => usize::from(u16::from_le_bytes([buf[0], buf[1]])),
        4 => u32::from_le_bytes(buf[..4].try_into().expect("width checked")) as usize,
        _ => u64::from_le_bytes(buf[..8].try_into().expect("width checked")) as usize,
    }
}

#[expect(
    clippy::cast_possible_truncation,
    reason = "the width is always wide enough for the value being encoded"
)]
fn write_uint(buf: &mut [u8], width: usize, n: usize) {
    match width {
        1 => buf[0] = n as u8,
        2 => buf[..2].copy_from_slice(&(n as u16).to_le_bytes()),
        4 => buf[..4].copy_from_slice(&(n as u32).to_le_bytes()),
        _ => buf[..8].copy_from_slice(&(n as u64).to_le_bytes()),
    }
}

fn layout(buf: &[u8]) -> Layout {
    let ctrl = buf[0];
    let kw = 1usize << ((ctrl >> 2) & 0b11);
    let vw = 1usize << (ctrl & 0b11);
    Layout {
        hdr: 1 + kw + vw * 2,
        key_len: read_uint(&buf[1..], kw),
        val_len: read_uint(&buf[1 + kw..], vw),
        spare: read_uint(&buf[1 + kw + vw..], vw),
    }
}

/// Read-only decoder over an entry's bytes.
#[derive(Clone, Copy)]
pub(crate) struct EntryRef<'a> {
    buf: &'a [u8],
}

impl<'a> EntryRef<'a> {
    /// Wraps a byte region whose first bytes are a valid entry header.
    #[must_use]
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    #[must_use]
    pub(crate) fn has_flag(self, flag: u8) -> bool {
        self.buf[0] & (flag << 4) != 0
    }

    /// Total byte size of the entry, header included.
    #[must_use]
    pub(crate) fn size(self) -> usize {
        let l = layout(self.buf);
        l.hdr + l.key_len + l.val_len + l.spare
    }

    /// Byte size of the body: `key_len + val_len + spare`.
    #[must_use]
    pub(crate) fn body_size(self) -> usize {
        let l = layout(self.buf);
        l.key_len + l.val_len + l.spare
    }

    #[must_use]
    pub(crate) fn key(self) -> &'a [u8] {
        let l = layout(self.buf);
        &self.buf[l.hdr..l.hdr + l.key_len]
    }

    #[must_use]
    pub(crate) fn value(self) -> &'a [u8] {
        let l = layout(self.buf);
        &self.buf[l.hdr + l.key_len..l.hdr + l.key_len + l.val_len]
    }

    /// Public read-only view of this entry.
    #[must_use]
    pub(crate) fn to_entry(self) -> Entry<'a> {
        Entry {
            key: self.key(),
            value: self.value(),
            recently_used: self.has_flag(RECENTLY_USED),
        }
    }
}

/// Mutating decoder over an entry's bytes.
pub(crate) struct EntryMut<'a> {
    buf: &'a mut [u8],
}

impl<'a> EntryMut<'a> {
    pub(crate) fn new(buf: &'a mut [u8]) -> Self {
        Self { buf }
    }

    /// Read-only reborrow of the same bytes.
    #[must_use]
    pub(crate) fn view(&self) -> EntryRef<'_> {
        EntryRef::new(self.buf)
    }

    pub(crate) fn add_flag(&mut self, flag: u8) {
        self.buf[0] |= flag << 4;
    }

    pub(crate) fn remove_flag(&mut self, flag: u8) {
        self.buf[0] &= !(flag << 4);
    }

    /// Initializes the region with `key`, `val`, and `spare` trailing bytes,
    /// clearing all flags.
    ///
    /// The region must be exactly [`entry_size`] bytes long.
    pub(crate) fn init(&mut self, key: &[u8], val: &[u8], spare: usize) {
        debug_assert_eq!(self.buf.len(), entry_size(key.len(), val.len(), spare));

        self.buf[0] = 0;
        let hdr = self.set_sizes(key.len(), val.len(), spare);
        self.buf[hdr..hdr + key.len()].copy_from_slice(key);
        self.buf[hdr + key.len()..hdr + key.len() + val.len()].copy_from_slice(val);
    }

    /// Rewrites the value in place, growing into (or releasing bytes to) the
    /// spare region.
    ///
    /// Fails when `val` exceeds `val_len + spare`; the entry is untouched
    /// then. Widths never change: `val_len + spare` is conserved, and the
    /// shared width selector was chosen from that sum.
    pub(crate) fn update_value(&mut self, val: &[u8]) -> bool {
        let l = layout(self.buf);
        let cap = l.val_len + l.spare;
        if val.len() > cap {
            return false;
        }
        self.buf[l.hdr + l.key_len..l.hdr + l.key_len + val.len()].copy_from_slice(val);
        self.set_sizes(l.key_len, val.len(), cap - val.len());
        true
    }

    /// Encodes widths and lengths into the header, preserving the flag
    /// nibble. Returns the header size.
    fn set_sizes(&mut self, key_len: usize, val_len: usize, spare: usize) -> usize {
        let (kw, km) = width_of(key_len);
        let (vw, vm) = width_of(val_len + spare);

        self.buf[0] = (self.buf[0] & 0xf0) | (km << 2) | vm;
        write_uint(&mut self.buf[1..], kw, key_len);
        write_uint(&mut self.buf[1 + kw..], vw, val_len);
        write_uint(&mut self.buf[1 + kw + vw..], vw, spare);
        1 + kw + vw * 2
    }
}

/// A read-only view of a cached entry.
///
/// Passed to [`dump`](crate::Cache::dump) visitors and eviction predicates.
/// The borrowed key and value are only valid while the owning bucket's lock
/// is held, i.e. for the duration of the callback.
#[derive(Clone, Copy)]
pub struct Entry<'a> {
    key: &'a [u8],
    value: &'a [u8],
    recently_used: bool,
}

impl<'a> Entry<'a> {
    /// The entry's key bytes.
    #[must_use]
    pub fn key(&self) -> &'a [u8] {
        self.key
    }

    /// The entry's value bytes.
    #[must_use]
    pub fn value(&self) -> &'a [u8] {
        self.value
    }

    /// Whether the entry was accessed since the last eviction pass over it.
    #[must_use]
    pub fn recently_used(&self) -> bool {
        self.recently_used
    }
}

impl std::fmt::Debug for Entry<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("key_len", &self.key.len())
            .field("val_len", &self.value.len())
            .field("recently_used", &self.recently_used)
            .finish()
    }
}
