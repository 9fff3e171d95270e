//! `#[repr(C)]` structures that live inside the mapped region, and the
//! geometry computed from creation parameters.
//!
//! All structs use fixed-size fields and explicit padding so the layout is
//! identical across compilations and processes mapping the same file. The
//! region is three concatenated areas:
//!
//! ```text
//! +--------+----------------+------------------------------+
//! | Header | HashSlot array |        bucket arena          |
//! +--------+----------------+------------------------------+
//! 0        hash_off         data_off
//! ```
//!
//! Integers are host-endian; the file is not portable across architectures.

use std::sync::atomic::AtomicI32;

use crate::error::Error;

/// Upper bound on the slot/bucket count.
pub const MAX_MAP_CAP: usize = 64 * 1024 * 1024;

/// Smallest accepted per-bucket key area (including the length prefix).
pub const MIN_KEY_SIZE: usize = 8;

/// Largest accepted per-bucket key area (including the length prefix).
pub const MAX_KEY_SIZE: usize = 256;

/// Largest accepted bucket stride.
pub const MAX_BUCKET_SIZE: usize = 4096;

/// Size of the fixed header at the start of the region.
pub const HEADER_SIZE: usize = 64;

/// Size of one hash-directory slot.
pub const SLOT_SIZE: usize = 16;

/// Size of the fixed part of a bucket, before key and value bytes.
pub const BUCKET_HEADER_SIZE: usize = 16;

/// Sentinel index meaning "no bucket" in chain links, the free list, and
/// slot heads.
pub const NIL: i32 = -1;

/// Header at offset 0 of the region.
///
/// `len`, `next` and `delete_link` are mutated at runtime and therefore
/// atomic; `cap` doubles as the initialization sentinel (zero until a fresh
/// region is fully initialized, release-stored last) and is atomic for that
/// publish. The remaining fields are written once before `cap` is published
/// and never change afterwards. `AtomicI32` is `repr(transparent)` over
/// `i32`, so the persisted layout is plain 32-bit words either way.
#[repr(C)]
pub struct Header {
    pub len: AtomicI32,         // 0..4   live key count
    pub cap: AtomicI32,         // 4..8   slot/bucket count; 0 = uninitialized
    pub key_size: i32,          // 8..12  key area incl. 1-byte length prefix
    pub bucket_size: i32,       // 12..16 bucket stride
    pub hash_off: u32,          // 16..20 offset of the HashSlot array
    pub data_off: u32,          // 20..24 offset of the bucket arena
    pub next: AtomicI32,        // 24..28 watermark: lowest never-allocated index
    pub delete_link: AtomicI32, // 28..32 free-list head, NIL when empty
    _reserved: [u8; 32],        // 32..64 zero, reserved for future fields
}

const _: () = assert!(std::mem::size_of::<Header>() == HEADER_SIZE);

/// Fixed part of a bucket. Key bytes follow at offset 16 (one length byte
/// then up to `key_size - 1` bytes), value bytes after the key area.
///
/// `next`, `hash` and `used` are written only while holding the owning
/// chain's lock, but racing readers traverse them without the lock, so all
/// three are atomic.
#[repr(C)]
pub struct BucketHeader {
    pub next: AtomicI32, // 0..4   next bucket in chain or free list, NIL ends
    pub hash: AtomicI32, // 4..8   cached CRC32 of the key
    pub used: AtomicI32, // 8..12  1 = live, 0 = free or tombstone
    _pad: i32,           // 12..16
}

const _: () = assert!(std::mem::size_of::<BucketHeader>() == BUCKET_HEADER_SIZE);

/// Validated geometry derived from creation parameters. The same values are
/// persisted in the header; reopening compares against them field by field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Layout {
    pub cap: i32,
    pub key_size: i32,
    pub bucket_size: i32,
    pub hash_off: u32,
    pub data_off: u32,
}

impl Layout {
    /// Validate and normalize `(map_cap, key_len, value_len)`.
    ///
    /// `map_cap` is checked against [`MAX_MAP_CAP`] before rounding up to a
    /// power of two (minimum 8). `key_len` is the longest storable key in
    /// bytes; one prefix byte is added and the key area rounded up to a
    /// multiple of 4. The bucket stride is rounded up to a multiple of 16
    /// and must not exceed [`MAX_BUCKET_SIZE`].
    pub fn compute(map_cap: usize, key_len: usize, value_len: usize) -> Result<Layout, Error> {
        if map_cap == 0 || map_cap > MAX_MAP_CAP {
            return Err(Error::MapCap);
        }
        let cap = map_cap.next_power_of_two().max(8);

        if !(MIN_KEY_SIZE - 1..=MAX_KEY_SIZE - 1).contains(&key_len) {
            return Err(Error::KeyLen);
        }
        let key_size = (key_len + 1 + 3) & !3;

        if value_len > MAX_BUCKET_SIZE - BUCKET_HEADER_SIZE - key_size {
            return Err(Error::ValLen);
        }
        let bucket_size = (BUCKET_HEADER_SIZE + key_size + value_len + 15) & !15;

        let hash_off = HEADER_SIZE as u32;
        let data_off = hash_off + (cap * SLOT_SIZE) as u32;

        Ok(Layout {
            cap: cap as i32,
            key_size: key_size as i32,
            bucket_size: bucket_size as i32,
            hash_off,
            data_off,
        })
    }

    /// Total byte size of the region: header + slot array + arena.
    pub fn region_size(&self) -> usize {
        self.data_off as usize + self.cap as usize * self.bucket_size as usize
    }

    /// Whether a published header carries exactly this geometry.
    pub fn matches(&self, head: &Header) -> bool {
        head.key_size == self.key_size
            && head.bucket_size == self.bucket_size
            && head.hash_off == self.hash_off
            && head.data_off == self.data_off
    }
}
