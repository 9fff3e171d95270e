//! Raw view over the bucket arena plus the wait-free bucket-index
//! allocator.
//!
//! Bucket `i` lives at `base + i * bucket_size`: a 16-byte
//! [`BucketHeader`], then the key area (`key_size` bytes, the first of
//! which is the key length), then the value area. The allocator hands out
//! indices from a LIFO free list of released buckets first and from a
//! monotonic watermark second; both live in the header and are driven by
//! CAS, so allocation never blocks behind a chain lock.
//!
//! Indices are validated at this boundary: every entry point asserts
//! `0 <= i < cap`, so a stale index read during an unlocked traversal can
//! never escape the arena.

use std::sync::atomic::{AtomicI32, Ordering};

use crate::layout::{BucketHeader, Layout, BUCKET_HEADER_SIZE, NIL};

pub(crate) struct BucketArena {
    base: *mut u8,
    cap: i32,
    bucket_size: i32,
    key_size: i32,
}

impl BucketArena {
    /// View the `layout.cap * layout.bucket_size` bytes at `base` as the
    /// bucket arena.
    ///
    /// # Safety
    /// `base` must point to at least `cap * bucket_size` writable bytes
    /// that outlive the arena.
    pub unsafe fn new(base: *mut u8, layout: &Layout) -> Self {
        BucketArena {
            base,
            cap: layout.cap,
            bucket_size: layout.bucket_size,
            key_size: layout.key_size,
        }
    }

    #[inline]
    fn bucket_ptr(&self, i: i32) -> *mut u8 {
        assert!(i >= 0 && i < self.cap, "bucket index {i} out of range");
        unsafe { self.base.add(i as usize * self.bucket_size as usize) }
    }

    /// Fixed header of bucket `i`.
    #[inline]
    pub fn bucket(&self, i: i32) -> &BucketHeader {
        unsafe { &*(self.bucket_ptr(i) as *const BucketHeader) }
    }

    /// Stored key of bucket `i`.
    ///
    /// The length prefix is clamped to the key area, so a torn or stale
    /// prefix byte cannot produce an out-of-bounds slice.
    #[inline]
    pub fn key(&self, i: i32) -> &[u8] {
        unsafe {
            let p = self.bucket_ptr(i).add(BUCKET_HEADER_SIZE);
            let len = (*p as usize).min(self.key_size as usize - 1);
            std::slice::from_raw_parts(p.add(1), len)
        }
    }

    /// Write `key` into bucket `i`'s key area: length prefix first byte,
    /// raw bytes after. Bytes past the copied prefix keep whatever the
    /// previous tenant left there; equality only ever compares the
    /// prefixed length.
    pub fn set_key(&self, i: i32, key: &[u8]) {
        let max = self.key_size as usize - 1;
        debug_assert!(key.len() <= max, "key longer than key area");
        let n = key.len().min(max);
        unsafe {
            let p = self.bucket_ptr(i).add(BUCKET_HEADER_SIZE);
            std::ptr::copy_nonoverlapping(key.as_ptr(), p.add(1), n);
            *p = n as u8;
        }
    }

    /// Start of bucket `i`'s value area.
    #[inline]
    pub fn value_ptr(&self, i: i32) -> *mut u8 {
        unsafe { self.bucket_ptr(i).add(BUCKET_HEADER_SIZE + self.key_size as usize) }
    }

    /// Byte length of every value area.
    #[inline]
    pub fn value_len(&self) -> usize {
        (self.bucket_size - BUCKET_HEADER_SIZE as i32 - self.key_size) as usize
    }

    /// Allocate a bucket index: pop the free list, else bump the
    /// watermark. Returns [`NIL`] when the arena is exhausted. The
    /// returned bucket's `next` is reset to [`NIL`]; nothing else is
    /// cleared, the caller's `set_key` overwrites what matters.
    pub fn alloc(&self, watermark: &AtomicI32, free_head: &AtomicI32) -> i32 {
        loop {
            let head = free_head.load(Ordering::Acquire);
            if head < 0 {
                break;
            }
            let link = self.bucket(head).next.load(Ordering::Acquire);
            if free_head
                .compare_exchange(head, link, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.bucket(head).next.store(NIL, Ordering::Relaxed);
                return head;
            }
        }
        loop {
            let n = watermark.load(Ordering::Acquire);
            if n >= self.cap {
                break;
            }
            if watermark
                .compare_exchange(n, n + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.bucket(n).next.store(NIL, Ordering::Relaxed);
                return n;
            }
        }
        NIL
    }

    /// Push bucket `i` onto the free list.
    ///
    /// Must be called exactly once per tombstoning, after the bucket has
    /// been unlinked from its chain; that single-freer rule is what keeps
    /// the untagged LIFO safe from ABA.
    pub fn free(&self, free_head: &AtomicI32, i: i32) {
        let b = self.bucket(i);
        loop {
            let head = free_head.load(Ordering::Acquire);
            b.next.store(head, Ordering::Relaxed);
            if free_head
                .compare_exchange(head, i, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }
}
