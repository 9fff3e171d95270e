//! The public map handle.
//!
//! One `Map` per process per file; multiple processes (and threads sharing
//! one handle) operate on the same mapped region concurrently. Reads are
//! lock-free chain traversals; inserts and deletes serialize per chain
//! through the slot's sequence lock and retry up to `max_try` times under
//! contention.

use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::Duration;

use log::debug;

use crate::arena::BucketArena;
use crate::error::Error;
use crate::layout::{Header, Layout, HEADER_SIZE, NIL};
use crate::lock::HashSlot;
use crate::region::MappedRegion;

/// Retry budget used when `max_try <= 0` is passed to [`Map::create`].
pub const DEFAULT_MAX_TRY: i32 = 20;

/// A fixed-capacity hash map living in a shared file mapping.
pub struct Map {
    region: MappedRegion,
    arena: BucketArena,
    cap: i32,
    max_try: i32,
}

// Safety: every word of the region that is written concurrently with reads
// is an atomic (header counters, slot words, bucket headers); key and value
// bytes are published by the release store of the chain head before any
// reader can reach them. The handle itself is immutable after creation.
unsafe impl Send for Map {}
unsafe impl Sync for Map {}

impl Map {
    /// Create or open the shared map database at `path`.
    ///
    /// `map_cap` is rounded up to a power of two (minimum 8); `key_len` is
    /// the longest storable key in bytes; `value_len` the fixed value size.
    /// A `max_try` of zero or below selects [`DEFAULT_MAX_TRY`]. `wait`
    /// bounds how long to wait for another process that is currently
    /// creating the same file.
    ///
    /// Opening an existing file checks the stored geometry against the
    /// parameters and fails with [`Error::DbSize`] on any difference.
    pub fn create<P: AsRef<Path>>(
        path: P,
        map_cap: usize,
        key_len: usize,
        value_len: usize,
        max_try: i32,
        wait: Duration,
    ) -> Result<Map, Error> {
        let layout = Layout::compute(map_cap, key_len, value_len)?;
        let max_try = if max_try <= 0 { DEFAULT_MAX_TRY } else { max_try };

        let (region, lock) = MappedRegion::open(path.as_ref(), layout.region_size(), wait)?;
        // On error the map (and with it the region) is dropped, which
        // unmaps and releases the creation lock.
        let map = Map::init(region, &layout, max_try)?;
        lock.unlock()?;
        Ok(map)
    }

    /// Initialize a fresh region or validate an existing one, gated on the
    /// header's `cap` field: zero means no opener has finished
    /// initialization yet. The caller holds the creation lock, so the
    /// fresh branch runs single-threaded.
    fn init(region: MappedRegion, layout: &Layout, max_try: i32) -> Result<Map, Error> {
        assert!(region.len() >= layout.region_size());
        let base = region.base_ptr();
        let hdr = base as *mut Header;

        let cap = unsafe { (*hdr).cap.load(Ordering::Acquire) };
        if cap != 0 {
            let head = unsafe { &*hdr };
            if cap != layout.cap || !layout.matches(head) {
                return Err(Error::DbSize);
            }
            debug!("opened existing map {} (cap {cap})", region.path().display());
        } else {
            let slots = unsafe {
                std::slice::from_raw_parts(
                    base.add(layout.hash_off as usize) as *const HashSlot,
                    layout.cap as usize,
                )
            };
            for slot in slots {
                slot.reset();
            }
            unsafe {
                (*hdr).delete_link.store(NIL, Ordering::Relaxed);
                (*hdr).next.store(0, Ordering::Relaxed);
                (*hdr).len.store(0, Ordering::Relaxed);
                std::ptr::addr_of_mut!((*hdr).key_size).write(layout.key_size);
                std::ptr::addr_of_mut!((*hdr).bucket_size).write(layout.bucket_size);
                std::ptr::addr_of_mut!((*hdr).hash_off).write(layout.hash_off);
                std::ptr::addr_of_mut!((*hdr).data_off).write(layout.data_off);
                // cap is published last: a nonzero cap promises every other
                // header field is valid
                (*hdr).cap.store(layout.cap, Ordering::Release);
            }
            debug!(
                "initialized fresh map {} (cap {}, bucket {} B)",
                region.path().display(),
                layout.cap,
                layout.bucket_size
            );
        }

        let arena = unsafe { BucketArena::new(base.add(layout.data_off as usize), layout) };
        Ok(Map {
            region,
            arena,
            cap: layout.cap,
            max_try,
        })
    }

    /// Look up `key`, inserting it when absent and `add` is set.
    ///
    /// On success the returned [`ValueRef`] borrows the bucket's value
    /// bytes in place; a later `get` of the same key yields the same
    /// buffer until the key is deleted. Without `add` a missing key is
    /// [`Error::KeyNot`]; with `add`, an exhausted arena is
    /// [`Error::DbFull`] and an exhausted retry budget [`Error::TryEnd`].
    pub fn get(&self, key: &[u8], add: bool) -> Result<ValueRef<'_>, Error> {
        let h = hash_key(key);
        let slot = self.slot(h);
        let mut try_left = self.max_try;
        let mut target = NIL;
        let mut last_check = false;

        let found = loop {
            if try_left == 0 {
                break Err(Error::TryEnd);
            }
            try_left -= 1;

            let head_idx = slot.head();
            let serial = slot.serial();

            if let Some(idx) = self.find(head_idx, key) {
                break Ok(idx);
            }
            if last_check {
                break Err(Error::DbFull);
            }
            if !add {
                break Err(Error::KeyNot);
            }

            if target < 0 {
                let header = self.header();
                let idx = self.arena.alloc(&header.next, &header.delete_link);
                if idx < 0 {
                    // The arena may look full only because a racing writer
                    // took the last bucket, possibly for this very key; one
                    // extra traversal settles it.
                    if slot.serial() != serial {
                        last_check = true;
                        continue;
                    }
                    break Err(Error::DbFull);
                }
                target = idx;
                self.arena.set_key(idx, key);
                self.arena.bucket(idx).hash.store(h, Ordering::Relaxed);
            }

            if slot.try_lock(serial) {
                // serial unchanged implies the head is still `head_idx`
                let b = self.arena.bucket(target);
                b.next.store(head_idx, Ordering::Relaxed);
                slot.set_head(target);
                b.used.store(1, Ordering::Release);
                slot.add_chain_len(1);
                slot.unlock();
                self.header().len.fetch_add(1, Ordering::Relaxed);
                let idx = target;
                target = NIL;
                break Ok(idx);
            }
        };

        // A speculative bucket that never got published goes back to the
        // free list on every exit path.
        if target >= 0 {
            self.arena.free(&self.header().delete_link, target);
        }
        found.map(|idx| self.value_ref(idx))
    }

    /// Remove `key`. Returns `true` on removal *and* when the key was
    /// already absent; `false` only when the retry budget ran out.
    pub fn delete(&self, key: &[u8]) -> bool {
        let h = hash_key(key);
        let slot = self.slot(h);

        for _ in 0..self.max_try {
            let head_idx = slot.head();
            let serial = slot.serial();

            let mut last = NIL;
            let mut target = NIL;
            let mut idx = head_idx;
            let mut steps = 0;
            while idx >= 0 && idx < self.cap && steps < self.cap {
                if self.arena.key(idx) == key {
                    target = idx;
                    break;
                }
                last = idx;
                idx = self.arena.bucket(idx).next.load(Ordering::Acquire);
                steps += 1;
            }
            if target < 0 {
                return true;
            }

            if slot.try_lock(serial) {
                let b = self.arena.bucket(target);
                // tombstone first; the key bytes stay intact until the
                // bucket is re-allocated, so a reader mid-chain still
                // terminates correctly
                b.used.store(0, Ordering::Release);
                let succ = b.next.load(Ordering::Relaxed);
                if last >= 0 {
                    self.arena.bucket(last).next.store(succ, Ordering::Release);
                } else {
                    slot.set_head(succ);
                }
                slot.add_chain_len(-1);
                slot.unlock();
                self.header().len.fetch_sub(1, Ordering::Relaxed);
                self.arena.free(&self.header().delete_link, target);
                return true;
            }
        }
        false
    }

    /// Visit every live bucket in arena order, stopping early when `f`
    /// returns `false`.
    ///
    /// Iteration is not snapshot-consistent: concurrent inserts and
    /// deletes may or may not be observed, and arena order is unrelated to
    /// insertion order.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        for i in 0..self.cap {
            if self.arena.bucket(i).used.load(Ordering::Acquire) == 0 {
                continue;
            }
            let value =
                unsafe { std::slice::from_raw_parts(self.arena.value_ptr(i), self.arena.value_len()) };
            if !f(self.arena.key(i), value) {
                return;
            }
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.header().len.load(Ordering::Relaxed).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slot/bucket capacity. Fixed at creation.
    pub fn cap(&self) -> usize {
        self.cap as usize
    }

    /// msync the region. Only needed for durability against power loss.
    pub fn flush(&self) -> Result<(), Error> {
        self.region.flush()?;
        Ok(())
    }

    /// Flush and release the mapping. Dropping the handle releases it
    /// without the flush.
    pub fn close(self) -> Result<(), Error> {
        self.region.flush()?;
        Ok(())
    }

    fn header(&self) -> &Header {
        unsafe { &*(self.region.base_ptr() as *const Header) }
    }

    fn slots(&self) -> &[HashSlot] {
        unsafe {
            std::slice::from_raw_parts(
                self.region.base_ptr().add(HEADER_SIZE) as *const HashSlot,
                self.cap as usize,
            )
        }
    }

    fn slot(&self, hash: i32) -> &HashSlot {
        &self.slots()[(hash as u32 % self.cap as u32) as usize]
    }

    /// Walk the chain starting at `idx` looking for `key`. Hop count and
    /// index range are both bounded so a stale chain observed mid-mutation
    /// still terminates inside the arena.
    fn find(&self, mut idx: i32, key: &[u8]) -> Option<i32> {
        let mut steps = 0;
        while idx >= 0 && idx < self.cap && steps < self.cap {
            if self.arena.key(idx) == key {
                return Some(idx);
            }
            idx = self.arena.bucket(idx).next.load(Ordering::Acquire);
            steps += 1;
        }
        None
    }

    fn value_ref(&self, idx: i32) -> ValueRef<'_> {
        ValueRef {
            ptr: self.arena.value_ptr(idx),
            len: self.arena.value_len(),
            _map: PhantomData,
        }
    }
}

/// The value bytes of one bucket, borrowed straight out of the mapped
/// region.
///
/// Mutations through [`DerefMut`] are visible to every process mapping the
/// file, with no synchronization from this layer: two handles obtained for
/// the same key alias the same buffer, and callers coordinate their own
/// value writes. The buffer address is stable until the key is deleted.
pub struct ValueRef<'a> {
    ptr: *mut u8,
    len: usize,
    _map: PhantomData<&'a Map>,
}

impl ValueRef<'_> {
    /// Address of the value area inside the region.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }
}

impl Deref for ValueRef<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl DerefMut for ValueRef<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

/// CRC32/IEEE of the raw key bytes, as the stored 32-bit hash. The slot is
/// chosen by unsigned modulo so every opener of a file agrees on placement.
fn hash_key(key: &[u8]) -> i32 {
    crc32fast::hash(key) as i32
}
