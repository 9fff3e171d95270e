//! Per-chain sequence lock living inside the mapped region.
//!
//! Each hash-directory slot is 16 bytes of four 32-bit words. The `lock`
//! word excludes writers from each other; the `serial` word lets a writer
//! detect that the chain changed between its snapshot and its lock
//! acquisition. Readers never touch `lock` at all: they traverse the chain
//! from `index` and rely on writers publishing a fully-written bucket
//! before linking it.

use std::sync::atomic::{AtomicI32, Ordering};

use crate::layout::{NIL, SLOT_SIZE};

/// One hash-directory slot: chain head, change serial, writer flag, and a
/// non-authoritative chain length kept for diagnostics.
#[repr(C)]
pub struct HashSlot {
    index: AtomicI32,     // 0..4   head bucket index, NIL when empty
    serial: AtomicI32,    // 4..8   incremented on every successful unlock
    lock: AtomicI32,      // 8..12  0 = free, 1 = held
    chain_len: AtomicI32, // 12..16
}

const _: () = assert!(std::mem::size_of::<HashSlot>() == SLOT_SIZE);

impl HashSlot {
    /// Head bucket index of the chain, or [`NIL`].
    #[inline]
    pub fn head(&self) -> i32 {
        self.index.load(Ordering::Acquire)
    }

    /// Point the chain head at `idx`. Caller must hold the lock; the
    /// release store publishes the new bucket's contents along with it.
    #[inline]
    pub fn set_head(&self, idx: i32) {
        self.index.store(idx, Ordering::Release);
    }

    /// Current change serial.
    #[inline]
    pub fn serial(&self) -> i32 {
        self.serial.load(Ordering::Acquire)
    }

    /// Try to acquire the writer lock, succeeding only if the serial still
    /// equals `expected_serial` (i.e. no writer committed since the caller
    /// snapshotted the chain). On a stale serial the flag is released again
    /// and the caller re-snapshots.
    pub fn try_lock(&self, expected_serial: i32) -> bool {
        if self
            .lock
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            if self.serial.load(Ordering::Acquire) == expected_serial {
                return true;
            }
            self.lock.store(0, Ordering::Release);
        }
        false
    }

    /// Release the writer lock. The serial bump is release-ordered before
    /// the flag store, so the next writer to win the CAS observes it.
    pub fn unlock(&self) {
        let s = self.serial.load(Ordering::Relaxed);
        self.serial.store(s.wrapping_add(1), Ordering::Release);
        self.lock.store(0, Ordering::Release);
    }

    /// Diagnostic chain length. Not authoritative under concurrency.
    #[allow(dead_code)]
    pub fn chain_len(&self) -> i32 {
        self.chain_len.load(Ordering::Relaxed)
    }

    /// Adjust the diagnostic chain length. Caller must hold the lock.
    #[inline]
    pub fn add_chain_len(&self, delta: i32) {
        let n = self.chain_len.load(Ordering::Relaxed);
        self.chain_len.store(n + delta, Ordering::Relaxed);
    }

    /// Reset all four words to the empty state (`index = NIL`, rest zero).
    /// Only used while initializing a fresh region, before the header's
    /// `cap` is published.
    pub fn reset(&self) {
        self.index.store(NIL, Ordering::Relaxed);
        self.serial.store(0, Ordering::Relaxed);
        self.lock.store(0, Ordering::Relaxed);
        self.chain_len.store(0, Ordering::Relaxed);
    }
}
