//! The double-slot snapshot cell.
//!
//! A [SnapCell] is a single 64-bit word holding two handles: `current` in the
//! low half and `snapshot` in the high half. Outside a collection every store
//! writes both halves at once, so the pair always agrees. While a collection
//! is running stores touch only `current`; the collector reads only
//! `snapshot`, which still carries the value the cell had when the collection
//! began. The two restore operations re-establish agreement afterwards.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::handle::Handle;

// Index of the half that aliases the low-order 32 bits of the combined word.
#[cfg(target_endian = "little")]
const CURRENT: usize = 0;
#[cfg(target_endian = "little")]
const SNAPSHOT: usize = 1;
#[cfg(target_endian = "big")]
const CURRENT: usize = 1;
#[cfg(target_endian = "big")]
const SNAPSHOT: usize = 0;

#[repr(C, align(8))]
pub struct SnapCell {
    halves: [AtomicU32; 2],
}

impl SnapCell {
    pub(crate) const fn new(v: Handle) -> Self {
        Self {
            halves: [AtomicU32::new(v), AtomicU32::new(v)],
        }
    }

    // The alignment of Self guarantees this cast is valid.
    fn combined(&self) -> &AtomicU64 {
        unsafe { &*(self as *const Self as *const AtomicU64) }
    }

    fn split(w: u64) -> (Handle, Handle) {
        (w as u32, (w >> 32) as u32)
    }

    fn join(v: Handle) -> u64 {
        (v as u64) | ((v as u64) << 32)
    }

    /// Store into both halves as one 64-bit write. Used by the regular write
    /// barrier.
    pub(crate) fn double_store(&self, v: Handle) {
        self.combined().store(Self::join(v), Ordering::Relaxed);
    }

    /// Store into `current` only, leaving the snapshot half untouched. Used by
    /// the collecting write barrier.
    pub(crate) fn single_store(&self, v: Handle) {
        self.halves[CURRENT].store(v, Ordering::Relaxed);
    }

    pub(crate) fn load(&self) -> Handle {
        self.halves[CURRENT].load(Ordering::Relaxed)
    }

    /// Collector-only consumer.
    pub(crate) fn load_snapshot(&self) -> Handle {
        self.halves[SNAPSHOT].load(Ordering::Relaxed)
    }

    /// Cheap, racy repair: read the pair once and patch the snapshot half with
    /// a plain store if the halves differ. A mutator storing concurrently can
    /// leave the pair disagreeing; [SnapCell::restore] fixes those leftovers.
    pub(crate) fn fast_restore(&self) {
        let (cur, snap) = Self::split(self.combined().load(Ordering::Relaxed));
        if cur != snap {
            self.halves[SNAPSHOT].store(cur, Ordering::Relaxed);
        }
    }

    /// Exact repair used by the finalize pass. Retries on interference.
    pub(crate) fn restore(&self) {
        let mut w = self.combined().load(Ordering::SeqCst);
        loop {
            let (cur, snap) = Self::split(w);
            if cur == snap {
                return;
            }
            match self.combined().compare_exchange_weak(
                w,
                Self::join(cur),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(actual) => w = actual,
            }
        }
    }
}

impl Default for SnapCell {
    fn default() -> Self {
        Self::new(crate::handle::NULL_HANDLE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_store_keeps_halves_equal() {
        let cell = SnapCell::new(0);
        cell.double_store(42);
        assert_eq!(cell.load(), 42);
        assert_eq!(cell.load_snapshot(), 42);
    }

    #[test]
    fn single_store_preserves_snapshot() {
        let cell = SnapCell::new(7);
        cell.single_store(99);
        assert_eq!(cell.load(), 99);
        assert_eq!(cell.load_snapshot(), 7);
    }

    #[test]
    fn fast_restore_copies_current() {
        let cell = SnapCell::new(1);
        cell.single_store(2);
        cell.fast_restore();
        assert_eq!(cell.load(), 2);
        assert_eq!(cell.load_snapshot(), 2);
        // idempotent once the halves agree
        cell.fast_restore();
        assert_eq!(cell.load_snapshot(), 2);
    }

    #[test]
    fn restore_converges() {
        let cell = SnapCell::new(3);
        cell.single_store(11);
        cell.restore();
        assert_eq!(cell.load(), 11);
        assert_eq!(cell.load_snapshot(), 11);
    }
}
