//! Fixed-capacity lock-free LIFO stacks.
//!
//! Used for recycling blocks of freed handle ids between the collector and
//! the mutator threads. The published head packs a 32-bit link index with a
//! 32-bit generation counter so a single 64-bit CAS is immune to ABA; every
//! successful pop bumps the generation. Link nodes come from an internal
//! freelist sized at construction, so the stack never allocates after `new`.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

use crossbeam_utils::{Backoff, CachePadded};

const EMPTY: i32 = -1;

struct Lane<T> {
    data: UnsafeCell<T>,
    next: AtomicI32,
}

pub(crate) struct LifoStack<T> {
    head: CachePadded<AtomicU64>,
    free: CachePadded<AtomicU64>,
    lanes: Box<[Lane<T>]>,
}

unsafe impl<T: Copy + Send> Send for LifoStack<T> {}
unsafe impl<T: Copy + Send> Sync for LifoStack<T> {}

fn pack(index: i32, generation: u32) -> u64 {
    (index as u32 as u64) | ((generation as u64) << 32)
}

fn unpack(word: u64) -> (i32, u32) {
    (word as u32 as i32, (word >> 32) as u32)
}

impl<T: Copy + Default> LifoStack<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0 && capacity < i32::MAX as usize);
        let lanes: Vec<Lane<T>> = (0..capacity)
            .map(|i| Lane {
                data: UnsafeCell::new(T::default()),
                next: AtomicI32::new(i as i32 - 1),
            })
            .collect();
        Self {
            head: CachePadded::new(AtomicU64::new(pack(EMPTY, 0))),
            free: CachePadded::new(AtomicU64::new(pack(capacity as i32 - 1, 0))),
            lanes: lanes.into_boxed_slice(),
        }
    }

    fn pop_lane(&self, list: &AtomicU64) -> Option<usize> {
        let backoff = Backoff::new();
        let mut cur = list.load(Ordering::SeqCst);
        loop {
            let (index, generation) = unpack(cur);
            if index == EMPTY {
                return None;
            }
            let next = self.lanes[index as usize].next.load(Ordering::SeqCst);
            match list.compare_exchange_weak(
                cur,
                pack(next, generation.wrapping_add(1)),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Some(index as usize),
                Err(actual) => {
                    cur = actual;
                    backoff.spin();
                }
            }
        }
    }

    fn push_lane(&self, list: &AtomicU64, lane: usize) {
        let backoff = Backoff::new();
        let mut cur = list.load(Ordering::SeqCst);
        loop {
            let (index, generation) = unpack(cur);
            self.lanes[lane].next.store(index, Ordering::SeqCst);
            match list.compare_exchange_weak(
                cur,
                pack(lane as i32, generation),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(actual) => {
                    cur = actual;
                    backoff.spin();
                }
            }
        }
    }

    /// Returns false when no link lane is free, i.e. the stack already holds
    /// `capacity` entries.
    pub fn push(&self, value: T) -> bool {
        let lane = match self.pop_lane(&self.free) {
            Some(lane) => lane,
            None => return false,
        };
        unsafe {
            *self.lanes[lane].data.get() = value;
        }
        self.push_lane(&self.head, lane);
        true
    }

    pub fn pop(&self) -> Option<T> {
        let lane = self.pop_lane(&self.head)?;
        let value = unsafe { *self.lanes[lane].data.get() };
        self.push_lane(&self.free, lane);
        Some(value)
    }

    /// Detach the whole stack in one exchange and return its entries, newest
    /// first.
    pub fn steal(&self) -> Vec<T> {
        let mut cur = self.head.load(Ordering::SeqCst);
        let mut first;
        loop {
            let (index, generation) = unpack(cur);
            first = index;
            if index == EMPTY {
                return Vec::new();
            }
            match self.head.compare_exchange_weak(
                cur,
                pack(EMPTY, generation.wrapping_add(1)),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
        let mut out = Vec::new();
        let mut lane = first;
        while lane != EMPTY {
            let next = self.lanes[lane as usize].next.load(Ordering::SeqCst);
            out.push(unsafe { *self.lanes[lane as usize].data.get() });
            self.push_lane(&self.free, lane as usize);
            lane = next;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_is_lifo() {
        let stack = LifoStack::<u32>::new(8);
        assert!(stack.push(1));
        assert!(stack.push(2));
        assert!(stack.push(3));
        assert_eq!(stack.pop(), Some(3));
        assert_eq!(stack.pop(), Some(2));
        assert_eq!(stack.pop(), Some(1));
        assert_eq!(stack.pop(), None);
    }

    #[test]
    fn capacity_is_bounded() {
        let stack = LifoStack::<u32>::new(2);
        assert!(stack.push(1));
        assert!(stack.push(2));
        assert!(!stack.push(3));
        assert_eq!(stack.pop(), Some(2));
        assert!(stack.push(3));
    }

    #[test]
    fn steal_drains_everything() {
        let stack = LifoStack::<u32>::new(4);
        for v in 0..4 {
            assert!(stack.push(v));
        }
        assert_eq!(stack.steal(), vec![3, 2, 1, 0]);
        assert_eq!(stack.pop(), None);
        // lanes were released back to the freelist
        assert!(stack.push(9));
        assert_eq!(stack.pop(), Some(9));
    }

    #[test]
    fn concurrent_push_pop_keeps_every_entry() {
        use std::sync::Arc;
        let stack = Arc::new(LifoStack::<u32>::new(1024));
        let mut handles = Vec::new();
        for t in 0..4u32 {
            let stack = stack.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..128 {
                    while !stack.push(t * 1000 + i) {
                        std::thread::yield_now();
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let mut seen = Vec::new();
        while let Some(v) = stack.pop() {
            seen.push(v);
        }
        assert_eq!(seen.len(), 4 * 128);
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 4 * 128);
    }
}
