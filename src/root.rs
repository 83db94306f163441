//! Root handles and instance handles.
//!
//! A [RootHandle] pins an object from outside the object graph: constructing
//! one links a heap-side entry into the creating thread's active root list,
//! and dropping it merely clears the entry's `owned` flag. The collector
//! applies the two-cycle rule when it scans the snapshot root list: a root
//! that was owned at the previous scan still marks its referent once more, so
//! a scope exiting between phase entry and mark cannot unroot an object the
//! snapshot promised to keep.
//!
//! An [InstanceHandle] is the field form: a snapshot cell embedded in a
//! collectable and owned exclusively by it, traversed through the enclosing
//! object's instance-var table.

use std::cell::Cell;
use std::marker::PhantomData;
use std::ptr::{null_mut, NonNull};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::api::{Collectable, Gc, Handled};
use crate::barrier;
use crate::cell::SnapCell;
use crate::handle::{Handle, NULL_HANDLE};
use crate::list::{self, Link};
use crate::state::THREAD;

/// Heap-side registration of a root. Owned by the list it is linked into;
/// freed by the collector after it is unlinked.
pub(crate) struct RootEntry {
    next: Cell<*mut RootEntry>,
    prev: Cell<*mut RootEntry>,
    pub(crate) cell: SnapCell,
    /// True while the owning [RootHandle] is alive. Cleared on drop, read by
    /// the collector.
    pub(crate) owned: AtomicBool,
    /// The previous collection's verdict; collector-only.
    pub(crate) was_owned: Cell<bool>,
    pub(crate) sentinel: bool,
}

impl RootEntry {
    fn new(referent: Handle) -> Self {
        Self {
            next: Cell::new(null_mut()),
            prev: Cell::new(null_mut()),
            cell: SnapCell::new(referent),
            owned: AtomicBool::new(true),
            was_owned: Cell::new(true),
            sentinel: false,
        }
    }

    pub(crate) fn sentinel() -> Self {
        Self {
            next: Cell::new(null_mut()),
            prev: Cell::new(null_mut()),
            cell: SnapCell::new(NULL_HANDLE),
            owned: AtomicBool::new(true),
            was_owned: Cell::new(true),
            sentinel: true,
        }
    }
}

unsafe impl Link for RootEntry {
    fn next(&self) -> *mut Self {
        self.next.get()
    }
    fn prev(&self) -> *mut Self {
        self.prev.get()
    }
    fn set_next(&self, next: *mut Self) {
        self.next.set(next);
    }
    fn set_prev(&self, prev: *mut Self) {
        self.prev.set(prev);
    }
}

/// An owning registration that keeps its referent alive for the lifetime of
/// the scope holding it. May reference nothing (the null handle).
pub struct RootHandle<T: Collectable> {
    entry: NonNull<RootEntry>,
    _marker: PhantomData<*const T>,
}

impl<T: Collectable> RootHandle<T> {
    /// Register an empty root.
    pub fn new() -> Self {
        Self::register(NULL_HANDLE)
    }

    /// Register a root already referencing `value`.
    pub fn new_with(value: Gc<T>) -> Self {
        Self::register(value.handle())
    }

    fn register(referent: Handle) -> Self {
        let ctx = crate::context();
        THREAD.with(|t| {
            assert!(
                t.is_registered(),
                "calling thread is not registered with the collector"
            );
            // Direct double-slot init is fine here: the entry only becomes
            // reachable once linked, and a collecting-phase registration
            // lands in the active list, which this cycle never scans.
            let entry = Box::into_raw(Box::new(RootEntry::new(referent)));
            unsafe {
                let lists = &*ctx.scan_lists[t.index.get()].load(Ordering::Acquire);
                let active = ctx.active_index.load(Ordering::SeqCst);
                list::push_front(lists.roots[active], entry);
            }
            ctx.stats.roots_registered.fetch_add(1, Ordering::Relaxed);
            RootHandle {
                entry: unsafe { NonNull::new_unchecked(entry) },
                _marker: PhantomData,
            }
        })
    }

    fn entry(&self) -> &RootEntry {
        unsafe { self.entry.as_ref() }
    }

    pub fn get(&self) -> Option<Gc<T>> {
        match self.entry().cell.load() {
            NULL_HANDLE => None,
            h => Some(Gc::from_handle(h)),
        }
    }

    pub fn set(&self, value: Gc<T>) {
        barrier::write(&self.entry().cell, value.handle());
    }

    pub fn clear(&self) {
        barrier::write(&self.entry().cell, NULL_HANDLE);
    }
}

impl<T: Collectable> Handled for RootHandle<T> {
    fn handle(&self) -> Handle {
        self.entry().cell.load()
    }
}

impl<T: Collectable> Drop for RootHandle<T> {
    fn drop(&mut self) {
        // the collector unlinks and frees the entry once it observes this
        self.entry().owned.store(false, Ordering::Release);
    }
}

impl<T: Collectable> Default for RootHandle<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A reference-holding field inside a collectable. The enclosing object owns
/// the cell exclusively and must publish it through
/// [Collectable::instance_var].
#[repr(transparent)]
pub struct InstanceHandle<T: Collectable> {
    cell: SnapCell,
    _marker: PhantomData<*const T>,
}

impl<T: Collectable> InstanceHandle<T> {
    pub const fn null() -> Self {
        Self {
            cell: SnapCell::new(NULL_HANDLE),
            _marker: PhantomData,
        }
    }

    pub fn new(value: Gc<T>) -> Self {
        Self {
            cell: SnapCell::new(value.handle()),
            _marker: PhantomData,
        }
    }

    pub fn get(&self) -> Option<Gc<T>> {
        match self.cell.load() {
            NULL_HANDLE => None,
            h => Some(Gc::from_handle(h)),
        }
    }

    /// Publish a reference through the calling thread's write barrier.
    pub fn set(&self, value: Gc<T>) {
        barrier::write(&self.cell, value.handle());
    }

    pub fn clear(&self) {
        barrier::write(&self.cell, NULL_HANDLE);
    }

    /// The raw cell, for [Collectable::instance_var] implementations.
    pub fn raw(&self) -> &SnapCell {
        &self.cell
    }
}

impl<T: Collectable> Handled for InstanceHandle<T> {
    fn handle(&self) -> Handle {
        self.cell.load()
    }
}

impl<T: Collectable> Default for InstanceHandle<T> {
    fn default() -> Self {
        Self::null()
    }
}

// The handle is a plain id; the cell it lives in is shared with the
// collector by design, under the phase ownership rules.
unsafe impl<T: Collectable> Send for InstanceHandle<T> {}
unsafe impl<T: Collectable> Sync for InstanceHandle<T> {}
