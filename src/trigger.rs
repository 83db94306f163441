//! The allocation trigger.
//!
//! Each thread tallies allocated bytes locally and folds the tally into the
//! global counter every 300 ordinary allocations, every 20 array
//! allocations, on any single allocation of half a megabyte or more, and on
//! thread exit. Whoever pushes the global counter past the trigger point
//! exchanges it back to zero and wakes the collector. A separate per-thread
//! count of consumed handles forces an early collection when a thread chews
//! through handles faster than bytes.

use std::sync::atomic::Ordering;

use crate::handle::HANDLE_EARLY_TRIGGER;
use crate::state::ThreadData;
use crate::GcContext;

pub(crate) const DEFAULT_TRIGGER_POINT: i64 = 300_000_000;

const ALLOCS_PER_MERGE: u32 = 300;
const ARRAY_ALLOCS_PER_MERGE: u32 = 20;
const LARGE_ALLOCATION: usize = 500_000;

pub(crate) fn log_alloc(ctx: &GcContext, thread: &ThreadData, bytes: usize) {
    thread
        .allocated_bytes
        .set(thread.allocated_bytes.get() + bytes as i64);
    thread.alloc_tally.set(thread.alloc_tally.get() + 1);
    if thread.alloc_tally.get() > ALLOCS_PER_MERGE || bytes > LARGE_ALLOCATION {
        alloc_merge(ctx, thread);
    }
}

pub(crate) fn log_array_alloc(ctx: &GcContext, thread: &ThreadData, bytes: usize, len: usize) {
    // the element count is folded into the byte tally as well, so long arrays
    // of small elements still push toward the trigger
    thread
        .allocated_bytes
        .set(thread.allocated_bytes.get() + (bytes + len) as i64);
    thread.array_tally.set(thread.array_tally.get() + 1);
    if thread.array_tally.get() > ARRAY_ALLOCS_PER_MERGE {
        thread.array_tally.set(0);
        alloc_merge(ctx, thread);
    }
}

/// Fold the thread-local tallies into the global counter and, if it crossed
/// the trigger point, take the whole count and wake the collector. Also runs
/// on thread exit so no allocation goes unaccounted.
pub(crate) fn alloc_merge(ctx: &GcContext, thread: &ThreadData) {
    thread
        .handles_used
        .set(thread.handles_used.get() + (thread.alloc_tally.get() as u64) * 2);
    thread.alloc_tally.set(0);
    ctx.allocated
        .fetch_add(thread.allocated_bytes.get(), Ordering::SeqCst);
    thread.allocated_bytes.set(0);

    let trigger = ctx.trigger_point.load(Ordering::Relaxed);
    let over_handles = thread.handles_used.get() > HANDLE_EARLY_TRIGGER;
    if ctx.allocated.load(Ordering::SeqCst) > trigger || over_handles {
        let taken = ctx.allocated.swap(0, Ordering::SeqCst);
        if taken > trigger || over_handles {
            thread.handles_used.set(0);
            signal_collection(ctx);
        } else {
            // someone else raced the exchange; give the count back
            ctx.allocated.fetch_add(taken, Ordering::SeqCst);
        }
    }
}

/// Wake the collector: arm the single-thread flag in combined mode, signal
/// the collection event otherwise. Quiet once the exit flag is set.
pub(crate) fn signal_collection(ctx: &GcContext) {
    if ctx.exit_flag.load(Ordering::SeqCst) {
        return;
    }
    if ctx.combined {
        ctx.single_thread_event.store(true, Ordering::SeqCst);
    } else {
        ctx.event.notify();
    }
}
