//! The collector driver.
//!
//! One cycle walks the phase machine through its three edges and does the
//! actual work between them:
//!
//! 1. `start_collection` — move the phase to COLLECTING, wait for every
//!    mutator to count out, flip the active index while holding the only
//!    execution context, then mark from the snapshot root lists and sweep
//!    the snapshot object lists.
//! 2. `start_restore_snapshot` — move to RESTORING_SNAPSHOT, splice the
//!    snapshot lists back onto the active lists during the exclusive window,
//!    then run the cheap non-atomic restore over the merged region.
//! 3. `end_sweep` — move back to NOT_COLLECTING, then run the CAS-based
//!    finalize pass that repairs whatever the cheap pass raced on.
//!
//! The collector either runs on its own parked thread, woken by the
//! allocation trigger, or inline on the single mutator thread in combined
//! mode, where every border wait terminates on its first check.

use std::sync::atomic::Ordering;

use crossbeam_utils::Backoff;
use parking_lot::{Condvar, Mutex};

use crate::api::{self, GcHeader};
use crate::handle::{Handle, END_OF_LIST, HANDLES_PER_BLOCK, NULL_HANDLE};
use crate::list::{Cursor, Link};
use crate::root::RootEntry;
use crate::state::{set_thread_phase, Phase, ScanLists, THREAD};
use crate::{list, GcContext};

/// Counter-style event: a missed notification is detected by comparing ids,
/// so signals sent while the collector is busy coalesce instead of being
/// lost.
pub(crate) struct CollectionEvent {
    id: Mutex<i32>,
    cond: Condvar,
}

impl CollectionEvent {
    pub fn new() -> Self {
        Self {
            id: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub fn notify(&self) {
        {
            let mut id = self.id.lock();
            *id += 1;
        }
        self.cond.notify_all();
    }

    pub fn wait(&self, received: &mut i32) {
        let mut id = self.id.lock();
        while *id == *received {
            self.cond.wait(&mut id);
        }
        *received = *id;
    }
}

/// Collector-private scratch that survives between cycles: the chain of
/// handles freed by the current sweep and the full blocks awaiting
/// publication. Blocks are only published at the next cycle's start, so an
/// id freed in cycle N cannot be returned by an allocation before cycle N+1.
pub(crate) struct CollectorScratch {
    dealloc_head: Handle,
    dealloc_count: usize,
    pending_blocks: Vec<Handle>,
}

impl CollectorScratch {
    pub fn new() -> Self {
        Self {
            dealloc_head: END_OF_LIST,
            dealloc_count: 0,
            pending_blocks: Vec::new(),
        }
    }
}

/// Body of the dedicated collector thread.
pub(crate) fn collector_main(ctx: &'static GcContext) {
    let mut received = 0i32;
    log::debug!("collector thread running");
    loop {
        if ctx.exit_flag.load(Ordering::SeqCst) {
            break;
        }
        ctx.event.wait(&mut received);
        if ctx.exit_flag.load(Ordering::SeqCst) {
            break;
        }
        one_collect(ctx);
    }
    log::debug!("collector thread exiting");
}

/// Run one full collection cycle.
pub(crate) fn one_collect(ctx: &GcContext) {
    log::debug!("collection started");
    start_collection(ctx);
    if ctx.exit_flag.load(Ordering::SeqCst) {
        return;
    }
    log::trace!("restoring snapshot");
    start_restore_snapshot(ctx);
    if ctx.exit_flag.load(Ordering::SeqCst) {
        return;
    }
    log::trace!("finalizing snapshot");
    end_sweep(ctx);
    ctx.stats.cycles.fetch_add(1, Ordering::SeqCst);
    log::debug!("collection finished");
}

fn scratch(ctx: &GcContext) -> &mut CollectorScratch {
    // sole accessor is the collector execution context
    unsafe { &mut *ctx.scratch.get() }
}

fn each_scan_lists<'a>(ctx: &'a GcContext) -> impl Iterator<Item = &'a ScanLists> {
    ctx.scan_lists.iter().filter_map(|slot| {
        let lists = slot.load(Ordering::Acquire);
        if lists.is_null() {
            None
        } else {
            Some(unsafe { &*lists })
        }
    })
}

/// NOT_COLLECTING -> COLLECTING. The collector counts itself into the old
/// counter to hold every mutator at its safe point, flips the active index
/// once it is the only member left, releases the mutators, and then marks
/// and sweeps.
fn start_collection(ctx: &GcContext) {
    let mut gc = ctx.load_state();
    debug_assert_eq!(gc.phase(), Phase::NotCollecting);
    let mut to;
    loop {
        to = gc;
        to.set_phase(Phase::Collecting);
        to.set_threads_out_of_collection(gc.threads_out_of_collection() + 1);
        if ctx.exit_flag.load(Ordering::SeqCst) {
            return;
        }
        if ctx.compare_set_state(&mut gc, to) {
            break;
        }
    }
    let mut flipped = false;
    let mut released = false;
    let backoff = Backoff::new();
    loop {
        if ctx.exit_flag.load(Ordering::SeqCst) {
            return;
        }
        if to.threads_out_of_collection() == 1 {
            if !flipped {
                ctx.active_index.fetch_xor(1, Ordering::SeqCst);
                flipped = true;
            }
            loop {
                let mut next = gc;
                if !released {
                    next.set_threads_out_of_collection(gc.threads_out_of_collection() - 1);
                }
                if ctx.compare_set_state(&mut gc, next) {
                    to = next;
                    break;
                }
            }
            released = true;
            if to.threads_out_of_collection() == 0 {
                break;
            }
        }
        backoff.snooze();
        to = ctx.load_state();
    }
    if ctx.combined {
        THREAD.with(|t| {
            if t.phase.get() != Phase::NotMutating {
                set_thread_phase(t, Phase::Collecting);
            }
        });
    }
    mark_and_sweep(ctx);
}

/// COLLECTING -> RESTORING_SNAPSHOT. Symmetric to `start_collection`; the
/// exclusive window is used to merge the snapshot lists back into the active
/// lists and record the merge boundary.
fn start_restore_snapshot(ctx: &GcContext) {
    let mut gc = ctx.load_state();
    debug_assert_eq!(gc.phase(), Phase::Collecting);
    let mut to;
    loop {
        to = gc;
        to.set_phase(Phase::RestoringSnapshot);
        to.set_threads_in_collection(gc.threads_in_collection() + 1);
        if ctx.compare_set_state(&mut gc, to) {
            break;
        }
    }
    let mut merged = false;
    let mut released = false;
    let backoff = Backoff::new();
    loop {
        if ctx.exit_flag.load(Ordering::SeqCst) {
            return;
        }
        if to.threads_in_collection() == 1 {
            if !merged {
                // no mutator can still hold the collecting barrier here: the
                // old counter is down to this thread alone
                merge_collected(ctx);
                merged = true;
            }
            loop {
                let mut next = gc;
                if !released {
                    next.set_threads_in_collection(gc.threads_in_collection() - 1);
                }
                if ctx.compare_set_state(&mut gc, next) {
                    to = next;
                    break;
                }
            }
            released = true;
            if to.threads_in_collection() == 0 {
                break;
            }
        }
        backoff.snooze();
        to = ctx.load_state();
    }
    if ctx.combined {
        THREAD.with(|t| {
            if t.phase.get() != Phase::NotMutating {
                set_thread_phase(t, Phase::RestoringSnapshot);
            }
        });
    }
    restore_snapshot(ctx);
}

/// RESTORING_SNAPSHOT -> NOT_COLLECTING. No list work on this edge; once the
/// mutators have re-acknowledged, the CAS-based finalize pass repairs the
/// cells the fast pass raced on.
fn end_sweep(ctx: &GcContext) {
    let mut gc = ctx.load_state();
    debug_assert_eq!(gc.phase(), Phase::RestoringSnapshot);
    let mut to;
    loop {
        if ctx.exit_flag.load(Ordering::SeqCst) {
            return;
        }
        to = gc;
        to.set_phase(Phase::NotCollecting);
        to.set_threads_in_sweep(gc.threads_in_sweep() + 1);
        if ctx.compare_set_state(&mut gc, to) {
            break;
        }
    }
    let mut released = false;
    let backoff = Backoff::new();
    loop {
        if ctx.exit_flag.load(Ordering::SeqCst) {
            return;
        }
        if to.threads_in_sweep() == 1 {
            loop {
                let mut next = gc;
                if !released {
                    next.set_threads_in_sweep(gc.threads_in_sweep() - 1);
                }
                if ctx.compare_set_state(&mut gc, next) {
                    to = next;
                    break;
                }
            }
            released = true;
            if to.threads_in_sweep() == 0 {
                break;
            }
        }
        backoff.snooze();
        to = ctx.load_state();
    }
    if ctx.combined {
        THREAD.with(|t| {
            if t.phase.get() != Phase::NotMutating {
                set_thread_phase(t, Phase::NotCollecting);
            }
        });
    }
    finalize_snapshot(ctx);
}

/// Link a freed id into the deallocation chain; a full block's worth moves to
/// the pending list for publication at the next cycle start.
unsafe fn free_handle(ctx: &GcContext, scratch: &mut CollectorScratch, handle: Handle) {
    ctx.table.set_free_link(handle, scratch.dealloc_head);
    scratch.dealloc_head = handle;
    scratch.dealloc_count += 1;
    if scratch.dealloc_count == HANDLES_PER_BLOCK {
        scratch.pending_blocks.push(scratch.dealloc_head);
        scratch.dealloc_head = END_OF_LIST;
        scratch.dealloc_count = 0;
    }
}

/// Publish the blocks reclaimed last cycle and absorb the chains surrendered
/// by exited threads.
fn drain_released_handles(ctx: &GcContext) {
    let scratch = scratch(ctx);
    for block in scratch.pending_blocks.drain(..) {
        let _pushed = ctx.block_queue.push(block);
        debug_assert!(_pushed, "block queue sized to hold every block");
    }
    for head in ctx.release_queue.steal() {
        let mut h = head;
        while h != END_OF_LIST {
            let next = unsafe { ctx.table.free_link(h) };
            unsafe { free_handle(ctx, scratch, h) };
            h = next;
        }
    }
}

/// Mark every object reachable from the snapshot root lists, then sweep the
/// snapshot object lists. Runs while mutators continue in COLLECTING; the
/// collector only reads snapshot halves, which are frozen.
fn mark_and_sweep(ctx: &GcContext) {
    drain_released_handles(ctx);
    let snapshot = ctx.active_index.load(Ordering::SeqCst) ^ 1;
    let mut worklist: Vec<Handle> = Vec::new();
    let mut roots_dropped = 0usize;
    let mut objects_freed = 0usize;

    for lists in each_scan_lists(ctx) {
        let mut cur: Cursor<RootEntry> = unsafe { Cursor::from_head(lists.roots[snapshot]) };
        while let Some(entry) = cur.get() {
            if ctx.exit_flag.load(Ordering::SeqCst) {
                return;
            }
            let e = unsafe { &*entry };
            debug_assert!(!e.sentinel);
            if e.was_owned.get() {
                let referent = e.cell.load_snapshot();
                if referent != NULL_HANDLE {
                    mark_object(ctx, referent, &mut worklist);
                }
            }
            let owned = e.owned.load(Ordering::Acquire);
            e.was_owned.set(owned);
            if !owned {
                unsafe {
                    cur.remove_and_advance();
                    drop(Box::from_raw(entry));
                }
                roots_dropped += 1;
            } else {
                unsafe { cur.advance() };
            }
        }
    }

    let scratch = scratch(ctx);
    for lists in each_scan_lists(ctx) {
        let mut cur: Cursor<GcHeader> = unsafe { Cursor::from_head(lists.objects[snapshot]) };
        while let Some(node) = cur.get() {
            if ctx.exit_flag.load(Ordering::SeqCst) {
                return;
            }
            let header = unsafe { &*node };
            debug_assert!(!header.is_sentinel());
            if !header.is_marked() {
                let handle = header.handle();
                unsafe {
                    cur.remove_and_advance();
                    api::destroy_object(ctx, handle);
                    free_handle(ctx, scratch, handle);
                }
                objects_freed += 1;
            } else {
                header.set_marked(false);
                unsafe {
                    (*ctx.table.object(header.handle())).value.clean_after_collect();
                }
                unsafe { cur.advance() };
            }
        }
    }

    ctx.stats.roots_dropped.fetch_add(roots_dropped, Ordering::Relaxed);
    ctx.stats.objects_freed.fetch_add(objects_freed, Ordering::Relaxed);
    ctx.stats.live_objects.fetch_sub(objects_freed, Ordering::Relaxed);
    log::debug!("{} roots dropped, {} objects freed", roots_dropped, objects_freed);
}

/// Transitively mark `handle` through snapshot halves, iteratively via an
/// explicit worklist.
fn mark_object(ctx: &GcContext, handle: Handle, worklist: &mut Vec<Handle>) {
    worklist.push(handle);
    while let Some(h) = worklist.pop() {
        unsafe {
            let object = ctx.table.object(h);
            let header = &(*object).header;
            if header.is_marked() {
                continue;
            }
            header.set_marked(true);
            let value = &(*object).value;
            for i in 0..value.instance_var_count() {
                let referent = value.instance_var(i).load_snapshot();
                if referent != NULL_HANDLE {
                    worklist.push(referent);
                }
            }
        }
    }
}

/// Splice every thread's snapshot lists onto the front of its active lists
/// and record where the merged region begins. Only called inside the
/// exclusive window of the COLLECTING -> RESTORING_SNAPSHOT edge.
fn merge_collected(ctx: &GcContext) {
    let active = ctx.active_index.load(Ordering::SeqCst);
    for lists in each_scan_lists(ctx) {
        unsafe {
            list::merge_into(lists.objects[active ^ 1], lists.objects[active]);
            lists.objects_pos.set((*lists.objects[active]).next());
            list::merge_into(lists.roots[active ^ 1], lists.roots[active]);
            lists.roots_pos.set((*lists.roots[active]).next());
        }
    }
}

/// Skipping both restore passes is sound in combined mode as long as only
/// one thread was ever registered: the whole cycle then ran inline with no
/// mutator stores in between, so every cell still agrees with its snapshot.
/// Relies on the registered-thread counter being monotonic.
fn restore_passes_redundant(ctx: &GcContext) -> bool {
    ctx.combined && ctx.threads_ever.load(Ordering::SeqCst) == 1
}

fn restore_snapshot(ctx: &GcContext) {
    if restore_passes_redundant(ctx) {
        return;
    }
    let active = ctx.active_index.load(Ordering::SeqCst);
    for lists in each_scan_lists(ctx) {
        // a thread registered after the merge has no recorded boundary yet
        if lists.objects_pos.get().is_null() {
            continue;
        }
        let mut cur: Cursor<GcHeader> =
            Cursor::new(lists.objects_pos.get(), lists.objects[active]);
        while let Some(node) = cur.get() {
            if ctx.exit_flag.load(Ordering::SeqCst) {
                return;
            }
            unsafe {
                let value = &(*ctx.table.object((*node).handle())).value;
                for i in (0..value.instance_var_count()).rev() {
                    value.instance_var(i).fast_restore();
                }
                cur.advance();
            }
        }
        let mut cur: Cursor<RootEntry> = Cursor::new(lists.roots_pos.get(), lists.roots[active]);
        while let Some(entry) = cur.get() {
            if ctx.exit_flag.load(Ordering::SeqCst) {
                return;
            }
            unsafe {
                (*entry).cell.fast_restore();
                cur.advance();
            }
        }
    }
}

fn finalize_snapshot(ctx: &GcContext) {
    if restore_passes_redundant(ctx) {
        return;
    }
    let active = ctx.active_index.load(Ordering::SeqCst);
    for lists in each_scan_lists(ctx) {
        if ctx.exit_flag.load(Ordering::SeqCst) {
            return;
        }
        if lists.objects_pos.get().is_null() {
            continue;
        }
        let mut cur: Cursor<GcHeader> =
            Cursor::new(lists.objects_pos.get(), lists.objects[active]);
        while let Some(node) = cur.get() {
            unsafe {
                let value = &(*ctx.table.object((*node).handle())).value;
                for i in (0..value.instance_var_count()).rev() {
                    value.instance_var(i).restore();
                }
                cur.advance();
            }
        }
        let mut cur: Cursor<RootEntry> = Cursor::new(lists.roots_pos.get(), lists.roots[active]);
        while let Some(entry) = cur.get() {
            unsafe {
                (*entry).cell.restore();
                cur.advance();
            }
        }
    }
}
