//! The global phase state machine and per-thread registration.
//!
//! One 64-bit atomic word holds the current phase together with four thread
//! counters. Every mutating thread is counted in exactly one of the three
//! phase counters (or in `threads_not_mutating` once it has opted out), and
//! every transition moves a thread from its old counter to the new one with a
//! single sequentially consistent CAS. The collector advances the phase and
//! then waits for the old phase's counter to drain before doing any work that
//! needs full quiescence.
//!
//! Phase cycle:
//!
//! ```text
//! NOT_COLLECTING --> COLLECTING --> RESTORING_SNAPSHOT --> NOT_COLLECTING
//!   double-store       single-store      double-store
//!   barrier            barrier           barrier
//! ```
//!
//! Mutators observe an edge at their next [safe_point], swap their write
//! barrier, and spin-yield until the counter of the phase they left reaches
//! zero, which guarantees no thread still runs with the previous barrier when
//! the collector proceeds.

use std::cell::Cell;
use std::ptr::null_mut;
use std::sync::atomic::Ordering;

use crossbeam_utils::Backoff;
use modular_bitfield::prelude::*;

use crate::api::GcHeader;
use crate::barrier::{self, BarrierFn};
use crate::handle::{self, Handle, END_OF_LIST};
use crate::list;
use crate::root::RootEntry;
use crate::{collector, trigger, try_context, GcContext};

/// Upper bound on simultaneously registered mutator threads.
pub const MAX_COLLECTED_THREADS: usize = 256;

#[derive(BitfieldSpecifier, Clone, Copy, PartialEq, Eq, Debug)]
#[bits = 8]
pub(crate) enum Phase {
    NotMutating,
    NotCollecting,
    Collecting,
    RestoringSnapshot,
    Exit,
}

/// The packed global state. Counters are 12 bits wide so all four plus the
/// phase fit one CAS-able word with room for [MAX_COLLECTED_THREADS] threads
/// and the collector itself.
#[bitfield(bits = 64)]
#[derive(Clone, Copy)]
pub(crate) struct StateWord {
    pub threads_not_mutating: B12,
    pub threads_in_collection: B12,
    pub threads_in_sweep: B12,
    pub threads_out_of_collection: B12,
    pub phase: Phase,
    #[skip]
    __: B8,
}

impl StateWord {
    pub fn to_u64(self) -> u64 {
        u64::from_le_bytes(self.into_bytes())
    }

    pub fn from_u64(v: u64) -> Self {
        Self::from_bytes(v.to_le_bytes())
    }
}

impl GcContext {
    pub(crate) fn load_state(&self) -> StateWord {
        StateWord::from_u64(self.state.load(Ordering::SeqCst))
    }

    /// On failure `expected` is refreshed with the observed state.
    pub(crate) fn compare_set_state(&self, expected: &mut StateWord, to: StateWord) -> bool {
        match self.state.compare_exchange_weak(
            expected.to_u64(),
            to.to_u64(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => true,
            Err(actual) => {
                *expected = StateWord::from_u64(actual);
                false
            }
        }
    }
}

/// Everything the collector needs to reach of a mutator thread: the two
/// object lists, the two root lists, and the positions where the last merge
/// spliced the snapshot lists back in (the restore passes start there).
pub(crate) struct ScanLists {
    pub objects: [*mut GcHeader; 2],
    pub roots: [*mut RootEntry; 2],
    pub objects_pos: Cell<*mut GcHeader>,
    pub roots_pos: Cell<*mut RootEntry>,
}

unsafe impl Send for ScanLists {}
unsafe impl Sync for ScanLists {}

impl ScanLists {
    pub(crate) fn new() -> Self {
        unsafe {
            let object_ring = || {
                let s = Box::into_raw(Box::new(GcHeader::sentinel()));
                list::init_ring(s);
                s
            };
            let root_ring = || {
                let s = Box::into_raw(Box::new(RootEntry::sentinel()));
                list::init_ring(s);
                s
            };
            ScanLists {
                objects: [object_ring(), object_ring()],
                roots: [root_ring(), root_ring()],
                objects_pos: Cell::new(null_mut()),
                roots_pos: Cell::new(null_mut()),
            }
        }
    }
}

const UNREGISTERED: usize = usize::MAX;

/// Thread-local mutator state: the mirrored phase, the barrier selector, the
/// private handle chain and the allocation tallies.
pub(crate) struct ThreadData {
    pub index: Cell<usize>,
    pub phase: Cell<Phase>,
    pub not_mutating_count: Cell<i32>,
    pub barrier: Cell<BarrierFn>,
    pub free_handles: Cell<Handle>,
    pub allocated_bytes: Cell<i64>,
    pub alloc_tally: Cell<u32>,
    pub array_tally: Cell<u32>,
    pub handles_used: Cell<u64>,
}

impl ThreadData {
    fn new() -> Self {
        Self {
            index: Cell::new(UNREGISTERED),
            phase: Cell::new(Phase::NotMutating),
            not_mutating_count: Cell::new(0),
            barrier: Cell::new(barrier::regular_barrier as BarrierFn),
            free_handles: Cell::new(END_OF_LIST),
            allocated_bytes: Cell::new(0),
            alloc_tally: Cell::new(0),
            array_tally: Cell::new(0),
            handles_used: Cell::new(0),
        }
    }

    pub fn is_registered(&self) -> bool {
        self.index.get() != UNREGISTERED
    }
}

thread_local! {
    pub(crate) static THREAD: ThreadData = ThreadData::new();
}

pub(crate) fn set_thread_phase(thread: &ThreadData, phase: Phase) {
    thread.phase.set(phase);
    thread.barrier.set(if phase == Phase::Collecting {
        barrier::collecting_barrier as BarrierFn
    } else {
        barrier::regular_barrier as BarrierFn
    });
}

/// Register the calling thread as a mutator, claiming one of the
/// [MAX_COLLECTED_THREADS] slots. Blocks (yielding) while every slot is
/// taken. `combine` must match the mode the collector was initialized with.
pub fn init_thread(combine: bool) {
    let ctx = crate::context();
    debug_assert_eq!(combine, ctx.combined, "mode switching is not supported");
    THREAD.with(|t| init_thread_inner(ctx, t));
}

fn init_thread_inner(ctx: &GcContext, thread: &ThreadData) {
    assert!(!thread.is_registered(), "thread is already registered");
    let backoff = Backoff::new();
    let slot = loop {
        let claimed = (0..MAX_COLLECTED_THREADS).find(|&i| {
            !ctx.thread_slots[i].load(Ordering::SeqCst)
                && ctx.thread_slots[i]
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
        });
        match claimed {
            Some(i) => break i,
            None => backoff.snooze(),
        }
    };
    thread.index.set(slot);
    ctx.threads_ever.fetch_add(1, Ordering::SeqCst);
    // Lists are kept when a thread exits so the objects it allocated remain
    // collectable; a thread reclaiming the slot simply adopts them.
    if ctx.scan_lists[slot].load(Ordering::Acquire).is_null() {
        let lists = Box::into_raw(Box::new(ScanLists::new()));
        ctx.scan_lists[slot].store(lists, Ordering::Release);
    }
    thread.not_mutating_count.set(1);
    enter_mutation_inner(ctx, thread, true);
}

/// Unregister the calling thread. Its allocation tallies are folded into the
/// global trigger and the rest of its handle chain goes back to the
/// collector.
pub fn exit_thread() {
    let ctx = crate::context();
    THREAD.with(|t| exit_thread_inner(ctx, t));
}

fn exit_thread_inner(ctx: &GcContext, thread: &ThreadData) {
    assert!(thread.is_registered(), "thread is not registered");
    leave_mutation_inner(ctx, thread);
    trigger::alloc_merge(ctx, thread);
    handle::release_thread_handles(ctx, thread);
    if !ctx.combined {
        // count back out of threads_not_mutating so the slot leaves no residue
        let mut gc = ctx.load_state();
        loop {
            let mut to = gc;
            to.set_threads_not_mutating(gc.threads_not_mutating() - 1);
            if ctx.compare_set_state(&mut gc, to) {
                break;
            }
        }
    }
    ctx.thread_slots[thread.index.get()].store(false, Ordering::SeqCst);
    thread.index.set(UNREGISTERED);
    thread.not_mutating_count.set(0);
    set_thread_phase(thread, Phase::NotMutating);
}

pub(crate) fn exit_current_thread_if_registered() {
    if let Some(ctx) = try_context() {
        THREAD.with(|t| {
            if t.is_registered() {
                exit_thread_inner(ctx, t);
            }
        });
    }
}

/// A voluntary coordination point. The host inserts calls to this in loop
/// backedges and before blocking operations; phase transitions take effect
/// for the calling thread here and nowhere else.
///
/// Must not be called while holding a lock the collector may also take.
pub fn safe_point() {
    let ctx = match try_context() {
        Some(ctx) => ctx,
        None => return,
    };
    THREAD.with(|t| safe_point_inner(ctx, t));
}

fn safe_point_inner(ctx: &GcContext, thread: &ThreadData) {
    if ctx.combined && ctx.single_thread_event.swap(false, Ordering::SeqCst) {
        collector::one_collect(ctx);
    }
    let mut gc = ctx.load_state();
    if thread.phase.get() == gc.phase() {
        return;
    }
    let backoff = Backoff::new();
    match thread.phase.get() {
        Phase::NotMutating | Phase::Exit => {}
        Phase::NotCollecting => {
            loop {
                let mut to = gc;
                to.set_threads_out_of_collection(gc.threads_out_of_collection() - 1);
                to.set_threads_in_collection(gc.threads_in_collection() + 1);
                if ctx.compare_set_state(&mut gc, to) {
                    gc = to;
                    break;
                }
            }
            set_thread_phase(thread, Phase::Collecting);
            while gc.threads_out_of_collection() > 0 {
                backoff.snooze();
                gc = ctx.load_state();
                if ctx.exit_flag.load(Ordering::SeqCst) {
                    return;
                }
            }
        }
        Phase::Collecting => {
            loop {
                if ctx.exit_flag.load(Ordering::SeqCst) {
                    return;
                }
                let mut to = gc;
                to.set_threads_in_collection(gc.threads_in_collection() - 1);
                to.set_threads_in_sweep(gc.threads_in_sweep() + 1);
                if ctx.compare_set_state(&mut gc, to) {
                    gc = to;
                    break;
                }
            }
            set_thread_phase(thread, Phase::RestoringSnapshot);
            while gc.threads_in_collection() > 0 {
                backoff.snooze();
                gc = ctx.load_state();
                if ctx.exit_flag.load(Ordering::SeqCst) {
                    return;
                }
            }
        }
        Phase::RestoringSnapshot => {
            loop {
                let mut to = gc;
                to.set_threads_in_sweep(gc.threads_in_sweep() - 1);
                to.set_threads_out_of_collection(gc.threads_out_of_collection() + 1);
                if ctx.compare_set_state(&mut gc, to) {
                    gc = to;
                    break;
                }
            }
            set_thread_phase(thread, Phase::NotCollecting);
            while gc.threads_in_sweep() > 0 {
                backoff.snooze();
                gc = ctx.load_state();
                if ctx.exit_flag.load(Ordering::SeqCst) {
                    return;
                }
            }
        }
    }
}

/// Opt the calling thread out of mutation around code that may block
/// indefinitely, so the collector does not have to wait for it. Calls nest.
pub fn leave_mutation() {
    let ctx = crate::context();
    THREAD.with(|t| leave_mutation_inner(ctx, t));
}

fn leave_mutation_inner(ctx: &GcContext, thread: &ThreadData) {
    let count = thread.not_mutating_count.get() + 1;
    thread.not_mutating_count.set(count);
    if count > 1 {
        return;
    }
    if ctx.combined {
        // the sole thread is also the collector; there is nobody to release
        set_thread_phase(thread, Phase::NotMutating);
        return;
    }
    // The mirrored phase names the counter this thread occupies; the global
    // phase may already have moved on if the thread has not acknowledged yet.
    let occupied = thread.phase.get();
    let mut gc = ctx.load_state();
    loop {
        let mut to = gc;
        match occupied {
            Phase::NotCollecting => {
                to.set_threads_out_of_collection(gc.threads_out_of_collection() - 1)
            }
            Phase::Collecting => to.set_threads_in_collection(gc.threads_in_collection() - 1),
            Phase::RestoringSnapshot => to.set_threads_in_sweep(gc.threads_in_sweep() - 1),
            Phase::NotMutating | Phase::Exit => {}
        }
        to.set_threads_not_mutating(gc.threads_not_mutating() + 1);
        if ctx.compare_set_state(&mut gc, to) {
            break;
        }
    }
    set_thread_phase(thread, Phase::NotMutating);
}

/// Rejoin mutation after [leave_mutation]. If a phase transition is waiting
/// on the counter this thread joins, this call waits for the transition to
/// complete before returning.
pub fn enter_mutation() {
    let ctx = crate::context();
    THREAD.with(|t| enter_mutation_inner(ctx, t, false));
}

fn enter_mutation_inner(ctx: &GcContext, thread: &ThreadData, from_init: bool) {
    let count = thread.not_mutating_count.get() - 1;
    thread.not_mutating_count.set(count);
    if count != 0 {
        return;
    }
    if ctx.combined {
        set_thread_phase(thread, ctx.load_state().phase());
        return;
    }
    let mut gc = ctx.load_state();
    let mut to;
    loop {
        to = gc;
        match gc.phase() {
            Phase::NotCollecting => {
                to.set_threads_out_of_collection(gc.threads_out_of_collection() + 1)
            }
            Phase::Collecting => to.set_threads_in_collection(gc.threads_in_collection() + 1),
            Phase::RestoringSnapshot => to.set_threads_in_sweep(gc.threads_in_sweep() + 1),
            Phase::NotMutating | Phase::Exit => {}
        }
        if !from_init {
            to.set_threads_not_mutating(gc.threads_not_mutating() - 1);
        }
        if ctx.compare_set_state(&mut gc, to) {
            break;
        }
    }
    set_thread_phase(thread, to.phase());
    // a transition out of the previous phase may still be draining; wait for
    // it so this thread's barrier cannot coexist with stale ones
    let backoff = Backoff::new();
    match to.phase() {
        Phase::NotCollecting => {
            while to.threads_in_sweep() > 0 {
                backoff.snooze();
                to = ctx.load_state();
                if ctx.exit_flag.load(Ordering::SeqCst) {
                    return;
                }
            }
        }
        Phase::Collecting => {
            while to.threads_out_of_collection() > 0 {
                backoff.snooze();
                to = ctx.load_state();
                if ctx.exit_flag.load(Ordering::SeqCst) {
                    return;
                }
            }
        }
        Phase::RestoringSnapshot => {
            while to.threads_in_collection() > 0 {
                backoff.snooze();
                to = ctx.load_state();
                if ctx.exit_flag.load(Ordering::SeqCst) {
                    return;
                }
            }
        }
        Phase::NotMutating | Phase::Exit => {}
    }
}

/// Registers the current thread for the lifetime of the scope.
pub struct ThreadScope(());

impl ThreadScope {
    pub fn new() -> Self {
        init_thread(crate::context().combined);
        ThreadScope(())
    }
}

impl Drop for ThreadScope {
    fn drop(&mut self) {
        exit_thread();
    }
}

/// Brackets a blocking region with [leave_mutation]/[enter_mutation].
pub struct LeaveMutationScope(());

impl LeaveMutationScope {
    pub fn new() -> Self {
        leave_mutation();
        LeaveMutationScope(())
    }
}

impl Drop for LeaveMutationScope {
    fn drop(&mut self) {
        enter_mutation();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_word_roundtrips() {
        let w = StateWord::new()
            .with_threads_not_mutating(3)
            .with_threads_in_collection(250)
            .with_threads_in_sweep(1)
            .with_threads_out_of_collection(17)
            .with_phase(Phase::Collecting);
        let packed = w.to_u64();
        let back = StateWord::from_u64(packed);
        assert_eq!(back.threads_not_mutating(), 3);
        assert_eq!(back.threads_in_collection(), 250);
        assert_eq!(back.threads_in_sweep(), 1);
        assert_eq!(back.threads_out_of_collection(), 17);
        assert_eq!(back.phase(), Phase::Collecting);
    }

    #[test]
    fn state_word_zero_is_empty_not_mutating() {
        let w = StateWord::from_u64(0);
        assert_eq!(w.threads_out_of_collection(), 0);
        assert_eq!(w.phase(), Phase::NotMutating);
    }
}
