//! Pauseless snapshot-at-the-beginning garbage collection for embedding in
//! Rust hosts.
//!
//! One collector thread (or, in combined mode, the sole mutator thread
//! itself) reclaims unreachable objects concurrently with the mutators.
//! There is no stop-the-world pause: coordination happens only at phase
//! borders, where each mutator briefly acknowledges the new phase at a
//! [safe_point] and swaps its write barrier. The collector works against a
//! snapshot of the object graph taken at the border, captured by double-slot
//! [SnapCell]s: while a collection runs, mutator stores touch only the
//! current half of each cell, so the snapshot half still describes the graph
//! as it was when the collection began.
//!
//! Objects are named by stable 32-bit handles through a fixed indirection
//! table; live references are held in [RootHandle]s (explicitly registered
//! roots) and [InstanceHandle]s (fields inside [Collectable] values).
//!
//! ```no_run
//! use snapgc::{allocate, Collectable, InstanceHandle, RootHandle, SnapCell};
//!
//! struct Node {
//!     next: InstanceHandle<Node>,
//! }
//!
//! impl Collectable for Node {
//!     fn instance_var_count(&self) -> usize {
//!         1
//!     }
//!     fn instance_var(&self, _at: usize) -> &SnapCell {
//!         self.next.raw()
//!     }
//! }
//!
//! snapgc::init(false);
//! snapgc::init_thread(false);
//! let head = RootHandle::new_with(allocate(Node { next: InstanceHandle::null() }).unwrap());
//! let second = allocate(Node { next: InstanceHandle::null() }).unwrap();
//! head.get().unwrap().next.set(second);
//! snapgc::safe_point();
//! snapgc::exit_thread();
//! drop(head);
//! snapgc::exit_collector();
//! ```

use std::ptr::null_mut;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

mod api;
mod barrier;
mod cell;
mod collector;
mod handle;
mod lifo;
mod list;
mod mmap;
mod root;
mod state;
mod statistics;
mod trigger;

#[cfg(test)]
mod tests;

pub use api::{
    allocate, allocate_array, AllocError, Collectable, Gc, GcArray, Handled,
};
pub use cell::SnapCell;
pub use handle::{Handle, NULL_HANDLE};
pub use root::{InstanceHandle, RootHandle};
pub use state::{
    enter_mutation, exit_thread, init_thread, leave_mutation, safe_point, LeaveMutationScope,
    ThreadScope, MAX_COLLECTED_THREADS,
};
pub use statistics::{statistics, GcStatistics};

use collector::{CollectionEvent, CollectorScratch};
use handle::{HandleTable, DEFAULT_HANDLE_BLOCKS};
use lifo::LifoStack;
use state::ScanLists;
use statistics::Counters;

/// Collector configuration, consumed by [init_with_config].
pub struct GcConfig {
    /// Handle table capacity in blocks of 16384 ids.
    pub handle_blocks: usize,
    /// Global allocated-bytes threshold that wakes the collector. Overridden
    /// by the `max-trigger` environment variable when set.
    pub trigger_point: i64,
    /// Run the collector inline on the calling thread instead of spawning a
    /// dedicated one. The caller becomes the single registered mutator.
    pub combine_thread_with_caller: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            handle_blocks: DEFAULT_HANDLE_BLOCKS,
            trigger_point: trigger::DEFAULT_TRIGGER_POINT,
            combine_thread_with_caller: false,
        }
    }
}

/// Every piece of process-wide collector state, owned as one value so there
/// is exactly one instance and one teardown path.
pub(crate) struct GcContext {
    pub state: AtomicU64,
    /// Selects which of each thread's two list roles is the active one;
    /// flipped by the collector while it holds the only execution context.
    pub active_index: AtomicUsize,
    /// Registered-thread count; monotonic, never decremented.
    pub threads_ever: AtomicU32,
    pub exit_flag: AtomicBool,
    pub single_thread_event: AtomicBool,
    /// Immutable after `init`; mode switching is not supported.
    pub combined: bool,
    pub thread_slots: [AtomicBool; MAX_COLLECTED_THREADS],
    pub scan_lists: [AtomicPtr<ScanLists>; MAX_COLLECTED_THREADS],
    pub table: HandleTable,
    pub block_queue: LifoStack<Handle>,
    pub release_queue: LifoStack<Handle>,
    pub allocated: AtomicI64,
    pub trigger_point: AtomicI64,
    pub event: CollectionEvent,
    pub scratch: std::cell::UnsafeCell<CollectorScratch>,
    pub stats: Counters,
    collector_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

unsafe impl Send for GcContext {}
unsafe impl Sync for GcContext {}

impl GcContext {
    fn new(config: &GcConfig, trigger_point: i64) -> Self {
        const FALSE: AtomicBool = AtomicBool::new(false);
        const NO_LISTS: AtomicPtr<ScanLists> = AtomicPtr::new(null_mut());
        let initial = state::StateWord::new()
            .with_phase(state::Phase::NotCollecting)
            .to_u64();
        Self {
            state: AtomicU64::new(initial),
            active_index: AtomicUsize::new(0),
            threads_ever: AtomicU32::new(0),
            exit_flag: AtomicBool::new(false),
            single_thread_event: AtomicBool::new(false),
            combined: config.combine_thread_with_caller,
            thread_slots: [FALSE; MAX_COLLECTED_THREADS],
            scan_lists: [NO_LISTS; MAX_COLLECTED_THREADS],
            table: HandleTable::new(config.handle_blocks),
            block_queue: LifoStack::new(config.handle_blocks + MAX_COLLECTED_THREADS + 1),
            release_queue: LifoStack::new(MAX_COLLECTED_THREADS * 4),
            allocated: AtomicI64::new(0),
            trigger_point: AtomicI64::new(trigger_point),
            event: CollectionEvent::new(),
            scratch: std::cell::UnsafeCell::new(CollectorScratch::new()),
            stats: Counters::new(),
            collector_thread: Mutex::new(None),
        }
    }
}

static CONTEXT: AtomicPtr<GcContext> = AtomicPtr::new(null_mut());

pub(crate) fn context() -> &'static GcContext {
    let ptr = CONTEXT.load(Ordering::Acquire);
    assert!(!ptr.is_null(), "collector is not initialized");
    unsafe { &*ptr }
}

pub(crate) fn try_context() -> Option<&'static GcContext> {
    let ptr = CONTEXT.load(Ordering::Acquire);
    if ptr.is_null() {
        None
    } else {
        Some(unsafe { &*ptr })
    }
}

/// Initialize the collector with defaults. With `combine_thread_with_caller`
/// the caller is installed as the single collector+mutator thread; otherwise
/// a dedicated collector thread is spawned and parked on the allocation
/// trigger.
pub fn init(combine_thread_with_caller: bool) {
    init_with_config(GcConfig {
        combine_thread_with_caller,
        ..GcConfig::default()
    });
}

/// Initialize the collector. Panics if it is already initialized; a fresh
/// `init` after a completed [exit_collector] is allowed.
pub fn init_with_config(config: GcConfig) {
    let trigger_point = std::env::var("max-trigger")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(config.trigger_point);
    let raw = Box::into_raw(Box::new(GcContext::new(&config, trigger_point)));
    if CONTEXT
        .compare_exchange(null_mut(), raw, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        unsafe { drop(Box::from_raw(raw)) };
        panic!("collector is already initialized");
    }
    let ctx: &'static GcContext = unsafe { &*raw };
    if ctx.combined {
        state::init_thread(true);
    } else {
        let thread = std::thread::Builder::new()
            .name("snapgc-collector".into())
            .spawn(move || collector::collector_main(ctx))
            .expect("failed to spawn collector thread");
        *ctx.collector_thread.lock() = Some(thread);
    }
    log::debug!(
        "collector initialized ({} handle blocks, trigger {}, combined: {})",
        config.handle_blocks,
        trigger_point,
        ctx.combined
    );
}

/// Ask for a collection cycle as if the allocation trigger had fired.
pub fn request_collection() {
    trigger::signal_collection(context());
}

/// Stop the collector and tear down all collector state, destroying every
/// remaining object exactly once. Every other mutator thread must have
/// called [exit_thread] first and all [RootHandle]s must be gone; the
/// calling thread is unregistered automatically in combined mode.
pub fn exit_collector() {
    let ctx = context();
    state::exit_current_thread_if_registered();
    ctx.exit_flag.store(true, Ordering::SeqCst);
    ctx.event.notify();
    if let Some(thread) = ctx.collector_thread.lock().take() {
        let _ = thread.join();
    }
    unsafe { teardown(ctx) };
    let raw = CONTEXT.swap(null_mut(), Ordering::AcqRel);
    unsafe { drop(Box::from_raw(raw)) };
}

/// Free every surviving object, root entry, sentinel and scan-list record.
/// Runs strictly single-threaded, after the collector has exited.
unsafe fn teardown(ctx: &GcContext) {
    use list::Cursor;
    for slot in ctx.scan_lists.iter() {
        let lists = slot.swap(null_mut(), Ordering::AcqRel);
        if lists.is_null() {
            continue;
        }
        let lists = Box::from_raw(lists);
        for sentinel in lists.objects.iter().copied() {
            let mut cur: Cursor<api::GcHeader> = Cursor::from_head(sentinel);
            while let Some(node) = cur.get() {
                let handle = (*node).handle();
                cur.remove_and_advance();
                api::destroy_object(ctx, handle);
            }
            drop(Box::from_raw(sentinel));
        }
        for sentinel in lists.roots.iter().copied() {
            let mut cur: Cursor<root::RootEntry> = Cursor::from_head(sentinel);
            while let Some(entry) = cur.get() {
                cur.remove_and_advance();
                drop(Box::from_raw(entry));
            }
            drop(Box::from_raw(sentinel));
        }
    }
}
