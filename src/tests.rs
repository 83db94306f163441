use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::*;

// The collector is a process singleton, so scenario tests are serialized.
static TEST_LOCK: Mutex<()> = parking_lot::const_mutex(());

fn with_gc<R>(config: GcConfig, f: impl FnOnce() -> R) -> R {
    let _guard = TEST_LOCK.lock();
    init_with_config(config);
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));
    exit_collector();
    match result {
        Ok(result) => result,
        Err(payload) => std::panic::resume_unwind(payload),
    }
}

fn combined(handle_blocks: usize) -> GcConfig {
    GcConfig {
        handle_blocks,
        combine_thread_with_caller: true,
        ..GcConfig::default()
    }
}

fn threaded(handle_blocks: usize) -> GcConfig {
    GcConfig {
        handle_blocks,
        ..GcConfig::default()
    }
}

/// Combined mode: a requested collection runs inline at the next safe point.
fn collect_inline(cycles: usize) {
    for _ in 0..cycles {
        request_collection();
        safe_point();
    }
}

/// Threaded mode: request cycles and keep safe-pointing until the collector
/// has finished them.
fn collect_blocking(cycles: usize) {
    for _ in 0..cycles {
        let before = statistics().total_gc_cycles;
        request_collection();
        while statistics().total_gc_cycles == before {
            safe_point();
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

struct Node {
    value: u32,
    next: InstanceHandle<Node>,
}

impl Node {
    fn new(value: u32) -> Self {
        Self {
            value,
            next: InstanceHandle::null(),
        }
    }
}

impl Collectable for Node {
    fn instance_var_count(&self) -> usize {
        1
    }
    fn instance_var(&self, _at: usize) -> &SnapCell {
        self.next.raw()
    }
}

struct Counted {
    drops: &'static AtomicUsize,
}

impl Collectable for Counted {}

impl Drop for Counted {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn linear_chain_is_swept_after_root_drop() {
    with_gc(combined(4), || {
        let base = statistics().live_objects;
        {
            let root = RootHandle::new_with(allocate(Node::new(0)).unwrap());
            let mut prev = root.get().unwrap();
            for i in 1..10_000 {
                let node = allocate(Node::new(i)).unwrap();
                prev.next.set(node);
                prev = node;
            }
            collect_inline(1);
            assert_eq!(statistics().live_objects, base + 10_000);
        }
        collect_inline(2);
        assert_eq!(statistics().live_objects, base);
    });
}

#[test]
fn reference_cycle_is_reclaimed() {
    with_gc(combined(1), || {
        let base = statistics().live_objects;
        let ra;
        let rb;
        {
            let a = allocate(Node::new(1)).unwrap();
            let b = allocate(Node::new(2)).unwrap();
            a.next.set(b);
            b.next.set(a);
            ra = RootHandle::new_with(a);
            rb = RootHandle::new_with(b);
        }
        collect_inline(1);
        assert_eq!(statistics().live_objects, base + 2);
        assert_eq!(ra.get().unwrap().value, 1);
        drop(ra);
        drop(rb);
        collect_inline(2);
        assert_eq!(statistics().live_objects, base);
    });
}

#[test]
fn rooted_object_survives_many_cycles() {
    with_gc(combined(1), || {
        let root = RootHandle::new_with(allocate(Node::new(7)).unwrap());
        for _ in 0..100 {
            collect_inline(1);
            assert_eq!(root.get().unwrap().value, 7);
        }
        drop(root);
        collect_inline(2);
    });
}

#[test]
fn root_has_a_two_cycle_lifetime() {
    static DROPS: AtomicUsize = AtomicUsize::new(0);
    with_gc(combined(1), || {
        let root = RootHandle::new_with(allocate(Counted { drops: &DROPS }).unwrap());
        drop(root);
        // the prior verdict still pins the referent for one cycle
        collect_inline(1);
        assert_eq!(DROPS.load(Ordering::SeqCst), 0);
        collect_inline(1);
        assert_eq!(DROPS.load(Ordering::SeqCst), 1);
        // idempotent from here on
        collect_inline(2);
        assert_eq!(DROPS.load(Ordering::SeqCst), 1);
    });
}

#[test]
fn destructor_runs_exactly_once() {
    static DROPS: AtomicUsize = AtomicUsize::new(0);
    with_gc(combined(1), || {
        {
            let _unrooted = allocate(Counted { drops: &DROPS }).unwrap();
        }
        collect_inline(1);
        assert_eq!(DROPS.load(Ordering::SeqCst), 1);
        collect_inline(3);
        assert_eq!(DROPS.load(Ordering::SeqCst), 1);
    });
}

struct Cleaned {
    cleans: &'static AtomicUsize,
}

impl Collectable for Cleaned {
    fn clean_after_collect(&self) {
        self.cleans.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn survivors_get_the_clean_hook_each_cycle() {
    static CLEANS: AtomicUsize = AtomicUsize::new(0);
    with_gc(combined(1), || {
        let root = RootHandle::new_with(allocate(Cleaned { cleans: &CLEANS }).unwrap());
        collect_inline(3);
        assert_eq!(CLEANS.load(Ordering::SeqCst), 3);
        drop(root);
        collect_inline(2);
    });
}

#[test]
fn an_idle_cycle_changes_nothing_but_statistics() {
    with_gc(combined(1), || {
        let root = RootHandle::new_with(allocate(Node::new(5)).unwrap());
        collect_inline(1);
        let before = statistics();
        collect_inline(1);
        let after = statistics();
        assert_eq!(after.total_gc_cycles, before.total_gc_cycles + 1);
        assert_eq!(after.live_objects, before.live_objects);
        assert_eq!(after.total_objects_freed, before.total_objects_freed);
        assert_eq!(root.get().unwrap().value, 5);
        drop(root);
        collect_inline(2);
    });
}

#[test]
fn handles_are_recycled_under_a_tiny_table() {
    // 2 blocks = 32767 usable ids; allocating 80k objects proves recycling
    with_gc(combined(2), || {
        let mut seen: HashSet<Handle> = HashSet::new();
        let mut reused = false;
        for _ in 0..8 {
            for i in 0..10_000 {
                let node = allocate(Node::new(i)).unwrap();
                reused |= !seen.insert(node.handle());
            }
            // first cycle sweeps the batch, second publishes the reclaimed
            // blocks for reuse
            collect_inline(2);
        }
        assert!(reused, "handle ids should be reused across cycles");
    });
}

#[test]
fn arrays_trace_their_elements() {
    with_gc(combined(1), || {
        let base = statistics().live_objects;
        {
            let array = allocate_array(vec![Node::new(0), Node::new(1), Node::new(2)]).unwrap();
            let root = RootHandle::new_with(array);
            for i in 0..3 {
                let leaf = allocate(Node::new(100 + i as u32)).unwrap();
                array[i].next.set(leaf);
            }
            collect_inline(1);
            // array plus three leaves survive through the array's cells
            assert_eq!(statistics().live_objects, base + 4);
            let got = root.get().unwrap();
            assert_eq!(got[1].next.get().unwrap().value, 101);
        }
        collect_inline(2);
        assert_eq!(statistics().live_objects, base);
    });
}

#[test]
fn threaded_collector_reclaims_on_request() {
    with_gc(threaded(4), || {
        init_thread(false);
        let base = statistics().live_objects;
        {
            let root = RootHandle::new_with(allocate(Node::new(0)).unwrap());
            let mut prev = root.get().unwrap();
            for i in 1..1_000 {
                let node = allocate(Node::new(i)).unwrap();
                prev.next.set(node);
                prev = node;
            }
            collect_blocking(1);
            assert_eq!(statistics().live_objects, base + 1_000);
        }
        collect_blocking(3);
        assert_eq!(statistics().live_objects, base);
        exit_thread();
    });
}

#[test]
fn cells_agree_with_their_snapshots_after_a_cycle() {
    with_gc(threaded(1), || {
        init_thread(false);
        let root = RootHandle::new_with(allocate(Node::new(0)).unwrap());
        for i in 0..50 {
            let node = allocate(Node::new(i)).unwrap();
            root.get().unwrap().next.set(node);
            safe_point();
        }
        collect_blocking(1);
        let head = root.get().unwrap();
        let cell = head.next.raw();
        assert_eq!(cell.load(), cell.load_snapshot());
        drop(root);
        collect_blocking(3);
        exit_thread();
    });
}

#[test]
fn concurrent_mutators_survive_collection_churn() {
    with_gc(threaded(8), || {
        init_thread(false);
        let base = statistics().live_objects;
        let stop = Arc::new(AtomicBool::new(false));
        let workers: Vec<_> = (0..2)
            .map(|_| {
                let stop = stop.clone();
                std::thread::spawn(move || {
                    init_thread(false);
                    let root = RootHandle::<Node>::new();
                    let mut i = 0u32;
                    while !stop.load(Ordering::Relaxed) {
                        let node = allocate(Node::new(i)).unwrap();
                        root.set(node);
                        safe_point();
                        i = i.wrapping_add(1);
                    }
                    drop(root);
                    exit_thread();
                })
            })
            .collect();
        for _ in 0..25 {
            collect_blocking(1);
        }
        stop.store(true, Ordering::Relaxed);
        for worker in workers {
            worker.join().unwrap();
        }
        collect_blocking(4);
        assert_eq!(statistics().live_objects, base);
        let stats = statistics();
        assert!(stats.total_objects_freed <= stats.total_objects_allocated);
        exit_thread();
    });
}

#[test]
fn blocked_threads_do_not_stall_the_collector() {
    with_gc(threaded(1), || {
        init_thread(false);
        let entered = Arc::new(AtomicBool::new(false));
        let release = Arc::new(AtomicBool::new(false));
        let worker = {
            let entered = entered.clone();
            let release = release.clone();
            std::thread::spawn(move || {
                init_thread(false);
                {
                    let _scope = LeaveMutationScope::new();
                    entered.store(true, Ordering::SeqCst);
                    while !release.load(Ordering::SeqCst) {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                }
                exit_thread();
            })
        };
        while !entered.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(1));
        }
        // the worker never safe-points inside the scope, yet cycles complete
        collect_blocking(2);
        release.store(true, Ordering::SeqCst);
        worker.join().unwrap();
        exit_thread();
    });
}

#[test]
fn allocation_trigger_fires_in_combined_mode() {
    let config = GcConfig {
        handle_blocks: 1,
        trigger_point: 1,
        combine_thread_with_caller: true,
    };
    with_gc(config, || {
        for i in 0..400 {
            let _ = allocate(Node::new(i)).unwrap();
        }
        // the tally crossed the trigger inside allocate; the collection runs
        // at the next safe point
        safe_point();
        assert!(statistics().total_gc_cycles >= 1);
    });
}

#[test]
fn max_trigger_environment_override() {
    std::env::set_var("max-trigger", "12345");
    with_gc(combined(1), || {
        assert_eq!(statistics().trigger_point, 12345);
    });
    std::env::remove_var("max-trigger");
}

#[test]
fn statistics_render_human_readable() {
    with_gc(combined(1), || {
        let root = RootHandle::new_with(allocate(Node::new(1)).unwrap());
        collect_inline(1);
        let rendered = format!("{}", statistics());
        assert!(rendered.contains("Collection cycles"));
        assert!(rendered.contains("Objects allocated"));
        drop(root);
        collect_inline(2);
    });
}

#[test]
fn reinitialization_after_exit_is_allowed() {
    let _guard = TEST_LOCK.lock();
    init_with_config(combined(1));
    let first = allocate(Node::new(1)).unwrap();
    assert_eq!(first.value, 1);
    exit_collector();
    init_with_config(combined(1));
    let second = allocate(Node::new(2)).unwrap();
    assert_eq!(second.value, 2);
    exit_collector();
}

#[test]
fn destructor_panics_are_isolated() {
    struct Exploding {
        fine: &'static AtomicUsize,
    }
    impl Collectable for Exploding {}
    impl Drop for Exploding {
        fn drop(&mut self) {
            if self.fine.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("deliberate destructor failure");
            }
        }
    }
    static SEEN: AtomicUsize = AtomicUsize::new(0);
    with_gc(combined(1), || {
        let base = statistics().live_objects;
        let _ = allocate(Exploding { fine: &SEEN }).unwrap();
        let _ = allocate(Exploding { fine: &SEEN }).unwrap();
        collect_inline(1);
        // the first destructor panicked, the sweep still freed both objects
        assert_eq!(SEEN.load(Ordering::SeqCst), 2);
        assert_eq!(statistics().live_objects, base);
    });
}
