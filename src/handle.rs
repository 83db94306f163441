//! The handle table: a fixed indirection array mapping 32-bit ids to object
//! addresses.
//!
//! Slots never move, so a handle is a stable name for an object until the
//! collection that unlinks it. Free ids are threaded through the slots
//! themselves: each mutator thread owns a private chain it allocates from,
//! and when the chain runs out it claims a whole block of 16384 ids, either
//! recycled from a previous cycle through the lock-free block queue or carved
//! virgin from the table. The backing store is a reserved mapping, so the
//! default multi-GiB table only costs address space until slots are touched.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::api::{Collectable, GcBox};
use crate::mmap::Mmap;
use crate::state::ThreadData;
use crate::GcContext;

pub type Handle = u32;

/// Handle of the canonical null object.
pub const NULL_HANDLE: Handle = 0;
/// Terminates free-list chains threaded through the table.
pub(crate) const END_OF_LIST: Handle = 0xffff_ffff;

pub(crate) const HANDLES_PER_BLOCK: usize = 16 * 1024;
pub(crate) const DEFAULT_HANDLE_BLOCKS: usize = 8192;
/// A thread that burns through this many handles asks for a collection even
/// if the byte trigger has not fired yet.
pub(crate) const HANDLE_EARLY_TRIGGER: u64 = HANDLES_PER_BLOCK as u64 * 1024;

#[derive(Clone, Copy)]
union HandleSlot {
    object: *mut GcBox<dyn Collectable>,
    free: Handle,
}

pub(crate) struct HandleTable {
    map: Mmap,
    blocks: usize,
    total: usize,
    /// Next untouched block; blocks past the recycler are carved from here.
    virgin: AtomicU32,
}

unsafe impl Send for HandleTable {}
unsafe impl Sync for HandleTable {}

impl HandleTable {
    pub fn new(blocks: usize) -> Self {
        assert!(blocks >= 1);
        let total = blocks * HANDLES_PER_BLOCK;
        assert!(total < END_OF_LIST as usize);
        let map = Mmap::new(total * std::mem::size_of::<HandleSlot>());
        Self {
            map,
            blocks,
            total,
            virgin: AtomicU32::new(0),
        }
    }

    pub fn virgin_blocks_used(&self) -> usize {
        (self.virgin.load(Ordering::Relaxed) as usize).min(self.blocks)
    }

    fn slot(&self, handle: Handle) -> *mut HandleSlot {
        debug_assert!((handle as usize) < self.total);
        unsafe { (self.map.start() as *mut HandleSlot).add(handle as usize) }
    }

    /// Valid only for ids currently bound to a live object.
    pub unsafe fn object(&self, handle: Handle) -> *mut GcBox<dyn Collectable> {
        (*self.slot(handle)).object
    }

    pub unsafe fn set_object(&self, handle: Handle, object: *mut GcBox<dyn Collectable>) {
        (*self.slot(handle)).object = object;
    }

    pub unsafe fn free_link(&self, handle: Handle) -> Handle {
        (*self.slot(handle)).free
    }

    pub unsafe fn set_free_link(&self, handle: Handle, next: Handle) {
        (*self.slot(handle)).free = next;
    }

    /// Thread the free chain of an untouched block through its slots and
    /// return the chain head. Block 0 starts at id 1, reserving the null id.
    unsafe fn carve_block(&self, block: usize) -> Handle {
        let lo = if block == 0 { 1 } else { block * HANDLES_PER_BLOCK };
        let hi = (block + 1) * HANDLES_PER_BLOCK;
        for id in lo..hi - 1 {
            self.set_free_link(id as Handle, id as Handle + 1);
        }
        self.set_free_link(hi as Handle - 1, END_OF_LIST);
        lo as Handle
    }
}

#[cold]
fn handle_pool_exhausted() -> ! {
    log::error!("handle pool exhausted");
    eprintln!("snapgc: handle pool exhausted, aborting");
    std::process::abort();
}

fn claim_block(ctx: &GcContext) -> Handle {
    if let Some(head) = ctx.block_queue.pop() {
        return head;
    }
    let block = ctx.table.virgin.fetch_add(1, Ordering::SeqCst) as usize;
    if block >= ctx.table.blocks {
        handle_pool_exhausted();
    }
    unsafe { ctx.table.carve_block(block) }
}

/// Pop an id from the calling thread's private chain, claiming a fresh block
/// when the chain is empty. Never returns [NULL_HANDLE] or the end-of-list
/// sentinel.
pub(crate) fn allocate_handle(ctx: &GcContext, thread: &ThreadData) -> Handle {
    let mut head = thread.free_handles.get();
    if head == END_OF_LIST {
        head = claim_block(ctx);
    }
    debug_assert!(head != NULL_HANDLE);
    unsafe {
        thread.free_handles.set(ctx.table.free_link(head));
    }
    head
}

/// Hand the remainder of the calling thread's chain to the collector. Called
/// on thread exit; the collector drains the queue at the next cycle start.
pub(crate) fn release_thread_handles(ctx: &GcContext, thread: &ThreadData) {
    let head = thread.free_handles.replace(END_OF_LIST);
    if head == END_OF_LIST {
        return;
    }
    while !ctx.release_queue.push(head) {
        // queue full: the collector frees lanes at its next cycle start
        crate::trigger::signal_collection(ctx);
        std::thread::yield_now();
        if ctx.exit_flag.load(Ordering::SeqCst) {
            return;
        }
    }
}
