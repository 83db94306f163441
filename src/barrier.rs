//! Per-thread write barrier dispatch.
//!
//! Every store of a handle into a [SnapCell] goes through the function
//! pointer installed in the calling thread's local state. Outside a
//! collection (and while the snapshot is being restored) the regular barrier
//! writes both halves; while the collector runs, the collecting barrier
//! writes only the current half so the snapshot stays frozen. The pointer is
//! swapped when the thread acknowledges a phase edge at a safe point.

use crate::cell::SnapCell;
use crate::handle::Handle;
use crate::state::THREAD;

#[cfg(debug_assertions)]
use crate::state::Phase;

pub(crate) type BarrierFn = fn(&SnapCell, Handle);

pub(crate) fn regular_barrier(cell: &SnapCell, v: Handle) {
    #[cfg(debug_assertions)]
    THREAD.with(|t| {
        debug_assert!(
            t.phase.get() != Phase::NotMutating,
            "barrier invoked by a thread that left mutation"
        );
        debug_assert!(
            t.phase.get() != Phase::Collecting,
            "regular barrier invoked during collection"
        );
    });
    cell.double_store(v);
}

pub(crate) fn collecting_barrier(cell: &SnapCell, v: Handle) {
    #[cfg(debug_assertions)]
    THREAD.with(|t| {
        debug_assert!(
            t.phase.get() == Phase::Collecting,
            "collecting barrier invoked outside collection"
        );
    });
    cell.single_store(v);
}

/// Store `v` into `cell` with the barrier variant matching the calling
/// thread's phase.
#[inline]
pub(crate) fn write(cell: &SnapCell, v: Handle) {
    THREAD.with(|t| (t.barrier.get())(cell, v));
}
