use std::sync::atomic::{AtomicUsize, Ordering};

/// Monotonic counters maintained by the allocator and the collector.
pub(crate) struct Counters {
    pub cycles: AtomicUsize,
    pub objects_allocated: AtomicUsize,
    pub objects_freed: AtomicUsize,
    pub live_objects: AtomicUsize,
    pub bytes_allocated: AtomicUsize,
    pub roots_registered: AtomicUsize,
    pub roots_dropped: AtomicUsize,
}

impl Counters {
    pub fn new() -> Self {
        Self {
            cycles: AtomicUsize::new(0),
            objects_allocated: AtomicUsize::new(0),
            objects_freed: AtomicUsize::new(0),
            live_objects: AtomicUsize::new(0),
            bytes_allocated: AtomicUsize::new(0),
            roots_registered: AtomicUsize::new(0),
            roots_dropped: AtomicUsize::new(0),
        }
    }
}

/// A point-in-time snapshot of the collector's counters.
#[derive(Clone, Copy, Debug)]
pub struct GcStatistics {
    pub total_gc_cycles: usize,
    pub total_objects_allocated: usize,
    pub total_objects_freed: usize,
    pub live_objects: usize,
    pub total_bytes_allocated: usize,
    pub total_roots_registered: usize,
    pub total_roots_dropped: usize,
    pub handle_blocks_used: usize,
    pub trigger_point: i64,
}

/// Snapshot the collector's statistics.
pub fn statistics() -> GcStatistics {
    let ctx = crate::context();
    GcStatistics {
        total_gc_cycles: ctx.stats.cycles.load(Ordering::SeqCst),
        total_objects_allocated: ctx.stats.objects_allocated.load(Ordering::Relaxed),
        total_objects_freed: ctx.stats.objects_freed.load(Ordering::Relaxed),
        live_objects: ctx.stats.live_objects.load(Ordering::Relaxed),
        total_bytes_allocated: ctx.stats.bytes_allocated.load(Ordering::Relaxed),
        total_roots_registered: ctx.stats.roots_registered.load(Ordering::Relaxed),
        total_roots_dropped: ctx.stats.roots_dropped.load(Ordering::Relaxed),
        handle_blocks_used: ctx.table.virgin_blocks_used(),
        trigger_point: ctx.trigger_point.load(Ordering::Relaxed),
    }
}

// Allocation totals here are counted bytes, not mapped memory; two tiers of
// precision are plenty for a log line.
fn human_bytes(bytes: usize) -> String {
    if bytes < 1024 {
        format!("{}B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1}K", bytes as f64 / 1024.0)
    } else {
        format!("{:.1}M", bytes as f64 / (1024.0 * 1024.0))
    }
}

impl std::fmt::Display for GcStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Collector statistics:")?;
        writeln!(f, "  Collection cycles: {}", self.total_gc_cycles)?;
        writeln!(
            f,
            "  Objects allocated: {} ({} freed, {} live)",
            self.total_objects_allocated, self.total_objects_freed, self.live_objects
        )?;
        writeln!(
            f,
            "  Total memory allocated: {}",
            human_bytes(self.total_bytes_allocated)
        )?;
        writeln!(
            f,
            "  Roots registered: {} ({} dropped)",
            self.total_roots_registered, self.total_roots_dropped
        )?;
        writeln!(f, "  Handle blocks used: {}", self.handle_blocks_used)?;
        writeln!(
            f,
            "  Trigger point: {}",
            human_bytes(self.trigger_point.max(0) as usize)
        )?;
        Ok(())
    }
}
