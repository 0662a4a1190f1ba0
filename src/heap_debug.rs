//! Heap reporting for the startup log and the periodic memory check.

/// Free heap below this gets a warning. The radio driver allocates per packet,
/// so a slow leak shows up here long before an allocation fails.
pub const LOW_MEMORY_THRESHOLD_KB: usize = 16;

#[derive(Clone, Copy, Debug)]
pub struct HeapStats {
    pub used_kb: usize,
    pub free_kb: usize,
}

impl HeapStats {
    pub fn current() -> Self {
        Self {
            used_kb: esp_alloc::HEAP.used() / 1024,
            free_kb: esp_alloc::HEAP.free() / 1024,
        }
    }

    pub fn is_low(&self) -> bool {
        self.free_kb < LOW_MEMORY_THRESHOLD_KB
    }
}

/// Log heap usage, tagged with where it was taken.
pub fn log_heap_stats(context: &str) {
    let stats = HeapStats::current();
    log::info!(
        "heap[{}]: used={}KB free={}KB (total={}KB)",
        context,
        stats.used_kb,
        stats.free_kb,
        stats.used_kb + stats.free_kb,
    );
}

/// Periodic memory check: usage line plus a warning when free heap runs low.
pub fn report(context: &str) {
    let stats = HeapStats::current();
    log::info!("heap[{}]: used={}KB free={}KB", context, stats.used_kb, stats.free_kb);
    if stats.is_low() {
        log::warn!(
            "heap[{}]: LOW MEMORY - only {}KB free (threshold={}KB)",
            context,
            stats.free_kb,
            LOW_MEMORY_THRESHOLD_KB
        );
    }
}
