//! In-process configuration for the tunables the spec already parameterizes.
//!
//! There is no CLI or environment-variable surface here — callers that want
//! the stock behavior use `Config::default()` and never touch this module.

/// Ascending power-of-two size classes a [`crate::mem::heap::BlockHeap`]
/// services directly; requests above the last entry (or whose alignment
/// exceeds it) are routed to a direct page-run allocation.
pub const DEFAULT_SIZE_CLASSES: [usize; 11] =
    [16, 32, 64, 128, 256, 512, 1024, 2048, 4096, 8192, 16384];

/// Default data slab size: 64 KiB, per spec §3.
pub const DEFAULT_DATA_PAGE_SIZE: usize = 64 * 1024;

/// Default fixed job slot pool size, per spec §3 (`N = 32768`).
pub const DEFAULT_N_JOBS: usize = 32_768;

/// Tunables for a [`crate::mem::heap::BlockHeap`].
#[derive(Debug, Clone)]
pub struct HeapConfig {
    /// Ascending power-of-two size classes. Must be non-empty, strictly
    /// ascending, and every entry a power of two.
    pub size_classes: Vec<usize>,
    /// Size in bytes of each data slab. Must be a power of two no smaller
    /// than the host page size, and large enough to hold the header, the
    /// occupancy bitmap, and at least one block of the smallest size class.
    pub data_page_size: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            size_classes: DEFAULT_SIZE_CLASSES.to_vec(),
            data_page_size: DEFAULT_DATA_PAGE_SIZE,
        }
    }
}

/// Tunables for a [`crate::job::JobSystem`].
#[derive(Debug, Clone)]
pub struct JobSystemConfig {
    /// Fixed number of job slots in the pool. Short-IDs index this pool, so
    /// it must fit in 16 bits (`<= 65536`).
    pub num_jobs: usize,
    /// Number of worker threads to spawn on `startup`. The main thread
    /// additionally participates during `flush`/`wait`, per spec §5.
    pub num_workers: usize,
}

impl Default for JobSystemConfig {
    fn default() -> Self {
        Self {
            num_jobs: DEFAULT_N_JOBS,
            num_workers: default_worker_count(),
        }
    }
}

/// `cores - 1`, clamped to at least 1, matching spec §5's "one worker per
/// core... plus the main thread."
fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1).max(1))
        .unwrap_or(1)
}
