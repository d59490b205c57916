//! Worker-thread budget for intra-decode parallelism.

/// Lower bound of the thread budget.
pub const MIN_THREADS: usize = 2;
/// Upper bound of the thread budget.
pub const MAX_THREADS: usize = 4;
/// Cores left to the host process.
const RESERVED_CORES: usize = 2;

/// Threads to use given `available` logical cores.
pub fn thread_count_for(available: usize) -> usize {
    available
        .saturating_sub(RESERVED_CORES)
        .clamp(MIN_THREADS, MAX_THREADS)
}

/// Threads to use on this machine.
pub fn default_thread_count() -> usize {
    let available = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let n = thread_count_for(available);
    tracing::debug!(available, threads = n, "thread budget");
    n
}
