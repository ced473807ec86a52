//! Shared runtime plumbing — worker pool, cancellation, subprocess
//! deadlines, file-descriptor budgeting, and the soft result cache.

pub mod cache;
pub mod cancel;
pub mod resource;
pub mod subprocess;

use crate::SporaResult;

/// Build the bounded CPU worker pool used by every pass.
pub fn build_pool(workers: usize) -> SporaResult<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("spora-worker-{i}"))
        .build()
        .map_err(|e| crate::SporaError::Io(std::io::Error::other(e)))
}
