//! Lock-free concurrency primitives: cache-line padding and the bounded
//! MPMC ring queue the job scheduler's ready queue is built on.

pub mod cache_padded;
pub(crate) mod loom_shim;
pub mod queue;

pub use cache_padded::CachePadded;
pub use queue::MpmcQueue;
