//! Error taxonomy for the runtime substrate.
//!
//! Each subsystem gets its own error enum rather than one crate-wide type:
//! a caller matching on a full queue has no reason to also handle a stale
//! job identifier. Programmer errors (corrupted canary, non-power-of-two
//! alignment, zero-size-with-alignment) are never represented here — they
//! `panic!`/`debug_assert!` per [`crate`] docs and are not recoverable.

use thiserror::Error;

/// Errors returned by the OS page mapper ([`crate::mem::pages`]).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PagesError {
    /// The OS page mapper could not satisfy the request.
    #[error("out of memory: failed to map {size} bytes at alignment {align}")]
    OutOfMemory {
        /// Requested size in bytes.
        size: usize,
        /// Requested alignment in bytes.
        align: usize,
    },
}

/// Errors returned by the block heap ([`crate::mem::heap`]).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// Neither a pooled slab nor a direct mapping could satisfy the request.
    #[error("out of memory: failed to allocate {size} bytes at alignment {align}")]
    OutOfMemory {
        /// Requested size in bytes.
        size: usize,
        /// Requested alignment in bytes.
        align: usize,
    },
}

/// Errors returned by the bounded MPMC ring queue ([`crate::sync::queue`]).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// The queue has no free slots; the caller should retry or back off.
    #[error("queue is full")]
    QueueFull,
    /// The queue has no ready values; the caller should retry or fall through.
    #[error("queue is empty")]
    QueueEmpty,
}

/// Errors returned by the job system ([`crate::job`]).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum JobError {
    /// The referenced [`crate::job::JobId`] no longer names a live job
    /// (it was never valid, or its slot's generation has since advanced).
    #[error("job id does not refer to a live job")]
    InvalidId,
    /// A wait primitive exceeded its spin budget without observing its
    /// predicate become true.
    #[error("wait timed out")]
    TimedOut,
    /// The job system is shutting down; no further work will be dispatched.
    #[error("job system is shutting down")]
    ShuttingDown,
}
