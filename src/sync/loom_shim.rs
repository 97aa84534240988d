//! Thin facade so the lock-free code in [`crate::sync::queue`] and
//! [`crate::job::slot`] can be exercised under `loom`'s model checker
//! without diverging from the types it uses in production.
//!
//! Ordinary builds (including ordinary `cargo test`) always see the real
//! `std::sync::atomic` types and a real spin hint. Only a test binary built
//! with `--cfg loom` (e.g. `RUSTFLAGS="--cfg loom" cargo test --release
//! --lib loom_`) sees loom's instrumented atomics and scheduler-aware
//! yield, which is what lets loom explore every legal interleaving of the
//! CAS protocols in those two modules instead of just running them once.

#[cfg(loom)]
pub(crate) use loom::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicU8, Ordering};
#[cfg(not(loom))]
pub(crate) use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicU8, Ordering};

/// Yields to the scheduler while spin-retrying a CAS.
///
/// Under `loom` this must go through `loom::thread::yield_now` rather than
/// a real spin hint, or the model checker has no opportunity to interleave
/// the waiting thread with the one it is waiting on.
#[cfg(loom)]
pub(crate) fn spin_loop() {
    loom::thread::yield_now();
}
#[cfg(not(loom))]
pub(crate) fn spin_loop() {
    std::hint::spin_loop();
}
