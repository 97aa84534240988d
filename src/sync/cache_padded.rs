//! Cache-line padding to keep independently-updated atomics from
//! false-sharing a cache line.
//!
//! Ported from the teacher's `concurrency::cache_padded::CachePadded`,
//! dropping only its ghost-token-branded sibling types (this crate has no
//! ghost-cell layer) and keeping its 128-byte alignment choice, which
//! covers both common 64-byte (x86) and 128-byte (Apple Silicon) lines.

use std::ops::{Deref, DerefMut};

/// Wraps `T`, padding it out to a 128-byte boundary.
#[repr(align(128))]
pub struct CachePadded<T> {
    value: T,
}

impl<T> CachePadded<T> {
    /// Wraps `value` with cache-line padding.
    pub const fn new(value: T) -> Self {
        Self { value }
    }
}

impl<T> Deref for CachePadded<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for CachePadded<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}
