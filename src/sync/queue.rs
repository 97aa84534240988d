//! Bounded lock-free MPMC ring queue.
//!
//! The teacher's own `concurrency::sync::mpmc::GhostRingBuffer` uses
//! per-slot sequence numbers (Vyukov's scheme); this module instead
//! implements the paired-index scheme spec §4.5 specifies verbatim — two
//! 64-bit atomics, each packing a pair of 32-bit cursors, so a single load
//! observes two cursors in one atomic snapshot. What's kept from the
//! teacher is the shape around that core: `CachePadded` separation of the
//! hot atomics, a boxed slot array sized once at construction, and a
//! drain-on-`Drop` that matches `GhostRingBuffer::drop`.

use crate::sync::cache_padded::CachePadded;
use crate::sync::loom_shim::{spin_loop, AtomicU64, Ordering};
use crate::error::QueueError;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;

struct Slot<T>(UnsafeCell<MaybeUninit<T>>);

// SAFETY: a `Slot<T>` is only ever written/read by whichever thread holds
// the exclusive index reservation produced by the CAS protocol below; two
// threads never touch the same slot concurrently.
unsafe impl<T: Send> Sync for Slot<T> {}

#[inline]
fn pack(hi: u32, lo: u32) -> u64 {
    ((hi as u64) << 32) | lo as u64
}

#[inline]
fn hi(v: u64) -> u32 {
    (v >> 32) as u32
}

#[inline]
fn lo(v: u64) -> u32 {
    (v & 0xFFFF_FFFF) as u32
}

/// A bounded, lock-free, multi-producer multi-consumer ring queue of fixed
/// capacity `max_size`.
///
/// State is the four cursors spec §4.5 names — `frontHead`, `backHead`,
/// `frontTail`, `backTail` — packed two-per-atomic so each load/CAS
/// observes a consistent pair: `front_head_back_tail` holds `frontHead` in
/// its high 32 bits and `backTail` in its low 32; `front_tail_back_head`
/// holds `frontTail` high, `backHead` low.
pub struct MpmcQueue<T> {
    buffer: Box<[Slot<T>]>,
    n: u32,
    max_size: u32,
    front_head_back_tail: CachePadded<AtomicU64>,
    front_tail_back_head: CachePadded<AtomicU64>,
}

// SAFETY: exclusivity of slot access is established by the CAS protocol,
// not by `T`'s own properties; `Send` is all that's required to move values
// across the threads that produce/consume them.
unsafe impl<T: Send> Send for MpmcQueue<T> {}
unsafe impl<T: Send> Sync for MpmcQueue<T> {}

impl<T> MpmcQueue<T> {
    /// Creates a queue holding at most `max_size` live elements at once.
    ///
    /// # Panics
    /// Panics if `max_size` is zero or would overflow the 32-bit cursor
    /// space (`max_size >= u32::MAX`).
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        assert!(max_size > 0, "queue capacity must be positive");
        assert!(max_size < u32::MAX as usize, "queue capacity exceeds 32-bit cursor range");
        let n = (max_size + 1) as u32;
        let buffer: Box<[Slot<T>]> =
            (0..n).map(|_| Slot(UnsafeCell::new(MaybeUninit::uninit()))).collect::<Vec<_>>().into_boxed_slice();
        Self {
            buffer,
            n,
            max_size: max_size as u32,
            // Initial state: all zero except frontTail = backTail = N - 1,
            // so the first enqueue targets index 0 (spec §4.5).
            front_head_back_tail: CachePadded::new(AtomicU64::new(pack(0, n - 1))),
            front_tail_back_head: CachePadded::new(AtomicU64::new(pack(n - 1, 0))),
        }
    }

    /// The fixed capacity this queue was constructed with.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.max_size as usize
    }

    /// Attempts to enqueue `value`. Spins internally against concurrent
    /// producers/consumers; returns [`QueueError::QueueFull`] (dropping
    /// `value`) once the queue is genuinely at capacity rather than merely
    /// transiently appearing full while a consumer finishes.
    pub fn enqueue(&self, value: T) -> Result<(), QueueError> {
        loop {
            let fhbt = self.front_head_back_tail.load(Ordering::Acquire);
            let head = hi(fhbt);
            let tail = lo(fhbt);
            if head == tail {
                // Either genuinely full, or a dequeue is mid-flight and
                // hasn't yet advanced `backTail` off this index.
                let front_tail = hi(self.front_tail_back_head.load(Ordering::Acquire));
                if front_tail != head {
                    spin_loop();
                    continue;
                }
                return Err(QueueError::QueueFull);
            }
            let next_head = if head + 1 == self.n { 0 } else { head + 1 };
            let new_fhbt = pack(next_head, tail);
            if self
                .front_head_back_tail
                .compare_exchange_weak(fhbt, new_fhbt, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }
            // SAFETY: the CAS above exclusively reserved slot `head` for
            // this producer; no other producer can also hold it.
            unsafe {
                (*self.buffer[head as usize].0.get()).write(value);
            }
            // Publish: advance backHead (the low half of
            // `front_tail_back_head`) from `head` to `next_head`, letting
            // concurrent consumers independently advance the high half.
            loop {
                let ftbh = self.front_tail_back_head.load(Ordering::Acquire);
                let front_tail = hi(ftbh);
                let back_head = lo(ftbh);
                if back_head != head {
                    spin_loop();
                    continue;
                }
                let new_ftbh = pack(front_tail, next_head);
                if self
                    .front_tail_back_head
                    .compare_exchange_weak(ftbh, new_ftbh, Ordering::Release, Ordering::Relaxed)
                    .is_ok()
                {
                    break;
                }
            }
            return Ok(());
        }
    }

    /// Attempts to dequeue a value, symmetric to [`Self::enqueue`].
    pub fn dequeue(&self) -> Result<T, QueueError> {
        loop {
            let ftbh = self.front_tail_back_head.load(Ordering::Acquire);
            let tail = hi(ftbh);
            let head = lo(ftbh);
            if tail == head {
                let back_tail = lo(self.front_head_back_tail.load(Ordering::Acquire));
                if back_tail != tail {
                    spin_loop();
                    continue;
                }
                return Err(QueueError::QueueEmpty);
            }
            let next_tail = if tail + 1 == self.n { 0 } else { tail + 1 };
            let new_ftbh = pack(next_tail, head);
            if self
                .front_tail_back_head
                .compare_exchange_weak(ftbh, new_ftbh, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }
            // SAFETY: the CAS above exclusively reserved slot `tail` for
            // this consumer, and its producer already published (Release)
            // before `backHead` could have included it, matched by our
            // Acquire load above.
            let value = unsafe { (*self.buffer[tail as usize].0.get()).assume_init_read() };
            loop {
                let fhbt = self.front_head_back_tail.load(Ordering::Acquire);
                let front_head = hi(fhbt);
                let back_tail = lo(fhbt);
                if back_tail != tail {
                    spin_loop();
                    continue;
                }
                let new_fhbt = pack(front_head, next_tail);
                if self
                    .front_head_back_tail
                    .compare_exchange_weak(fhbt, new_fhbt, Ordering::Release, Ordering::Relaxed)
                    .is_ok()
                {
                    break;
                }
            }
            return Ok(value);
        }
    }

    /// Enqueues without the CAS loops or fences `enqueue` uses.
    ///
    /// # Safety
    /// The caller must guarantee this queue has exactly one producer and
    /// one consumer for its whole lifetime, each using only the `_unsync`
    /// variants, with no concurrent access from the synced methods.
    pub unsafe fn enqueue_unsync(&self, value: T) -> Result<(), QueueError> {
        let fhbt = self.front_head_back_tail.load(Ordering::Relaxed);
        let head = hi(fhbt);
        let tail = lo(fhbt);
        if head == tail {
            return Err(QueueError::QueueFull);
        }
        let next_head = if head + 1 == self.n { 0 } else { head + 1 };
        (*self.buffer[head as usize].0.get()).write(value);
        self.front_head_back_tail.store(pack(next_head, tail), Ordering::Relaxed);
        let front_tail = hi(self.front_tail_back_head.load(Ordering::Relaxed));
        self.front_tail_back_head.store(pack(front_tail, next_head), Ordering::Relaxed);
        Ok(())
    }

    /// Dequeues without the CAS loops or fences `dequeue` uses.
    ///
    /// # Safety
    /// Same contract as [`Self::enqueue_unsync`].
    pub unsafe fn dequeue_unsync(&self) -> Result<T, QueueError> {
        let ftbh = self.front_tail_back_head.load(Ordering::Relaxed);
        let tail = hi(ftbh);
        let head = lo(ftbh);
        if tail == head {
            return Err(QueueError::QueueEmpty);
        }
        let next_tail = if tail + 1 == self.n { 0 } else { tail + 1 };
        let value = (*self.buffer[tail as usize].0.get()).assume_init_read();
        self.front_tail_back_head.store(pack(next_tail, head), Ordering::Relaxed);
        let front_head = hi(self.front_head_back_tail.load(Ordering::Relaxed));
        self.front_head_back_tail.store(pack(front_head, next_tail), Ordering::Relaxed);
        Ok(value)
    }
}

impl<T> Drop for MpmcQueue<T> {
    fn drop(&mut self) {
        while self.dequeue().is_ok() {}
    }
}
