//! The per-slot record the job pool is built from: state, generation,
//! dependency counter, inline/external parameter storage, and the permit
//! list naming this job's successors.
//!
//! Cache-line-padded the same way [`crate::sync::CachePadded`] pads the
//! queue's atomics, for the same reason: independent slots must not
//! false-share a line under concurrent worker access.

use crate::job::interface::JobInterface;
use crate::sync::loom_shim::{spin_loop, AtomicBool, AtomicU16, AtomicU8, Ordering};
use std::alloc::Layout;
use std::cell::UnsafeCell;

/// Inline parameter capacity in bytes, per spec §4.6's "≤ 40 bytes"
/// discriminator.
pub(crate) const INLINE_PARAM_CAPACITY: usize = 40;

/// Sentinel short-ID meaning "no successor"/"no expansion slot".
pub(crate) const NO_SHORT_ID: u16 = u16::MAX;

/// Number of inline permit slots before an expansion slot is chained in.
pub(crate) const INLINE_PERMITS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum JobState {
    Free = 0,
    NotStarted = 1,
    WaitingForChildren = 2,
}

impl JobState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => JobState::Free,
            1 => JobState::NotStarted,
            2 => JobState::WaitingForChildren,
            _ => unreachable!("corrupted job state"),
        }
    }
}

/// The inline parameter buffer, forced to 8-byte alignment so it can host
/// any `Param` whose own alignment is at most 8 regardless of where it
/// happens to sit inside [`JobCall`]/[`JobSlot`] (whose own 64-byte
/// alignment only bounds the *first* field's offset, not nested ones).
#[repr(align(8))]
pub(crate) struct InlineBuf(pub [u8; INLINE_PARAM_CAPACITY]);

/// Where a job's parameter bytes live.
pub(crate) enum ParamStorage {
    /// Not yet populated (slot freshly obtained from the free queue).
    Empty,
    /// Copied directly into the slot's inline buffer. Spec §4.6 allows
    /// inline storage up to the slot's own alignment (64); this narrows
    /// that to 8, covering every primitive and small POD a caller is
    /// likely to schedule with, in exchange for a simpler fixed-offset
    /// buffer layout.
    Internal { bytes: InlineBuf },
    /// Heap-allocated because it didn't fit (or align) inline.
    External { ptr: *mut u8, layout: Layout },
}

/// Type-erased call record: a trampoline that knows how to reinterpret the
/// parameter bytes as a concrete `P` and invoke the concrete `fn(&P,
/// &JobInterface)`, plus a drop function for external parameters.
///
/// One trampoline is monomorphized per distinct `P` the caller schedules
/// with; `func_ptr` carries the concrete `fn(&P, &JobInterface)` pointer,
/// type-erased, so a single slot layout serves every job type without
/// per-type slot variants — the source's "type-level programming" replaced
/// with an ordinary generic function per spec §9.
pub(crate) struct JobCall {
    pub trampoline: unsafe fn(*const u8, *const (), &JobInterface<'_>),
    pub func_ptr: *const (),
    pub param: ParamStorage,
    pub drop_param: unsafe fn(&mut ParamStorage),
}

/// Three inline successor short-IDs plus a chained expansion slot, per
/// spec §4.3/§4.6.
pub(crate) struct PermitList {
    pub inline: [u16; INLINE_PERMITS],
    pub expansion: u16,
}

impl Default for PermitList {
    fn default() -> Self {
        Self { inline: [NO_SHORT_ID; INLINE_PERMITS], expansion: NO_SHORT_ID }
    }
}

/// A single pool slot. `lock` is the permit-list spin-lock spec §4.6
/// describes; `state`/`generation`/`dependencies` are the fields every
/// scheduling operation reads or updates.
#[repr(align(64))]
pub(crate) struct JobSlot {
    pub state: AtomicU8,
    pub generation: AtomicU16,
    pub dependencies: AtomicU8,
    lock: AtomicBool,
    permits: UnsafeCell<PermitList>,
    call: UnsafeCell<JobCall>,
}

// SAFETY: all mutable access to `permits`/`call` happens either while
// holding `lock` (permits) or under the exclusive "I currently own this
// short-ID" discipline the job system enforces (call); the fields are
// never read/written concurrently from two threads without one of those
// two guards.
unsafe impl Sync for JobSlot {}

// SAFETY: `JobCall`'s raw pointers (`func_ptr`, and `ParamStorage::External`'s
// `ptr`) only ever address a `'static` function or a heap allocation owned
// exclusively by this slot; nothing about them is thread-affine. Without
// this, `JobSlot`'s raw pointers would make it (and therefore `JobSystem`,
// which owns a `Box<[JobSlot]>`) `!Send`, and `Arc<JobSystem>` could never
// be handed to the worker threads `startup` spawns.
unsafe impl Send for JobSlot {}

fn noop_trampoline(_: *const u8, _: *const (), _: &JobInterface<'_>) {
    unreachable!("empty job slot invoked")
}

unsafe fn noop_drop(_: &mut ParamStorage) {}

impl JobSlot {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(JobState::Free as u8),
            generation: AtomicU16::new(0),
            dependencies: AtomicU8::new(0),
            lock: AtomicBool::new(false),
            permits: UnsafeCell::new(PermitList::default()),
            call: UnsafeCell::new(JobCall {
                trampoline: noop_trampoline as unsafe fn(*const u8, *const (), &JobInterface<'_>),
                func_ptr: std::ptr::null(),
                param: ParamStorage::Empty,
                drop_param: noop_drop,
            }),
        }
    }

    pub fn state(&self) -> JobState {
        JobState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, s: JobState) {
        self.state.store(s as u8, Ordering::Release);
    }

    pub fn generation_now(&self) -> u16 {
        self.generation.load(Ordering::Acquire)
    }

    fn lock(&self) {
        while self
            .lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spin_loop();
        }
    }

    fn unlock(&self) {
        self.lock.store(false, Ordering::Release);
    }

    /// Runs `f` with exclusive access to this slot's permit list, under the
    /// spin-lock spec §4.6 specifies.
    pub fn with_permits_locked<R>(&self, f: impl FnOnce(&mut PermitList) -> R) -> R {
        self.lock();
        // SAFETY: `lock` gives exclusive access to `permits`.
        let r = f(unsafe { &mut *self.permits.get() });
        self.unlock();
        r
    }

    /// # Safety
    /// The caller must have exclusive ownership of this slot (it is the
    /// current occupant by short-ID, not concurrently accessed by another
    /// thread as a live job).
    pub unsafe fn call(&self) -> &JobCall {
        &*self.call.get()
    }

    /// # Safety
    /// Same contract as [`Self::call`].
    pub unsafe fn call_mut(&self) -> &mut JobCall {
        &mut *self.call.get()
    }
}

/// Model-checked interleaving test for the permit-list spin-lock: two
/// threads racing to install themselves as successors on the same slot must
/// both land, under every legal interleaving loom can construct. Run with
/// `RUSTFLAGS="--cfg loom" cargo test --release --lib job::slot::loom_tests`.
#[cfg(all(test, loom))]
mod loom_tests {
    use super::*;
    use loom::sync::Arc;
    use loom::thread;

    #[test]
    fn two_threads_racing_to_add_a_permit_both_land() {
        loom::model(|| {
            let slot = Arc::new(JobSlot::new());
            let s1 = slot.clone();
            let s2 = slot.clone();

            let t1 = thread::spawn(move || {
                s1.with_permits_locked(|p| {
                    let i = p.inline.iter().position(|&s| s == NO_SHORT_ID).unwrap();
                    p.inline[i] = 1;
                });
            });
            let t2 = thread::spawn(move || {
                s2.with_permits_locked(|p| {
                    let i = p.inline.iter().position(|&s| s == NO_SHORT_ID).unwrap();
                    p.inline[i] = 2;
                });
            });

            t1.join().unwrap();
            t2.join().unwrap();

            slot.with_permits_locked(|p| {
                let installed: Vec<u16> = p.inline.iter().copied().filter(|&s| s != NO_SHORT_ID).collect();
                assert_eq!(installed.len(), 2, "both racing inserts must have landed, not clobbered each other");
                assert!(installed.contains(&1) && installed.contains(&2));
            });
        });
    }
}
