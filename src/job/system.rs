//! The job pool, scheduling operations, and worker dispatch loop.
//!
//! Grounded in the teacher's plain-`std::thread` concurrency style
//! (`concurrency::scoped`, which builds on `std::thread::scope` rather than
//! a third-party executor) — workers here are ordinary `std::thread`
//! handles parking on the ready queue instead of a scoped closure, since
//! the job system's lifetime isn't naturally scoped to one call frame, but
//! the "no external async runtime, just `std::thread` plus atomics" choice
//! carries over directly.

use crate::config::JobSystemConfig;
use crate::error::JobError;
use crate::job::interface::JobInterface;
use crate::job::slot::{InlineBuf, JobCall, JobSlot, JobState, ParamStorage, INLINE_PARAM_CAPACITY, NO_SHORT_ID};
use crate::sync::MpmcQueue;
use std::alloc::Layout;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

const STATE_NOT_STARTED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_SHUTTING_DOWN: u8 = 2;

/// How many spin attempts a worker makes against the ready queue before
/// re-checking the shutdown flag, per spec §5's `waitForReadyTaskTimeout`.
const SPIN_BUDGET: u32 = 256;

/// A handle to a scheduled job: a short-ID plus the slot's generation at
/// the moment of scheduling. Per spec §4.2, a job is "finished" once the
/// slot's current generation no longer matches the one recorded here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(u32);

impl JobId {
    /// The canonical invalid ID: all bits set, per spec §4.2.
    pub const INVALID: JobId = JobId(u32::MAX);

    fn new(short_id: u16, generation: u16) -> Self {
        JobId(((generation as u32) << 16) | short_id as u32)
    }

    /// The low 16 bits: the pool index this ID names.
    #[must_use]
    pub fn short_id(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    /// The high 16 bits: the slot's generation when this ID was issued.
    #[must_use]
    pub fn generation(self) -> u16 {
        (self.0 >> 16) as u16
    }

    /// True for [`Self::INVALID`].
    #[must_use]
    pub fn is_invalid(self) -> bool {
        *self == Self::INVALID
    }
}

fn install_param<P: Send + 'static>(call: &mut JobCall, param: P, func: fn(&P, &JobInterface<'_>)) {
    unsafe fn trampoline<P>(param_ptr: *const u8, func_ptr: *const (), iface: &JobInterface<'_>) {
        // SAFETY: `func_ptr` was produced from a `fn(&P, &JobInterface)` by
        // `install_param::<P>` and `param_ptr` addresses a live `P` written
        // by the same instantiation.
        let func: fn(&P, &JobInterface<'_>) = std::mem::transmute(func_ptr);
        let param = &*param_ptr.cast::<P>();
        func(param, iface);
    }

    unsafe fn drop_internal<P>(storage: &mut ParamStorage) {
        if let ParamStorage::Internal { bytes } = storage {
            std::ptr::drop_in_place(bytes.0.as_mut_ptr().cast::<P>());
        }
    }

    unsafe fn drop_external<P>(storage: &mut ParamStorage) {
        if let ParamStorage::External { ptr, layout } = storage {
            std::ptr::drop_in_place(ptr.cast::<P>());
            std::alloc::dealloc(*ptr, *layout);
        }
    }

    call.trampoline = trampoline::<P>;
    call.func_ptr = func as *const ();
    if std::mem::size_of::<P>() <= INLINE_PARAM_CAPACITY && std::mem::align_of::<P>() <= 8 {
        let mut bytes = InlineBuf([0u8; INLINE_PARAM_CAPACITY]);
        // SAFETY: capacity and alignment checked above.
        unsafe { std::ptr::write(bytes.0.as_mut_ptr().cast::<P>(), param) };
        call.param = ParamStorage::Internal { bytes };
        call.drop_param = drop_internal::<P>;
    } else {
        let layout = Layout::new::<P>();
        // SAFETY: `layout` is non-zero-sized whenever `P` is (external path
        // is only taken when `size_of::<P>() > INLINE_PARAM_CAPACITY`).
        let ptr = unsafe { std::alloc::alloc(layout) };
        assert!(!ptr.is_null(), "external job parameter allocation failed");
        // SAFETY: `ptr` is freshly allocated for exactly `layout`.
        unsafe { std::ptr::write(ptr.cast::<P>(), param) };
        call.param = ParamStorage::External { ptr, layout };
        call.drop_param = drop_external::<P>;
    }
}

fn param_ptr(call: &JobCall) -> *const u8 {
    match &call.param {
        ParamStorage::Internal { bytes } => bytes.0.as_ptr(),
        ParamStorage::External { ptr, .. } => ptr.cast_const(),
        ParamStorage::Empty => std::ptr::null(),
    }
}

/// The fixed job-slot pool, its free/ready queues, and the worker threads
/// dispatching against them.
pub struct JobSystem {
    slots: Box<[JobSlot]>,
    free_queue: MpmcQueue<u16>,
    ready_queue: MpmcQueue<u16>,
    state: AtomicU8,
    pending: AtomicUsize,
    num_workers: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

// SAFETY: every slot access either goes through its own atomics/spin-lock
// or is gated by exclusive short-ID ownership (obtained from `free_queue`,
// relinquished by recycling back into it); no two threads ever touch the
// same slot's non-atomic fields without one of those two guards.
unsafe impl Sync for JobSystem {}

impl JobSystem {
    /// Builds a job system with `config.num_jobs` pool slots, all free.
    /// Does not spawn any workers; call [`Self::startup`] for that.
    ///
    /// # Panics
    /// Panics if `config.num_jobs` is zero or does not fit in 16 bits
    /// (reserving `u16::MAX` as the "no slot" sentinel, spec §4.2's
    /// all-ones invalid ID).
    #[must_use]
    pub fn new(config: &JobSystemConfig) -> Self {
        assert!(config.num_jobs > 0, "num_jobs must be positive");
        assert!(config.num_jobs < u16::MAX as usize, "num_jobs must fit in 16 bits, reserving u16::MAX");
        let slots: Box<[JobSlot]> = (0..config.num_jobs).map(|_| JobSlot::new()).collect();
        let free_queue = MpmcQueue::new(config.num_jobs);
        let ready_queue = MpmcQueue::new(config.num_jobs);
        for short_id in 0..config.num_jobs as u16 {
            free_queue.enqueue(short_id).expect("free queue sized to num_jobs");
        }
        Self {
            slots,
            free_queue,
            ready_queue,
            state: AtomicU8::new(STATE_NOT_STARTED),
            pending: AtomicUsize::new(0),
            num_workers: config.num_workers,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawns `config.num_workers` worker threads and transitions to the
    /// running state. Must precede any `schedule*` call, per spec §6.
    pub fn startup(self: &Arc<Self>) {
        self.state.store(STATE_RUNNING, Ordering::Release);
        #[cfg(feature = "tracing")]
        tracing::debug!(num_workers = self.num_workers, "job system starting up");
        let mut workers = self.workers.lock().unwrap();
        for _ in 0..self.num_workers {
            let system = Arc::clone(self);
            workers.push(thread::spawn(move || system.worker_loop()));
        }
    }

    fn worker_loop(&self) {
        loop {
            match self.wait_for_ready_task_timeout(SPIN_BUDGET) {
                Some(short_id) => self.run_slot(short_id),
                None => {
                    if self.state.load(Ordering::Acquire) == STATE_SHUTTING_DOWN {
                        return;
                    }
                }
            }
        }
    }

    fn wait_for_ready_task_timeout(&self, attempts: u32) -> Option<u16> {
        for _ in 0..attempts {
            match self.ready_queue.dequeue() {
                Ok(short_id) => return Some(short_id),
                Err(_) => {
                    if self.state.load(Ordering::Acquire) == STATE_SHUTTING_DOWN {
                        return None;
                    }
                    std::hint::spin_loop();
                }
            }
        }
        None
    }

    fn obtain_slot(&self) -> u16 {
        loop {
            match self.free_queue.dequeue() {
                Ok(id) => {
                    self.pending.fetch_add(1, Ordering::AcqRel);
                    return id;
                }
                Err(_) => std::hint::spin_loop(),
            }
        }
    }

    fn free_queue_push_or_spin(&self, short_id: u16) {
        loop {
            match self.free_queue.enqueue(short_id) {
                Ok(()) => return,
                Err(_) => std::hint::spin_loop(),
            }
        }
    }

    fn ready_queue_push_or_spin(&self, short_id: u16) {
        loop {
            match self.ready_queue.enqueue(short_id) {
                Ok(()) => return,
                Err(_) => std::hint::spin_loop(),
            }
        }
    }

    /// Schedules a top-level job with no parent.
    ///
    /// # Panics
    /// Panics if `deps.len() >= 255` (the dependency counter is a `u8`
    /// that also carries the publication pin).
    pub fn schedule<P: Send + 'static>(&self, param: P, func: fn(&P, &JobInterface<'_>), deps: &[JobId]) -> JobId {
        self.schedule_inner(param, func, deps)
    }

    /// Alias for [`Self::schedule`]: both take an explicit dependency
    /// list, matching spec §4.6's `schedule`/`scheduleWithDeps` pair (the
    /// distinction in the source is an overload, not a behavioral split).
    ///
    /// # Panics
    /// Panics if `deps.len() >= 255`, see [`Self::schedule`].
    pub fn schedule_with_deps<P: Send + 'static>(
        &self,
        param: P,
        func: fn(&P, &JobInterface<'_>),
        deps: &[JobId],
    ) -> JobId {
        self.schedule_inner(param, func, deps)
    }

    fn schedule_inner<P: Send + 'static>(&self, param: P, func: fn(&P, &JobInterface<'_>), deps: &[JobId]) -> JobId {
        // The dependency counter is a `u8` including the publication pin
        // (spec §4.6 step 3: `1 + len(deps)`); silently wrapping past 255
        // would release the job before all its dependencies ran.
        assert!(deps.len() < 255, "job cannot depend on 255 or more other jobs (u8 dependency counter)");
        let short_id = self.obtain_slot();
        let slot = &self.slots[short_id as usize];
        let generation = slot.generation_now();
        let job_id = JobId::new(short_id, generation);

        // SAFETY: we exclusively own `short_id` (just dequeued from the
        // free queue); no other thread holds or references this slot.
        unsafe { install_param(slot.call_mut(), param, func) };
        slot.set_state(JobState::NotStarted);
        slot.dependencies.store(1 + deps.len() as u8, Ordering::Release);

        for dep in deps {
            if dep.is_invalid() || !self.add_permit(dep.short_id(), dep.generation(), short_id) {
                self.finish_dependency(short_id);
            }
        }
        // The publication pin (spec §4.6 step 5).
        self.finish_dependency(short_id);
        job_id
    }

    /// Schedules a child job of the running job occupying `parent_short_id`,
    /// pre-incrementing the parent's dependency counter first so it cannot
    /// finalize before this child does.
    pub(crate) fn schedule_child<P: Send + 'static>(
        &self,
        parent_short_id: u16,
        param: P,
        func: fn(&P, &JobInterface<'_>),
        deps: &[JobId],
    ) -> JobId {
        self.slots[parent_short_id as usize].dependencies.fetch_add(1, Ordering::AcqRel);
        let child_id = self.schedule_inner(param, func, deps);
        if !self.add_permit(child_id.short_id(), child_id.generation(), parent_short_id) {
            self.finish_dependency(parent_short_id);
        }
        child_id
    }

    /// Registers `successor` on `owner`'s permit list, walking (and
    /// growing, via expansion slots) the chain as needed. Returns `false`
    /// if `owner`'s generation had already advanced past `owner_generation`
    /// (it finished before the registration landed), in which case the
    /// caller must decrement `successor`'s own dependency count itself.
    fn add_permit(&self, owner_short_id: u16, owner_generation: u16, successor: u16) -> bool {
        enum Step {
            Installed,
            AlreadyDone,
            Descend(u16),
        }
        let mut cursor = owner_short_id;
        let mut first = true;
        loop {
            let slot = &self.slots[cursor as usize];
            let step = slot.with_permits_locked(|permits| {
                // The generation check must happen under the owner's own
                // lock (spec §4.6), not before acquiring it: otherwise the
                // owner can finalize (bump generation, recycle the slot)
                // between an unlocked check and the install below, landing
                // `successor` in an unrelated job's permit list.
                if first && slot.generation_now() != owner_generation {
                    return Step::AlreadyDone;
                }
                if let Some(i) = permits.inline.iter().position(|&s| s == NO_SHORT_ID) {
                    permits.inline[i] = successor;
                    return Step::Installed;
                }
                if permits.expansion == NO_SHORT_ID {
                    permits.expansion = self.obtain_slot();
                }
                Step::Descend(permits.expansion)
            });
            match step {
                Step::Installed => return true,
                Step::AlreadyDone => return false,
                Step::Descend(next) => {
                    cursor = next;
                    first = false;
                }
            }
        }
    }

    /// Decrements `short_id`'s dependency counter; if it reaches zero,
    /// either marks it ready-to-run (publication path) or finalizes it
    /// (body already ran), pushing any newly-unblocked successors onto an
    /// explicit work-list rather than recursing — spec §9 flags the
    /// source's recursive `releasePermits` as a stack-exhaustion risk in
    /// deep DAGs and recommends exactly this conversion.
    fn finish_dependency(&self, short_id: u16) {
        let mut worklist = vec![short_id];
        while let Some(id) = worklist.pop() {
            let slot = &self.slots[id as usize];
            let prev = slot.dependencies.fetch_sub(1, Ordering::AcqRel);
            debug_assert!(prev > 0, "job dependency counter underflowed");
            if prev != 1 {
                continue;
            }
            match slot.state() {
                JobState::NotStarted => self.ready_queue_push_or_spin(id),
                JobState::WaitingForChildren => self.finalize(id, &mut worklist),
                JobState::Free => unreachable!("dependency count reached zero on a free slot"),
            }
        }
    }

    /// Snapshots and clears `short_id`'s permit chain (recycling any
    /// expansion slots along the way), bumps its generation, returns it to
    /// the free queue, and appends its successors to `worklist`.
    fn finalize(&self, short_id: u16, worklist: &mut Vec<u16>) {
        let mut successors = Vec::new();
        let mut cursor = short_id;
        loop {
            let slot = &self.slots[cursor as usize];
            let next_expansion = slot.with_permits_locked(|permits| {
                successors.extend(permits.inline.iter().copied().filter(|&s| s != NO_SHORT_ID));
                let expansion = permits.expansion;
                *permits = Default::default();
                expansion
            });
            if cursor != short_id {
                // A chained expansion slot: pure bookkeeping, never ran
                // through the normal dispatch path, so it is recycled here
                // directly instead of via `finish_dependency`.
                slot.generation.fetch_add(1, Ordering::Release);
                slot.set_state(JobState::Free);
                self.free_queue_push_or_spin(cursor);
                self.pending.fetch_sub(1, Ordering::AcqRel);
            }
            if next_expansion == NO_SHORT_ID {
                break;
            }
            cursor = next_expansion;
        }
        let slot = &self.slots[short_id as usize];
        slot.generation.fetch_add(1, Ordering::Release);
        slot.set_state(JobState::Free);
        self.free_queue_push_or_spin(short_id);
        self.pending.fetch_sub(1, Ordering::AcqRel);
        worklist.extend(successors);
    }

    fn run_slot(&self, short_id: u16) {
        let slot = &self.slots[short_id as usize];
        let generation = slot.generation_now();
        // Step 1: guard against children completing mid-body.
        slot.dependencies.store(1, Ordering::Release);
        slot.set_state(JobState::WaitingForChildren);

        let job_id = JobId::new(short_id, generation);
        let iface = JobInterface::new(self, job_id);
        // SAFETY: this thread holds exclusive dispatch ownership of
        // `short_id` (it came off the ready queue exactly once).
        unsafe {
            let call = slot.call();
            (call.trampoline)(param_ptr(call), call.func_ptr, &iface);
        }
        // SAFETY: same ownership as above.
        unsafe {
            let call = slot.call_mut();
            (call.drop_param)(&mut call.param);
            call.param = ParamStorage::Empty;
        }
        self.finish_dependency(short_id);
    }

    /// Runs jobs (participating as a worker) until `job_id`'s generation
    /// has advanced, i.e. until it has finished.
    ///
    /// # Errors
    /// Returns [`JobError::InvalidId`] for [`JobId::INVALID`], or
    /// [`JobError::ShuttingDown`] if shutdown is signalled first.
    pub fn wait(&self, job_id: JobId) -> Result<(), JobError> {
        if job_id.is_invalid() {
            return Err(JobError::InvalidId);
        }
        loop {
            if self.slots[job_id.short_id() as usize].generation_now() != job_id.generation() {
                return Ok(());
            }
            if self.state.load(Ordering::Acquire) == STATE_SHUTTING_DOWN {
                return Err(JobError::ShuttingDown);
            }
            match self.wait_for_ready_task_timeout(SPIN_BUDGET) {
                Some(short_id) => self.run_slot(short_id),
                None => std::hint::spin_loop(),
            }
        }
    }

    /// As [`Self::wait`], but gives up after `max_spins` failed ready-queue
    /// polls, per spec §5's `waitForReadyTaskTimeout`.
    ///
    /// # Errors
    /// As [`Self::wait`], plus [`JobError::TimedOut`] if the budget is
    /// exhausted before `job_id` finishes.
    pub fn wait_timeout(&self, job_id: JobId, max_spins: u32) -> Result<(), JobError> {
        if job_id.is_invalid() {
            return Err(JobError::InvalidId);
        }
        for _ in 0..max_spins {
            if self.slots[job_id.short_id() as usize].generation_now() != job_id.generation() {
                return Ok(());
            }
            if self.state.load(Ordering::Acquire) == STATE_SHUTTING_DOWN {
                return Err(JobError::ShuttingDown);
            }
            match self.wait_for_ready_task_timeout(1) {
                Some(short_id) => self.run_slot(short_id),
                None => std::hint::spin_loop(),
            }
        }
        Err(JobError::TimedOut)
    }

    /// Runs jobs (participating as a worker) until no job anywhere in the
    /// system is outstanding.
    pub fn flush(&self) {
        while self.pending.load(Ordering::Acquire) > 0 {
            match self.wait_for_ready_task_timeout(SPIN_BUDGET) {
                Some(short_id) => self.run_slot(short_id),
                None => {
                    if self.state.load(Ordering::Acquire) == STATE_SHUTTING_DOWN {
                        return;
                    }
                }
            }
        }
    }

    /// Signals shutdown, joins every worker thread, then resets pending
    /// counters so the system could in principle be restarted with a fresh
    /// `startup`.
    pub fn shutdown(&self) {
        self.state.store(STATE_SHUTTING_DOWN, Ordering::Release);
        let mut workers = self.workers.lock().unwrap();
        for worker in workers.drain(..) {
            let _ = worker.join();
        }
        self.pending.store(0, Ordering::Release);
        self.state.store(STATE_NOT_STARTED, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobSystemConfig;
    use std::sync::atomic::AtomicI32;

    fn system(num_jobs: usize, num_workers: usize) -> Arc<JobSystem> {
        Arc::new(JobSystem::new(&JobSystemConfig { num_jobs, num_workers }))
    }

    #[test]
    fn schedule_and_flush_runs_job_exactly_once() {
        let sys = system(64, 2);
        sys.startup();
        static COUNT: AtomicI32 = AtomicI32::new(0);
        COUNT.store(0, Ordering::SeqCst);
        let id = sys.schedule((), |_, _| { COUNT.fetch_add(1, Ordering::SeqCst); }, &[]);
        sys.wait(id).unwrap();
        assert_eq!(COUNT.load(Ordering::SeqCst), 1);
        sys.shutdown();
    }

    #[test]
    fn dependency_chain_runs_in_order() {
        let sys = system(64, 2);
        sys.startup();
        static ORDER: Mutex<Vec<u32>> = Mutex::new(Vec::new());
        ORDER.lock().unwrap().clear();
        let a = sys.schedule(1u32, |p, _| ORDER.lock().unwrap().push(*p), &[]);
        let b = sys.schedule(2u32, |p, _| ORDER.lock().unwrap().push(*p), &[a]);
        sys.wait(b).unwrap();
        assert_eq!(*ORDER.lock().unwrap(), vec![1, 2]);
        sys.shutdown();
    }

    #[test]
    fn dag_with_fan_out_all_run_and_flush_returns() {
        // job A, job B depends on A, 16 jobs C depend on B: spec §8 scenario 5.
        let sys = system(64, 4);
        sys.startup();
        static A_RAN: AtomicUsize = AtomicUsize::new(0);
        static B_RAN: AtomicUsize = AtomicUsize::new(0);
        static C_RAN: AtomicUsize = AtomicUsize::new(0);
        A_RAN.store(0, Ordering::SeqCst);
        B_RAN.store(0, Ordering::SeqCst);
        C_RAN.store(0, Ordering::SeqCst);

        let a = sys.schedule((), |_, _| { A_RAN.fetch_add(1, Ordering::SeqCst); }, &[]);
        let b = sys.schedule((), |_, _| { B_RAN.fetch_add(1, Ordering::SeqCst); }, &[a]);
        for _ in 0..16 {
            sys.schedule((), |_, _| { C_RAN.fetch_add(1, Ordering::SeqCst); }, &[b]);
        }
        sys.flush();
        assert_eq!(A_RAN.load(Ordering::SeqCst), 1);
        assert_eq!(B_RAN.load(Ordering::SeqCst), 1);
        assert_eq!(C_RAN.load(Ordering::SeqCst), 16);
        sys.shutdown();
    }

    #[test]
    fn sub_job_delays_parent_completion() {
        let sys = system(64, 4);
        sys.startup();
        static PARENT_AFTER_CHILD: AtomicUsize = AtomicUsize::new(0);
        PARENT_AFTER_CHILD.store(0, Ordering::SeqCst);

        let parent = sys.schedule(
            (),
            |_, iface| {
                iface.add_sub_job(
                    (),
                    |_, _| {
                        std::thread::yield_now();
                        PARENT_AFTER_CHILD.fetch_add(1, Ordering::SeqCst);
                    },
                    &[],
                );
            },
            &[],
        );
        sys.wait(parent).unwrap();
        assert_eq!(PARENT_AFTER_CHILD.load(Ordering::SeqCst), 1);
        sys.shutdown();
    }

    #[test]
    fn external_parameter_round_trips() {
        let sys = system(32, 2);
        sys.startup();
        #[derive(Clone)]
        struct Big([u64; 16]);
        static SUM: AtomicUsize = AtomicUsize::new(0);
        SUM.store(0, Ordering::SeqCst);
        let param = Big([7; 16]);
        let id = sys.schedule(param, |p, _| {
            let total: u64 = p.0.iter().sum();
            SUM.store(total as usize, Ordering::SeqCst);
        }, &[]);
        sys.wait(id).unwrap();
        assert_eq!(SUM.load(Ordering::SeqCst), 7 * 16);
        sys.shutdown();
    }

    #[test]
    fn wide_fan_out_exceeds_inline_permit_capacity() {
        // More than 3 successors forces the expansion-slot chain.
        let sys = system(64, 4);
        sys.startup();
        static RAN: AtomicUsize = AtomicUsize::new(0);
        RAN.store(0, Ordering::SeqCst);
        let root = sys.schedule((), |_, _| {}, &[]);
        for _ in 0..20 {
            sys.schedule((), |_, _| { RAN.fetch_add(1, Ordering::SeqCst); }, &[root]);
        }
        sys.flush();
        assert_eq!(RAN.load(Ordering::SeqCst), 20);
        sys.shutdown();
    }

    #[test]
    fn invalid_job_id_wait_errors() {
        let sys = system(16, 1);
        sys.startup();
        assert_eq!(sys.wait(JobId::INVALID), Err(JobError::InvalidId));
        sys.shutdown();
    }
}
