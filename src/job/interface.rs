//! The interface passed to a running job's body, letting it identify
//! itself and spawn children.

use crate::job::system::{JobId, JobSystem};

/// Passed to every job body. Exposes the job's own identity and lets it
/// spawn sub-jobs whose completion the parent will wait on before it is
/// considered finished, per spec §4.6's `addSubJob`.
pub struct JobInterface<'a> {
    system: &'a JobSystem,
    current: JobId,
}

impl<'a> JobInterface<'a> {
    pub(crate) fn new(system: &'a JobSystem, current: JobId) -> Self {
        Self { system, current }
    }

    /// The identity of the job currently executing.
    #[must_use]
    pub fn current_job(&self) -> JobId {
        self.current
    }

    /// Schedules `param`/`func` as a child of the currently running job.
    /// The parent's dependency counter is pre-incremented so it will not
    /// finalize (and its generation will not advance) until this child
    /// also finishes, per spec §4.6.
    pub fn add_sub_job<P: Send + 'static>(
        &self,
        param: P,
        func: fn(&P, &JobInterface<'_>),
        deps: &[JobId],
    ) -> JobId {
        self.system.schedule_child(self.current.short_id(), param, func, deps)
    }
}
