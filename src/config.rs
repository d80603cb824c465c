//! Knobs for a [`Scheduler`](crate::Scheduler).

/// What happens to dispatch units that are already queued when a child is
/// detached from its parent stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DetachPolicy {
    /// Units enqueued before the detach still reach the child; later ones don't.
    #[default]
    DeliverPending,
    /// The edge is gone immediately, queued units skip it.
    Immediate,
}

/// What the scheduler does with a rejection that nobody listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UncaughtPolicy {
    /// Record it for [`Scheduler::take_uncaught`](crate::Scheduler::take_uncaught)
    /// and log a warning.
    #[default]
    Collect,
    /// Panic inside the tick that found it.
    Panic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SchedulerConfig {
    pub detach_policy: DetachPolicy,
    pub uncaught_policy: UncaughtPolicy,
}

impl SchedulerConfig {
    pub fn with_detach_policy(mut self, policy: DetachPolicy) -> Self {
        self.detach_policy = policy;
        self
    }

    pub fn with_uncaught_policy(mut self, policy: UncaughtPolicy) -> Self {
        self.uncaught_policy = policy;
        self
    }
}
