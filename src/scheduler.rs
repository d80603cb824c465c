//! The dispatch queue. One FIFO of dispatch units per [`Scheduler`], drained
//! one unit per tick. How ticks get advanced is up to the host, through the
//! [`Defer`] hook.
//!
//! ```
//! use promise_stream::{Promise, Scheduler};
//!
//! let scheduler = Scheduler::new();
//! let promise = Promise::<u32, String>::new(&scheduler);
//! let doubled = promise.map(|v| v * 2);
//! promise.resolve(21).unwrap();
//! assert_eq!(doubled.value(), None);
//! scheduler.run_until_idle();
//! assert_eq!(doubled.value(), Some(42));
//! ```
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};

use futures::executor::LocalSpawner;
use futures::task::LocalSpawnExt;
use thiserror::Error;
use tracing::{trace, warn};

use crate::config::{SchedulerConfig, UncaughtPolicy};
use crate::node::NodeId;

/// Host hook that arranges for [`TickHandle::fire`] to be called "later".
pub trait Defer {
    fn request_tick(&self, tick: TickHandle);
}

/// Never advances on its own; the host calls [`Scheduler::tick`] or
/// [`Scheduler::run_until_idle`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ManualDefer;

impl Defer for ManualDefer {
    fn request_tick(&self, _tick: TickHandle) {}
}

/// Runs each tick as its own task on a `futures` local executor, so other work
/// spawned on the same pool interleaves between ticks.
///
/// ```
/// use futures::executor::LocalPool;
/// use promise_stream::{LocalPoolDefer, Promise, Scheduler, SchedulerConfig};
///
/// let mut pool = LocalPool::new();
/// let scheduler = Scheduler::with_config(
///     SchedulerConfig::default(),
///     LocalPoolDefer::new(pool.spawner()),
/// );
/// let promise = Promise::<&str, ()>::new(&scheduler);
/// let waiter = promise.wait();
/// promise.resolve("🍓").unwrap();
/// assert_eq!(pool.run_until(waiter), Ok(Ok("🍓")));
/// ```
pub struct LocalPoolDefer {
    spawner: LocalSpawner,
}

impl fmt::Debug for LocalPoolDefer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalPoolDefer").finish_non_exhaustive()
    }
}

impl LocalPoolDefer {
    pub fn new(spawner: LocalSpawner) -> Self {
        Self { spawner }
    }
}

impl Defer for LocalPoolDefer {
    fn request_tick(&self, tick: TickHandle) {
        let fallback = tick.clone();
        if let Err(err) = self.spawner.spawn_local(async move {
            tick.fire();
        }) {
            warn!(error = %err, "executor refused a tick");
            fallback.cancel();
        }
    }
}

/// A weak reference back to the scheduler, handed to [`Defer`] hooks.
#[derive(Clone)]
pub struct TickHandle {
    shared: Weak<Shared>,
}

impl TickHandle {
    /// Runs one tick. Returns false if the scheduler is gone or idle.
    pub fn fire(&self) -> bool {
        match self.shared.upgrade() {
            Some(shared) => {
                shared.tick_requested.set(false);
                Scheduler { shared }.tick()
            }
            None => false,
        }
    }

    /// Forgets the outstanding request so the next enqueue asks again.
    pub fn cancel(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.tick_requested.set(false);
        }
    }
}

impl fmt::Debug for TickHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TickHandle")
            .field("alive", &(self.shared.strong_count() > 0))
            .finish()
    }
}

/// A rejection that reached a node with nobody listening.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("uncaught rejection on node {node}: {message}")]
pub struct UncaughtRejection {
    pub node: NodeId,
    /// Set when the node is a combinator that was rejected by one of its sources.
    pub source_index: Option<usize>,
    pub message: String,
}

struct DispatchUnit {
    seq: u64,
    node: NodeId,
    run: Box<dyn FnOnce(u64)>,
}

struct Shared {
    config: SchedulerConfig,
    defer: Box<dyn Defer>,
    queue: RefCell<VecDeque<DispatchUnit>>,
    next_seq: Cell<u64>,
    next_node: Cell<u64>,
    ticks: Cell<u64>,
    tick_requested: Cell<bool>,
    running: Cell<bool>,
    uncaught: RefCell<Vec<UncaughtRejection>>,
}

struct Running<'a>(&'a Cell<bool>);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

#[derive(Clone)]
pub struct Scheduler {
    shared: Rc<Shared>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default(), ManualDefer)
    }

    pub fn with_config(config: SchedulerConfig, defer: impl Defer + 'static) -> Self {
        Self {
            shared: Rc::new(Shared {
                config,
                defer: Box::new(defer),
                queue: RefCell::new(VecDeque::new()),
                next_seq: Cell::new(0),
                next_node: Cell::new(0),
                ticks: Cell::new(0),
                tick_requested: Cell::new(false),
                running: Cell::new(false),
                uncaught: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> SchedulerConfig {
        self.shared.config
    }

    /// Number of units waiting to run.
    pub fn pending_units(&self) -> usize {
        self.shared.queue.borrow().len()
    }

    /// Number of units run so far.
    pub fn ticks(&self) -> u64 {
        self.shared.ticks.get()
    }

    /// Pops and runs one dispatch unit. Anything it enqueues waits for a later
    /// tick. Calling this from inside a running unit does nothing.
    pub fn tick(&self) -> bool {
        if self.shared.running.get() {
            trace!("tick requested from inside a dispatch unit, ignored");
            return false;
        }
        let unit = self.shared.queue.borrow_mut().pop_front();
        let Some(unit) = unit else {
            return false;
        };
        {
            self.shared.running.set(true);
            let _running = Running(&self.shared.running);
            trace!(seq = unit.seq, node = %unit.node, "dispatch");
            (unit.run)(unit.seq);
        }
        self.shared.ticks.set(self.shared.ticks.get() + 1);
        if !self.shared.queue.borrow().is_empty() {
            self.request_tick();
        }
        true
    }

    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        while self.tick() {
            ran += 1;
        }
        ran
    }

    pub fn run_ticks(&self, max: usize) -> usize {
        let mut ran = 0;
        while ran < max && self.tick() {
            ran += 1;
        }
        ran
    }

    /// Drains the uncaught rejections recorded so far, oldest first.
    pub fn take_uncaught(&self) -> Vec<UncaughtRejection> {
        std::mem::take(&mut *self.shared.uncaught.borrow_mut())
    }

    /// Turns the oldest uncaught rejection into an error, if there is one.
    pub fn check(&self) -> Result<(), crate::Error> {
        let mut uncaught = self.shared.uncaught.borrow_mut();
        if uncaught.is_empty() {
            return Ok(());
        }
        Err(uncaught.remove(0).into())
    }

    pub(crate) fn allocate_node(&self) -> NodeId {
        let id = self.shared.next_node.get();
        self.shared.next_node.set(id + 1);
        NodeId(id)
    }

    /// Sequence number the next enqueued unit will get.
    pub(crate) fn next_seq(&self) -> u64 {
        self.shared.next_seq.get()
    }

    pub(crate) fn enqueue(&self, node: NodeId, run: impl FnOnce(u64) + 'static) {
        let seq = self.shared.next_seq.get();
        self.shared.next_seq.set(seq + 1);
        trace!(seq, node = %node, "enqueue");
        self.shared.queue.borrow_mut().push_back(DispatchUnit {
            seq,
            node,
            run: Box::new(run),
        });
        self.request_tick();
    }

    pub(crate) fn report_uncaught(&self, rejection: UncaughtRejection) {
        warn!(node = %rejection.node, source_index = ?rejection.source_index, message = %rejection.message, "uncaught rejection");
        match self.shared.config.uncaught_policy {
            UncaughtPolicy::Collect => self.shared.uncaught.borrow_mut().push(rejection),
            UncaughtPolicy::Panic => panic!("{}", crate::Error::from(rejection)),
        }
    }

    fn request_tick(&self) {
        if !self.shared.tick_requested.replace(true) {
            self.shared.defer.request_tick(TickHandle {
                shared: Rc::downgrade(&self.shared),
            });
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.shared.config)
            .field("pending_units", &self.pending_units())
            .field("ticks", &self.ticks())
            .finish()
    }
}
