//! The resolution core shared by [`Promise`](crate::Promise) and
//! [`Stream`](crate::Stream).
//!
//! A [`Node`] is one state machine plus an ordered listener list. The
//! `one_shot` flag is the only thing that tells the two variants apart:
//!
//! - one-shot nodes settle once; a second settle is
//!   [`Error::DoubleResolution`], and the listener list is dropped after the
//!   single dispatch.
//! - repeatable nodes accept any number of settles. Each one enqueues its own
//!   dispatch unit right away and is flushed, in order, to whoever is listening
//!   when that unit runs.
//!
//! Attaching to a node that is already fulfilled or rejected replays the stored
//! payload synchronously. Everything else goes through the scheduler.
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use tracing::{debug, warn};

use crate::config::DetachPolicy;
use crate::scheduler::{Scheduler, UncaughtRejection};
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionState {
    Pending,
    Fulfilled,
    Rejected,
}

/// How a payload reached a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// Synchronously, because the listener attached to a settled node.
    Replay,
    /// From a dispatch unit.
    Dispatch,
}

impl Delivery {
    /// A replay nested inside a dispatch is still part of that dispatch.
    pub(crate) fn within(self, outer: Delivery) -> Delivery {
        match outer {
            Delivery::Dispatch => Delivery::Dispatch,
            Delivery::Replay => self,
        }
    }
}

pub(crate) type Callback<T, E> = Rc<dyn Fn(&Result<T, E>, Delivery)>;

/// Asked before each dispatch; a listener whose guard says false is dropped.
pub(crate) type Keep = Rc<dyn Fn() -> bool>;

struct Listener<T, E> {
    /// The derived node this edge feeds, when it was made by `then`/`pipe`.
    child: Option<NodeId>,
    /// Units with a sequence number at or past this one skip the listener.
    detached_at: Option<u64>,
    keep: Option<Keep>,
    callback: Callback<T, E>,
}

impl<T, E> Listener<T, E> {
    fn live_at(&self, seq: u64) -> bool {
        self.detached_at.map_or(true, |at| seq < at)
            && self.keep.as_ref().map_or(true, |keep| keep())
    }
}

struct Core<T, E> {
    state: ResolutionState,
    value: Option<T>,
    error: Option<E>,
    listeners: Vec<Listener<T, E>>,
    queued: VecDeque<Result<T, E>>,
    resolved: bool,
    /// Dispatch units enqueued for this node that have not run yet.
    in_flight: usize,
    observed: bool,
    uncaught: bool,
    failed_source: Option<usize>,
}

struct Inner<T, E> {
    id: NodeId,
    one_shot: bool,
    scheduler: Scheduler,
    core: RefCell<Core<T, E>>,
}

/// Handle to a shared resolution state machine. Cloning is cheap and every
/// clone points at the same node.
pub struct Node<T, E> {
    inner: Rc<Inner<T, E>>,
}

impl<T, E> Clone for Node<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, E> fmt::Debug for Node<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.inner.core.borrow();
        f.debug_struct("Node")
            .field("id", &self.inner.id)
            .field("one_shot", &self.inner.one_shot)
            .field("state", &core.state)
            .field("listeners", &core.listeners.len())
            .field("queued", &core.queued.len())
            .finish()
    }
}

impl<T, E> Node<T, E>
where
    T: Clone + 'static,
    E: Clone + fmt::Debug + 'static,
{
    pub(crate) fn new(scheduler: &Scheduler, one_shot: bool) -> Self {
        Self {
            inner: Rc::new(Inner {
                id: scheduler.allocate_node(),
                one_shot,
                scheduler: scheduler.clone(),
                core: RefCell::new(Core {
                    state: ResolutionState::Pending,
                    value: None,
                    error: None,
                    listeners: Vec::new(),
                    queued: VecDeque::new(),
                    resolved: false,
                    in_flight: 0,
                    observed: false,
                    uncaught: false,
                    failed_source: None,
                }),
            }),
        }
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    pub fn is_one_shot(&self) -> bool {
        self.inner.one_shot
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn state(&self) -> ResolutionState {
        self.inner.core.borrow().state
    }

    /// True as soon as anything was resolved or rejected, before dispatch.
    pub fn is_resolved(&self) -> bool {
        self.inner.core.borrow().resolved
    }

    /// True while not yet settled or while dispatch work is still queued.
    pub fn is_pending(&self) -> bool {
        let core = self.inner.core.borrow();
        core.state == ResolutionState::Pending || core.in_flight > 0
    }

    pub fn is_fulfilled(&self) -> bool {
        self.state() == ResolutionState::Fulfilled
    }

    pub fn is_rejected(&self) -> bool {
        self.state() == ResolutionState::Rejected
    }

    /// True once a rejection of this node was reported as uncaught.
    pub fn is_uncaught(&self) -> bool {
        self.inner.core.borrow().uncaught
    }

    /// Last dispatched value.
    pub fn value(&self) -> Option<T> {
        self.inner.core.borrow().value.clone()
    }

    /// Last dispatched error, cleared again by a later value.
    pub fn error(&self) -> Option<E> {
        self.inner.core.borrow().error.clone()
    }

    pub(crate) fn settle(&self, payload: Result<T, E>) -> Result<(), Error> {
        if self.inner.one_shot && self.inner.core.borrow().resolved {
            return Err(Error::DoubleResolution {
                node: self.inner.id,
            });
        }
        self.queue(payload);
        Ok(())
    }

    /// Queues a payload and enqueues the unit that will dispatch it. Only
    /// repeatable nodes call this directly; they never refuse a payload.
    pub(crate) fn queue(&self, payload: Result<T, E>) {
        {
            let mut core = self.inner.core.borrow_mut();
            core.resolved = true;
            if !self.inner.one_shot {
                core.state = ResolutionState::Pending;
            }
            core.queued.push_back(payload);
            core.in_flight += 1;
            debug!(node = %self.inner.id, queued = core.queued.len(), "settle");
        }
        self.schedule_flush();
    }

    pub(crate) fn subscribe(&self, child: Option<NodeId>, callback: Callback<T, E>) {
        self.subscribe_while(child, None, callback)
    }

    /// Like [`subscribe`](Self::subscribe), but the edge goes away at the first
    /// dispatch where `keep` returns false.
    pub(crate) fn subscribe_while(
        &self,
        child: Option<NodeId>,
        keep: Option<Keep>,
        callback: Callback<T, E>,
    ) {
        let replay = {
            let mut core = self.inner.core.borrow_mut();
            core.observed = true;
            let replay = match core.state {
                ResolutionState::Fulfilled => core.value.clone().map(Ok),
                ResolutionState::Rejected => core.error.clone().map(Err),
                ResolutionState::Pending => None,
            };
            // a settled one-shot node never dispatches again
            if !(self.inner.one_shot && replay.is_some()) {
                core.listeners.push(Listener {
                    child,
                    detached_at: None,
                    keep,
                    callback: callback.clone(),
                });
            }
            replay
        };
        if let Some(payload) = replay {
            callback(&payload, Delivery::Replay);
        }
    }

    /// Feeds a payload coming from a parent edge into this node.
    pub(crate) fn propagate(&self, payload: Result<T, E>, delivery: Delivery) {
        if delivery == Delivery::Replay && self.is_fresh() {
            self.commit(payload);
            return;
        }
        if let Err(err) = self.settle(payload) {
            warn!(node = %self.inner.id, error = %err, "settlement dropped");
        }
    }

    /// Derives a node of the same variant whose payloads are `f` applied to
    /// this node's payloads.
    pub(crate) fn chain<U, F>(&self, f: F) -> Node<U, E>
    where
        U: Clone + 'static,
        F: Fn(&Result<T, E>) -> Result<U, E> + 'static,
    {
        let derived = Node::new(&self.inner.scheduler, self.inner.one_shot);
        let target = derived.clone();
        self.subscribe(
            Some(derived.id()),
            Rc::new(move |payload: &Result<T, E>, delivery: Delivery| {
                target.propagate(f(payload), delivery)
            }),
        );
        derived
    }

    /// Derives a node that mirrors every node `f` hands back.
    ///
    /// Mirror edges accumulate on a repeatable derived node: each outer value
    /// adds one, and earlier inner nodes keep feeding it. A one-shot derived
    /// node drops its mirror edges once it has settled.
    pub(crate) fn pipe<U, N, F>(&self, f: F) -> Node<U, E>
    where
        U: Clone + 'static,
        N: Source<Value = U, Error = E>,
        F: Fn(T) -> Result<N, E> + 'static,
    {
        let derived = Node::new(&self.inner.scheduler, self.inner.one_shot);
        let target = derived.clone();
        self.subscribe(
            Some(derived.id()),
            Rc::new(move |payload: &Result<T, E>, delivery: Delivery| match payload {
                Ok(value) => match f(value.clone()) {
                    Ok(inner) => {
                        let keep: Option<Keep> = target.is_one_shot().then(|| {
                            let settled = target.clone();
                            Rc::new(move || !settled.is_resolved()) as Keep
                        });
                        let target = target.clone();
                        inner.as_node().subscribe_while(
                            None,
                            keep,
                            Rc::new(move |payload: &Result<U, E>, inner_delivery: Delivery| {
                                if target.is_one_shot() && target.is_resolved() {
                                    return;
                                }
                                target.propagate(payload.clone(), inner_delivery.within(delivery))
                            }),
                        );
                    }
                    Err(error) => target.propagate(Err(error), delivery),
                },
                Err(error) => target.propagate(Err(error.clone()), delivery),
            }),
        );
        derived
    }

    /// Removes the edge to a child created by `then`/`pipe` on this node.
    pub(crate) fn detach(&self, child: NodeId) -> Result<(), Error> {
        let policy = self.inner.scheduler.config().detach_policy;
        let removed = {
            let mut core = self.inner.core.borrow_mut();
            let Some(pos) = core
                .listeners
                .iter()
                .position(|l| l.child == Some(child) && l.detached_at.is_none())
            else {
                return Err(Error::NotAChild {
                    parent: self.inner.id,
                    child,
                });
            };
            if policy == DetachPolicy::DeliverPending && core.in_flight > 0 {
                core.listeners[pos].detached_at = Some(self.inner.scheduler.next_seq());
                None
            } else {
                Some(core.listeners.remove(pos))
            }
        };
        debug!(parent = %self.inner.id, child = %child, deferred = removed.is_none(), "detach");
        drop(removed);
        Ok(())
    }

    pub(crate) fn mark_failed_source(&self, index: usize) {
        self.inner.core.borrow_mut().failed_source = Some(index);
    }

    fn is_fresh(&self) -> bool {
        let core = self.inner.core.borrow();
        core.listeners.is_empty()
            && core.in_flight == 0
            && !(self.inner.one_shot && core.resolved)
    }

    /// Settles without a tick. Only used on nodes nobody listens to yet.
    fn commit(&self, payload: Result<T, E>) {
        let rejected = {
            let mut core = self.inner.core.borrow_mut();
            core.resolved = true;
            match payload {
                Ok(value) => {
                    core.state = ResolutionState::Fulfilled;
                    core.value = Some(value);
                    core.error = None;
                    false
                }
                Err(error) => {
                    core.state = ResolutionState::Rejected;
                    core.error = Some(error);
                    true
                }
            }
        };
        debug!(node = %self.inner.id, rejected, "commit");
        if rejected {
            let node = self.clone();
            self.inner
                .scheduler
                .enqueue(self.inner.id, move |_| node.check_handled());
        }
    }

    fn check_handled(&self) {
        let error = {
            let core = self.inner.core.borrow();
            if core.observed || core.state != ResolutionState::Rejected {
                return;
            }
            core.error.clone()
        };
        if let Some(error) = error {
            self.report_uncaught(&error);
        }
    }

    fn schedule_flush(&self) {
        let node = self.clone();
        self.inner
            .scheduler
            .enqueue(self.inner.id, move |seq| node.flush(seq));
    }

    fn flush(&self, seq: u64) {
        let (payload, snapshot) = {
            let mut core = self.inner.core.borrow_mut();
            core.in_flight = core.in_flight.saturating_sub(1);
            let Some(payload) = core.queued.pop_front() else {
                return;
            };
            match &payload {
                Ok(value) => {
                    core.state = ResolutionState::Fulfilled;
                    core.value = Some(value.clone());
                    core.error = None;
                }
                Err(error) => {
                    core.state = ResolutionState::Rejected;
                    core.error = Some(error.clone());
                }
            }
            core.listeners.retain(|l| l.live_at(seq));
            let snapshot: Vec<Callback<T, E>> =
                core.listeners.iter().map(|l| l.callback.clone()).collect();
            if self.inner.one_shot {
                core.listeners.clear();
            }
            (payload, snapshot)
        };
        debug!(node = %self.inner.id, seq, listeners = snapshot.len(), rejected = payload.is_err(), "flush");
        if let Err(error) = &payload {
            if snapshot.is_empty() {
                self.report_uncaught(error);
            }
        }
        for callback in &snapshot {
            callback(&payload, Delivery::Dispatch);
        }
    }

    #[cfg(test)]
    pub(crate) fn listener_count(&self) -> usize {
        self.inner.core.borrow().listeners.len()
    }

    fn report_uncaught(&self, error: &E) {
        let source_index = {
            let mut core = self.inner.core.borrow_mut();
            core.uncaught = true;
            core.failed_source
        };
        self.inner.scheduler.report_uncaught(UncaughtRejection {
            node: self.inner.id,
            source_index,
            message: format!("{error:?}"),
        });
    }
}

/// Anything backed by a [`Node`]: promises, streams, and references to them.
pub trait Source {
    type Value: Clone + 'static;
    type Error: Clone + fmt::Debug + 'static;

    #[doc(hidden)]
    fn as_node(&self) -> &Node<Self::Value, Self::Error>;

    fn id(&self) -> NodeId {
        self.as_node().id()
    }

    fn state(&self) -> ResolutionState {
        self.as_node().state()
    }

    fn is_resolved(&self) -> bool {
        self.as_node().is_resolved()
    }

    fn is_pending(&self) -> bool {
        self.as_node().is_pending()
    }

    fn is_fulfilled(&self) -> bool {
        self.as_node().is_fulfilled()
    }

    fn is_rejected(&self) -> bool {
        self.as_node().is_rejected()
    }

    fn is_uncaught(&self) -> bool {
        self.as_node().is_uncaught()
    }
}

impl<S: Source + ?Sized> Source for &S {
    type Value = S::Value;
    type Error = S::Error;

    fn as_node(&self) -> &Node<Self::Value, Self::Error> {
        (**self).as_node()
    }
}
