use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt::Debug;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};

use crate::combinator::Join;
use crate::node::{Delivery, Keep, Node, Source};
use crate::{Error, Scheduler, WakerState};

/// A repeatable [`Node`]. Every update is dispatched on its own tick, in the
/// order it was made, to everyone listening at that tick.
///
/// External event sources feed a stream by calling [`update`](Self::update)
/// per event.
///
/// # Examples
///
/// ```
/// use promise_stream::{Scheduler, Stream};
///
/// let scheduler = Scheduler::new();
/// let clicks = Stream::<u32, ()>::new(&scheduler);
/// let doubled = clicks.map(|n| n * 2);
/// clicks.update(1);
/// clicks.update(2);
/// scheduler.tick();
/// scheduler.tick();
/// assert_eq!(clicks.value(), Some(2));
/// // `doubled` gets its own units behind both updates
/// assert_eq!(doubled.value(), None);
/// scheduler.run_until_idle();
/// assert_eq!(doubled.value(), Some(4));
/// ```
pub struct Stream<T, E> {
    node: Node<T, E>,
}

impl<T, E> Clone for Stream<T, E> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
        }
    }
}

impl<T, E> Debug for Stream<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Stream").field(&self.node).finish()
    }
}

impl<T, E> Stream<T, E>
where
    T: Clone + 'static,
    E: Clone + Debug + 'static,
{
    pub fn new(scheduler: &Scheduler) -> Self {
        Self::from_node(Node::new(scheduler, false))
    }

    pub(crate) fn from_node(node: Node<T, E>) -> Self {
        debug_assert!(!node.is_one_shot());
        Self { node }
    }

    pub fn update(&self, value: T) {
        self.node.queue(Ok(value))
    }

    /// Alias of [`update`](Self::update).
    pub fn resolve(&self, value: T) {
        self.update(value)
    }

    /// Rejects the current cycle. The stream stays usable; a later update
    /// fulfills it again.
    pub fn reject(&self, error: E) {
        self.node.queue(Err(error))
    }

    pub fn then<U, F>(&self, on_value: F) -> Stream<U, E>
    where
        U: Clone + 'static,
        F: Fn(T) -> Result<U, E> + 'static,
    {
        Stream::from_node(self.node.chain(move |payload| match payload {
            Ok(value) => on_value(value.clone()),
            Err(error) => Err(error.clone()),
        }))
    }

    pub fn then_else<U, F, H>(&self, on_value: F, on_error: H) -> Stream<U, E>
    where
        U: Clone + 'static,
        F: Fn(T) -> Result<U, E> + 'static,
        H: Fn(E) -> Result<U, E> + 'static,
    {
        Stream::from_node(self.node.chain(move |payload| match payload {
            Ok(value) => on_value(value.clone()),
            Err(error) => on_error(error.clone()),
        }))
    }

    pub fn map<U, F>(&self, f: F) -> Stream<U, E>
    where
        U: Clone + 'static,
        F: Fn(T) -> U + 'static,
    {
        self.then(move |value| Ok(f(value)))
    }

    /// Every value is handed to `f`; the derived stream mirrors each node `f`
    /// returns, from that point on.
    pub fn pipe<U, N, F>(&self, f: F) -> Stream<U, E>
    where
        U: Clone + 'static,
        N: Source<Value = U, Error = E>,
        F: Fn(T) -> Result<N, E> + 'static,
    {
        Stream::from_node(self.node.pipe(f))
    }

    pub fn catch_error<F>(&self, on_error: F) -> Stream<T, E>
    where
        F: Fn(E) -> T + 'static,
    {
        Stream::from_node(self.node.chain(move |payload| match payload {
            Ok(value) => Ok(value.clone()),
            Err(error) => Ok(on_error(error.clone())),
        }))
    }

    /// Same as [`catch_error`](Self::catch_error).
    pub fn error_then<F>(&self, on_error: F) -> Stream<T, E>
    where
        F: Fn(E) -> T + 'static,
    {
        self.catch_error(on_error)
    }

    /// Emits the tuple of latest values every time any source updates, once
    /// each source has produced a value.
    pub fn whenever<S>(sources: S) -> Self
    where
        S: Join<Output = T, Error = E>,
    {
        sources.whenever()
    }

    /// Stops dispatch from this stream to `child`, which must have been made
    /// by `then`/`pipe` (or one of their wrappers) on this very stream.
    pub fn detach_stream<C: Source>(&self, child: &C) -> Result<(), Error> {
        self.node.detach(child.id())
    }

    /// Last dispatched value, kept across later rejections.
    pub fn value(&self) -> Option<T> {
        self.node.value()
    }

    pub fn error(&self) -> Option<E> {
        self.node.error()
    }

    /// Every payload dispatched from now on, as a `futures` stream. Ends when
    /// this stream is dropped. Dropping the returned reader unsubscribes it at
    /// the next dispatch.
    pub fn updates(&self) -> Updates<T, E> {
        let inner = Rc::new(RefCell::new(Inner {
            buffer: VecDeque::new(),
            waker: Err(WakerState::Fresh),
        }));
        let sink = Sink {
            stream: Rc::downgrade(&inner),
        };
        let reader = Rc::downgrade(&inner);
        let keep: Keep = Rc::new(move || reader.strong_count() > 0);
        self.node.subscribe_while(
            None,
            Some(keep),
            Rc::new(move |payload: &Result<T, E>, delivery: Delivery| {
                // the value that was current before subscribing is not news
                if delivery == Delivery::Dispatch {
                    sink.push(payload.clone())
                }
            }),
        );
        Updates { stream: inner }
    }
}

impl<T, E> Source for Stream<T, E>
where
    T: Clone + 'static,
    E: Clone + Debug + 'static,
{
    type Value = T;
    type Error = E;

    fn as_node(&self) -> &Node<T, E> {
        &self.node
    }
}

#[derive(Debug)]
struct Inner<T, E> {
    buffer: VecDeque<Result<T, E>>,
    waker: Result<Waker, WakerState>,
}

struct Sink<T, E> {
    stream: Weak<RefCell<Inner<T, E>>>,
}

impl<T, E> Sink<T, E> {
    fn push(&self, payload: Result<T, E>) {
        let Some(stream) = self.stream.upgrade() else {
            return;
        };
        let mut stream = stream.borrow_mut();
        stream.buffer.push_back(payload);
        if let Ok(waker) = std::mem::replace(&mut stream.waker, Err(WakerState::Fresh)) {
            waker.wake()
        }
    }
}

impl<T, E> Drop for Sink<T, E> {
    fn drop(&mut self) {
        let Some(stream) = self.stream.upgrade() else {
            return;
        };
        let mut stream = stream.borrow_mut();
        if let Ok(waker) = std::mem::replace(&mut stream.waker, Err(WakerState::Tainted)) {
            waker.wake()
        }
    }
}

/// `futures::Stream` over a [`Stream`]'s dispatched payloads.
#[derive(Debug)]
pub struct Updates<T, E> {
    stream: Rc<RefCell<Inner<T, E>>>,
}

impl<T, E> futures::Stream for Updates<T, E> {
    type Item = Result<T, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut stream = self.stream.borrow_mut();
        if let Some(payload) = stream.buffer.pop_front() {
            return Poll::Ready(Some(payload));
        }
        match std::mem::replace(&mut stream.waker, Ok(cx.waker().clone())) {
            Err(WakerState::Tainted) => {
                stream.waker = Err(WakerState::Tainted);
                Poll::Ready(None)
            }
            _ => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::executor::block_on;
    use futures::StreamExt;
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::Stream;
    use crate::{Error, Scheduler, Source};

    #[test]
    fn test_updates_in_one_tick_spread_over_ticks() {
        let scheduler = Scheduler::new();
        let stream = Stream::<i32, ()>::new(&scheduler);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = seen.clone();
        let _child = stream.map(move |v| log.borrow_mut().push(v));
        stream.update(1);
        stream.update(2);
        stream.update(3);
        assert_eq!(scheduler.pending_units(), 3);
        for expected in 1..=3 {
            assert!(scheduler.tick());
            assert_eq!(seen.borrow().last(), Some(&expected));
        }
        assert_eq!(*seen.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn test_listener_added_mid_flush_gets_later_updates() {
        let scheduler = Scheduler::new();
        let stream = Stream::<i32, ()>::new(&scheduler);
        stream.update(1);
        stream.update(2);
        assert!(scheduler.tick());
        // replays the current value, then sees the queued one
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = seen.clone();
        let _late = stream.map(move |v| log.borrow_mut().push(v));
        assert_eq!(*seen.borrow(), vec![1]);
        scheduler.run_until_idle();
        assert_eq!(*seen.borrow(), vec![1, 2]);
    }

    #[test]
    fn test_stream_recovers_after_reject() {
        let scheduler = Scheduler::new();
        let stream = Stream::<i32, String>::new(&scheduler);
        let safe = stream.catch_error(|_| -1);
        stream.update(1);
        stream.reject("bad".into());
        stream.update(2);
        // stream(1), stream(err)
        scheduler.run_ticks(2);
        assert!(stream.is_rejected());
        assert_eq!(stream.error().as_deref(), Some("bad"));
        scheduler.run_until_idle();
        assert!(stream.is_fulfilled());
        assert_eq!(stream.error(), None);
        assert_eq!(safe.value(), Some(2));
        assert!(scheduler.take_uncaught().is_empty());
    }

    #[test]
    fn test_detach_direct_child() {
        let scheduler = Scheduler::new();
        let stream = Stream::<i32, ()>::new(&scheduler);
        let calls = Rc::new(RefCell::new(0));
        let counter = calls.clone();
        let child = stream.map(move |v| *counter.borrow_mut() += v);
        stream.update(1);
        scheduler.run_until_idle();
        stream.detach_stream(&child).unwrap();
        stream.update(10);
        scheduler.run_until_idle();
        assert_eq!(*calls.borrow(), 1);
    }

    #[test]
    fn test_detach_keeps_updates_made_before_it() {
        let scheduler = Scheduler::new();
        let stream = Stream::<i32, ()>::new(&scheduler);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = seen.clone();
        let child = stream.map(move |v| log.borrow_mut().push(v));
        stream.update(1);
        stream.update(2);
        stream.detach_stream(&child).unwrap();
        stream.update(3);
        scheduler.run_until_idle();
        assert_eq!(*seen.borrow(), vec![1, 2]);
    }

    #[test]
    fn test_detach_grandchild_rejected() {
        let scheduler = Scheduler::new();
        let stream = Stream::<i32, ()>::new(&scheduler);
        let child = stream.map(|v| v + 1);
        let grandchild = child.map(|v| v + 1);
        assert_eq!(
            stream.detach_stream(&grandchild),
            Err(Error::NotAChild {
                parent: stream.id(),
                child: grandchild.id()
            })
        );
        assert!(child.detach_stream(&grandchild).is_ok());
    }

    #[test]
    fn test_pipe_flattens_inner_streams() {
        let scheduler = Scheduler::new();
        let outer = Stream::<u8, ()>::new(&scheduler);
        let inner = Stream::<String, ()>::new(&scheduler);
        let handle = inner.clone();
        let piped = outer.pipe(move |_| Ok(handle.clone()));
        outer.update(0);
        scheduler.run_until_idle();
        inner.update("a".into());
        scheduler.run_until_idle();
        assert_eq!(piped.value().as_deref(), Some("a"));
        inner.update("b".into());
        scheduler.run_until_idle();
        assert_eq!(piped.value().as_deref(), Some("b"));
    }

    #[test]
    fn test_dropped_reader_is_unsubscribed() {
        let scheduler = Scheduler::new();
        let stream = Stream::<i32, String>::new(&scheduler);
        for _ in 0..3 {
            drop(stream.updates());
        }
        let kept = stream.updates();
        assert_eq!(stream.as_node().listener_count(), 4);
        stream.update(1);
        scheduler.run_until_idle();
        assert_eq!(stream.as_node().listener_count(), 1);
        drop(kept);
        // nobody is left to handle it
        stream.reject("lost".into());
        scheduler.run_until_idle();
        assert!(stream.is_uncaught());
    }

    #[test]
    fn test_updates_as_futures_stream() {
        let scheduler = Scheduler::new();
        let stream = Stream::<i32, String>::new(&scheduler);
        let updates = stream.updates();
        stream.update(1);
        stream.reject("oops".into());
        stream.update(3);
        scheduler.run_until_idle();
        drop(stream);
        let collected: Vec<_> = block_on(updates.collect());
        assert_eq!(collected, vec![Ok(1), Err("oops".to_string()), Ok(3)]);
    }
}
