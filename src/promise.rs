use std::cell::RefCell;
use std::fmt::Debug;
use std::rc::Rc;
use std::{future::Future, task::{Poll, Waker}};

use crate::combinator::Join;
use crate::node::{Delivery, Node, NodeId, Source};
use crate::{Error, Scheduler, WakerState};

/// A one-shot [`Node`]: resolves or rejects at most once.
///
/// # Examples
///
/// ```
/// use promise_stream::{Promise, Scheduler, Source};
///
/// let scheduler = Scheduler::new();
/// let promise = Promise::<String, String>::new(&scheduler);
/// let greeting = promise.map(|name| format!("Hi {name}"));
/// promise.resolve("🍓".into()).unwrap();
/// assert!(promise.is_resolved());
/// assert!(promise.resolve("🍓".into()).is_err());
/// scheduler.run_until_idle();
/// assert_eq!(greeting.value().as_deref(), Some("Hi 🍓"));
/// ```
pub struct Promise<T, E> {
    node: Node<T, E>,
}

impl<T, E> Clone for Promise<T, E> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
        }
    }
}

impl<T, E> Debug for Promise<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Promise").field(&self.node).finish()
    }
}

impl<T, E> Promise<T, E>
where
    T: Clone + 'static,
    E: Clone + Debug + 'static,
{
    pub fn new(scheduler: &Scheduler) -> Self {
        Self::from_node(Node::new(scheduler, true))
    }

    pub(crate) fn from_node(node: Node<T, E>) -> Self {
        debug_assert!(node.is_one_shot());
        Self { node }
    }

    /// Fails with [`Error::DoubleResolution`] if already resolved or rejected.
    pub fn resolve(&self, value: T) -> Result<(), Error> {
        self.node.settle(Ok(value))
    }

    /// Fails with [`Error::DoubleResolution`] if already resolved or rejected.
    pub fn reject(&self, error: E) -> Result<(), Error> {
        self.node.settle(Err(error))
    }

    /// Chains `on_value` onto this promise. An `Err` from `on_value` rejects
    /// the derived promise; a rejection of this promise passes through.
    pub fn then<U, F>(&self, on_value: F) -> Promise<U, E>
    where
        U: Clone + 'static,
        F: Fn(T) -> Result<U, E> + 'static,
    {
        Promise::from_node(self.node.chain(move |payload| match payload {
            Ok(value) => on_value(value.clone()),
            Err(error) => Err(error.clone()),
        }))
    }

    /// Like [`then`](Self::then), with `on_error` handling a rejection of this
    /// promise.
    pub fn then_else<U, F, H>(&self, on_value: F, on_error: H) -> Promise<U, E>
    where
        U: Clone + 'static,
        F: Fn(T) -> Result<U, E> + 'static,
        H: Fn(E) -> Result<U, E> + 'static,
    {
        Promise::from_node(self.node.chain(move |payload| match payload {
            Ok(value) => on_value(value.clone()),
            Err(error) => on_error(error.clone()),
        }))
    }

    pub fn map<U, F>(&self, f: F) -> Promise<U, E>
    where
        U: Clone + 'static,
        F: Fn(T) -> U + 'static,
    {
        self.then(move |value| Ok(f(value)))
    }

    /// Chains onto the promise or stream `f` returns; the derived promise
    /// settles with whatever that node settles with first.
    pub fn pipe<U, N, F>(&self, f: F) -> Promise<U, E>
    where
        U: Clone + 'static,
        N: Source<Value = U, Error = E>,
        F: Fn(T) -> Result<N, E> + 'static,
    {
        Promise::from_node(self.node.pipe(f))
    }

    /// Stops a rejection here: the derived promise is fulfilled with
    /// `on_error`'s value instead.
    pub fn catch_error<F>(&self, on_error: F) -> Promise<T, E>
    where
        F: Fn(E) -> T + 'static,
    {
        Promise::from_node(self.node.chain(move |payload| match payload {
            Ok(value) => Ok(value.clone()),
            Err(error) => Ok(on_error(error.clone())),
        }))
    }

    /// Same as [`catch_error`](Self::catch_error); reads better where the
    /// recovered value is meant to keep flowing down the chain.
    pub fn error_then<F>(&self, on_error: F) -> Promise<T, E>
    where
        F: Fn(E) -> T + 'static,
    {
        self.catch_error(on_error)
    }

    /// Resolves with a tuple once every source has a value, or rejects with the
    /// first rejection.
    pub fn when<S>(sources: S) -> Self
    where
        S: Join<Output = T, Error = E>,
    {
        sources.when()
    }

    pub fn value(&self) -> Option<T> {
        self.node.value()
    }

    pub fn error(&self) -> Option<E> {
        self.node.error()
    }

    /// A future that completes once this promise is dispatched.
    pub fn wait(&self) -> Waiter<T, E> {
        let inner = Rc::new(RefCell::new(Inner {
            value: None,
            waker: Err(WakerState::Fresh),
        }));
        let sink = Sink {
            promise: inner.clone(),
        };
        self.node.subscribe(
            None,
            Rc::new(move |payload: &Result<T, E>, _: Delivery| sink.deliver(payload.clone())),
        );
        Waiter {
            node: self.node.id(),
            promise: inner,
        }
    }
}

impl<T, E> Source for Promise<T, E>
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
    value: Option<Result<T, E>>,
    waker: Result<Waker, WakerState>,
}

/// The listener half of a [`Waiter`]. Dropping it without a value taints the
/// waiter.
struct Sink<T, E> {
    promise: Rc<RefCell<Inner<T, E>>>,
}

impl<T, E> Sink<T, E> {
    fn deliver(&self, payload: Result<T, E>) {
        let mut promise = self.promise.borrow_mut();
        promise.value = Some(payload);
        if let Ok(waker) = std::mem::replace(&mut promise.waker, Err(WakerState::Fresh)) {
            waker.wake()
        }
    }
}

impl<T, E> Drop for Sink<T, E> {
    /// If the promise went away unsettled, wake with an error.
    fn drop(&mut self) {
        let mut promise = self.promise.borrow_mut();
        if let Ok(waker) = std::mem::replace(&mut promise.waker, Err(WakerState::Tainted)) {
            waker.wake()
        }
    }
}

/// Future returned by [`Promise::wait`].
#[derive(Debug)]
pub struct Waiter<T, E> {
    node: NodeId,
    promise: Rc<RefCell<Inner<T, E>>>,
}

impl<T, E> Future for Waiter<T, E> {
    type Output = Result<Result<T, E>, Error>;

    fn poll(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        let mut promise = self.promise.borrow_mut();
        match promise.value.take() {
            Some(value) => Poll::Ready(Ok(value)),
            None => match std::mem::replace(&mut promise.waker, Ok(cx.waker().clone())) {
                Err(WakerState::Tainted) => Poll::Ready(Err(Error::Dropped { node: self.node })),
                _ => Poll::Pending,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::executor::{block_on, LocalPool};
    use std::cell::Cell;
    use std::rc::Rc;

    use super::Promise;
    use crate::{Error, LocalPoolDefer, Scheduler, SchedulerConfig, Source, Stream};

    #[test]
    fn test_promise_resolve() {
        let scheduler = Scheduler::new();
        let promise = Promise::<String, ()>::new(&scheduler);
        let waiter = promise.wait();
        promise.resolve(String::from("🍓")).unwrap();
        scheduler.run_until_idle();
        assert_eq!(block_on(waiter), Ok(Ok(String::from("🍓"))));
    }

    #[test]
    fn test_promise_reject() {
        let scheduler = Scheduler::new();
        let promise = Promise::<(), String>::new(&scheduler);
        let waiter = promise.wait();
        promise.reject(String::from("reject!!")).unwrap();
        scheduler.run_until_idle();
        assert_eq!(block_on(waiter), Ok(Err(String::from("reject!!"))));
        assert!(promise.is_rejected());
        assert!(!promise.is_uncaught());
    }

    #[test]
    fn test_promise_resolve_twice() {
        let scheduler = Scheduler::new();
        let promise = Promise::<String, ()>::new(&scheduler);
        promise.resolve("hi".into()).unwrap();
        assert_eq!(
            promise.resolve("hi".into()),
            Err(Error::DoubleResolution { node: promise.id() })
        );
        assert_eq!(
            promise.reject(()),
            Err(Error::DoubleResolution { node: promise.id() })
        );
        // nothing extra was queued by the failed calls
        assert_eq!(scheduler.pending_units(), 1);
    }

    #[test]
    fn test_promise_unresolved_dropped() {
        let scheduler = Scheduler::new();
        let promise = Promise::<String, ()>::new(&scheduler);
        let id = promise.id();
        let waiter = promise.wait();
        drop(promise);
        assert_eq!(block_on(waiter), Err(Error::Dropped { node: id }));
    }

    #[test]
    fn test_wait_on_settled_promise() {
        let scheduler = Scheduler::new();
        let promise = Promise::<u8, ()>::new(&scheduler);
        promise.resolve(9).unwrap();
        scheduler.run_until_idle();
        assert_eq!(block_on(promise.wait()), Ok(Ok(9)));
    }

    #[test]
    fn test_then_fires_synchronously_on_fulfilled() {
        let scheduler = Scheduler::new();
        let promise = Promise::<i32, ()>::new(&scheduler);
        promise.resolve(4).unwrap();
        scheduler.run_until_idle();
        let calls = Rc::new(Cell::new(0));
        let seen = calls.clone();
        let derived = promise.then(move |v| {
            seen.set(seen.get() + 1);
            Ok(v + 1)
        });
        assert_eq!(calls.get(), 1);
        assert!(derived.is_fulfilled());
        assert_eq!(derived.value(), Some(5));
    }

    #[test]
    fn test_then_on_pending_waits_for_tick() {
        let scheduler = Scheduler::new();
        let promise = Promise::<i32, ()>::new(&scheduler);
        let derived = promise.map(|v| v * 3);
        promise.resolve(2).unwrap();
        assert!(promise.is_resolved());
        assert!(!promise.is_fulfilled());
        assert!(promise.is_pending());
        assert!(scheduler.tick());
        assert!(promise.is_fulfilled());
        assert!(!derived.is_fulfilled());
        assert!(scheduler.tick());
        assert_eq!(derived.value(), Some(6));
    }

    #[test]
    fn test_pipe_mirrors_inner_promise() {
        let scheduler = Scheduler::new();
        let outer = Promise::<i32, String>::new(&scheduler);
        let inner = Promise::<String, String>::new(&scheduler);
        let handle = inner.clone();
        let piped = outer.pipe(move |_| Ok(handle.clone()));
        outer.resolve(1).unwrap();
        scheduler.run_until_idle();
        assert!(piped.is_pending());
        inner.resolve("inner".into()).unwrap();
        scheduler.run_until_idle();
        assert_eq!(piped.value().as_deref(), Some("inner"));
    }

    #[test]
    fn test_pipe_onto_stream_lets_go_after_first_value() {
        let scheduler = Scheduler::new();
        let outer = Promise::<i32, ()>::new(&scheduler);
        let inner = Stream::<&str, ()>::new(&scheduler);
        let handle = inner.clone();
        let piped = outer.pipe(move |_| Ok(handle.clone()));
        outer.resolve(1).unwrap();
        scheduler.run_until_idle();
        inner.update("a");
        scheduler.run_until_idle();
        assert_eq!(piped.value(), Some("a"));
        assert_eq!(inner.as_node().listener_count(), 1);
        inner.update("b");
        scheduler.run_until_idle();
        assert_eq!(piped.value(), Some("a"));
        assert_eq!(inner.as_node().listener_count(), 0);
    }

    #[test]
    fn test_catch_error_stops_rejection() {
        let scheduler = Scheduler::new();
        let promise = Promise::<i32, String>::new(&scheduler);
        let recovered = promise
            .then(|v| Err::<i32, _>(format!("bad {v}")))
            .catch_error(|e| e.len() as i32);
        promise.resolve(1).unwrap();
        scheduler.run_until_idle();
        assert_eq!(recovered.value(), Some(5));
        assert!(scheduler.take_uncaught().is_empty());
    }

    #[test]
    fn test_then_else_handles_rejection() {
        let scheduler = Scheduler::new();
        let promise = Promise::<i32, String>::new(&scheduler);
        let handled = promise.then_else(|v| Ok(v.to_string()), |e| Ok(format!("recovered {e}")));
        promise.reject("x".into()).unwrap();
        scheduler.run_until_idle();
        assert_eq!(handled.value().as_deref(), Some("recovered x"));
    }

    #[test]
    fn test_wait_on_local_pool() {
        let mut pool = LocalPool::new();
        let scheduler =
            Scheduler::with_config(SchedulerConfig::default(), LocalPoolDefer::new(pool.spawner()));
        let promise = Promise::<i32, ()>::new(&scheduler);
        let sum = promise.map(|v| v + 1).map(|v| v * 2);
        let waiter = sum.wait();
        promise.resolve(1).unwrap();
        assert_eq!(pool.run_until(waiter), Ok(Ok(4)));
    }
}
