//! `when` (all of) and `whenever` (any of) over tuples of sources.
//!
//! Both subscribe once to every source and keep the latest value per source.
//! `when` produces a [`Promise`] that resolves with the first complete tuple,
//! or rejects with the first source rejection, and then ignores its sources.
//! `whenever` produces a [`Stream`] that re-emits the full tuple on every
//! source update once all slots are filled, and passes rejections through
//! without closing.
//!
//! ```
//! use promise_stream::{when, Promise, Scheduler};
//!
//! let scheduler = Scheduler::new();
//! let a = Promise::<i32, String>::new(&scheduler);
//! let b = Promise::<i32, String>::new(&scheduler);
//! a.resolve(1).unwrap();
//! b.resolve(2).unwrap();
//! let sum = when((&a, &b)).map(|(a, b)| a + b);
//! scheduler.run_until_idle();
//! assert_eq!(sum.value(), Some(3));
//! ```
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use tracing::debug;

use crate::node::{Delivery, Node, Source};
use crate::{Promise, Stream};

/// A tuple of sources that share one error type.
pub trait Join: Sized {
    type Output: Clone + 'static;
    type Error: Clone + fmt::Debug + 'static;

    #[doc(hidden)]
    fn join(self, one_shot: bool) -> Node<Self::Output, Self::Error>;

    fn when(self) -> Promise<Self::Output, Self::Error> {
        Promise::from_node(self.join(true))
    }

    fn whenever(self) -> Stream<Self::Output, Self::Error> {
        Stream::from_node(self.join(false))
    }
}

pub fn when<S: Join>(sources: S) -> Promise<S::Output, S::Error> {
    sources.when()
}

pub fn whenever<S: Join>(sources: S) -> Stream<S::Output, S::Error> {
    sources.whenever()
}

/// Slot bookkeeping shared by every source edge of one combinator.
struct Gate<O, E> {
    target: Node<O, E>,
    seen: RefCell<Vec<bool>>,
    closed: Cell<bool>,
}

impl<O, E> Gate<O, E>
where
    O: Clone + 'static,
    E: Clone + fmt::Debug + 'static,
{
    fn new(target: Node<O, E>, arity: usize) -> Rc<Self> {
        Rc::new(Self {
            target,
            seen: RefCell::new(vec![false; arity]),
            closed: Cell::new(false),
        })
    }

    /// Whether a value from source `index` should overwrite its slot. `when`
    /// only keeps the first one.
    fn accepts(&self, index: usize) -> bool {
        !self.closed.get() && (!self.target.is_one_shot() || !self.seen.borrow()[index])
    }

    fn arrive(&self, index: usize, assemble: &dyn Fn() -> Option<O>, delivery: Delivery) {
        if self.closed.get() {
            return;
        }
        let complete = {
            let mut seen = self.seen.borrow_mut();
            seen[index] = true;
            seen.iter().all(|s| *s)
        };
        if !complete {
            return;
        }
        let Some(output) = assemble() else {
            return;
        };
        if self.target.is_one_shot() {
            self.closed.set(true);
        }
        self.target.propagate(Ok(output), delivery);
    }

    fn fail(&self, index: usize, error: E, delivery: Delivery) {
        if self.closed.get() {
            return;
        }
        if self.target.is_one_shot() {
            self.closed.set(true);
        }
        debug!(combinator = %self.target.id(), source_index = index, "source rejected");
        self.target.mark_failed_source(index);
        self.target.propagate(Err(error), delivery);
    }
}

macro_rules! impl_join {
    ($($idx:tt $S:ident),+) => {
        impl<E, $($S),+> Join for ($($S,)+)
        where
            E: Clone + fmt::Debug + 'static,
            $($S: Source<Error = E>,)+
        {
            type Output = ($(<$S as Source>::Value,)+);
            type Error = E;

            fn join(self, one_shot: bool) -> Node<Self::Output, E> {
                let target = Node::new(self.0.as_node().scheduler(), one_shot);
                let gate = Gate::new(target.clone(), [$($idx),+].len());
                let latest: Rc<RefCell<($(Option<<$S as Source>::Value>,)+)>> =
                    Rc::new(RefCell::new(Default::default()));
                let assemble: Rc<dyn Fn() -> Option<Self::Output>> = {
                    let latest = latest.clone();
                    Rc::new(move || {
                        let latest = latest.borrow();
                        Some(($(latest.$idx.clone()?,)+))
                    })
                };
                $(
                    {
                        let gate = gate.clone();
                        let latest = latest.clone();
                        let assemble = assemble.clone();
                        self.$idx.as_node().subscribe(
                            None,
                            Rc::new(move |payload: &Result<<$S as Source>::Value, E>, delivery: Delivery| {
                                match payload {
                                    Ok(value) => {
                                        if gate.accepts($idx) {
                                            latest.borrow_mut().$idx = Some(value.clone());
                                        }
                                        gate.arrive($idx, &*assemble, delivery);
                                    }
                                    Err(error) => gate.fail($idx, error.clone(), delivery),
                                }
                            }),
                        );
                    }
                )+
                target
            }
        }
    };
}

impl_join!(0 A);
impl_join!(0 A, 1 B);
impl_join!(0 A, 1 B, 2 C);
impl_join!(0 A, 1 B, 2 C, 3 D);
impl_join!(0 A, 1 B, 2 C, 3 D, 4 F);
impl_join!(0 A, 1 B, 2 C, 3 D, 4 F, 5 G);
impl_join!(0 A, 1 B, 2 C, 3 D, 4 F, 5 G, 6 H);
impl_join!(0 A, 1 B, 2 C, 3 D, 4 F, 5 G, 6 H, 7 I);
