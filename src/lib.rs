//! Promises and streams for a single-threaded, tick-driven runtime.
//!
//! A [`Promise`] settles once; a [`Stream`] may be updated any number of
//! times. Both are handles to the same resolution core, and everything they
//! dispatch goes through one [`Scheduler`], which runs one dispatch unit per
//! tick. All listeners of one resolution see it in the same tick, in the order
//! they subscribed. Successive resolutions, even of the same stream, land on
//! separate ticks.
//!
//! Errors travel alongside values. A rejection flows down `then` edges until a
//! [`catch_error`](Promise::catch_error), [`error_then`](Promise::error_then) or
//! [`then_else`](Promise::then_else) turns it back into a value. One that
//! reaches a node nobody listens to is reported to the scheduler as an
//! [`UncaughtRejection`].
//!
//! ```
//! use promise_stream::{when, Promise, Scheduler, Source};
//!
//! let scheduler = Scheduler::new();
//! let a = Promise::<i32, String>::new(&scheduler);
//! let b = Promise::<i32, String>::new(&scheduler);
//! let total = when((&a, &b))
//!     .then(|(a, b)| if b == 0 { Err("div by zero".to_string()) } else { Ok(a / b) })
//!     .catch_error(|_| 0);
//! a.resolve(6).unwrap();
//! b.resolve(0).unwrap();
//! scheduler.run_until_idle();
//! assert_eq!(total.value(), Some(0));
//! assert!(scheduler.check().is_ok());
//! assert!(total.is_fulfilled());
//! ```
use thiserror::Error;

mod combinator;
mod config;
mod node;
pub mod promise;
mod scheduler;
pub mod stream;

pub use combinator::{when, whenever, Join};
pub use config::{DetachPolicy, SchedulerConfig, UncaughtPolicy};
pub use node::{Node, NodeId, ResolutionState, Source};
pub use promise::{Promise, Waiter};
pub use scheduler::{Defer, LocalPoolDefer, ManualDefer, Scheduler, TickHandle, UncaughtRejection};
pub use stream::{Stream, Updates};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("node {node} was already settled")]
    DoubleResolution { node: NodeId },
    #[error("uncaught rejection on node {node}: {message}")]
    Uncaught { node: NodeId, message: String },
    #[error("combinator {node} rejected by source {source_index}: {message}")]
    Combinator {
        node: NodeId,
        source_index: usize,
        message: String,
    },
    #[error("node {child} is not a direct child of node {parent}")]
    NotAChild { parent: NodeId, child: NodeId },
    #[error("node {node} was dropped before it settled")]
    Dropped { node: NodeId },
}

impl From<UncaughtRejection> for Error {
    fn from(rejection: UncaughtRejection) -> Self {
        match rejection.source_index {
            Some(source_index) => Error::Combinator {
                node: rejection.node,
                source_index,
                message: rejection.message,
            },
            None => Error::Uncaught {
                node: rejection.node,
                message: rejection.message,
            },
        }
    }
}

/// State of the waker slot shared by a consumer future and its listener.
#[derive(Debug)]
pub(crate) enum WakerState {
    /// Nothing to wake yet.
    Fresh,
    /// The listener side is gone.
    Tainted,
}
