//! A single-assignment deferred container with chainable continuations.
//!
//! A producer settles a [`Deferred`] exactly once through its [`Settler`],
//! with a value or a failure. Consumers chain continuations with
//! [`Deferred::then`], [`Deferred::catch`] and [`Deferred::finally`], before
//! or after the settlement, and each continuation runs exactly once on the
//! container's [`Scheduler`]. [`Deferred::all`] and [`Deferred::race`]
//! combine several containers, and [`Deferred::listen`] turns one into a
//! [`Future`](std::future::Future).
//!
//! ```
//! use deferred::{Deferred, Resolution, TaskQueue};
//!
//! let queue = TaskQueue::new();
//! let scheduler = queue.scheduler();
//! let (deferred, settler) = Deferred::<i32, String>::pair(&scheduler);
//! let doubled = deferred.then(|value| Ok(Resolution::Value(value * 2)));
//! settler.resolve(21);
//!
//! let listener = doubled.listen();
//! queue.run_until_idle();
//! assert_eq!(futures::executor::block_on(listener), Ok(Ok(42)));
//! ```
mod combinator;
pub mod deferred;
pub mod listen;
pub mod scheduler;

use thiserror::Error;

pub use crate::deferred::{Deferred, PassThrough, Resolution, Settler, Thenable};
pub use crate::listen::Listener;
pub use crate::scheduler::{Scheduler, SharedScheduler, Task, TaskQueue};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("a deferred needs a setup routine")]
    InvalidArgument,
    #[error("every settler was dropped before the deferred settled")]
    SettlerDropped,
}

#[derive(Debug)]
enum WakerState {
    Fresh,
    Tainted,
}
