//! The deferred container: a single-assignment cell for the eventual result
//! of an asynchronous operation, with chainable continuations.
//!
//! A producer settles a container through a [`Settler`]; consumers chain on it
//! with [`Deferred::then`] and friends. Every callback runs on the container's
//! [`Scheduler`](crate::Scheduler), never inside the call that triggered it.
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::mem;
use std::rc::Rc;

use crate::scheduler::SharedScheduler;
use crate::Error;

type Callback<A> = Box<dyn FnOnce(A)>;

thread_local! {
    /// Callback queues of abandoned containers waiting to be dropped. `Some`
    /// while a cascade is being drained further up the stack.
    static ABANDONED: RefCell<Option<Vec<Box<dyn Any>>>> = const { RefCell::new(None) };
}

/// What a handler hands to the downstream container: a plain value, or
/// something to follow until it settles.
pub enum Resolution<T, E> {
    Value(T),
    Thenable(Box<dyn Thenable<T, E>>),
}

impl<T: fmt::Debug, E> fmt::Debug for Resolution<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Resolution::Thenable(_) => f.write_str("Thenable(..)"),
        }
    }
}

impl<T, E> From<Deferred<T, E>> for Resolution<T, E>
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    fn from(deferred: Deferred<T, E>) -> Self {
        Resolution::Thenable(Box::new(deferred))
    }
}

/// Anything exposing the chain capability. Resolving a container with a
/// thenable makes the container mirror it.
pub trait Thenable<T, E> {
    /// Registers exactly one of the two callbacks to fire once this settles.
    fn subscribe(
        self: Box<Self>,
        on_fulfilled: Box<dyn FnOnce(T)>,
        on_rejected: Box<dyn FnOnce(E)>,
    );
}

/// Handler passed as `None` to [`Deferred::then_optional`] when only one side
/// is given.
pub type PassThrough<T, E> = fn(T) -> Result<Resolution<T, E>, E>;

enum Status<T, E> {
    Pending,
    Fulfilled(T),
    Rejected(E),
}

struct State<T, E> {
    status: Status<T, E>,
    following: bool,
    fulfilled: Vec<Callback<T>>,
    rejected: Vec<Callback<E>>,
}

struct Shared<T, E> {
    scheduler: SharedScheduler,
    settlers: Cell<usize>,
    state: RefCell<State<T, E>>,
}

/// A single-assignment container for a value of type `T` or a failure of
/// type `E`.
///
/// Cloning is cheap and yields another handle to the same container.
///
/// # Examples
///
/// ```
/// use deferred::{Deferred, Resolution, TaskQueue};
/// use futures::executor::block_on;
///
/// let queue = TaskQueue::new();
/// let scheduler = queue.scheduler();
/// let message = Deferred::<i32, String>::new(&scheduler, |settler| {
///     settler.resolve(5);
///     Ok(())
/// })
/// .then(|value| Ok(Resolution::Value(value * 2)))
/// .then(|_: i32| -> Result<Resolution<String, String>, String> { Err("x".into()) })
/// .catch(|reason| Ok(Resolution::Value(reason)));
///
/// let listener = message.listen();
/// queue.run_until_idle();
/// assert_eq!(block_on(listener), Ok(Ok("x".to_string())));
/// ```
pub struct Deferred<T, E> {
    shared: Rc<Shared<T, E>>,
}

/// The producer side of a [`Deferred`]. Every clone settles the same
/// container; only the first settlement has any effect.
pub struct Settler<T: 'static, E: 'static> {
    shared: Rc<Shared<T, E>>,
}

impl<T, E> Clone for Deferred<T, E> {
    fn clone(&self) -> Self {
        Self { shared: Rc::clone(&self.shared) }
    }
}

impl<T, E> fmt::Debug for Deferred<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred").finish_non_exhaustive()
    }
}

impl<T: 'static, E: 'static> fmt::Debug for Settler<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settler")
            .field("settlers", &self.shared.settlers.get())
            .finish()
    }
}

impl<T, E> Deferred<T, E>
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    fn detached(scheduler: &SharedScheduler) -> Self {
        Self {
            shared: Rc::new(Shared {
                scheduler: Rc::clone(scheduler),
                settlers: Cell::new(0),
                state: RefCell::new(State {
                    status: Status::Pending,
                    following: false,
                    fulfilled: Vec::new(),
                    rejected: Vec::new(),
                }),
            }),
        }
    }

    fn settler(&self) -> Settler<T, E> {
        self.shared.settlers.set(self.shared.settlers.get() + 1);
        Settler { shared: Rc::clone(&self.shared) }
    }

    /// Creates a container and runs `setup` with its settler right away.
    ///
    /// An `Err` returned by `setup` rejects the container, unless `setup`
    /// already settled it.
    pub fn new<F>(scheduler: &SharedScheduler, setup: F) -> Self
    where
        F: FnOnce(Settler<T, E>) -> Result<(), E>,
    {
        let deferred = Self::detached(scheduler);
        let guard = deferred.settler();
        if let Err(reason) = setup(deferred.settler()) {
            tracing::trace!("deferred setup failed");
            guard.reject(reason);
        }
        deferred
    }

    /// Like [`Deferred::new`], but fails with [`Error::InvalidArgument`] when
    /// there is no setup routine to run.
    pub fn try_new<F>(scheduler: &SharedScheduler, setup: Option<F>) -> Result<Self, Error>
    where
        F: FnOnce(Settler<T, E>) -> Result<(), E>,
    {
        let setup = setup.ok_or(Error::InvalidArgument)?;
        Ok(Self::new(scheduler, setup))
    }

    /// A pending container and the settler that controls it.
    pub fn pair(scheduler: &SharedScheduler) -> (Self, Settler<T, E>) {
        let deferred = Self::detached(scheduler);
        let settler = deferred.settler();
        (deferred, settler)
    }

    /// A container fulfilled with `value`.
    pub fn resolve(scheduler: &SharedScheduler, value: T) -> Self {
        Self::resolve_with(scheduler, Resolution::Value(value))
    }

    /// A container settled from `resolution`; a thenable is followed.
    pub fn resolve_with(
        scheduler: &SharedScheduler,
        resolution: impl Into<Resolution<T, E>>,
    ) -> Self {
        let (deferred, settler) = Self::pair(scheduler);
        settler.resolve_with(resolution);
        deferred
    }

    /// A container rejected with `reason`.
    pub fn reject(scheduler: &SharedScheduler, reason: E) -> Self {
        let (deferred, settler) = Self::pair(scheduler);
        settler.reject(reason);
        deferred
    }

    pub fn scheduler(&self) -> &SharedScheduler {
        &self.shared.scheduler
    }

    /// Chains `on_fulfilled`; a rejection is forwarded unchanged.
    pub fn then<U, F>(&self, on_fulfilled: F) -> Deferred<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Result<Resolution<U, E>, E> + 'static,
    {
        self.chain(on_fulfilled, |reason| Err(reason))
    }

    /// Chains a handler for each outcome. Whichever runs settles the returned
    /// container.
    pub fn then_or_else<U, F, R>(&self, on_fulfilled: F, on_rejected: R) -> Deferred<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Result<Resolution<U, E>, E> + 'static,
        R: FnOnce(E) -> Result<Resolution<U, E>, E> + 'static,
    {
        self.chain(on_fulfilled, on_rejected)
    }

    /// Chains optional handlers. A missing fulfillment handler passes the
    /// value through; a missing rejection handler forwards the reason.
    pub fn then_optional<F, R>(
        &self,
        on_fulfilled: Option<F>,
        on_rejected: Option<R>,
    ) -> Deferred<T, E>
    where
        F: FnOnce(T) -> Result<Resolution<T, E>, E> + 'static,
        R: FnOnce(E) -> Result<Resolution<T, E>, E> + 'static,
    {
        self.chain(
            move |value| match on_fulfilled {
                Some(on_fulfilled) => on_fulfilled(value),
                None => Ok(Resolution::Value(value)),
            },
            move |reason| match on_rejected {
                Some(on_rejected) => on_rejected(reason),
                None => Err(reason),
            },
        )
    }

    /// Recovers from a rejection. A fulfilled value passes through.
    pub fn catch<R>(&self, on_rejected: R) -> Deferred<T, E>
    where
        R: FnOnce(E) -> Result<Resolution<T, E>, E> + 'static,
    {
        self.then_optional(None::<PassThrough<T, E>>, Some(on_rejected))
    }

    /// Runs `on_settled` on either outcome and keeps the original outcome.
    ///
    /// An `Err` from `on_settled` rejects the returned container instead. A
    /// returned thenable delays propagation until it settles, and its
    /// rejection replaces the original outcome.
    pub fn finally<X, F>(&self, on_settled: F) -> Deferred<T, E>
    where
        X: 'static,
        F: FnOnce() -> Result<Resolution<X, E>, E> + 'static,
    {
        // Only one of the two handlers ever runs.
        let on_settled = Rc::new(Cell::new(Some(on_settled)));
        let on_rejected = Rc::clone(&on_settled);
        let scheduler = Rc::clone(self.scheduler());
        let rejected_scheduler = Rc::clone(&scheduler);
        self.chain(
            move |value| settle_after(&scheduler, on_settled.take(), Ok(value)),
            move |reason| settle_after(&rejected_scheduler, on_rejected.take(), Err(reason)),
        )
    }

    /// A future completing once this container settles.
    pub fn listen(&self) -> crate::Listener<T, E> {
        crate::Listener::new(self)
    }

    fn chain<U, F, R>(&self, on_fulfilled: F, on_rejected: R) -> Deferred<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Result<Resolution<U, E>, E> + 'static,
        R: FnOnce(E) -> Result<Resolution<U, E>, E> + 'static,
    {
        let (next, settler) = Deferred::pair(self.scheduler());
        let fulfilled_settler = settler.clone();
        // A container returned from the rejection handler is followed exactly
        // as one returned from the fulfillment handler: it is never forced
        // into a rejection.
        self.on_settle(
            Box::new(move |value| fulfilled_settler.complete(on_fulfilled(value))),
            Box::new(move |reason| settler.complete(on_rejected(reason))),
        );
        next
    }

    /// Queues the callbacks while pending, or schedules the matching one when
    /// already settled.
    pub(crate) fn on_settle(&self, on_fulfilled: Callback<T>, on_rejected: Callback<E>) {
        let mut state = self.shared.state.borrow_mut();
        let settled = match &state.status {
            Status::Pending => None,
            Status::Fulfilled(value) => Some(Ok(value.clone())),
            Status::Rejected(reason) => Some(Err(reason.clone())),
        };
        match settled {
            None if self.shared.settlers.get() == 0 => {
                drop(state);
                tracing::trace!("deferred is abandoned; dropping callbacks");
            }
            None => {
                state.fulfilled.push(on_fulfilled);
                state.rejected.push(on_rejected);
            }
            Some(Ok(value)) => {
                drop(state);
                self.shared.scheduler.schedule(Box::new(move || on_fulfilled(value)));
            }
            Some(Err(reason)) => {
                drop(state);
                self.shared.scheduler.schedule(Box::new(move || on_rejected(reason)));
            }
        }
    }
}

impl<T, E> Thenable<T, E> for Deferred<T, E>
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    fn subscribe(
        self: Box<Self>,
        on_fulfilled: Box<dyn FnOnce(T)>,
        on_rejected: Box<dyn FnOnce(E)>,
    ) {
        self.on_settle(on_fulfilled, on_rejected);
    }
}

impl<T, E> std::future::IntoFuture for Deferred<T, E>
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    type Output = Result<Result<T, E>, Error>;
    type IntoFuture = crate::Listener<T, E>;

    fn into_future(self) -> Self::IntoFuture {
        self.listen()
    }
}

fn settle_after<T, E, X, F>(
    scheduler: &SharedScheduler,
    on_settled: Option<F>,
    outcome: Result<T, E>,
) -> Result<Resolution<T, E>, E>
where
    T: Clone + 'static,
    E: Clone + 'static,
    F: FnOnce() -> Result<Resolution<X, E>, E>,
{
    let Some(on_settled) = on_settled else {
        return outcome.map(Resolution::Value);
    };
    match on_settled()? {
        Resolution::Value(_) => outcome.map(Resolution::Value),
        Resolution::Thenable(pending) => {
            let (delayed, settler) = Deferred::pair(scheduler);
            let rejected_settler = settler.clone();
            pending.subscribe(
                Box::new(move |_| settler.complete(outcome.map(Resolution::Value))),
                Box::new(move |reason| rejected_settler.reject(reason)),
            );
            Ok(Resolution::from(delayed))
        }
    }
}

impl<T, E> Settler<T, E>
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    /// Fulfills the container with `value`.
    pub fn resolve(&self, value: T) {
        self.resolve_with(Resolution::Value(value));
    }

    /// Settles the container from `resolution`. A thenable is followed: the
    /// container mirrors its outcome, and other settlement calls are ignored
    /// meanwhile.
    pub fn resolve_with(&self, resolution: impl Into<Resolution<T, E>>) {
        if !self.accepts() {
            return;
        }
        match resolution.into() {
            Resolution::Value(value) => self.settle(Ok(value)),
            Resolution::Thenable(thenable) => {
                self.shared.state.borrow_mut().following = true;
                tracing::debug!("deferred following a thenable");
                let fulfilled_settler = self.clone();
                let rejected_settler = self.clone();
                thenable.subscribe(
                    Box::new(move |value| fulfilled_settler.settle(Ok(value))),
                    Box::new(move |reason| rejected_settler.settle(Err(reason))),
                );
            }
        }
    }

    /// Rejects the container with `reason`.
    pub fn reject(&self, reason: E) {
        if self.accepts() {
            self.settle(Err(reason));
        }
    }

    pub(crate) fn complete(&self, result: Result<Resolution<T, E>, E>) {
        match result {
            Ok(resolution) => self.resolve_with(resolution),
            Err(reason) => self.reject(reason),
        }
    }

    fn accepts(&self) -> bool {
        let state = self.shared.state.borrow();
        matches!(state.status, Status::Pending) && !state.following
    }

    fn settle(&self, outcome: Result<T, E>) {
        let (fulfilled, rejected) = {
            let mut state = self.shared.state.borrow_mut();
            if !matches!(state.status, Status::Pending) {
                return;
            }
            state.following = false;
            state.status = match &outcome {
                Ok(value) => Status::Fulfilled(value.clone()),
                Err(reason) => Status::Rejected(reason.clone()),
            };
            (mem::take(&mut state.fulfilled), mem::take(&mut state.rejected))
        };
        match outcome {
            Ok(value) => {
                tracing::trace!(callbacks = fulfilled.len(), "deferred fulfilled");
                drop(rejected);
                self.drain(fulfilled, value);
            }
            Err(reason) => {
                if rejected.is_empty() {
                    tracing::trace!("deferred rejected with no rejection callbacks");
                } else {
                    tracing::trace!(callbacks = rejected.len(), "deferred rejected");
                }
                drop(fulfilled);
                self.drain(rejected, reason);
            }
        }
    }

    fn drain<A: Clone + 'static>(&self, callbacks: Vec<Callback<A>>, settled: A) {
        if callbacks.is_empty() {
            return;
        }
        self.shared.scheduler.schedule(Box::new(move || {
            for callback in callbacks {
                callback(settled.clone());
            }
        }));
    }
}

impl<T: 'static, E: 'static> Clone for Settler<T, E> {
    fn clone(&self) -> Self {
        self.shared.settlers.set(self.shared.settlers.get() + 1);
        Self { shared: Rc::clone(&self.shared) }
    }
}

impl<T: 'static, E: 'static> Drop for Settler<T, E> {
    /// The last settler of a pending container abandons it: nothing can
    /// settle it any more, so its callbacks are dropped.
    fn drop(&mut self) {
        let remaining = self.shared.settlers.get() - 1;
        self.shared.settlers.set(remaining);
        if remaining > 0 {
            return;
        }
        let abandoned = {
            let mut state = self.shared.state.borrow_mut();
            match state.status {
                Status::Pending => {
                    Some((mem::take(&mut state.fulfilled), mem::take(&mut state.rejected)))
                }
                _ => None,
            }
        };
        if let Some((fulfilled, rejected)) = abandoned {
            tracing::debug!(callbacks = fulfilled.len(), "deferred abandoned while pending");
            release(Box::new((fulfilled, rejected)));
        }
    }
}

/// Drops abandoned callback queues without recursing. The callbacks hold the
/// settlers of downstream containers, so dropping them can abandon those in
/// turn; nested calls only queue their work for the outermost one.
fn release(queues: Box<dyn Any>) {
    // During thread teardown the worklist is gone and the queues drop inline.
    let first = ABANDONED.try_with(|cell| {
        let mut cascade = cell.borrow_mut();
        match cascade.as_mut() {
            Some(pending) => {
                pending.push(queues);
                None
            }
            None => {
                *cascade = Some(Vec::new());
                Some(queues)
            }
        }
    });
    let Ok(Some(first)) = first else {
        return;
    };
    drop(first);
    loop {
        let next = ABANDONED.with(|cell| cell.borrow_mut().as_mut().and_then(Vec::pop));
        match next {
            Some(queues) => drop(queues),
            None => break,
        }
    }
    ABANDONED.with(|cell| *cell.borrow_mut() = None);
}
