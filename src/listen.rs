//! Awaiting a [`Deferred`] from async code.
//!
use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::{Deferred, Error, WakerState};

/// Completes with the outcome of a [`Deferred`].
///
/// Resolves to `Ok(Ok(value))` or `Ok(Err(reason))` once the container
/// settles, and to `Err(Error::SettlerDropped)` if it never can. Delivery
/// still goes through the container's scheduler, so that scheduler must be
/// driven for the listener to complete.
///
/// # Examples
///
/// ```
/// use deferred::{Deferred, SharedScheduler};
/// use futures::executor::LocalPool;
/// use std::rc::Rc;
///
/// let mut pool = LocalPool::new();
/// let scheduler: SharedScheduler = Rc::new(pool.spawner());
/// let (deferred, settler) = Deferred::<String, String>::pair(&scheduler);
/// settler.resolve("🍓".into());
/// assert_eq!(pool.run_until(deferred.listen()), Ok(Ok("🍓".to_string())));
/// ```
#[derive(Debug)]
pub struct Listener<T, E> {
    slot: Rc<RefCell<Slot<T, E>>>,
}

#[derive(Debug)]
struct Slot<T, E> {
    value: Option<Result<T, E>>,
    waker: Result<Waker, WakerState>,
}

/// Held by the callbacks registered on the container. Once both are gone
/// without delivering, nothing will.
struct Delivery<T, E> {
    slot: Rc<RefCell<Slot<T, E>>>,
}

impl<T, E> Delivery<T, E> {
    fn deliver(&self, outcome: Result<T, E>) {
        let mut slot = self.slot.borrow_mut();
        slot.value = Some(outcome);
        if let Ok(waker) = std::mem::replace(&mut slot.waker, Err(WakerState::Tainted)) {
            waker.wake()
        }
    }
}

impl<T, E> Drop for Delivery<T, E> {
    fn drop(&mut self) {
        let mut slot = self.slot.borrow_mut();
        if slot.value.is_none() {
            tracing::trace!("listener lost its deferred");
            if let Ok(waker) = std::mem::replace(&mut slot.waker, Err(WakerState::Tainted)) {
                waker.wake()
            }
        }
    }
}

impl<T, E> Listener<T, E>
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    pub(crate) fn new(deferred: &Deferred<T, E>) -> Self {
        let slot = Rc::new(RefCell::new(Slot {
            value: None,
            waker: Err(WakerState::Fresh),
        }));
        let delivery = Rc::new(Delivery { slot: slot.clone() });
        let rejected = delivery.clone();
        deferred.on_settle(
            Box::new(move |value| delivery.deliver(Ok(value))),
            Box::new(move |reason| rejected.deliver(Err(reason))),
        );
        Self { slot }
    }
}

impl<T, E> Future for Listener<T, E> {
    type Output = Result<Result<T, E>, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.slot.borrow_mut();
        match slot.value.take() {
            Some(outcome) => Poll::Ready(Ok(outcome)),
            None => match std::mem::replace(&mut slot.waker, Ok(cx.waker().clone())) {
                Err(WakerState::Tainted) => Poll::Ready(Err(Error::SettlerDropped)),
                _ => Poll::Pending,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{Deferred, Error, SharedScheduler, TaskQueue};
    use futures::executor::{block_on, LocalPool};
    use std::rc::Rc;

    #[test]
    fn test_listen_resolve() {
        let queue = TaskQueue::new();
        let (deferred, settler) = Deferred::<String, ()>::pair(&queue.scheduler());
        let listener = deferred.listen();
        settler.resolve(String::from("🍓"));
        queue.run_until_idle();
        assert_eq!(block_on(listener), Ok(Ok(String::from("🍓"))));
    }

    #[test]
    fn test_listen_reject() {
        let queue = TaskQueue::new();
        let (deferred, settler) = Deferred::<(), String>::pair(&queue.scheduler());
        settler.reject(String::from("reject!!"));
        let listener = deferred.listen();
        queue.run_until_idle();
        assert_eq!(block_on(listener), Ok(Err(String::from("reject!!"))));
    }

    #[test]
    fn test_two_listeners_resolve() {
        let mut pool = LocalPool::new();
        let scheduler: SharedScheduler = Rc::new(pool.spawner());
        let (deferred, settler) = Deferred::<String, ()>::pair(&scheduler);
        let first = deferred.listen();
        let second = deferred.listen();
        settler.resolve("hi".into());
        assert_eq!(pool.run_until(first), Ok(Ok("hi".to_string())));
        assert_eq!(pool.run_until(second), Ok(Ok("hi".to_string())));
    }

    #[test]
    fn test_listen_unresolved() {
        let queue = TaskQueue::new();
        let (deferred, settler) = Deferred::<String, ()>::pair(&queue.scheduler());
        let listener = deferred.listen();
        std::mem::drop(settler);
        assert_eq!(block_on(listener), Err(Error::SettlerDropped));
    }

    #[test]
    fn test_await_deferred() {
        let mut pool = LocalPool::new();
        let scheduler: SharedScheduler = Rc::new(pool.spawner());
        let deferred = Deferred::<i32, String>::resolve(&scheduler, 42);
        let result = pool.run_until(async move { deferred.await });
        assert_eq!(result, Ok(Ok(42)));
    }
}
