//! Aggregating several deferred containers into one.
use std::cell::RefCell;
use std::rc::Rc;

use crate::scheduler::SharedScheduler;
use crate::{Deferred, Resolution};

struct Collected<T> {
    values: Vec<Option<T>>,
    remaining: usize,
}

impl<T, E> Deferred<T, E>
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    /// Fulfills with every input's value, in input order, once all of them
    /// fulfill. The first rejection rejects the aggregate.
    ///
    /// Plain values count as already fulfilled. With no inputs the aggregate
    /// fulfills with an empty `Vec`.
    ///
    /// # Examples
    ///
    /// ```
    /// use deferred::{Deferred, Resolution, TaskQueue};
    /// use futures::executor::block_on;
    ///
    /// let queue = TaskQueue::new();
    /// let scheduler = queue.scheduler();
    /// let all = Deferred::<i32, String>::all(
    ///     &scheduler,
    ///     vec![
    ///         Deferred::<i32, String>::resolve(&scheduler, 1).into(),
    ///         Resolution::Value(2),
    ///         Deferred::<i32, String>::resolve(&scheduler, 3).into(),
    ///     ],
    /// );
    /// let listener = all.listen();
    /// queue.run_until_idle();
    /// assert_eq!(block_on(listener), Ok(Ok(vec![1, 2, 3])));
    /// ```
    pub fn all<I>(scheduler: &SharedScheduler, inputs: I) -> Deferred<Vec<T>, E>
    where
        I: IntoIterator,
        I::Item: Into<Resolution<T, E>>,
    {
        let inputs: Vec<Deferred<T, E>> = inputs
            .into_iter()
            .map(|input| Self::resolve_with(scheduler, input))
            .collect();
        let (aggregate, settler) = Deferred::pair(scheduler);
        if inputs.is_empty() {
            settler.resolve(Vec::new());
            return aggregate;
        }
        let collected = Rc::new(RefCell::new(Collected {
            values: inputs.iter().map(|_| None).collect(),
            remaining: inputs.len(),
        }));
        for (index, input) in inputs.into_iter().enumerate() {
            let collected = collected.clone();
            let fulfilled_settler = settler.clone();
            let rejected_settler = settler.clone();
            input.on_settle(
                Box::new(move |value| {
                    let mut collected = collected.borrow_mut();
                    collected.values[index] = Some(value);
                    collected.remaining -= 1;
                    if collected.remaining > 0 {
                        return;
                    }
                    let values = collected
                        .values
                        .iter_mut()
                        .map(Option::take)
                        .collect::<Option<Vec<T>>>();
                    drop(collected);
                    if let Some(values) = values {
                        fulfilled_settler.resolve(values);
                    }
                }),
                Box::new(move |reason| rejected_settler.reject(reason)),
            );
        }
        aggregate
    }

    /// Settles like whichever input settles first, either way.
    ///
    /// With no inputs the aggregate never settles.
    pub fn race<I>(scheduler: &SharedScheduler, inputs: I) -> Deferred<T, E>
    where
        I: IntoIterator,
        I::Item: Into<Resolution<T, E>>,
    {
        let (aggregate, settler) = Deferred::pair(scheduler);
        for input in inputs {
            let fulfilled_settler = settler.clone();
            let rejected_settler = settler.clone();
            Self::resolve_with(scheduler, input).on_settle(
                Box::new(move |value| fulfilled_settler.resolve(value)),
                Box::new(move |reason| rejected_settler.reject(reason)),
            );
        }
        aggregate
    }
}

#[cfg(test)]
mod tests {
    use crate::{Deferred, Error, Resolution, TaskQueue};
    use futures::executor::block_on;

    #[test]
    fn test_all_empty_fulfills_immediately() {
        let queue = TaskQueue::new();
        let scheduler = queue.scheduler();
        let all = Deferred::<i32, String>::all(&scheduler, Vec::<Resolution<i32, String>>::new());
        let listener = all.listen();
        queue.run_until_idle();
        assert_eq!(block_on(listener), Ok(Ok(vec![])));
    }

    #[test]
    fn test_all_keeps_input_order() {
        let queue = TaskQueue::new();
        let scheduler = queue.scheduler();
        let (first, first_settler) = Deferred::<i32, String>::pair(&scheduler);
        let (second, second_settler) = Deferred::<i32, String>::pair(&scheduler);
        let all = Deferred::<i32, String>::all(&scheduler, vec![first, second]);
        let listener = all.listen();
        second_settler.resolve(2);
        queue.run_until_idle();
        first_settler.resolve(1);
        queue.run_until_idle();
        assert_eq!(block_on(listener), Ok(Ok(vec![1, 2])));
    }

    #[test]
    fn test_all_first_rejection_wins() {
        for rejection_first in [true, false] {
            let queue = TaskQueue::new();
            let scheduler = queue.scheduler();
            let (c1, s1) = Deferred::<i32, String>::pair(&scheduler);
            let (c2, s2) = Deferred::<i32, String>::pair(&scheduler);
            let (c3, s3) = Deferred::<i32, String>::pair(&scheduler);
            let listener = Deferred::<i32, String>::all(&scheduler, vec![c1, c2, c3]).listen();
            if rejection_first {
                s2.reject("R".into());
                s3.resolve(3);
                s1.resolve(1);
            } else {
                s3.resolve(3);
                s1.resolve(1);
                queue.run_until_idle();
                s2.reject("R".into());
            }
            queue.run_until_idle();
            assert_eq!(block_on(listener), Ok(Err("R".to_string())));
        }
    }

    #[test]
    fn test_race_first_settlement_wins() {
        let queue = TaskQueue::new();
        let scheduler = queue.scheduler();
        let (slow, slow_settler) = Deferred::<i32, String>::pair(&scheduler);
        let (fast, fast_settler) = Deferred::<i32, String>::pair(&scheduler);
        let listener = Deferred::<i32, String>::race(&scheduler, vec![slow, fast]).listen();
        fast_settler.reject("fast".into());
        queue.run_until_idle();
        slow_settler.resolve(1);
        queue.run_until_idle();
        assert_eq!(block_on(listener), Ok(Err("fast".to_string())));
    }

    #[test]
    fn test_race_plain_value_wins() {
        let queue = TaskQueue::new();
        let scheduler = queue.scheduler();
        let (pending, _settler) = Deferred::<i32, String>::pair(&scheduler);
        let inputs: Vec<Resolution<i32, String>> = vec![pending.into(), Resolution::Value(7)];
        let listener = Deferred::<i32, String>::race(&scheduler, inputs).listen();
        queue.run_until_idle();
        assert_eq!(block_on(listener), Ok(Ok(7)));
    }

    #[test]
    fn test_race_empty_never_settles() {
        let queue = TaskQueue::new();
        let scheduler = queue.scheduler();
        let race = Deferred::<i32, String>::race(&scheduler, Vec::<Resolution<i32, String>>::new());
        let listener = race.listen();
        assert_eq!(queue.run_until_idle(), 0);
        assert_eq!(block_on(listener), Err(Error::SettlerDropped));
    }
}
