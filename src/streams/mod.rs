//! Pull-based reactive stream kernel.
//!
//! The kernel implements a small reactive-streams dialect built around
//! three pieces:
//!
//! - [`Publisher<T>`]: a lazy, single-use sequence of `T`. Subscribing
//!   consumes the publisher, so single-subscription is enforced by move
//!   semantics rather than a runtime flag.
//! - [`Subscriber<T>`]: a sink observing four events — `on_subscribe`,
//!   `on_next`, `on_complete`, `on_error`. After a terminal event no
//!   further events are delivered.
//! - [`Subscription`]: the back-channel from subscriber to publisher
//!   carrying `request(n)` demand and `cancel()`.
//!
//! A publisher is quiescent until demand arrives, may then emit at most the
//! accumulated demand, and becomes quiescent again. Demand is additive.
//! Reentrant `request` calls from inside `on_next` are supported: operators
//! run a drain loop guarded by an `in_drain` flag, so reentry only bumps a
//! counter and the outer loop picks it up. This keeps emission FIFO at
//! constant stack depth.
//!
//! All kernel types are `Rc`-based and `!Send`: the whole core runs on one
//! cooperative reactor thread, and the compiler enforces it.
//!
//! # Example
//!
//! ```rust
//! use argus::streams::{of, map, take};
//!
//! let doubled = (of(vec![1, 2, 3, 4]) >> map(|x| x * 2) >> take(3))
//!     .collect()
//!     .unwrap();
//! assert_eq!(doubled, vec![2, 4, 6]);
//! ```

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{Error, Result};

pub mod ops;
pub mod publishers;

pub use ops::{
    do_finally, flat_map, lift, map, repeat_if, take, DoFinally, FlatMap, Lift, Map, Operator,
    RepeatIf, Take,
};
pub use publishers::{empty, error, generate, live, merge, of, range, LiveObserver};

/// Sink side of a stream.
///
/// Methods take `&self`: subscriber implementations live behind `Rc` and
/// keep their state in `Cell`/`RefCell`, because publisher and subscriber
/// hold references to each other for the lifetime of the subscription.
pub trait Subscriber<T> {
    /// Called at most once, before any `on_next`, with the back-channel.
    /// Trivially finished sequences may deliver a terminal event without
    /// ever subscribing.
    fn on_subscribe(&self, subscription: Subscription);
    /// Called once per item, never exceeding the requested demand.
    fn on_next(&self, item: T);
    /// Terminal: the sequence ended normally.
    fn on_complete(&self);
    /// Terminal: the sequence ended with an error.
    fn on_error(&self, error: Error);
}

/// Emission handle passed to generator callbacks and captured by live
/// sources.
pub trait Observer<T> {
    /// Emit one item.
    fn on_next(&self, item: T);
    /// Finish the sequence.
    fn on_complete(&self);
    /// Fail the sequence.
    fn on_error(&self, error: Error);
}

pub(crate) trait Demand {
    fn request(&self, n: u64);
    fn cancel(&self);
}

/// Back-channel handle from subscriber to publisher.
///
/// Cloning the handle does not duplicate the stream; all clones drive the
/// same producer state.
#[derive(Clone)]
pub struct Subscription {
    producer: Rc<dyn Demand>,
}

impl Subscription {
    pub(crate) fn new(producer: Rc<dyn Demand>) -> Self {
        Self { producer }
    }

    /// Add `n` to the pending demand. The publisher may deliver up to the
    /// accumulated demand and no more.
    pub fn request(&self, n: u64) {
        self.producer.request(n);
    }

    /// Tear the stream down. Cancellation propagates upstream and is
    /// silent downstream: the caller that cancelled receives no
    /// `on_complete`.
    pub fn cancel(&self) {
        self.producer.cancel();
    }
}

pub(crate) trait PublisherCore<T> {
    fn attach(self: Box<Self>, sink: Rc<dyn Subscriber<T>>);
}

/// A lazy, single-use sequence of `T`.
///
/// Subscribing consumes the publisher. Compose operators with the `>>`
/// pipe (or the equivalent [`pipe`](Publisher::pipe) method):
///
/// ```rust
/// use argus::streams::{range, map};
///
/// let squares = (range(0, 4) >> map(|x| x * x)).collect().unwrap();
/// assert_eq!(squares, vec![0, 1, 4, 9]);
/// ```
pub struct Publisher<T> {
    core: Box<dyn PublisherCore<T>>,
}

impl<T: 'static> Publisher<T> {
    pub(crate) fn from_core(core: impl PublisherCore<T> + 'static) -> Self {
        Self {
            core: Box::new(core),
        }
    }

    /// Attach `sink` to this publisher. The publisher immediately invokes
    /// `sink.on_subscribe` (or a terminal event for trivially finished
    /// sequences) and is quiescent until the sink requests demand.
    pub fn subscribe(self, sink: Rc<dyn Subscriber<T>>) {
        self.core.attach(sink);
    }

    /// Apply an operator, yielding the transformed publisher. Equivalent
    /// to `self >> op`.
    pub fn pipe<O: Operator<T>>(self, op: O) -> Publisher<O::Out> {
        op.apply(self)
    }

    /// Drive the stream to completion with closures, requesting one item
    /// at a time. This is the standard terminal consumer: request 1,
    /// process, request 1 again.
    pub fn process(
        self,
        on_next: impl FnMut(T) + 'static,
        on_complete: impl FnOnce() + 'static,
        on_error: impl FnOnce(Error) + 'static,
    ) {
        struct ProcessSink<T, N, C, E> {
            on_next: RefCell<N>,
            on_complete: RefCell<Option<C>>,
            on_error: RefCell<Option<E>>,
            upstream: RefCell<Option<Subscription>>,
            _marker: std::marker::PhantomData<fn(T)>,
        }

        impl<T, N, C, E> Subscriber<T> for ProcessSink<T, N, C, E>
        where
            N: FnMut(T),
            C: FnOnce(),
            E: FnOnce(Error),
        {
            fn on_subscribe(&self, subscription: Subscription) {
                *self.upstream.borrow_mut() = Some(subscription.clone());
                subscription.request(1);
            }

            fn on_next(&self, item: T) {
                (&mut *self.on_next.borrow_mut())(item);
                let upstream = self.upstream.borrow().clone();
                if let Some(upstream) = upstream {
                    upstream.request(1);
                }
            }

            fn on_complete(&self) {
                self.upstream.borrow_mut().take();
                if let Some(f) = self.on_complete.borrow_mut().take() {
                    f();
                }
            }

            fn on_error(&self, error: Error) {
                self.upstream.borrow_mut().take();
                if let Some(f) = self.on_error.borrow_mut().take() {
                    f(error);
                }
            }
        }

        self.subscribe(Rc::new(ProcessSink {
            on_next: RefCell::new(on_next),
            on_complete: RefCell::new(Some(on_complete)),
            on_error: RefCell::new(Some(on_error)),
            upstream: RefCell::new(None),
            _marker: std::marker::PhantomData,
        }));
    }

    /// Collect a synchronously-terminating stream into a `Vec`.
    ///
    /// Returns the stream's error if it failed, and [`Error::Reactor`] if
    /// the publisher did not terminate before `subscribe` returned (a live
    /// source, for instance). Intended for finite sources and tests.
    pub fn collect(self) -> Result<Vec<T>> {
        let items = Rc::new(RefCell::new(Vec::new()));
        let outcome: Rc<RefCell<Option<Result<()>>>> = Rc::new(RefCell::new(None));

        let items_next = items.clone();
        let outcome_complete = outcome.clone();
        let outcome_error = outcome.clone();
        self.process(
            move |item| items_next.borrow_mut().push(item),
            move || *outcome_complete.borrow_mut() = Some(Ok(())),
            move |error| *outcome_error.borrow_mut() = Some(Err(error)),
        );

        let result = outcome.borrow_mut().take();
        match result {
            Some(Ok(())) => Ok(items.take()),
            Some(Err(error)) => Err(error),
            None => Err(Error::Reactor(
                "publisher did not terminate synchronously".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_requests_one_at_a_time() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let done = Rc::new(std::cell::Cell::new(false));

        let seen2 = seen.clone();
        let done2 = done.clone();
        publishers::range(0, 5).process(
            move |x| seen2.borrow_mut().push(x),
            move || done2.set(true),
            |e| panic!("unexpected error: {e}"),
        );

        assert_eq!(*seen.borrow(), vec![0, 1, 2, 3, 4]);
        assert!(done.get());
    }

    #[test]
    fn test_collect_propagates_error() {
        let result = publishers::error::<i64>(Error::EndOfStream).collect();
        assert!(matches!(result, Err(Error::EndOfStream)));
    }

    #[test]
    fn test_collect_on_nonterminating_source_reports_reactor_error() {
        let silent: Publisher<i64> = publishers::live(|_observer| {});
        let result = silent.collect();
        assert!(matches!(result, Err(Error::Reactor(_))));
    }
}
