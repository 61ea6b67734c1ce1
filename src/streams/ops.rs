//! Composable stream operators.
//!
//! An operator is a value describing a transformation; applying it to a
//! [`Publisher`] (via `>>` or [`Publisher::pipe`]) yields a new publisher.
//! At subscribe time the operator materializes an *instance*: an `Rc`
//! shared between the upstream (which sees it as a [`Subscriber`]) and the
//! downstream (which sees it as the producer behind its [`Subscription`]).
//!
//! Instances release both links on any terminal event — complete, error,
//! or downstream cancel — which breaks the upstream/downstream reference
//! cycle and lets the whole chain drop.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::ops::Shr;
use std::rc::{Rc, Weak};

use super::{Demand, Error, Publisher, PublisherCore, Subscriber, Subscription};

/// A publisher transformation. `Out` is the element type of the resulting
/// publisher.
pub trait Operator<S> {
    /// Element type produced by the transformed publisher.
    type Out: 'static;

    /// Consume the operator and the source, yielding the transformed
    /// publisher.
    fn apply(self, source: Publisher<S>) -> Publisher<Self::Out>;
}

impl<T: 'static, O: Operator<T>> Shr<O> for Publisher<T> {
    type Output = Publisher<O::Out>;

    fn shr(self, op: O) -> Self::Output {
        op.apply(self)
    }
}

// ============================================================================
// map
// ============================================================================

/// Transform each item synchronously. Demand passes through unchanged.
pub fn map<S, T, F>(f: F) -> Map<F>
where
    F: FnMut(S) -> T,
{
    Map { f }
}

/// See [`map`].
pub struct Map<F> {
    f: F,
}

impl<S, T, F> Operator<S> for Map<F>
where
    S: 'static,
    T: 'static,
    F: FnMut(S) -> T + 'static,
{
    type Out = T;

    fn apply(self, source: Publisher<S>) -> Publisher<T> {
        struct Core<S, F> {
            source: Publisher<S>,
            f: F,
        }

        impl<S, T, F> PublisherCore<T> for Core<S, F>
        where
            S: 'static,
            T: 'static,
            F: FnMut(S) -> T + 'static,
        {
            fn attach(self: Box<Self>, sink: Rc<dyn Subscriber<T>>) {
                let me = *self;
                let inst = Rc::new_cyclic(|this| MapInst {
                    f: RefCell::new(me.f),
                    sink: RefCell::new(Some(sink)),
                    upstream: RefCell::new(None),
                    this: this.clone(),
                    _marker: PhantomData,
                });
                me.source.subscribe(inst);
            }
        }

        Publisher::from_core(Core {
            source,
            f: self.f,
        })
    }
}

struct MapInst<S, T, F> {
    f: RefCell<F>,
    sink: RefCell<Option<Rc<dyn Subscriber<T>>>>,
    upstream: RefCell<Option<Subscription>>,
    this: Weak<MapInst<S, T, F>>,
    _marker: PhantomData<fn(S)>,
}

impl<S, T, F> Subscriber<S> for MapInst<S, T, F>
where
    S: 'static,
    T: 'static,
    F: FnMut(S) -> T + 'static,
{
    fn on_subscribe(&self, subscription: Subscription) {
        *self.upstream.borrow_mut() = Some(subscription);
        let sink = self.sink.borrow().clone();
        if let Some(sink) = sink {
            let this = self.this.upgrade().expect("operator instance alive");
            sink.on_subscribe(Subscription::new(this));
        }
    }

    fn on_next(&self, item: S) {
        let mapped = (&mut *self.f.borrow_mut())(item);
        let sink = self.sink.borrow().clone();
        if let Some(sink) = sink {
            sink.on_next(mapped);
        }
    }

    fn on_complete(&self) {
        self.upstream.borrow_mut().take();
        if let Some(sink) = self.sink.borrow_mut().take() {
            sink.on_complete();
        }
    }

    fn on_error(&self, error: Error) {
        self.upstream.borrow_mut().take();
        if let Some(sink) = self.sink.borrow_mut().take() {
            sink.on_error(error);
        }
    }
}

impl<S, T, F> Demand for MapInst<S, T, F>
where
    S: 'static,
    T: 'static,
    F: FnMut(S) -> T + 'static,
{
    fn request(&self, n: u64) {
        let upstream = self.upstream.borrow().clone();
        if let Some(upstream) = upstream {
            upstream.request(n);
        }
    }

    fn cancel(&self) {
        let upstream = self.upstream.borrow_mut().take();
        self.sink.borrow_mut().take();
        if let Some(upstream) = upstream {
            upstream.cancel();
        }
    }
}

// ============================================================================
// take
// ============================================================================

/// Forward the first `n` items, then cancel upstream and complete
/// downstream. Demand to the upstream is capped at `n - emitted`.
pub fn take(n: u64) -> Take {
    Take { n }
}

/// See [`take`].
pub struct Take {
    n: u64,
}

impl<T: 'static> Operator<T> for Take {
    type Out = T;

    fn apply(self, source: Publisher<T>) -> Publisher<T> {
        struct Core<T> {
            source: Publisher<T>,
            n: u64,
        }

        impl<T: 'static> PublisherCore<T> for Core<T> {
            fn attach(self: Box<Self>, sink: Rc<dyn Subscriber<T>>) {
                let me = *self;
                let inst = Rc::new_cyclic(|this| TakeInst {
                    remaining: Cell::new(me.n),
                    outstanding: Cell::new(0),
                    sink: RefCell::new(Some(sink)),
                    upstream: RefCell::new(None),
                    this: this.clone(),
                });
                me.source.subscribe(inst);
            }
        }

        Publisher::from_core(Core {
            source,
            n: self.n,
        })
    }
}

struct TakeInst<T> {
    remaining: Cell<u64>,
    outstanding: Cell<u64>,
    sink: RefCell<Option<Rc<dyn Subscriber<T>>>>,
    upstream: RefCell<Option<Subscription>>,
    this: Weak<TakeInst<T>>,
}

impl<T: 'static> TakeInst<T> {
    fn finish(&self) {
        if let Some(upstream) = self.upstream.borrow_mut().take() {
            upstream.cancel();
        }
        if let Some(sink) = self.sink.borrow_mut().take() {
            sink.on_complete();
        }
    }
}

impl<T: 'static> Subscriber<T> for TakeInst<T> {
    fn on_subscribe(&self, subscription: Subscription) {
        if self.remaining.get() == 0 {
            // Nothing to forward: the upstream is cancelled before any
            // demand flows and the downstream completes without ever
            // seeing a subscription.
            subscription.cancel();
            if let Some(sink) = self.sink.borrow_mut().take() {
                sink.on_complete();
            }
            return;
        }
        *self.upstream.borrow_mut() = Some(subscription);
        let sink = self.sink.borrow().clone();
        if let Some(sink) = sink {
            let this = self.this.upgrade().expect("operator instance alive");
            sink.on_subscribe(Subscription::new(this));
        }
    }

    fn on_next(&self, item: T) {
        let sink = self.sink.borrow().clone();
        if let Some(sink) = sink {
            sink.on_next(item);
        }
        self.remaining.set(self.remaining.get().saturating_sub(1));
        self.outstanding.set(self.outstanding.get().saturating_sub(1));
        if self.remaining.get() == 0 {
            self.finish();
        }
    }

    fn on_complete(&self) {
        self.upstream.borrow_mut().take();
        if let Some(sink) = self.sink.borrow_mut().take() {
            sink.on_complete();
        }
    }

    fn on_error(&self, error: Error) {
        self.upstream.borrow_mut().take();
        if let Some(sink) = self.sink.borrow_mut().take() {
            sink.on_error(error);
        }
    }
}

impl<T: 'static> Demand for TakeInst<T> {
    fn request(&self, n: u64) {
        let capped = n.min(self.remaining.get().saturating_sub(self.outstanding.get()));
        if capped == 0 {
            return;
        }
        self.outstanding.set(self.outstanding.get() + capped);
        let upstream = self.upstream.borrow().clone();
        if let Some(upstream) = upstream {
            upstream.request(capped);
        }
    }

    fn cancel(&self) {
        let upstream = self.upstream.borrow_mut().take();
        self.sink.borrow_mut().take();
        if let Some(upstream) = upstream {
            upstream.cancel();
        }
    }
}

// ============================================================================
// do_finally
// ============================================================================

/// Run `f` exactly once when the stream terminates, whatever the cause:
/// complete, error, or downstream cancel.
pub fn do_finally<F>(f: F) -> DoFinally<F>
where
    F: FnOnce(),
{
    DoFinally { f }
}

/// See [`do_finally`].
pub struct DoFinally<F> {
    f: F,
}

impl<T, F> Operator<T> for DoFinally<F>
where
    T: 'static,
    F: FnOnce() + 'static,
{
    type Out = T;

    fn apply(self, source: Publisher<T>) -> Publisher<T> {
        struct Core<T, F> {
            source: Publisher<T>,
            f: F,
        }

        impl<T, F> PublisherCore<T> for Core<T, F>
        where
            T: 'static,
            F: FnOnce() + 'static,
        {
            fn attach(self: Box<Self>, sink: Rc<dyn Subscriber<T>>) {
                let me = *self;
                let inst = Rc::new_cyclic(|this| DoFinallyInst {
                    f: RefCell::new(Some(me.f)),
                    sink: RefCell::new(Some(sink)),
                    upstream: RefCell::new(None),
                    this: this.clone(),
                });
                me.source.subscribe(inst);
            }
        }

        Publisher::from_core(Core {
            source,
            f: self.f,
        })
    }
}

struct DoFinallyInst<T, F> {
    f: RefCell<Option<F>>,
    sink: RefCell<Option<Rc<dyn Subscriber<T>>>>,
    upstream: RefCell<Option<Subscription>>,
    this: Weak<DoFinallyInst<T, F>>,
}

impl<T, F: FnOnce()> DoFinallyInst<T, F> {
    fn run_finalizer(&self) {
        if let Some(f) = self.f.borrow_mut().take() {
            f();
        }
    }
}

impl<T, F> Subscriber<T> for DoFinallyInst<T, F>
where
    T: 'static,
    F: FnOnce() + 'static,
{
    fn on_subscribe(&self, subscription: Subscription) {
        *self.upstream.borrow_mut() = Some(subscription);
        let sink = self.sink.borrow().clone();
        if let Some(sink) = sink {
            let this = self.this.upgrade().expect("operator instance alive");
            sink.on_subscribe(Subscription::new(this));
        }
    }

    fn on_next(&self, item: T) {
        let sink = self.sink.borrow().clone();
        if let Some(sink) = sink {
            sink.on_next(item);
        }
    }

    fn on_complete(&self) {
        self.upstream.borrow_mut().take();
        if let Some(sink) = self.sink.borrow_mut().take() {
            sink.on_complete();
        }
        self.run_finalizer();
    }

    fn on_error(&self, error: Error) {
        self.upstream.borrow_mut().take();
        if let Some(sink) = self.sink.borrow_mut().take() {
            sink.on_error(error);
        }
        self.run_finalizer();
    }
}

impl<T, F> Demand for DoFinallyInst<T, F>
where
    T: 'static,
    F: FnOnce() + 'static,
{
    fn request(&self, n: u64) {
        let upstream = self.upstream.borrow().clone();
        if let Some(upstream) = upstream {
            upstream.request(n);
        }
    }

    fn cancel(&self) {
        let upstream = self.upstream.borrow_mut().take();
        self.sink.borrow_mut().take();
        if let Some(upstream) = upstream {
            upstream.cancel();
        }
        self.run_finalizer();
    }
}

// ============================================================================
// flat_map
// ============================================================================

/// For each upstream item, subscribe to the publisher returned by `f` and
/// forward its items downstream. The next upstream item is requested only
/// after the inner publisher completes: at most one inner subscription is
/// active at any time, and downstream demand is honored end-to-end.
pub fn flat_map<S, T, F>(f: F) -> FlatMap<F>
where
    F: FnMut(S) -> Publisher<T>,
{
    FlatMap { f }
}

/// See [`flat_map`].
pub struct FlatMap<F> {
    f: F,
}

impl<S, T, F> Operator<S> for FlatMap<F>
where
    S: 'static,
    T: 'static,
    F: FnMut(S) -> Publisher<T> + 'static,
{
    type Out = T;

    fn apply(self, source: Publisher<S>) -> Publisher<T> {
        struct Core<S, F> {
            source: Publisher<S>,
            f: F,
        }

        impl<S, T, F> PublisherCore<T> for Core<S, F>
        where
            S: 'static,
            T: 'static,
            F: FnMut(S) -> Publisher<T> + 'static,
        {
            fn attach(self: Box<Self>, sink: Rc<dyn Subscriber<T>>) {
                let me = *self;
                let inst = Rc::new_cyclic(|this| FlatMapInst {
                    f: RefCell::new(me.f),
                    sink: RefCell::new(Some(sink)),
                    upstream: RefCell::new(None),
                    inner: RefCell::new(None),
                    outstanding: Cell::new(0),
                    inner_granted: Cell::new(0),
                    delivered: Cell::new(0),
                    in_drain: Cell::new(false),
                    active: Cell::new(true),
                    source_complete: Cell::new(false),
                    awaiting_outer: Cell::new(false),
                    this: this.clone(),
                });
                me.source.subscribe(inst);
            }
        }

        Publisher::from_core(Core {
            source,
            f: self.f,
        })
    }
}

struct FlatMapInst<S, T, F> {
    f: RefCell<F>,
    sink: RefCell<Option<Rc<dyn Subscriber<T>>>>,
    upstream: RefCell<Option<Subscription>>,
    inner: RefCell<Option<Rc<InnerSub<S, T, F>>>>,
    /// Downstream demand not yet satisfied.
    outstanding: Cell<u64>,
    /// Demand already granted to the active inner and not yet consumed.
    inner_granted: Cell<u64>,
    /// Monotonic count of downstream deliveries. The drain loop uses it to
    /// detect synchronous progress; demand counters alone cannot, because a
    /// reentrant `request` can replenish exactly what a delivery consumed.
    delivered: Cell<u64>,
    in_drain: Cell<bool>,
    active: Cell<bool>,
    source_complete: Cell<bool>,
    /// An outer request(1) is in flight and the item has not arrived yet.
    awaiting_outer: Cell<bool>,
    this: Weak<FlatMapInst<S, T, F>>,
}

impl<S, T, F> FlatMapInst<S, T, F>
where
    S: 'static,
    T: 'static,
    F: FnMut(S) -> Publisher<T> + 'static,
{
    fn release(&self) {
        self.upstream.borrow_mut().take();
        self.sink.borrow_mut().take();
        if let Some(inner) = self.inner.borrow_mut().take() {
            inner.upstream.borrow_mut().take();
        }
    }

    fn terminate_complete(&self) {
        if !self.active.get() {
            return;
        }
        self.active.set(false);
        self.upstream.borrow_mut().take();
        let sink = self.sink.borrow_mut().take();
        if let Some(sink) = sink {
            sink.on_complete();
        }
    }

    fn terminate_error(&self, error: Error) {
        if !self.active.get() {
            return;
        }
        self.active.set(false);
        let sink = self.sink.borrow_mut().take();
        self.release();
        if let Some(sink) = sink {
            sink.on_error(error);
        }
    }

    fn drain(&self) {
        if self.in_drain.get() {
            return;
        }

        self.in_drain.set(true);
        loop {
            if !self.active.get() {
                break;
            }
            // Completion is a terminal event, not an emission: it does not
            // wait for demand.
            if self.inner.borrow().is_none() && self.source_complete.get() {
                self.terminate_complete();
                break;
            }
            if self.outstanding.get() == 0 {
                break;
            }

            let inner = self.inner.borrow().clone();
            match inner {
                None => {
                    if self.awaiting_outer.get() {
                        // Outer item not delivered yet.
                        break;
                    }
                    self.awaiting_outer.set(true);
                    let upstream = self.upstream.borrow().clone();
                    match upstream {
                        Some(upstream) => upstream.request(1),
                        None => break,
                    }
                    if self.inner.borrow().is_none() && self.awaiting_outer.get() {
                        // Asynchronous upstream; resume on delivery.
                        break;
                    }
                }
                Some(inner) => {
                    let want = self
                        .outstanding
                        .get()
                        .saturating_sub(self.inner_granted.get());
                    if want == 0 {
                        break;
                    }
                    self.inner_granted.set(self.inner_granted.get() + want);
                    let delivered = self.delivered.get();
                    inner.request(want);
                    if self.active.get()
                        && self.delivered.get() == delivered
                        && self.inner.borrow().is_some()
                    {
                        // The inner made no synchronous progress; resume
                        // when it delivers.
                        break;
                    }
                }
            }
        }
        self.in_drain.set(false);

        if !self.active.get() {
            self.release();
        }
    }

    fn inner_complete(&self) {
        if let Some(inner) = self.inner.borrow_mut().take() {
            inner.upstream.borrow_mut().take();
        }
        self.inner_granted.set(0);
        if self.in_drain.get() {
            // The drain loop observes the cleared inner.
            return;
        }
        if self.source_complete.get() {
            self.terminate_complete();
            return;
        }
        self.drain();
    }

    fn inner_next(&self, item: T) {
        self.delivered.set(self.delivered.get().wrapping_add(1));
        self.outstanding.set(self.outstanding.get().saturating_sub(1));
        self.inner_granted
            .set(self.inner_granted.get().saturating_sub(1));
        let sink = self.sink.borrow().clone();
        if let Some(sink) = sink {
            sink.on_next(item);
        }
    }

    fn inner_error(&self, error: Error) {
        self.terminate_error(error);
    }
}

impl<S, T, F> Subscriber<S> for FlatMapInst<S, T, F>
where
    S: 'static,
    T: 'static,
    F: FnMut(S) -> Publisher<T> + 'static,
{
    fn on_subscribe(&self, subscription: Subscription) {
        *self.upstream.borrow_mut() = Some(subscription);
        let sink = self.sink.borrow().clone();
        if let Some(sink) = sink {
            let this = self.this.upgrade().expect("operator instance alive");
            sink.on_subscribe(Subscription::new(this));
        }
    }

    fn on_next(&self, item: S) {
        debug_assert!(self.inner.borrow().is_none(), "inner already active");
        self.awaiting_outer.set(false);
        let publisher = (&mut *self.f.borrow_mut())(item);
        let this = self.this.clone();
        let inner = Rc::new(InnerSub {
            parent: this,
            upstream: RefCell::new(None),
        });
        *self.inner.borrow_mut() = Some(inner.clone());
        publisher.subscribe(inner);
        self.drain();
    }

    fn on_complete(&self) {
        self.awaiting_outer.set(false);
        self.source_complete.set(true);
        if self.inner.borrow().is_some() {
            // Defer until the active inner finishes.
            return;
        }
        if self.in_drain.get() {
            // The drain loop observes source_complete and finishes.
            return;
        }
        self.terminate_complete();
    }

    fn on_error(&self, error: Error) {
        self.terminate_error(error);
    }
}

impl<S, T, F> Demand for FlatMapInst<S, T, F>
where
    S: 'static,
    T: 'static,
    F: FnMut(S) -> Publisher<T> + 'static,
{
    fn request(&self, n: u64) {
        if !self.active.get() {
            return;
        }
        self.outstanding.set(self.outstanding.get().saturating_add(n));
        self.drain();
    }

    fn cancel(&self) {
        self.active.set(false);
        if let Some(upstream) = self.upstream.borrow_mut().take() {
            upstream.cancel();
        }
        if let Some(inner) = self.inner.borrow_mut().take() {
            if let Some(sub) = inner.upstream.borrow_mut().take() {
                sub.cancel();
            }
        }
        self.sink.borrow_mut().take();
    }
}

struct InnerSub<S, T, F> {
    parent: Weak<FlatMapInst<S, T, F>>,
    upstream: RefCell<Option<Subscription>>,
}

impl<S, T, F> InnerSub<S, T, F>
where
    S: 'static,
    T: 'static,
    F: FnMut(S) -> Publisher<T> + 'static,
{
    fn request(&self, n: u64) {
        let upstream = self.upstream.borrow().clone();
        if let Some(upstream) = upstream {
            upstream.request(n);
        }
    }
}

impl<S, T, F> Subscriber<T> for InnerSub<S, T, F>
where
    S: 'static,
    T: 'static,
    F: FnMut(S) -> Publisher<T> + 'static,
{
    fn on_subscribe(&self, subscription: Subscription) {
        *self.upstream.borrow_mut() = Some(subscription);
    }

    fn on_next(&self, item: T) {
        if let Some(parent) = self.parent.upgrade() {
            parent.inner_next(item);
        }
    }

    fn on_complete(&self) {
        self.upstream.borrow_mut().take();
        if let Some(parent) = self.parent.upgrade() {
            parent.inner_complete();
        }
    }

    fn on_error(&self, error: Error) {
        self.upstream.borrow_mut().take();
        if let Some(parent) = self.parent.upgrade() {
            parent.inner_error(error);
        }
    }
}

// ============================================================================
// repeat_if
// ============================================================================

/// Cache the latest item matching `pred` and re-inject it before each
/// subsequent non-matching item. `max` bounds the re-injections per cached
/// item; `0` means unlimited.
///
/// The canonical use is re-injecting infrequent codec-metadata packets so
/// that every frame is preceded by the metadata that decodes it.
pub fn repeat_if<P>(max: u64, pred: P) -> RepeatIf<P> {
    RepeatIf { max, pred }
}

/// See [`repeat_if`].
pub struct RepeatIf<P> {
    max: u64,
    pred: P,
}

impl<T, P> Operator<T> for RepeatIf<P>
where
    T: Clone + 'static,
    P: Fn(&T) -> bool + 'static,
{
    type Out = T;

    fn apply(self, source: Publisher<T>) -> Publisher<T> {
        struct Core<T, P> {
            source: Publisher<T>,
            max: u64,
            pred: P,
        }

        impl<T, P> PublisherCore<T> for Core<T, P>
        where
            T: Clone + 'static,
            P: Fn(&T) -> bool + 'static,
        {
            fn attach(self: Box<Self>, sink: Rc<dyn Subscriber<T>>) {
                let me = *self;
                let inst = Rc::new_cyclic(|this| RepeatIfInst {
                    pred: me.pred,
                    max: me.max,
                    cached: RefCell::new(None),
                    repeats: Cell::new(0),
                    pending: RefCell::new(VecDeque::new()),
                    outstanding: Cell::new(0),
                    awaiting_upstream: Cell::new(false),
                    source_complete: Cell::new(false),
                    in_drain: Cell::new(false),
                    active: Cell::new(true),
                    sink: RefCell::new(Some(sink)),
                    upstream: RefCell::new(None),
                    this: this.clone(),
                });
                me.source.subscribe(inst);
            }
        }

        Publisher::from_core(Core {
            source,
            max: self.max,
            pred: self.pred,
        })
    }
}

struct RepeatIfInst<T, P> {
    pred: P,
    max: u64,
    cached: RefCell<Option<T>>,
    repeats: Cell<u64>,
    pending: RefCell<VecDeque<T>>,
    outstanding: Cell<u64>,
    awaiting_upstream: Cell<bool>,
    source_complete: Cell<bool>,
    in_drain: Cell<bool>,
    active: Cell<bool>,
    sink: RefCell<Option<Rc<dyn Subscriber<T>>>>,
    upstream: RefCell<Option<Subscription>>,
    this: Weak<RepeatIfInst<T, P>>,
}

impl<T, P> RepeatIfInst<T, P>
where
    T: Clone + 'static,
    P: Fn(&T) -> bool + 'static,
{
    fn release(&self) {
        self.sink.borrow_mut().take();
        self.upstream.borrow_mut().take();
        self.pending.borrow_mut().clear();
        self.cached.borrow_mut().take();
    }

    fn drain(&self) {
        if self.in_drain.get() {
            return;
        }

        self.in_drain.set(true);
        loop {
            if !self.active.get() {
                break;
            }
            if self.pending.borrow().is_empty() && self.source_complete.get() {
                self.active.set(false);
                self.upstream.borrow_mut().take();
                let sink = self.sink.borrow_mut().take();
                if let Some(sink) = sink {
                    sink.on_complete();
                }
                break;
            }
            if self.outstanding.get() == 0 {
                break;
            }

            let queued = self.pending.borrow_mut().pop_front();
            if let Some(item) = queued {
                self.outstanding.set(self.outstanding.get() - 1);
                let sink = self.sink.borrow().clone();
                if let Some(sink) = sink {
                    sink.on_next(item);
                }
                continue;
            }

            if self.awaiting_upstream.get() {
                break;
            }
            self.awaiting_upstream.set(true);
            let upstream = self.upstream.borrow().clone();
            match upstream {
                Some(upstream) => upstream.request(1),
                None => break,
            }
            if self.awaiting_upstream.get() && self.pending.borrow().is_empty() {
                // Asynchronous upstream; resume on delivery.
                break;
            }
        }
        self.in_drain.set(false);

        if !self.active.get() {
            self.release();
        }
    }
}

impl<T, P> Subscriber<T> for RepeatIfInst<T, P>
where
    T: Clone + 'static,
    P: Fn(&T) -> bool + 'static,
{
    fn on_subscribe(&self, subscription: Subscription) {
        *self.upstream.borrow_mut() = Some(subscription);
        let sink = self.sink.borrow().clone();
        if let Some(sink) = sink {
            let this = self.this.upgrade().expect("operator instance alive");
            sink.on_subscribe(Subscription::new(this));
        }
    }

    fn on_next(&self, item: T) {
        self.awaiting_upstream.set(false);
        if (self.pred)(&item) {
            *self.cached.borrow_mut() = Some(item.clone());
            self.repeats.set(0);
            self.pending.borrow_mut().push_back(item);
        } else {
            let reinject = {
                let cached = self.cached.borrow();
                match cached.as_ref() {
                    Some(c) if self.max == 0 || self.repeats.get() < self.max => Some(c.clone()),
                    _ => None,
                }
            };
            let mut pending = self.pending.borrow_mut();
            if let Some(repeat) = reinject {
                self.repeats.set(self.repeats.get() + 1);
                pending.push_back(repeat);
            }
            pending.push_back(item);
            drop(pending);
        }
        self.drain();
    }

    fn on_complete(&self) {
        self.awaiting_upstream.set(false);
        self.source_complete.set(true);
        self.upstream.borrow_mut().take();
        if self.in_drain.get() {
            return;
        }
        if self.pending.borrow().is_empty() {
            self.active.set(false);
            let sink = self.sink.borrow_mut().take();
            if let Some(sink) = sink {
                sink.on_complete();
            }
            self.release();
        } else {
            self.drain();
        }
    }

    fn on_error(&self, error: Error) {
        // Errors preempt any queued items.
        self.active.set(false);
        let sink = self.sink.borrow_mut().take();
        self.release();
        if let Some(sink) = sink {
            sink.on_error(error);
        }
    }
}

impl<T, P> Demand for RepeatIfInst<T, P>
where
    T: Clone + 'static,
    P: Fn(&T) -> bool + 'static,
{
    fn request(&self, n: u64) {
        if !self.active.get() {
            return;
        }
        self.outstanding.set(self.outstanding.get().saturating_add(n));
        self.drain();
    }

    fn cancel(&self) {
        self.active.set(false);
        if let Some(upstream) = self.upstream.borrow_mut().take() {
            upstream.cancel();
        }
        if !self.in_drain.get() {
            self.release();
        }
    }
}

// ============================================================================
// lift
// ============================================================================

/// Escape hatch: splice an arbitrary publisher transformer into a chain.
pub fn lift<S, T, F>(f: F) -> Lift<F>
where
    F: FnOnce(Publisher<S>) -> Publisher<T>,
{
    Lift { f }
}

/// See [`lift`].
pub struct Lift<F> {
    f: F,
}

impl<S, T, F> Operator<S> for Lift<F>
where
    S: 'static,
    T: 'static,
    F: FnOnce(Publisher<S>) -> Publisher<T>,
{
    type Out = T;

    fn apply(self, source: Publisher<S>) -> Publisher<T> {
        (self.f)(source)
    }
}

#[cfg(test)]
mod tests {
    use super::super::{of, range};
    use super::*;

    #[test]
    fn test_map_law() {
        let xs = vec![1, 2, 3];
        let lhs = (of(xs.clone()) >> map(|x| x + 10)).collect().unwrap();
        let rhs: Vec<i64> = xs.into_iter().map(|x| x + 10).collect();
        assert_eq!(lhs, rhs);
    }

    #[test]
    fn test_flat_map_of_singletons_is_identity() {
        let xs = vec![1, 2, 3, 4];
        let lhs = (of(xs.clone()) >> flat_map(|x| of(vec![x]))).collect().unwrap();
        assert_eq!(lhs, xs);
    }

    #[test]
    fn test_flat_map_flattens_in_order() {
        let flattened = (of(vec![0i64, 10, 20]) >> flat_map(|base| of(vec![base, base + 1])))
            .collect()
            .unwrap();
        assert_eq!(flattened, vec![0, 1, 10, 11, 20, 21]);
    }

    #[test]
    fn test_flat_map_skips_empty_inner() {
        let flattened = (of(vec![1i64, 2, 3]) >> flat_map(|x| {
            if x == 2 {
                super::super::empty()
            } else {
                of(vec![x])
            }
        }))
        .collect()
        .unwrap();
        assert_eq!(flattened, vec![1, 3]);
    }

    #[test]
    fn test_take_law() {
        let taken = (range(5, 1_000_000) >> take(4)).collect().unwrap();
        assert_eq!(taken, vec![5, 6, 7, 8]);
    }

    #[test]
    fn test_take_more_than_available() {
        let taken = (range(0, 3) >> take(10)).collect().unwrap();
        assert_eq!(taken, vec![0, 1, 2]);
    }

    #[test]
    fn test_take_zero_completes_immediately() {
        let taken = (range(0, 1_000_000) >> take(0)).collect().unwrap();
        assert_eq!(taken, Vec::<i64>::new());
    }

    #[test]
    fn test_do_finally_runs_once_on_complete() {
        let runs = Rc::new(Cell::new(0u32));
        let runs2 = runs.clone();
        let items = (of(vec![1, 2]) >> do_finally(move || runs2.set(runs2.get() + 1)))
            .collect()
            .unwrap();
        assert_eq!(items, vec![1, 2]);
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn test_do_finally_runs_once_on_error() {
        let runs = Rc::new(Cell::new(0u32));
        let runs2 = runs.clone();
        let result = (super::super::error::<i64>(Error::EndOfStream)
            >> do_finally(move || runs2.set(runs2.get() + 1)))
        .collect();
        assert!(result.is_err());
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn test_do_finally_runs_once_on_cancel() {
        let runs = Rc::new(Cell::new(0u32));
        let runs2 = runs.clone();
        // take(2) cancels its upstream after the second item; the
        // finalizer below it must observe that cancel exactly once.
        let items = (range(0, 1_000_000)
            >> do_finally(move || runs2.set(runs2.get() + 1))
            >> take(2))
        .collect()
        .unwrap();
        assert_eq!(items, vec![0, 1]);
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn test_repeat_if_reinjects_cached_item() {
        #[derive(Clone, Debug, PartialEq)]
        enum Pkt {
            Meta(u32),
            Frame(u32),
        }

        let source = of(vec![
            Pkt::Meta(0),
            Pkt::Frame(1),
            Pkt::Frame(2),
            Pkt::Frame(3),
        ]);
        let items = (source >> repeat_if(0, |p: &Pkt| matches!(p, Pkt::Meta(_))))
            .collect()
            .unwrap();
        assert_eq!(
            items,
            vec![
                Pkt::Meta(0),
                Pkt::Meta(0),
                Pkt::Frame(1),
                Pkt::Meta(0),
                Pkt::Frame(2),
                Pkt::Meta(0),
                Pkt::Frame(3),
            ]
        );
    }

    #[test]
    fn test_repeat_if_respects_max() {
        #[derive(Clone, Debug, PartialEq)]
        enum Pkt {
            Meta,
            Frame(u32),
        }

        let source = of(vec![Pkt::Meta, Pkt::Frame(1), Pkt::Frame(2), Pkt::Frame(3)]);
        let items = (source >> repeat_if(1, |p: &Pkt| matches!(p, Pkt::Meta)))
            .collect()
            .unwrap();
        assert_eq!(
            items,
            vec![
                Pkt::Meta,
                Pkt::Meta,
                Pkt::Frame(1),
                Pkt::Frame(2),
                Pkt::Frame(3),
            ]
        );
    }

    #[test]
    fn test_lift_splices_transformer() {
        let items = (range(0, 10) >> lift(|src| src >> take(2))).collect().unwrap();
        assert_eq!(items, vec![0, 1]);
    }

    #[test]
    fn test_range_take_law() {
        let (a, b, k) = (3i64, 9i64, 4u64);
        let lhs = (range(a, b) >> take(k)).collect().unwrap();
        let expected: Vec<i64> = (a..b).take(k as usize).collect();
        assert_eq!(lhs, expected);
    }
}
