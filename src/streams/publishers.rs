//! Primitive publisher constructors.
//!
//! Everything finite is built on [`generate`]; [`live`] covers sources
//! that emit out-of-band (capture devices, bus subscriptions) and drop
//! items past pending demand.

use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::rc::Rc;

use tracing::trace;

use super::{flat_map, Demand, Error, Observer, Publisher, PublisherCore, Subscriber, Subscription};
use crate::metrics::LIVE_ITEMS_DROPPED;

/// A publisher that completes immediately on subscribe.
pub fn empty<T: 'static>() -> Publisher<T> {
    struct Empty;

    impl<T> PublisherCore<T> for Empty {
        fn attach(self: Box<Self>, sink: Rc<dyn Subscriber<T>>) {
            sink.on_complete();
        }
    }

    Publisher::from_core(Empty)
}

/// A publisher that fails immediately on subscribe.
pub fn error<T: 'static>(error: Error) -> Publisher<T> {
    struct Failed(Error);

    impl<T> PublisherCore<T> for Failed {
        fn attach(self: Box<Self>, sink: Rc<dyn Subscriber<T>>) {
            sink.on_error(self.0);
        }
    }

    Publisher::from_core(Failed(error))
}

/// A deterministic finite sequence.
pub fn of<T: 'static>(values: Vec<T>) -> Publisher<T> {
    generate(
        move || values.into_iter(),
        |iter, demand, out| {
            for _ in 0..demand {
                match iter.next() {
                    Some(value) => out.on_next(value),
                    None => break,
                }
            }
            if iter.len() == 0 {
                out.on_complete();
            }
        },
    )
}

/// The half-open integer range `[from, to)`.
pub fn range(from: i64, to: i64) -> Publisher<i64> {
    generate(
        move || from,
        move |next, demand, out| {
            for _ in 0..demand {
                if *next >= to {
                    break;
                }
                let value = *next;
                *next += 1;
                out.on_next(value);
            }
            if *next >= to {
                out.on_complete();
            }
        },
    )
}

/// A stateful generator publisher.
///
/// `create` builds the generator state when the publisher is subscribed;
/// `gen` is then invoked with the state, the pending demand and an
/// [`Observer`], and emits up to `demand` items per call. It may finish
/// the sequence with `on_complete` or `on_error` at any point. A call
/// that emits nothing and does not terminate leaves the remaining demand
/// pending until the next `request`.
pub fn generate<T, S, C, G>(create: C, gen: G) -> Publisher<T>
where
    T: 'static,
    S: 'static,
    C: FnOnce() -> S + 'static,
    G: FnMut(&mut S, u64, &dyn Observer<T>) + 'static,
{
    struct Generate<C, G, T> {
        create: C,
        gen: G,
        _marker: PhantomData<fn() -> T>,
    }

    impl<T, S, C, G> PublisherCore<T> for Generate<C, G, T>
    where
        T: 'static,
        S: 'static,
        C: FnOnce() -> S + 'static,
        G: FnMut(&mut S, u64, &dyn Observer<T>) + 'static,
    {
        fn attach(self: Box<Self>, sink: Rc<dyn Subscriber<T>>) {
            let me = *self;
            let producer = Rc::new(GenerateProducer {
                state: RefCell::new((me.create)()),
                gen: RefCell::new(me.gen),
                sink: RefCell::new(Some(sink.clone())),
                outstanding: Cell::new(0),
                active: Cell::new(true),
                in_drain: Cell::new(false),
                progressed: Cell::new(false),
            });
            sink.on_subscribe(Subscription::new(producer));
        }
    }

    Publisher::from_core(Generate {
        create,
        gen,
        _marker: PhantomData,
    })
}

struct GenerateProducer<S, G, T> {
    state: RefCell<S>,
    gen: RefCell<G>,
    sink: RefCell<Option<Rc<dyn Subscriber<T>>>>,
    outstanding: Cell<u64>,
    active: Cell<bool>,
    in_drain: Cell<bool>,
    /// Whether the current generator call emitted anything. Demand counters
    /// cannot detect progress on their own: a reentrant `request` from
    /// inside `on_next` can replenish exactly what the emission consumed.
    progressed: Cell<bool>,
}

impl<S, G, T> GenerateProducer<S, G, T>
where
    G: FnMut(&mut S, u64, &dyn Observer<T>),
{
    fn drain(&self) {
        if self.in_drain.get() {
            // Reentrant request from inside an emission; the outer loop
            // observes the bumped demand.
            return;
        }

        self.in_drain.set(true);
        while self.active.get() && self.outstanding.get() > 0 {
            self.progressed.set(false);
            {
                let mut gen = self.gen.borrow_mut();
                let mut state = self.state.borrow_mut();
                let demand = self.outstanding.get();
                (*gen)(&mut state, demand, self);
            }
            if self.active.get() && !self.progressed.get() {
                // The generator chose to emit fewer items than asked.
                // Remaining demand stays pending for the next request.
                break;
            }
        }
        self.in_drain.set(false);

        if !self.active.get() {
            self.sink.borrow_mut().take();
        }
    }
}

impl<S, G, T> Observer<T> for GenerateProducer<S, G, T>
where
    G: FnMut(&mut S, u64, &dyn Observer<T>),
{
    fn on_next(&self, item: T) {
        if !self.active.get() {
            return;
        }
        self.progressed.set(true);
        self.outstanding.set(self.outstanding.get().saturating_sub(1));
        let sink = self.sink.borrow().clone();
        if let Some(sink) = sink {
            sink.on_next(item);
        }
    }

    fn on_complete(&self) {
        if !self.active.get() {
            return;
        }
        self.active.set(false);
        let sink = self.sink.borrow_mut().take();
        if let Some(sink) = sink {
            sink.on_complete();
        }
    }

    fn on_error(&self, error: Error) {
        if !self.active.get() {
            return;
        }
        self.active.set(false);
        let sink = self.sink.borrow_mut().take();
        if let Some(sink) = sink {
            sink.on_error(error);
        }
    }
}

impl<S, G, T> Demand for GenerateProducer<S, G, T>
where
    G: FnMut(&mut S, u64, &dyn Observer<T>),
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
        if !self.in_drain.get() {
            self.sink.borrow_mut().take();
        }
    }
}

/// A live, single-subscriber source fed out-of-band through a
/// [`LiveObserver`].
///
/// `init` runs at subscribe time and captures the observer; whatever owns
/// it (a capture loop, a bus callback) emits through it later. The
/// contract is best-effort: emissions past the pending demand are
/// **dropped**, not buffered, and counted — live sources are lossy under
/// backpressure.
pub fn live<T: 'static>(init: impl FnOnce(LiveObserver<T>) + 'static) -> Publisher<T> {
    struct Live<F, T> {
        init: F,
        _marker: PhantomData<fn() -> T>,
    }

    impl<T: 'static, F: FnOnce(LiveObserver<T>)> PublisherCore<T> for Live<F, T> {
        fn attach(self: Box<Self>, sink: Rc<dyn Subscriber<T>>) {
            let state = Rc::new(LiveState {
                sink: RefCell::new(Some(sink.clone())),
                outstanding: Cell::new(0),
                dropped: Cell::new(0),
                active: Cell::new(true),
            });
            (self.init)(LiveObserver {
                state: state.clone(),
            });
            sink.on_subscribe(Subscription::new(state));
        }
    }

    Publisher::from_core(Live {
        init,
        _marker: PhantomData,
    })
}

struct LiveState<T> {
    sink: RefCell<Option<Rc<dyn Subscriber<T>>>>,
    outstanding: Cell<u64>,
    dropped: Cell<u64>,
    active: Cell<bool>,
}

impl<T> Demand for LiveState<T> {
    fn request(&self, n: u64) {
        if !self.active.get() {
            return;
        }
        self.outstanding.set(self.outstanding.get().saturating_add(n));
    }

    fn cancel(&self) {
        self.active.set(false);
        self.sink.borrow_mut().take();
    }
}

/// Emission handle for [`live`] publishers. Clones share the same stream.
pub struct LiveObserver<T> {
    state: Rc<LiveState<T>>,
}

impl<T> Clone for LiveObserver<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T> LiveObserver<T> {
    /// Number of items dropped because no demand was pending.
    pub fn dropped(&self) -> u64 {
        self.state.dropped.get()
    }

    /// Whether the downstream is still attached.
    pub fn is_active(&self) -> bool {
        self.state.active.get()
    }
}

impl<T> Observer<T> for LiveObserver<T> {
    fn on_next(&self, item: T) {
        if !self.state.active.get() {
            return;
        }
        let outstanding = self.state.outstanding.get();
        if outstanding == 0 {
            self.state.dropped.set(self.state.dropped.get() + 1);
            metrics::counter!(LIVE_ITEMS_DROPPED).increment(1);
            trace!(dropped = self.state.dropped.get(), "live item dropped");
            drop(item);
            return;
        }
        self.state.outstanding.set(outstanding - 1);
        let sink = self.state.sink.borrow().clone();
        if let Some(sink) = sink {
            sink.on_next(item);
        }
    }

    fn on_complete(&self) {
        if !self.state.active.get() {
            return;
        }
        self.state.active.set(false);
        let sink = self.state.sink.borrow_mut().take();
        if let Some(sink) = sink {
            sink.on_complete();
        }
    }

    fn on_error(&self, error: Error) {
        if !self.state.active.get() {
            return;
        }
        self.state.active.set(false);
        let sink = self.state.sink.borrow_mut().take();
        if let Some(sink) = sink {
            sink.on_error(error);
        }
    }
}

/// Interleave `sources` into one stream.
///
/// Built as a publisher-of-publishers flattened through `flat_map`, so
/// inner sequences are consumed one at a time: the next source is
/// subscribed when the previous one completes.
pub fn merge<T: 'static>(sources: Vec<Publisher<T>>) -> Publisher<T> {
    of(sources).pipe(flat_map(|inner| inner))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_completes_without_items() {
        assert_eq!(empty::<i64>().collect().unwrap(), Vec::<i64>::new());
    }

    #[test]
    fn test_error_fails_without_items() {
        let result = error::<i64>(Error::NotConnected).collect();
        assert!(matches!(result, Err(Error::NotConnected)));
    }

    #[test]
    fn test_of_emits_in_order() {
        assert_eq!(of(vec![3, 1, 2]).collect().unwrap(), vec![3, 1, 2]);
    }

    #[test]
    fn test_range_is_half_open() {
        assert_eq!(range(2, 6).collect().unwrap(), vec![2, 3, 4, 5]);
        assert_eq!(range(5, 5).collect().unwrap(), Vec::<i64>::new());
    }

    #[test]
    fn test_generate_completes_exactly_once() {
        let completions = Rc::new(Cell::new(0u32));
        let completions2 = completions.clone();
        generate(
            || 0u64,
            |count, demand, out| {
                for _ in 0..demand {
                    if *count == 3 {
                        out.on_complete();
                        out.on_complete();
                        return;
                    }
                    out.on_next(*count as i64);
                    *count += 1;
                }
                if *count == 3 {
                    out.on_complete();
                }
            },
        )
        .process(
            |_| {},
            move || completions2.set(completions2.get() + 1),
            |e| panic!("unexpected error: {e}"),
        );
        assert_eq!(completions.get(), 1);
    }

    #[test]
    fn test_live_drops_past_demand() {
        let observer: Rc<RefCell<Option<LiveObserver<i64>>>> = Rc::new(RefCell::new(None));
        let seen = Rc::new(RefCell::new(Vec::new()));

        let observer2 = observer.clone();
        let seen2 = seen.clone();
        // A sink with a single up-front request and no re-request, so only
        // the first emission has demand backing it.
        struct OneShot(Rc<RefCell<Vec<i64>>>);
        impl Subscriber<i64> for OneShot {
            fn on_subscribe(&self, subscription: Subscription) {
                subscription.request(1);
            }
            fn on_next(&self, item: i64) {
                self.0.borrow_mut().push(item);
            }
            fn on_complete(&self) {}
            fn on_error(&self, error: Error) {
                panic!("unexpected error: {error}");
            }
        }

        live(move |obs| *observer2.borrow_mut() = Some(obs)).subscribe(Rc::new(OneShot(seen2)));

        let obs = observer.borrow().clone().unwrap();
        obs.on_next(1);
        obs.on_next(2);
        obs.on_next(3);

        assert_eq!(*seen.borrow(), vec![1]);
        assert_eq!(obs.dropped(), 2);
    }

    #[test]
    fn test_merge_concatenates_finite_sources() {
        let merged = merge(vec![of(vec![1, 2]), of(vec![3]), of(vec![4, 5])])
            .collect()
            .unwrap();
        assert_eq!(merged, vec![1, 2, 3, 4, 5]);
    }
}
