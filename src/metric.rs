//! Many-producer, single-collector accumulation with a wait-free hot path.
//!
//! The inverse of [`crate::rcu`]: every producer thread owns a private
//! three-slot exchange carrying accumulator slices, and a collector
//! periodically drains all of them. An [`update`](LockFreeMetric::update) is
//! one fold plus one atomic word operation; only the collector takes a lock,
//! and only against other collectors.
//!
//! Because a producer keeps a second copy of its running fold (the delayed
//! pending delta makes that lossless), each slice carries the half-open range
//! `start..end` of delta sequence numbers it covers. The collector compares
//! the range against what it has already drained and discards the overlap,
//! so repeated collects racing with ongoing updates never count a delta
//! twice.

use crate::exchange::{RawExchange, LEFT, RIGHT};
use crate::monoid::Absorb;
use crate::registry::{DelayedRegistry, ThreadEntries};
use crate::sync::UnsafeCell;
use core::fmt;
use core::marker::PhantomData;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

#[cfg(feature = "tracing")]
use tracing::instrument;

thread_local! {
    static PRODUCERS: RefCell<ThreadEntries> = RefCell::new(ThreadEntries::new());
}

/// One slot's payload: a running fold of the deltas numbered `start..end`,
/// with the newest one still pending.
struct MetricSlice<C, D> {
    start: i64,
    end: i64,
    collected: C,
    /// Holds a value iff `end > start`.
    last: Option<D>,
}

impl<C: Default, D> Default for MetricSlice<C, D> {
    fn default() -> Self {
        Self {
            start: 0,
            end: 0,
            collected: C::default(),
            last: None,
        }
    }
}

impl<C, D> MetricSlice<C, D>
where
    C: Absorb<D> + Default,
{
    fn len(&self) -> i64 {
        self.end - self.start
    }

    fn is_empty(&self) -> bool {
        self.last.is_none()
    }

    fn append(&mut self, value: D) {
        if let Some(pending) = self.last.take() {
            self.collected.absorb(pending);
        }
        self.last = Some(value);
        self.end += 1;
    }

    /// Forgets everything but the pending delta.
    fn keep_just_last(&mut self) {
        self.start = self.end - 1;
        self.collected = C::default();
    }

    fn reset(&mut self, new_start: i64) {
        if !self.is_empty() {
            self.collected = C::default();
            self.last = None;
        }
        self.start = new_start;
        self.end = new_start;
    }

    fn take_collected(&mut self) -> C {
        self.start = self.end;
        if let Some(pending) = self.last.take() {
            self.collected.absorb(pending);
        }
        core::mem::take(&mut self.collected)
    }
}

/// The per-thread channel between one producer and the collector.
struct MetricLocal<C, D> {
    exchange: RawExchange<MetricSlice<C, D>>,
    /// Sequence number of the producer's next delta; producer side only.
    update_index: UnsafeCell<i64>,
    /// Sequence number up to which the collector drained; collector side
    /// only, guarded by the central collect lock.
    collect_index: UnsafeCell<i64>,
}

// The exchange protocol plus the side-affinity contracts on `produce` and
// `drain` keep all interior state single-writer.
unsafe impl<C: Send, D: Send> Sync for MetricLocal<C, D> {}

impl<C, D> MetricLocal<C, D>
where
    C: Absorb<D> + Default,
    D: Clone,
{
    fn new() -> Self {
        Self {
            exchange: RawExchange::new(core::array::from_fn(|_| MetricSlice::default())),
            update_index: UnsafeCell::new(0),
            collect_index: UnsafeCell::new(0),
        }
    }

    /// # Safety
    ///
    /// Only the producer thread this local is bound to may call this.
    unsafe fn produce(&self, delta: D) {
        let last_start;
        {
            let slice = &mut *self.exchange.owned_slot::<LEFT>();
            slice.append(delta.clone());
            last_start = slice.start;
        }
        let flags = self.exchange.pass::<LEFT, _>(|_| {});
        let update_index = &mut *self.update_index.get();
        let next = &mut *self.exchange.owned_slot::<LEFT>();
        if flags.exchanged {
            // The reclaimed slot came back from the collector; everything it
            // covered has been drained.
            next.reset(*update_index);
        } else {
            let advance = last_start - next.start;
            if advance > 0 {
                debug_assert_eq!(advance, next.len() - 1);
                next.keep_just_last();
            }
        }
        debug_assert_eq!(next.end, *update_index);
        *update_index += 1;
        next.append(delta);
    }

    /// Drains every delta not yet seen by the collector.
    ///
    /// # Safety
    ///
    /// Collector side; calls must be serialized by the central collect lock.
    unsafe fn drain(&self) -> C {
        self.exchange.pass::<RIGHT, _>(|_| {});
        let collect_index = &mut *self.collect_index.get();
        let next = &mut *self.exchange.owned_slot::<RIGHT>();
        let seen = *collect_index - next.start;
        if seen < 0 {
            panic!(
                "metric collector lost deltas {}..{}",
                *collect_index, next.start
            );
        } else if seen < next.len() {
            if seen > 0 {
                debug_assert_eq!(seen, next.len() - 1);
                next.keep_just_last();
            }
            *collect_index += next.len();
            next.take_collected()
        } else {
            debug_assert!(next.is_empty());
            next.reset(*collect_index);
            C::default()
        }
    }
}

/// A thread's attachment, stored in its local map; dropping it (thread exit
/// or [`LockFreeMetric::detach`]) flags the local as abandoned for the next
/// collect.
struct ProducerEntry<C, D> {
    local: Arc<MetricLocal<C, D>>,
    abandoned: Arc<AtomicBool>,
    central: Weak<MetricShared<C, D>>,
}

impl<C, D> Drop for ProducerEntry<C, D> {
    fn drop(&mut self) {
        self.abandoned.store(true, Ordering::Release);
    }
}

struct MetricShared<C, D> {
    registry: DelayedRegistry<MetricLocal<C, D>>,
    collect_lock: Mutex<()>,
}

/// A thread-safe accumulator fanned in from any number of producer threads.
///
/// Producers fold deltas of type `D` into per-thread accumulators of type
/// `C` through the [`Absorb`] seam; [`collect`](Self::collect) gathers and
/// resets all of them. The handle is cheap to clone; all clones address the
/// same accumulator set.
///
/// `Absorb::absorb` may run twice per delta, on two distinct accumulators
/// (once on the producer side and once during a drain), so it must be a
/// monoidal fold such as numeric `+=`, set union or list append.
pub struct LockFreeMetric<C, D = C> {
    shared: Arc<MetricShared<C, D>>,
}

impl<C, D> Clone for LockFreeMetric<C, D> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C, D> fmt::Debug for LockFreeMetric<C, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockFreeMetric").finish_non_exhaustive()
    }
}

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<C, D> Default for LockFreeMetric<C, D>
where
    C: Absorb<D> + Default + Send + 'static,
    D: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<C, D> LockFreeMetric<C, D>
where
    C: Absorb<D> + Default + Send + 'static,
    D: Clone + Send + 'static,
{
    /// Creates an empty accumulator set.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(MetricShared {
                registry: DelayedRegistry::new(),
                collect_lock: Mutex::new(()),
            }),
        }
    }

    /// Folds `delta` into the calling thread's accumulator.
    ///
    /// Wait-free except for the calling thread's very first update, which
    /// registers it with the collector.
    pub fn update(&self, delta: D) {
        self.with_producer(|entry| unsafe { entry.local.produce(delta) })
    }

    /// A handle bound to the calling thread's accumulator that skips the
    /// thread-local lookup of [`update`](Self::update) on hot paths.
    ///
    /// Deltas pushed through the handle after the thread called
    /// [`detach`](Self::detach) and a subsequent collect ran are dropped
    /// with that accumulator.
    pub fn writer(&self) -> MetricWriter<C, D> {
        self.with_producer(|entry| MetricWriter {
            local: Arc::clone(&entry.local),
            _pinned: PhantomData,
        })
    }

    /// Gathers the accumulated value of every producer thread, resetting
    /// each accumulator, and returns them in unspecified order.
    ///
    /// Producer threads that terminated since the previous collect are
    /// drained one final time and their accumulators are dropped. Collects
    /// serialize against each other but never block producers.
    #[cfg_attr(feature = "tracing", instrument(skip_all))]
    pub fn collect(&self) -> Vec<C> {
        let _collecting = relock(&self.shared.collect_lock);
        let pruned = self.shared.registry.prune_and_list();
        let mut collected = Vec::with_capacity(pruned.live.len() + pruned.abandoned.len());
        for local in &pruned.live {
            // The collect lock serializes all collector-side accesses.
            collected.push(unsafe { local.drain() });
        }
        for local in pruned.abandoned {
            collected.push(unsafe { local.drain() });
        }
        collected
    }

    /// Detaches the calling thread's accumulator, if any; it is drained and
    /// dropped by the next collect, and a later update re-attaches with a
    /// fresh one. Idempotent.
    pub fn detach(&self) {
        let key = Arc::as_ptr(&self.shared) as usize;
        PRODUCERS.with(|entries| entries.borrow_mut().remove(key));
    }

    fn with_producer<R>(&self, access: impl FnOnce(&ProducerEntry<C, D>) -> R) -> R {
        let key = Arc::as_ptr(&self.shared) as usize;
        PRODUCERS.with(|entries| {
            let mut entries = entries.borrow_mut();
            let entry = entries.get_or_insert(
                key,
                |entry: &ProducerEntry<C, D>| entry.central.strong_count() == 0,
                || self.attach(),
            );
            access(entry)
        })
    }

    fn attach(&self) -> ProducerEntry<C, D> {
        let local = Arc::new(MetricLocal::new());
        let abandoned = self.shared.registry.register(Arc::clone(&local));
        ProducerEntry {
            local,
            abandoned,
            central: Arc::downgrade(&self.shared),
        }
    }
}

/// A producer handle pinned to the thread that created it; see
/// [`LockFreeMetric::writer`].
pub struct MetricWriter<C, D = C> {
    local: Arc<MetricLocal<C, D>>,
    /// The producer side of the local is single-threaded; keeping the handle
    /// `!Send` pins it to the attaching thread.
    _pinned: PhantomData<*const ()>,
}

impl<C, D> MetricWriter<C, D>
where
    C: Absorb<D> + Default,
    D: Clone,
{
    /// Folds `delta` into this thread's accumulator.
    pub fn update(&mut self, delta: D) {
        // The handle is pinned to the producer thread that attached.
        unsafe { self.local.produce(delta) }
    }
}

impl<C, D> fmt::Debug for MetricWriter<C, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricWriter").finish_non_exhaustive()
    }
}

#[cfg(all(test, feature = "std", not(loom)))]
mod tests {
    use super::LockFreeMetric;
    use crate::monoid::Absorb;
    use test_log::test;

    #[test]
    fn test_collect_without_producers_is_empty() {
        let metric = LockFreeMetric::<i64>::new();
        assert!(metric.collect().is_empty());
    }

    #[test]
    fn test_update_then_collect() {
        let metric = LockFreeMetric::<i64>::new();
        metric.update(1);
        assert_eq!(metric.collect(), vec![1]);
        assert_eq!(metric.collect(), vec![0]);
        metric.update(2);
        metric.update(3);
        assert_eq!(metric.collect(), vec![5]);
        assert_eq!(metric.collect(), vec![0]);
    }

    #[test]
    fn test_interleaved_collects_never_double_count() {
        let metric = LockFreeMetric::<i64>::new();
        let mut total = 0;
        metric.update(1);
        total += metric.collect().iter().sum::<i64>();
        metric.update(2);
        metric.update(3);
        total += metric.collect().iter().sum::<i64>();
        metric.update(4);
        total += metric.collect().iter().sum::<i64>();
        total += metric.collect().iter().sum::<i64>();
        assert_eq!(total, 10);
    }

    #[test]
    fn test_writer_handle_bypasses_lookup() {
        let metric = LockFreeMetric::<i64>::new();
        let mut writer = metric.writer();
        for delta in 1..=10 {
            writer.update(delta);
        }
        assert_eq!(metric.collect(), vec![55]);
    }

    #[test]
    fn test_detach_hands_accumulator_to_next_collect() {
        let metric = LockFreeMetric::<i64>::new();
        metric.update(1);
        metric.detach();
        metric.detach();
        metric.update(2);
        let mut collected = metric.collect();
        collected.sort_unstable();
        assert_eq!(collected, vec![1, 2]);
        // The abandoned accumulator is gone, the live one stays.
        assert_eq!(metric.collect(), vec![0]);
    }

    #[test]
    fn test_terminated_producer_is_drained_once() {
        let metric = LockFreeMetric::<i64>::new();
        std::thread::spawn({
            let metric = metric.clone();
            move || {
                metric.update(7);
                metric.update(8);
            }
        })
        .join()
        .unwrap();
        assert_eq!(metric.collect(), vec![15]);
        assert!(metric.collect().is_empty());
    }

    #[test]
    fn test_many_producers_total() {
        const PRODUCERS: i64 = 64;
        const UPDATES: i64 = 50;

        let metric = LockFreeMetric::<i64>::new();
        std::thread::scope(|scope| {
            for _ in 0..PRODUCERS {
                scope.spawn(|| {
                    for delta in 1..=UPDATES {
                        metric.update(delta);
                    }
                });
            }
        });
        let collected = metric.collect();
        assert_eq!(collected.len() as i64, PRODUCERS);
        assert_eq!(
            collected.iter().sum::<i64>(),
            PRODUCERS * UPDATES * (UPDATES + 1) / 2
        );
    }

    #[test]
    fn test_collect_races_with_producers() {
        const UPDATES: i64 = 10_000;

        let metric = LockFreeMetric::<i64>::new();
        let mut total = 0;
        std::thread::scope(|scope| {
            let producer = {
                let metric = metric.clone();
                scope.spawn(move || {
                    for _ in 0..UPDATES {
                        metric.update(1);
                    }
                })
            };
            while !producer.is_finished() {
                total += metric.collect().iter().sum::<i64>();
            }
            producer.join().unwrap();
        });
        total += metric.collect().iter().sum::<i64>();
        assert_eq!(total, UPDATES);
    }

    #[derive(Debug, Default)]
    struct Channel(Vec<&'static str>);

    impl Absorb<&'static str> for Channel {
        fn absorb(&mut self, delta: &'static str) {
            self.0.push(delta);
        }
    }

    /// Accumulating into a collection makes the metric a lossless channel.
    #[test]
    fn test_collection_accumulator() {
        let metric = LockFreeMetric::<Channel, &'static str>::new();
        metric.update("a");
        metric.update("b");
        let collected = metric.collect();
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].0, ["a", "b"]);
        metric.update("c");
        let collected = metric.collect();
        assert_eq!(collected[0].0, ["c"]);
    }
}
