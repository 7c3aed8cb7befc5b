//! Most-recent-value channel between a reader thread and an updater thread.
//!
//! Like [`crate::exchange`], a [`pair`] juggles three pre-allocated slots, but
//! the roles are asymmetric: the updater publishes replacement values and the
//! reader only ever advances to the newest published one. The single shared
//! word holds either the index of a slot carrying a new value for the reader
//! or [`NULL_INDEX`] when the in-flight slot is travelling back from the
//! reader to the updater.
//!
//! No allocation and no loop happens in any operation; each state change is
//! one atomic read-modify-write on the shared word.

use crate::sync::{Arc, AtomicUsize, Ordering, UnsafeCell};
use core::fmt;
use crossbeam_utils::CachePadded;

/// Sentinel stored in the shared word when no new value is ready: the
/// in-flight slot belongs to the updater once reclaimed.
const NULL_INDEX: usize = 3;

/// Reader-side bookkeeping, touched only by the reader.
struct ReadContext {
    /// Index of the slot the reader currently owns.
    index: usize,
}

/// Updater-side bookkeeping, touched only by the updater.
struct UpdateContext {
    /// Index of the slot the updater currently owns.
    index: usize,
    /// The last value this side pushed into the shared word.
    next_index: usize,
}

impl UpdateContext {
    /// The slot that is neither owned by the updater nor in flight; after a
    /// successful publication this is the slot the reader released.
    fn old_read_index(&self) -> usize {
        (0 + 1 + 2) - (self.index + self.next_index)
    }

    /// After `index` was pushed into the shared word, rotate the remaining
    /// indices: `next_index <- index <- old read index`.
    fn rotate_after_publish(&mut self) {
        let old_read_index = self.old_read_index();
        self.next_index = self.index;
        self.index = old_read_index;
        debug_assert_ne!(self.index, self.next_index);
    }
}

pub(crate) struct RawRcu<T> {
    next_read: CachePadded<AtomicUsize>,
    read: UnsafeCell<ReadContext>,
    update: UnsafeCell<UpdateContext>,
    slots: [UnsafeCell<T>; 3],
}

// Slots and contexts follow the exclusive-ownership protocol documented on
// the unsafe methods; the shared word carries the acquire/release edges.
unsafe impl<T: Send> Send for RawRcu<T> {}
unsafe impl<T: Send> Sync for RawRcu<T> {}

impl<T> RawRcu<T> {
    /// `slots[0]` is the reader's initial value, `slots[1]` the updater's,
    /// `slots[2]` the value reclaimed by the first publication.
    pub(crate) fn new(slots: [T; 3]) -> Self {
        Self {
            next_read: CachePadded::new(AtomicUsize::new(NULL_INDEX)),
            read: UnsafeCell::new(ReadContext { index: 0 }),
            update: UnsafeCell::new(UpdateContext {
                index: 1,
                next_index: 0,
            }),
            slots: slots.map(UnsafeCell::new),
        }
    }

    /// # Safety
    ///
    /// Reader-side: only one thread at a time may use the `read`/`try_read`
    /// methods, and the pointer is invalidated by the next `try_read` that
    /// returns `true`.
    #[inline]
    pub(crate) unsafe fn read(&self) -> *mut T {
        let context = &*self.read.get();
        self.slots[context.index].get()
    }

    /// Advances the reader to a newly published value, if there is one.
    ///
    /// # Safety
    ///
    /// Reader-side; see [`Self::read`].
    pub(crate) unsafe fn try_read(&self) -> bool {
        let next_read = self.next_read.swap(NULL_INDEX, Ordering::AcqRel);
        if next_read != NULL_INDEX {
            (*self.read.get()).index = next_read;
            true
        } else {
            false
        }
    }

    /// # Safety
    ///
    /// Updater-side: only one thread at a time may use the `update*`,
    /// `force_update` and `reclaim` methods, and the pointer is invalidated
    /// by the next `try_update` returning `true` or by any `force_update`.
    #[inline]
    pub(crate) unsafe fn update(&self) -> *mut T {
        let context = &*self.update.get();
        self.slots[context.index].get()
    }

    /// Publishes the updater's slot if the reader has taken the previous one.
    ///
    /// Returns `true` iff the publication happened, in which case the updater
    /// now owns the slot the reader released.
    ///
    /// # Safety
    ///
    /// Updater-side; see [`Self::update`].
    pub(crate) unsafe fn try_update(&self) -> bool {
        let context = &mut *self.update.get();
        // Relaxed on failure: nothing is read through the observed value.
        if self
            .next_read
            .compare_exchange(NULL_INDEX, context.index, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            context.rotate_after_publish();
            true
        } else {
            false
        }
    }

    /// Publishes the updater's slot unconditionally.
    ///
    /// Returns `true` iff the reader had taken the previous publication; when
    /// it had not, the displaced value is discarded unseen and `false` is
    /// returned.
    ///
    /// # Safety
    ///
    /// Updater-side; see [`Self::update`].
    pub(crate) unsafe fn force_update(&self) -> bool {
        let context = &mut *self.update.get();
        let previous = self.next_read.swap(context.index, Ordering::AcqRel);
        if previous == NULL_INDEX {
            context.rotate_after_publish();
            true
        } else {
            // The reader has not advanced; the old in-flight slot comes
            // straight back to the updater.
            context.next_index = context.index;
            context.index = previous;
            false
        }
    }

    /// The slot the reader released, if the in-flight slot is travelling
    /// towards the updater; `None` while a publication is pending.
    ///
    /// # Safety
    ///
    /// Updater-side; see [`Self::update`]. The pointer is invalidated by the
    /// next state-changing updater call.
    pub(crate) unsafe fn reclaim(&self) -> Option<*mut T> {
        if self.next_read.load(Ordering::Acquire) == NULL_INDEX {
            let context = &*self.update.get();
            Some(self.slots[context.old_read_index()].get())
        } else {
            None
        }
    }
}

/// Reader endpoint of a [`pair`]; `Send` but not `Clone`.
pub struct RcuReader<T> {
    shared: Arc<RawRcu<T>>,
}

/// Updater endpoint of a [`pair`]; `Send` but not `Clone`.
pub struct RcuUpdater<T> {
    shared: Arc<RawRcu<T>>,
}

impl<T> RcuReader<T> {
    /// The reader's current value.
    ///
    /// As long as [`try_read`](Self::try_read) keeps returning `false`, this
    /// returns the identically addressed slot with unchanged contents.
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        unsafe { &mut *self.shared.read() }
    }

    /// Shared-reference variant of [`get_mut`](Self::get_mut).
    #[inline]
    pub fn get(&self) -> &T {
        // Still exclusive to the reader side; `&self` only narrows what the
        // caller can do with the result.
        unsafe { &*self.shared.read() }
    }

    /// Advances to the most recently published value, returning whether the
    /// reader moved. A previously obtained reference must not be used again
    /// after this returns `true`.
    #[inline]
    pub fn try_read(&mut self) -> bool {
        unsafe { self.shared.try_read() }
    }
}

impl<T> RcuUpdater<T> {
    /// The updater's staging value, to be filled before publication.
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        unsafe { &mut *self.shared.update() }
    }

    /// Shared-reference variant of [`get_mut`](Self::get_mut).
    #[inline]
    pub fn get(&self) -> &T {
        unsafe { &*self.shared.update() }
    }

    /// Publishes the staging slot if the reader already consumed the previous
    /// publication; on success the staging slot afterwards is the one the
    /// reader released, ready for reuse.
    #[inline]
    pub fn try_update(&mut self) -> bool {
        unsafe { self.shared.try_update() }
    }

    /// Publishes the staging slot unconditionally, displacing an unconsumed
    /// previous publication if there is one (it is discarded unseen, and
    /// `false` is returned).
    #[inline]
    pub fn force_update(&mut self) -> bool {
        unsafe { self.shared.force_update() }
    }

    /// Accesses the slot the reader finished with, without publishing a new
    /// value; `None` while a publication is still pending.
    #[inline]
    pub fn reclaim(&mut self) -> Option<&mut T> {
        unsafe { self.shared.reclaim().map(|slot| &mut *slot) }
    }
}

impl<T> fmt::Debug for RcuReader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RcuReader").finish_non_exhaustive()
    }
}

impl<T> fmt::Debug for RcuUpdater<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RcuUpdater").finish_non_exhaustive()
    }
}

/// Creates a linked reader/updater pair over three default values.
pub fn pair<T: Default>() -> (RcuReader<T>, RcuUpdater<T>) {
    from_slots(core::array::from_fn(|_| T::default()))
}

/// Creates a linked reader/updater pair over three copies of `value`.
pub fn pair_with<T: Clone>(value: T) -> (RcuReader<T>, RcuUpdater<T>) {
    from_slots([value.clone(), value.clone(), value])
}

/// Creates a linked reader/updater pair with distinct initial values:
/// `read` is visible through the reader, `update` through the updater, and
/// `reclaim` is what the updater gets back from its first successful
/// publication.
pub fn pair_from<T>(read: T, update: T, reclaim: T) -> (RcuReader<T>, RcuUpdater<T>) {
    from_slots([read, update, reclaim])
}

pub(crate) fn from_slots<T>(slots: [T; 3]) -> (RcuReader<T>, RcuUpdater<T>) {
    let shared = Arc::new(RawRcu::new(slots));
    (
        RcuReader {
            shared: Arc::clone(&shared),
        },
        RcuUpdater { shared },
    )
}
