//! Broadcast of a current value to any number of reader threads.
//!
//! A [`CopyRcu`] keeps the authoritative value under a mutex and fans every
//! update out to one [`crate::local_rcu`] instance per reader thread, so a
//! reader's snapshot is a single wait-free word operation after its first
//! access. Writers pay for the fan-out while holding the mutex; updates are
//! coarse-grained events and the read side dominates.

use crate::local_rcu::RawRcu;
use crate::registry::{ThreadEntries, WeakRegistry};
use core::fmt;
use std::cell::RefCell;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

#[cfg(feature = "tracing")]
use tracing::instrument;

thread_local! {
    static VIEWS: RefCell<ThreadEntries> = RefCell::new(ThreadEntries::new());
}

struct Central<T> {
    current: T,
    views: WeakRegistry<RawRcu<T>>,
}

struct CopyShared<T> {
    central: Mutex<Central<T>>,
}

/// A per-thread attachment stored in the thread's local map.
struct ViewEntry<T> {
    view: Arc<RawRcu<T>>,
    central: Weak<CopyShared<T>>,
}

/// A broadcast value with wait-free per-thread reads.
///
/// The handle is cheap to clone; all clones address the same value. Readers
/// that observed an older value keep it, unchanged and valid, until their
/// next snapshot.
pub struct CopyRcu<T> {
    shared: Arc<CopyShared<T>>,
}

impl<T> Clone for CopyRcu<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for CopyRcu<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CopyRcu").finish_non_exhaustive()
    }
}

impl<T: Default + Clone + Send + 'static> Default for CopyRcu<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T: Clone + Send + 'static> CopyRcu<T> {
    /// Creates a broadcast value holding `initial`.
    pub fn new(initial: T) -> Self {
        Self {
            shared: Arc::new(CopyShared {
                central: Mutex::new(Central {
                    current: initial,
                    views: WeakRegistry::new(),
                }),
            }),
        }
    }

    /// Replaces the value in every attached reader thread and returns the
    /// previous one.
    ///
    /// Thread-safe; concurrent updates are serialized by the internal mutex.
    /// A snapshot that starts after this returns observes `value` or a newer
    /// one. The previous value can still be observed by readers that have
    /// not taken a fresh snapshot yet.
    #[cfg_attr(feature = "tracing", instrument(skip_all))]
    pub fn update(&self, value: T) -> T {
        let mut central = relock(&self.shared.central);
        Self::update_locked(&mut central, value)
    }

    /// Like [`update`](Self::update), but only replaces the value when
    /// `predicate` accepts the current one; returns the previous value on
    /// replacement and `None` otherwise.
    ///
    /// The predicate runs under the internal mutex and must not reenter this
    /// broadcast.
    #[cfg_attr(feature = "tracing", instrument(skip_all))]
    pub fn update_if(&self, value: T, predicate: impl FnOnce(&T) -> bool) -> Option<T> {
        let mut central = relock(&self.shared.central);
        if predicate(&central.current) {
            Some(Self::update_locked(&mut central, value))
        } else {
            None
        }
    }

    fn update_locked(central: &mut Central<T>, mut value: T) -> T {
        for view in central.views.prune_and_list() {
            // The mutex serializes all updater-side accesses to the views.
            unsafe {
                *view.update() = value.clone();
                view.force_update();
            }
        }
        core::mem::swap(&mut central.current, &mut value);
        value
    }

    /// Returns a copy of the newest value distributed to this thread.
    ///
    /// The first call from a thread attaches it (taking the mutex once);
    /// every further call is a single wait-free word operation plus the
    /// copy.
    pub fn snapshot(&self) -> T {
        self.snapshot_with(|value, _| value.clone())
    }

    /// No-copy access to this thread's newest value.
    ///
    /// The closure receives the value, valid for the duration of the call,
    /// and whether this call observed a fresh publication. The reference is
    /// stable across calls that report `false`.
    pub fn snapshot_with<R>(&self, observe: impl FnOnce(&T, bool) -> R) -> R {
        let key = Arc::as_ptr(&self.shared) as usize;
        VIEWS.with(|entries| {
            let mut entries = entries.borrow_mut();
            let entry = entries.get_or_insert(
                key,
                |entry: &ViewEntry<T>| entry.central.strong_count() == 0,
                || self.attach(),
            );
            // This thread is the only reader of its view.
            unsafe {
                let fresh = entry.view.try_read();
                observe(&*entry.view.read(), fresh)
            }
        })
    }

    /// Detaches the calling thread's view, if any; the next snapshot
    /// re-attaches. Idempotent.
    pub fn detach(&self) {
        let key = Arc::as_ptr(&self.shared) as usize;
        VIEWS.with(|entries| entries.borrow_mut().remove(key));
    }

    fn attach(&self) -> ViewEntry<T> {
        let central = relock(&self.shared.central);
        // Seed all three slots from the current value so the reader observes
        // it before the first fan-out reaches this view.
        let view = Arc::new(RawRcu::new([
            central.current.clone(),
            central.current.clone(),
            central.current.clone(),
        ]));
        central.views.register(&view);
        ViewEntry {
            view,
            central: Arc::downgrade(&self.shared),
        }
    }
}

/// Broadcast of a shared pointer: [`CopyRcu::update`] distributes an [`Arc`]
/// to every reader thread for the cost of a reference-count bump per view.
///
/// Readers that want to stay off the reference count entirely can borrow the
/// payload through [`CopyRcu::snapshot_with`] instead of cloning it out.
pub type Rcu<T> = CopyRcu<Arc<T>>;
