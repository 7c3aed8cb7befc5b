//! Bookkeeping that binds per-thread instances to a central object.
//!
//! Two flavors exist, differing in who owns a per-thread instance after its
//! thread terminates:
//!
//! - [`WeakRegistry`]: the central object holds weak references; the strong
//!   reference lives in the thread's local map, so thread exit destroys the
//!   instance unless a concurrent [`WeakRegistry::prune_and_list`] upgraded
//!   it first.
//! - [`DelayedRegistry`]: the central object owns the instances; thread exit
//!   only raises an `abandoned` flag, and the next
//!   [`DelayedRegistry::prune_and_list`] transfers ownership of flagged
//!   instances out for one final drain.
//!
//! Both registries are touched only on a thread's first attachment and
//! during pruning; the hot paths go straight to the per-thread instance.

use std::any::Any;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // The registries hold plain lists, which stay consistent across a
    // poisoning panic elsewhere.
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Central-side bookkeeping of the weak flavor.
pub(crate) struct WeakRegistry<L> {
    entries: Mutex<Vec<Weak<L>>>,
}

impl<L> WeakRegistry<L> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn register(&self, local: &Arc<L>) {
        relock(&self.entries).push(Arc::downgrade(local));
    }

    /// Drops entries whose thread has terminated and returns strong
    /// references to the still-alive per-thread instances.
    pub(crate) fn prune_and_list(&self) -> Vec<Arc<L>> {
        let mut entries = relock(&self.entries);
        let before = entries.len();
        let mut live = Vec::with_capacity(before);
        entries.retain(|entry| match entry.upgrade() {
            Some(local) => {
                live.push(local);
                true
            }
            None => false,
        });
        let expired = before - entries.len();
        #[cfg(feature = "tracing")]
        if expired > 0 {
            tracing::debug!(expired, "dropped expired per-thread instances");
        }
        #[cfg(not(feature = "tracing"))]
        let _ = expired;
        live
    }
}

/// Central-side bookkeeping of the delayed flavor.
pub(crate) struct DelayedRegistry<L> {
    entries: Mutex<Vec<DelayedEntry<L>>>,
}

struct DelayedEntry<L> {
    local: Arc<L>,
    abandoned: Arc<AtomicBool>,
}

/// Result of [`DelayedRegistry::prune_and_list`].
pub(crate) struct Pruned<L> {
    /// Instances whose thread is still attached.
    pub(crate) live: Vec<Arc<L>>,
    /// Instances whose thread terminated; ownership now rests with the
    /// caller, which is expected to drain and drop them.
    pub(crate) abandoned: Vec<Arc<L>>,
}

impl<L> DelayedRegistry<L> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Takes ownership of `local` and returns the flag the attaching thread
    /// must raise (with release ordering) when it detaches.
    pub(crate) fn register(&self, local: Arc<L>) -> Arc<AtomicBool> {
        let abandoned = Arc::new(AtomicBool::new(false));
        relock(&self.entries).push(DelayedEntry {
            local,
            abandoned: Arc::clone(&abandoned),
        });
        abandoned
    }

    pub(crate) fn prune_and_list(&self) -> Pruned<L> {
        let mut entries = relock(&self.entries);
        let mut live = Vec::with_capacity(entries.len());
        let mut abandoned = Vec::new();
        entries.retain(|entry| {
            if entry.abandoned.load(Ordering::Acquire) {
                abandoned.push(Arc::clone(&entry.local));
                false
            } else {
                live.push(Arc::clone(&entry.local));
                true
            }
        });
        #[cfg(feature = "tracing")]
        if !abandoned.is_empty() {
            tracing::debug!(abandoned = abandoned.len(), "reaping abandoned per-thread instances");
        }
        Pruned { live, abandoned }
    }
}

/// A thread's map from central-object identity to its local attachment,
/// type-erased so a single `thread_local!` serves every payload type.
///
/// An entry is replaced when its central object died and a new one was
/// allocated at the same address, which the `is_stale` predicate detects via
/// an expired [`Weak`] back-reference.
pub(crate) struct ThreadEntries {
    map: HashMap<usize, Box<dyn Any>>,
}

impl ThreadEntries {
    pub(crate) fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    pub(crate) fn get_or_insert<E: Any>(
        &mut self,
        key: usize,
        is_stale: impl FnOnce(&E) -> bool,
        attach: impl FnOnce() -> E,
    ) -> &mut E {
        let slot = match self.map.entry(key) {
            Entry::Occupied(occupied) => {
                let slot = occupied.into_mut();
                let reusable = slot.downcast_ref::<E>().is_some_and(|entry| !is_stale(entry));
                if !reusable {
                    *slot = Box::new(attach());
                }
                slot
            }
            Entry::Vacant(vacant) => vacant.insert(Box::new(attach())),
        };
        match slot.downcast_mut::<E>() {
            Some(entry) => entry,
            None => unreachable!("freshly attached thread entry has the attachment's type"),
        }
    }

    pub(crate) fn remove(&mut self, key: usize) {
        self.map.remove(&key);
    }
}
