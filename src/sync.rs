//! Facade over the synchronization primitives used by the crate.
//!
//! Re-exports the `std` implementations normally, the `loom` implementations
//! under `--cfg loom` so the protocol tests can model-check interleavings, and
//! the `core` implementations for `no_std` builds.

#[cfg(all(feature = "std", not(loom)))]
pub(crate) use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

#[cfg(loom)]
pub(crate) use loom::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

#[cfg(not(any(loom, feature = "std")))]
pub(crate) use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

#[cfg(loom)]
pub(crate) use loom::sync::Arc;

#[cfg(not(loom))]
pub(crate) use alloc::sync::Arc;

/// Interior-mutability cell for the payload slots and per-side contexts.
///
/// The slots are never accessed by both sides at once: the state-word protocol
/// hands exclusive ownership back and forth, so a plain
/// [`core::cell::UnsafeCell`] is used under loom as well and only the state
/// words themselves are modeled.
#[repr(transparent)]
pub(crate) struct UnsafeCell<T: ?Sized>(core::cell::UnsafeCell<T>);

impl<T> UnsafeCell<T> {
    pub(crate) const fn new(data: T) -> UnsafeCell<T> {
        UnsafeCell(core::cell::UnsafeCell::new(data))
    }
}

impl<T: ?Sized> UnsafeCell<T> {
    #[inline]
    pub(crate) fn get(&self) -> *mut T {
        self.0.get()
    }
}
