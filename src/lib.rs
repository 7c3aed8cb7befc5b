//! # tricell
//!
//! Lock-free primitives for sharing values between threads, all built around
//! one idea: three pre-allocated slots rotating between two sides, steered by
//! a single atomic word. No hot-path operation takes a lock, loops, or
//! allocates; each is one or two atomic read-modify-writes on that word.
//!
//! The two-thread cores are:
//!
//! - [`exchange`], a symmetric three-slot channel. Each side hands its slot
//!   over and learns whether the opposite side has acted since last time,
//!   which is enough to build lossless protocols on top.
//! - [`local_rcu`], the asymmetric specialization: an updater publishes
//!   replacement values, a reader always observes the most recent one.
//! - [`monoid`], a two-thread accumulator over [`exchange`] that folds
//!   deltas with a user-supplied [`monoid::Absorb`] operation without ever
//!   losing or double-folding one.
//!
//! Scaled out across threads (requires the `std` feature, on by default):
//!
//! - [`rcu`], a broadcast value: one update fans out to a private
//!   [`local_rcu`] per reader thread, so every read is a single wait-free
//!   word operation.
//! - [`metric`], the inverse channel: many producer threads fold deltas
//!   locally and a collector drains all of them.
//!
//! # Example
//!
//! ```
//! use std::thread;
//! use tricell::{CopyRcu, LockFreeMetric};
//!
//! let config = CopyRcu::new(String::from("v1"));
//! let hits = LockFreeMetric::<u64>::new();
//!
//! thread::scope(|scope| {
//!     for _ in 0..4 {
//!         scope.spawn(|| {
//!             // Wait-free after this thread's first access.
//!             assert_eq!(config.snapshot(), "v1");
//!             hits.update(1);
//!         });
//!     }
//! });
//!
//! assert_eq!(config.update(String::from("v2")), "v1");
//! assert_eq!(hits.collect().iter().sum::<u64>(), 4);
//! ```
//!
//! The two-thread cores are used directly by moving one endpoint to another
//! thread:
//!
//! ```
//! let (mut left, mut right) = tricell::monoid::pair::<i32, i32>(0);
//! left.update(2);
//! let (collected, crossed) = right.update(3);
//! assert_eq!((*collected, crossed), (2, true));
//! ```
//!
//! # Testing
//!
//! The state-machine cores are model-checked with `loom` (build with
//! `RUSTFLAGS="--cfg loom"`) and the fan-in layer is randomized with
//! `shuttle` behind the `shuttle` feature.

#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_debug_implementations, missing_docs)]

extern crate alloc;

pub mod exchange;
pub mod local_rcu;
#[cfg(all(feature = "std", not(loom)))]
pub mod metric;
pub mod monoid;
#[cfg(all(feature = "std", not(loom)))]
pub mod rcu;
pub mod refcount;
#[cfg(all(feature = "std", not(loom)))]
mod registry;
mod sync;

pub use exchange::{ExchangeSide, Pass, LEFT, RIGHT};
pub use local_rcu::{RcuReader, RcuUpdater};
#[cfg(all(feature = "std", not(loom)))]
pub use metric::{LockFreeMetric, MetricWriter};
pub use monoid::{Absorb, MonoidSide};
#[cfg(all(feature = "std", not(loom)))]
pub use rcu::{CopyRcu, Rcu};
pub use refcount::Refcount;
