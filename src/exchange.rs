//! Three-slot exchange between exactly two threads.
//!
//! A [`pair`] owns three payload slots. At any moment one slot belongs to the
//! left side, one to the right side, and one is in flight between them. A
//! single atomic state word tracks which slot is in flight, which side moved
//! it last, and whether that move crossed a move by the opposite side; the
//! per-side bookkeeping lives in the side handles' private contexts and needs
//! no synchronization of its own.
//!
//! [`ExchangeSide::pass`] hands the currently owned slot over and acquires a
//! new one with one compare-exchange (plus one swap when the opposite side
//! acted in between) and reports two facts about the opposite side's
//! activity:
//!
//! - `exchanged`: the opposite side moved since this side's previous pass, so
//!   the acquired slot was previously owned by the opposite side.
//! - `past_exchanged`: the state word showed that the opposite side itself
//!   observed such a crossing, i.e. the acquired slot carries the opposite
//!   side's most recent contribution.

use crate::sync::{Arc, AtomicUsize, Ordering, UnsafeCell};
use core::fmt;
use crossbeam_utils::CachePadded;

/// Side selector for the left (first) endpoint.
pub const LEFT: bool = false;
/// Side selector for the right (second) endpoint.
pub const RIGHT: bool = true;

/// Bits 0..1 of the state word: index of the in-flight slot.
const INDEX_MASK: usize = 0b0011;
/// Bit 2: set iff the right side wrote the state word last.
const BY_RIGHT: usize = 0b0100;
/// Bit 3: set iff the last write crossed a move by the opposite side.
const EXCHANGED: usize = 0b1000;

/// State word value at construction: slot 1 in flight, written "by left".
const INITIAL_WORD: usize = 1;

/// Private per-side bookkeeping. Each context is only ever touched by the
/// handle of its side.
struct SideContext {
    /// Index of the slot this side currently owns.
    index: usize,
    /// The exact value this side last wrote to the state word.
    last: usize,
}

pub(crate) struct RawExchange<T> {
    passing: CachePadded<AtomicUsize>,
    contexts: [UnsafeCell<SideContext>; 2],
    slots: [UnsafeCell<T>; 3],
}

// The slots and contexts are accessed under the exclusive-ownership protocol
// documented on the unsafe methods below, never concurrently by both sides.
unsafe impl<T: Send> Send for RawExchange<T> {}
unsafe impl<T: Send> Sync for RawExchange<T> {}

/// Outcome flags of a raw pass; see [`Pass`] for their meaning.
pub(crate) struct PassFlags {
    pub(crate) exchanged: bool,
    pub(crate) past_exchanged: bool,
}

impl<T> RawExchange<T> {
    pub(crate) fn new(slots: [T; 3]) -> Self {
        Self {
            passing: CachePadded::new(AtomicUsize::new(INITIAL_WORD)),
            contexts: [
                UnsafeCell::new(SideContext {
                    index: 0,
                    last: INITIAL_WORD,
                }),
                // The right side's `last` differs from the initial word in
                // `BY_RIGHT`, so its first pass takes the exchange branch and
                // correctly reports the left-held initial state.
                UnsafeCell::new(SideContext {
                    index: 2,
                    last: INITIAL_WORD ^ BY_RIGHT,
                }),
            ],
            slots: slots.map(UnsafeCell::new),
        }
    }

    /// Pointer to the slot currently owned by side `R`.
    ///
    /// # Safety
    ///
    /// Only the unique owner of side `R` may call this, and the pointer is
    /// valid only until that owner's next `pass`.
    #[inline]
    pub(crate) unsafe fn owned_slot<const R: bool>(&self) -> *mut T {
        let context = &*self.contexts[R as usize].get();
        self.slots[context.index].get()
    }

    /// Hands the owned slot of side `R` over and acquires a new one.
    ///
    /// `on_hand_over` is invoked on the outgoing slot whenever the result may
    /// carry `past_exchanged = true`; the callback may take the slot's value
    /// out, since the opposite side is expected to overwrite it.
    ///
    /// # Safety
    ///
    /// Only the unique owner of side `R` may call this, and no reference
    /// obtained from [`Self::owned_slot`] may be live across the call.
    pub(crate) unsafe fn pass<const R: bool, F>(&self, mut on_hand_over: F) -> PassFlags
    where
        F: FnMut(&mut T),
    {
        let context = &mut *self.contexts[R as usize].get();
        let mut callback_ran = context.last & EXCHANGED != 0;
        if callback_ran {
            on_hand_over(&mut *self.slots[context.index].get());
        }

        let mut want = context.index | if R { BY_RIGHT } else { 0 };
        let (exchanged, received) =
            match self
                .passing
                .compare_exchange(context.last, want, Ordering::AcqRel, Ordering::Acquire)
            {
                // The opposite side has not moved: the in-flight slot is now
                // the one this side just published, and this side takes back
                // the slot it published on its previous pass.
                Ok(previous) => (false, previous),
                Err(observed) => {
                    if observed & EXCHANGED != 0 && !callback_ran {
                        callback_ran = true;
                        on_hand_over(&mut *self.slots[context.index].get());
                    }
                    want |= EXCHANGED;
                    (true, self.passing.swap(want, Ordering::AcqRel))
                }
            };

        context.last = want;
        context.index = received & INDEX_MASK;
        let past_exchanged = received & EXCHANGED != 0;
        // Between a failed compare-exchange and the follow-up swap the
        // opposite side can only succeed its own compare-exchanges, which
        // never set EXCHANGED, so the flag observed by the swap implies the
        // callback already ran above.
        debug_assert!(callback_ran || !past_exchanged);
        PassFlags {
            exchanged,
            past_exchanged,
        }
    }

    /// Owned indices of both sides plus the in-flight index, for invariant
    /// checks from single-threaded tests.
    #[cfg(test)]
    pub(crate) fn occupancy(&self) -> [usize; 3] {
        let left = unsafe { (*self.contexts[0].get()).index };
        let right = unsafe { (*self.contexts[1].get()).index };
        let mid = self.passing.load(Ordering::Relaxed) & INDEX_MASK;
        [left, mid, right]
    }
}

/// One endpoint of a three-slot exchange.
///
/// The handle is [`Send`] but deliberately not [`Clone`]: each side of the
/// channel must be driven by at most one thread at a time.
pub struct ExchangeSide<T, const R: bool> {
    shared: Arc<RawExchange<T>>,
}

/// Result of [`ExchangeSide::pass`]: the newly owned slot and what the pass
/// learned about the opposite side.
pub struct Pass<'a, T> {
    /// The slot now owned by this side, valid until its next pass.
    pub value: &'a mut T,
    /// Whether the opposite side moved since this side's previous pass.
    pub exchanged: bool,
    /// Whether the state word carried the crossing flag when observed, i.e.
    /// the acquired slot holds the opposite side's latest contribution.
    pub past_exchanged: bool,
}

impl<T, const R: bool> ExchangeSide<T, R> {
    /// The slot this side currently owns.
    ///
    /// The reference is stable until the next [`pass`](Self::pass) by this
    /// side; the opposite side never touches this slot in the meantime.
    #[inline]
    pub fn value(&mut self) -> &mut T {
        // The handle is the unique owner of side `R` and `&mut self` keeps
        // the borrow exclusive until the next call.
        unsafe { &mut *self.shared.owned_slot::<R>() }
    }

    /// Hands the owned slot over to the opposite side and acquires a new one.
    pub fn pass(&mut self) -> Pass<'_, T> {
        self.pass_with(|_| {})
    }

    /// Like [`pass`](Self::pass), but `on_hand_over` is invoked on the
    /// outgoing slot whenever the result may report `past_exchanged = true`.
    ///
    /// The callback may move the slot's value out; the slot is about to be
    /// handed to the opposite side, which overwrites it.
    pub fn pass_with<F>(&mut self, on_hand_over: F) -> Pass<'_, T>
    where
        F: FnMut(&mut T),
    {
        let flags = unsafe { self.shared.pass::<R, F>(on_hand_over) };
        Pass {
            value: unsafe { &mut *self.shared.owned_slot::<R>() },
            exchanged: flags.exchanged,
            past_exchanged: flags.past_exchanged,
        }
    }

    #[cfg(test)]
    pub(crate) fn raw(&self) -> &RawExchange<T> {
        &self.shared
    }
}

impl<T, const R: bool> fmt::Debug for ExchangeSide<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeSide")
            .field("right", &R)
            .finish_non_exhaustive()
    }
}

impl<T: fmt::Debug> fmt::Debug for Pass<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pass")
            .field("value", &self.value)
            .field("exchanged", &self.exchanged)
            .field("past_exchanged", &self.past_exchanged)
            .finish()
    }
}

/// Creates a linked pair of exchange sides over three default slots.
pub fn pair<T: Default>() -> (ExchangeSide<T, LEFT>, ExchangeSide<T, RIGHT>) {
    from_slots(core::array::from_fn(|_| T::default()))
}

/// Creates a linked pair of exchange sides over three copies of `initial`.
pub fn pair_with<T: Clone>(initial: T) -> (ExchangeSide<T, LEFT>, ExchangeSide<T, RIGHT>) {
    from_slots([initial.clone(), initial.clone(), initial])
}

pub(crate) fn from_slots<T>(slots: [T; 3]) -> (ExchangeSide<T, LEFT>, ExchangeSide<T, RIGHT>) {
    let shared = Arc::new(RawExchange::new(slots));
    (
        ExchangeSide {
            shared: Arc::clone(&shared),
        },
        ExchangeSide { shared },
    )
}
