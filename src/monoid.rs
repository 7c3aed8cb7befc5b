//! Lossless two-thread accumulation of deltas over a three-slot exchange.
//!
//! Each slot of the underlying [`crate::exchange`] carries an accumulator
//! together with one *pending* delta. Folding the pending delta is delayed by
//! exactly one step, so the newest delta is always recoverable from whichever
//! slot crosses to the opposite side, and no delta is ever folded twice into
//! the same accumulator. Both sides thereby converge on the combined history
//! of all deltas, each seeing the other side's contributions at the latest
//! one pass later.

use crate::exchange::{ExchangeSide, LEFT, RIGHT};
use core::fmt;
use core::ops::AddAssign;

/// Accumulation seam: folds a delta of type `D` into `Self`.
///
/// The operation must behave like a left-associative monoid action: applying
/// the same sequence of deltas to two accumulators and then combining their
/// histories must be order-insensitive across the two-thread boundary.
/// Numeric `+=`, set union and list append all qualify. It is implemented
/// for free wherever `AddAssign` exists.
pub trait Absorb<D> {
    /// Folds `delta` into the accumulator.
    fn absorb(&mut self, delta: D);
}

impl<C, D> Absorb<D> for C
where
    C: AddAssign<D>,
{
    #[inline]
    fn absorb(&mut self, delta: D) {
        *self += delta;
    }
}

/// One slot's payload: the running fold plus the one delta whose folding is
/// still delayed. `last == None` is the identity delta.
pub(crate) struct Slice<C, D> {
    pub(crate) collected: C,
    pub(crate) last: Option<D>,
}

impl<C, D> Slice<C, D> {
    pub(crate) fn new(collected: C) -> Self {
        Self {
            collected,
            last: None,
        }
    }

    /// Folds the previously pending delta into the accumulator and makes
    /// `value` the new pending delta.
    pub(crate) fn append(&mut self, value: Option<D>)
    where
        C: Absorb<D>,
    {
        if let Some(pending) = self.last.take() {
            self.collected.absorb(pending);
        }
        self.last = value;
    }
}

impl<C: Clone, D: Clone> Clone for Slice<C, D> {
    fn clone(&self) -> Self {
        Self {
            collected: self.collected.clone(),
            last: self.last.clone(),
        }
    }
}

/// One endpoint of a two-thread accumulator; `Send` but not `Clone`.
pub struct MonoidSide<C, D, const R: bool> {
    side: ExchangeSide<Slice<C, D>, R>,
}

impl<C, D, const R: bool> MonoidSide<C, D, R>
where
    C: Absorb<D> + Clone,
    D: Clone,
{
    /// Contributes `delta` and returns the accumulator now owned by this
    /// side, together with whether this call crossed a move by the opposite
    /// side.
    ///
    /// The returned accumulator covers every delta this side knows about
    /// *except* `delta` itself, which stays pending until the next call on
    /// either side; use [`observe_last`](Self::observe_last) to fold it in
    /// place.
    pub fn update(&mut self, delta: D) -> (&C, bool) {
        self.side.value().append(Some(delta.clone()));

        let mut outgoing: Option<Slice<C, D>> = None;
        let pass = self
            .side
            .pass_with(|slice: &mut Slice<C, D>| outgoing = Some(slice.clone()));
        let exchanged = pass.exchanged;
        let next = pass.value;

        match outgoing.filter(|_| pass.past_exchanged) {
            None => {
                // The opposite side was quiet (or the acquired slot predates
                // its activity): the slot's own history is current, only the
                // delayed fold and the new delta are missing.
                next.append(Some(delta));
            }
            Some(previous) if exchanged => {
                // True crossing: the acquired slot lags behind this side's
                // own history except for the opposite side's newest delta,
                // which sits in its pending slot.
                next.collected = previous.collected;
                next.append(Some(delta));
            }
            Some(previous) => {
                // This side got its own previously handed slot back. Its
                // pending delta is already folded into `previous.collected`,
                // so splice the history in without folding it again.
                next.collected = previous.collected;
                next.last = Some(delta);
            }
        }
        (&next.collected, exchanged)
    }

    /// Folds the pending delta into this side's accumulator and returns it.
    ///
    /// Idempotent between updates; the reference is valid until the next
    /// call on this side.
    pub fn observe_last(&mut self) -> &C {
        let slice = self.side.value();
        slice.append(None);
        &slice.collected
    }
}

impl<C, D, const R: bool> fmt::Debug for MonoidSide<C, D, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonoidSide")
            .field("right", &R)
            .finish_non_exhaustive()
    }
}

/// Creates a linked pair of accumulator endpoints, both starting from
/// `initial` with no pending delta.
pub fn pair<C, D>(initial: C) -> (MonoidSide<C, D, LEFT>, MonoidSide<C, D, RIGHT>)
where
    C: Clone,
{
    let (left, right) = crate::exchange::from_slots([
        Slice::new(initial.clone()),
        Slice::new(initial.clone()),
        Slice::new(initial),
    ]);
    (MonoidSide { side: left }, MonoidSide { side: right })
}

#[cfg(all(test, feature = "std", not(loom)))]
mod tests {
    use super::{pair, Absorb};
    use test_log::test;

    #[test]
    fn test_interleaved_string_appends() {
        let (mut left, mut right) = pair::<String, &str>(String::new());
        assert_eq!(left.update("a").0, "");
        let (collected, exchanged) = right.update("b");
        assert_eq!((collected.as_str(), exchanged), ("a", true));
        let (collected, exchanged) = right.update("c");
        assert_eq!((collected.as_str(), exchanged), ("ab", false));
        // Another round.
        assert_eq!(left.update("x").0, "abc");
        let (collected, exchanged) = left.update("");
        assert_eq!((collected.as_str(), exchanged), ("abcx", false));
        let (collected, exchanged) = right.update("y");
        assert_eq!((collected.as_str(), exchanged), ("abcx", true));
        let (collected, exchanged) = right.update("");
        assert_eq!((collected.as_str(), exchanged), ("abcxy", false));
    }

    #[test]
    fn test_observe_last_is_idempotent() {
        let (mut left, mut right) = pair::<String, &str>(String::new());
        left.update("a");
        assert_eq!(left.observe_last(), "a");
        assert_eq!(left.observe_last(), "a");
        right.update("b");
        assert_eq!(right.observe_last(), "ab");
        assert_eq!(right.observe_last(), "ab");
        right.update("c");
        assert_eq!(right.observe_last(), "abc");
        left.update("x");
        assert_eq!(left.observe_last(), "abcx");
        assert_eq!(left.observe_last(), "abcx");
    }

    #[test]
    fn test_zig_zag_totals() {
        let (mut left, mut right) = pair::<i32, i32>(0);
        assert_eq!(left.update(1), (&0, false));
        assert_eq!(right.update(2), (&1, true));
        assert_eq!(left.update(4), (&3, true));
        assert_eq!(right.update(8), (&7, true));
        assert_eq!(left.update(16), (&15, true));
        assert_eq!(right.update(32), (&31, true));
        assert_eq!(right.update(0), (&63, false));
    }

    #[test]
    fn test_one_sided_burst_crosses_whole() {
        let (mut left, mut right) = pair::<i32, i32>(0);
        for delta in [1, 2, 3] {
            left.update(delta);
        }
        let (collected, exchanged) = right.update(0);
        assert_eq!((*collected, exchanged), (6, true));
    }

    #[derive(Clone, Debug, Default, PartialEq)]
    struct Tags(Vec<u32>);

    impl Absorb<u32> for Tags {
        fn absorb(&mut self, delta: u32) {
            self.0.push(delta);
        }
    }

    /// Every delta is folded at most once into any given accumulator, and a
    /// side's own deltas are never lost.
    #[test]
    fn test_conservation_over_pseudo_random_schedule() {
        let (mut left, mut right) = pair::<Tags, u32>(Tags::default());
        let mut state = 0x2545f491u32;
        let mut left_tags = Vec::new();
        let mut right_tags = Vec::new();
        for tag in 0..256u32 {
            // xorshift32 schedule
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            let collected = if state & 1 == 0 {
                left_tags.push(tag);
                left.update(tag).0
            } else {
                right_tags.push(tag);
                right.update(tag).0
            };
            let mut seen = collected.0.clone();
            seen.sort_unstable();
            seen.dedup();
            assert_eq!(seen.len(), collected.0.len(), "no duplicated fold");
        }

        for (side, own) in [
            (left.observe_last(), &left_tags),
            (right.observe_last(), &right_tags),
        ] {
            let mut seen = side.0.clone();
            seen.sort_unstable();
            for tag in own {
                assert!(seen.binary_search(tag).is_ok(), "own delta {tag} lost");
            }
            seen.dedup();
            assert_eq!(seen.len(), side.0.len(), "no duplicated fold");
        }
    }
}
