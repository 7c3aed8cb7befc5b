use tricell::monoid::{self, Absorb};

cfg_if::cfg_if! {
    if #[cfg(loom)] {
        pub(crate) use loom::thread;
    } else if #[cfg(feature = "shuttle")] {
        pub(crate) use shuttle::thread;
    } else {
        pub(crate) use std::thread;
    }
}

/// Bit-set accumulator whose fold asserts the exactly-once property: no
/// accumulator instance may absorb the same delta twice.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct DeltaSet(pub(crate) u64);

impl Absorb<u64> for DeltaSet {
    fn absorb(&mut self, delta: u64) {
        assert_eq!(
            self.0 & delta,
            0,
            "a delta must fold at most once into any accumulator"
        );
        self.0 |= delta;
    }
}

/// Race `per_side` updates on each end of a two-thread accumulator, then
/// verify that no delta was lost or double-folded.
pub(crate) fn two_thread_accumulation_test(per_side: u32) {
    assert!(2 * per_side <= u64::BITS);
    let (mut left, mut right) = monoid::pair::<DeltaSet, u64>(DeltaSet::default());

    let left_handle = thread::spawn(move || {
        for bit in 0..per_side {
            left.update(1u64 << bit);
        }
        left
    });
    let right_handle = thread::spawn(move || {
        for bit in per_side..2 * per_side {
            right.update(1u64 << bit);
        }
        right
    });
    let mut left = left_handle.join().expect("the left thread panicked");
    let mut right = right_handle.join().expect("the right thread panicked");

    // A zero delta is the identity of the bit-set fold; a couple of
    // identity updates propagate both histories across the pair.
    left.update(0);
    right.update(0);
    left.update(0);

    let left_bits = (1u64 << per_side) - 1;
    let right_bits = ((1u64 << per_side) - 1) << per_side;
    let left_seen = left.observe_last().0;
    let right_seen = right.observe_last().0;
    assert_eq!(left_seen & left_bits, left_bits, "left deltas lost");
    assert_eq!(right_seen & right_bits, right_bits, "right deltas lost");
    assert_eq!(left_seen | right_seen, left_bits | right_bits);
}
