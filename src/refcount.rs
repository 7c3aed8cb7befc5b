use crate::sync::{AtomicU32, Ordering};

/// An atomic reference counter with a single-owner fast path.
///
/// The counter starts at 1, the count held by the creator. [`Refcount::inc`]
/// uses relaxed ordering because nobody inspects the value on the increment
/// side; [`Refcount::dec`] publishes all prior writes of the dying holder with
/// acquire-release ordering so that whichever thread observes zero also
/// observes a fully written object.
#[derive(Debug)]
pub struct Refcount {
    count: AtomicU32,
}

impl Refcount {
    /// Creates a counter holding a single reference.
    pub fn new() -> Self {
        Self {
            count: AtomicU32::new(1),
        }
    }

    /// Adds one reference.
    #[inline]
    pub fn inc(&self) {
        // The value is not inspected at all here, so no ordering is needed.
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns whether exactly one reference is held.
    ///
    /// A `true` result is stable only if the caller itself holds that one
    /// reference: no other thread can increment it concurrently.
    #[inline]
    pub fn is_one(&self) -> bool {
        self.count.load(Ordering::Acquire) == 1
    }

    /// Drops one reference and returns `true` iff it was the last one, in
    /// which case the caller must destroy the referenced object and the
    /// counter's state becomes unspecified.
    ///
    /// Pass `expect_one = true` when there is a reasonable chance the caller
    /// holds the only reference. If the check confirms it, the decrement
    /// itself is skipped, which saves the release operation the store would
    /// otherwise need.
    #[inline]
    pub fn dec(&self, expect_one: bool) -> bool {
        if expect_one && self.is_one() {
            // The caller is the only holder, so no other thread can race a
            // decrement; the counter can be abandoned as-is.
            return true;
        }
        let previous = self.count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "reference count underflow");
        previous == 1
    }
}

impl Default for Refcount {
    fn default() -> Self {
        Self::new()
    }
}
