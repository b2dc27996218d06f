//! Wrap-around sequence numbers
//!
//! Sequence numbers are 16 bits wide and roll over from 65535 to 0. Ordering
//! is circular: `a` is newer than `b` when `(a - b) mod 65536` lies in
//! `1..=32767`. This stays unambiguous as long as fewer than half the
//! sequence space is in flight at once, which always holds for audio.

/// A 16-bit voice frame sequence number.
pub type SequenceNumber = u16;

/// Half of the sequence space. Distances at or above this are "behind".
pub const HALF_RANGE: u16 = 0x8000;

/// Circular distance from `b` forward to `a`, i.e. `(a - b) mod 65536`.
#[inline]
pub fn distance(a: SequenceNumber, b: SequenceNumber) -> u16 {
    a.wrapping_sub(b)
}

/// True if `a` comes after `b` in circular order.
#[inline]
pub fn is_newer(a: SequenceNumber, b: SequenceNumber) -> bool {
    let d = distance(a, b);
    d != 0 && d < HALF_RANGE
}

/// True if `a` comes before `b` in circular order.
#[inline]
pub fn is_older(a: SequenceNumber, b: SequenceNumber) -> bool {
    is_newer(b, a)
}

/// Per-session outgoing sequence counter.
///
/// The first call to [`SequenceCounter::next`] returns the start value
/// ([`SequenceCounter::START`] unless constructed with
/// [`SequenceCounter::starting_at`]); each call then advances by one with
/// wraparound.
#[derive(Debug, Clone)]
pub struct SequenceCounter {
    next: SequenceNumber,
}

impl SequenceCounter {
    /// Start value for a fresh session.
    pub const START: SequenceNumber = 0;

    pub fn new() -> Self {
        Self::starting_at(Self::START)
    }

    pub fn starting_at(start: SequenceNumber) -> Self {
        Self { next: start }
    }

    /// Return the current value, then advance.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> SequenceNumber {
        let value = self.next;
        self.next = value.wrapping_add(1);
        value
    }

    /// The value the next call to `next()` will return.
    pub fn peek(&self) -> SequenceNumber {
        self.next
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}



/// Kani formal verification proofs
#[cfg(kani)]
mod kani_proofs {
    use super::*;

    /// Proves: for distinct, non-antipodal values exactly one direction holds
    #[kani::proof]
    fn ordering_is_total_off_the_antipode() {
        let a: u16 = kani::any();
        let b: u16 = kani::any();
        kani::assume(a != b);
        kani::assume(distance(a, b) != HALF_RANGE);
        kani::assert(is_newer(a, b) != is_older(a, b), "exactly one must hold");
    }

    /// Proves: the successor of any value is newer than it
    #[kani::proof]
    fn successor_is_newer() {
        let a: u16 = kani::any();
        kani::assert(is_newer(a.wrapping_add(1), a), "a+1 must be newer than a");
    }
}
