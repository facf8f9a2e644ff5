//! Leadership terms and the total order over writes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Leadership term (epoch) type. Monotonically increasing; a member adopts a
/// new term only if it is strictly greater than its currently known term.
pub type Term = u64;

/// Totally ordered log position: the term in which it was assigned plus a
/// strictly increasing per-term sequence counter. Positions assigned in term
/// T order below all positions of any term T' > T; this is the single source
/// of global write ordering.
#[derive(
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Clone,
    Copy,
    Serialize,
    Deserialize,
)]
pub struct LogPosition {
    /// Term in which this position was assigned.
    pub term: Term,

    /// Sequence counter within the term, starting from 0.
    pub seq: u64,
}

impl LogPosition {
    /// The zero position, ordering below every assigned position (real
    /// terms start from 1). Stands for "empty history".
    pub const ZERO: LogPosition = LogPosition { term: 0, seq: 0 };

    /// Creates a log position from term and in-term sequence number.
    #[inline]
    pub fn new(term: Term, seq: u64) -> Self {
        LogPosition { term, seq }
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.term, self.seq)
    }
}

/// Tracker of the current term, the next in-term sequence number to assign,
/// and the highest position accepted locally. Mutated only from the owning
/// replica's event loop.
#[derive(Debug, Clone)]
pub(crate) struct TermTracker {
    /// Currently known term.
    term: Term,

    /// Next sequence number to assign within `term` (leader side).
    next_seq: u64,

    /// Highest log position accepted by this member.
    high: LogPosition,
}

impl TermTracker {
    /// Creates a new tracker knowing no term and empty history.
    pub(crate) fn new() -> Self {
        TermTracker {
            term: 0,
            next_seq: 0,
            high: LogPosition::ZERO,
        }
    }

    /// Currently known term.
    #[inline]
    pub(crate) fn current(&self) -> Term {
        self.term
    }

    /// Highest accepted position.
    #[inline]
    pub(crate) fn high(&self) -> LogPosition {
        self.high
    }

    /// Adopts a new term if it is strictly greater than the currently known
    /// one; never regresses. Returns true if adopted. Adoption restarts the
    /// in-term sequence counter.
    pub(crate) fn adopt(&mut self, term: Term) -> bool {
        if term > self.term {
            self.term = term;
            self.next_seq = 0;
            true
        } else {
            false
        }
    }

    /// Assigns the next log position in the current term. The caller must
    /// be the (single) leader-side assigner.
    pub(crate) fn assign_next(&mut self) -> LogPosition {
        let pos = LogPosition::new(self.term, self.next_seq);
        self.next_seq += 1;
        debug_assert!(pos > self.high || self.high == LogPosition::ZERO);
        self.high = pos;
        pos
    }

    /// Records a position accepted from the leader, advancing the high
    /// watermark.
    pub(crate) fn observe(&mut self, pos: LogPosition) {
        if pos > self.high {
            self.high = pos;
        }
    }

    /// Initializes the next-position counter above the given position, as
    /// done at leader activation with the maximum position reported by the
    /// acknowledging quorum. Positions of lower terms need no counter bump
    /// (a fresh term's seq 0 already orders above them).
    pub(crate) fn prime_above(&mut self, pos: LogPosition) {
        if pos.term == self.term && pos.seq >= self.next_seq {
            self.next_seq = pos.seq + 1;
        }
        self.observe(pos);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_ordering() {
        assert!(LogPosition::new(1, 0) > LogPosition::ZERO);
        assert!(LogPosition::new(1, 1) > LogPosition::new(1, 0));
        // all positions of term 2 order above all of term 1
        assert!(LogPosition::new(2, 0) > LogPosition::new(1, 999));
        assert_eq!(format!("{}", LogPosition::new(3, 14)), "3.14");
    }

    #[test]
    fn adopt_never_regresses() {
        let mut tracker = TermTracker::new();
        assert!(tracker.adopt(1));
        assert!(tracker.adopt(3));
        assert!(!tracker.adopt(3));
        assert!(!tracker.adopt(2));
        assert_eq!(tracker.current(), 3);
    }

    #[test]
    fn assign_strictly_increasing() {
        let mut tracker = TermTracker::new();
        tracker.adopt(1);
        let a = tracker.assign_next();
        let b = tracker.assign_next();
        assert!(b > a);
        assert_eq!(a, LogPosition::new(1, 0));
        assert_eq!(b, LogPosition::new(1, 1));
        assert_eq!(tracker.high(), b);

        // new term restarts the sequence but orders above
        tracker.adopt(2);
        let c = tracker.assign_next();
        assert_eq!(c, LogPosition::new(2, 0));
        assert!(c > b);
    }

    #[test]
    fn observe_and_prime() {
        let mut tracker = TermTracker::new();
        tracker.adopt(2);
        tracker.observe(LogPosition::new(1, 41));
        assert_eq!(tracker.high(), LogPosition::new(1, 41));

        // priming with an older-term position leaves next_seq at 0
        tracker.prime_above(LogPosition::new(1, 41));
        assert_eq!(tracker.assign_next(), LogPosition::new(2, 0));

        // priming with a same-term position bumps the counter above it
        let mut tracker = TermTracker::new();
        tracker.adopt(2);
        tracker.prime_above(LogPosition::new(2, 6));
        assert_eq!(tracker.assign_next(), LogPosition::new(2, 7));
    }
}
