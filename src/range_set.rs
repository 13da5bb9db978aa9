use std::fmt::{Display, Formatter};

use crate::sequence::SequenceNumber;

/// An inclusive interval of sequence numbers confirmed delivered by the
///  receiver.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct SequenceRange {
    pub lower: SequenceNumber,
    pub upper: SequenceNumber,
}

impl SequenceRange {
    pub fn new(lower: SequenceNumber, upper: SequenceNumber) -> SequenceRange {
        assert!(lower <= upper, "range bounds out of order");
        SequenceRange { lower, upper }
    }

    pub fn contains(&self, n: SequenceNumber) -> bool {
        self.lower <= n && n <= self.upper
    }
}

impl Display for SequenceRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{},{}]", self.lower, self.upper)
    }
}

/// An ordered set of disjoint inclusive ranges of acknowledged sequence
///  numbers.
///
/// Invariant: ranges are sorted, non-overlapping and non-adjacent (adjacent
///  ranges are merged on construction).
///
/// This is an immutable value type - all combining operations return a new
///  set. Successive acknowledgements are compared against each other for
///  consistency, so earlier sets must stay untouched.
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct SequenceRangeSet {
    ranges: Vec<SequenceRange>,
}

impl SequenceRangeSet {
    pub fn new() -> SequenceRangeSet {
        SequenceRangeSet { ranges: Vec::new() }
    }

    pub fn from_range(lower: SequenceNumber, upper: SequenceNumber) -> SequenceRangeSet {
        SequenceRangeSet {
            ranges: vec![SequenceRange::new(lower, upper)],
        }
    }

    pub fn singleton(n: SequenceNumber) -> SequenceRangeSet {
        Self::from_range(n, n)
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn ranges(&self) -> &[SequenceRange] {
        &self.ranges
    }

    /// Total count of sequence numbers covered by the set
    pub fn total_len(&self) -> u64 {
        self.ranges
            .iter()
            .map(|r| r.upper.to_raw() - r.lower.to_raw() + 1)
            .sum()
    }

    pub fn contains(&self, n: SequenceNumber) -> bool {
        let idx = self.ranges.partition_point(|r| r.upper < n);
        idx < self.ranges.len() && self.ranges[idx].lower <= n
    }

    /// The highest acknowledged number, if any
    pub fn max(&self) -> Option<SequenceNumber> {
        self.ranges.last().map(|r| r.upper)
    }

    /// True iff a single range of the set covers all of `[lower, upper]`
    pub fn covers(&self, lower: SequenceNumber, upper: SequenceNumber) -> bool {
        let idx = self.ranges.partition_point(|r| r.upper < lower);
        idx < self.ranges.len() && self.ranges[idx].lower <= lower && upper <= self.ranges[idx].upper
    }

    pub fn add(&self, range: SequenceRange) -> SequenceRangeSet {
        self.union(&SequenceRangeSet {
            ranges: vec![range],
        })
    }

    /// Merge of the two sets, coalescing overlapping and adjacent ranges
    pub fn union(&self, other: &SequenceRangeSet) -> SequenceRangeSet {
        let mut merged: Vec<SequenceRange> =
            Vec::with_capacity(self.ranges.len() + other.ranges.len());
        let (mut i, mut j) = (0, 0);

        loop {
            // take the remaining range with the smaller lower bound
            let take_left = i < self.ranges.len()
                && (j >= other.ranges.len() || self.ranges[i].lower <= other.ranges[j].lower);
            let next = if take_left {
                i += 1;
                self.ranges[i - 1]
            } else if j < other.ranges.len() {
                j += 1;
                other.ranges[j - 1]
            } else {
                break;
            };

            match merged.last_mut() {
                // overlap or adjacency: [1,3] and [4,6] coalesce to [1,6]
                Some(last) if last.upper.to_raw().saturating_add(1) >= next.lower.to_raw() => {
                    if next.upper > last.upper {
                        last.upper = next.upper;
                    }
                }
                _ => merged.push(next),
            }
        }

        SequenceRangeSet { ranges: merged }
    }

    /// An acknowledgement must be monotonically non-shrinking: false iff
    ///  `previous` covers a sequence number that `self` does not.
    pub fn is_consistent_with(&self, previous: &SequenceRangeSet) -> bool {
        previous.ranges.iter().all(|r| self.covers(r.lower, r.upper))
    }
}

impl Display for SequenceRangeSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (idx, range) in self.ranges.iter().enumerate() {
            if idx > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", range)?;
        }
        Ok(())
    }
}
