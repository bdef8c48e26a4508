//! Delivery verification: ordering, gaps and duplicates.

/// Bits reserved for the per-producer sequence in a tagged value.
const SEQUENCE_BITS: u32 = 40;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

/// Pack a producer id and its local sequence into one value.
pub fn tag(producer: usize, seq: u64) -> u64 {
    ((producer as u64) << SEQUENCE_BITS) | (seq & SEQUENCE_MASK)
}

/// Inverse of [`tag`].
pub fn untag(value: u64) -> (usize, u64) {
    ((value >> SEQUENCE_BITS) as usize, value & SEQUENCE_MASK)
}

/// Expects `start, start + 1, start + 2, ...` with nothing skipped or repeated.
#[derive(Debug, Clone)]
pub struct SequenceChecker {
    expected: u64,
    received: u64,
    errors: u64,
    first_error: Option<(u64, u64)>,
}

impl SequenceChecker {
    pub fn new(start: u64) -> Self {
        Self {
            expected: start,
            received: 0,
            errors: 0,
            first_error: None,
        }
    }

    /// Record `value`. Returns false on a gap, duplicate or reordering; the
    /// checker resynchronises on `value` so one fault is reported once.
    pub fn check(&mut self, value: u64) -> bool {
        self.received += 1;
        let ok = value == self.expected;
        if !ok {
            self.errors += 1;
            if self.first_error.is_none() {
                self.first_error = Some((self.expected, value));
            }
        }
        self.expected = value + 1;
        ok
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn errors(&self) -> u64 {
        self.errors
    }

    /// `(expected, got)` of the first fault.
    pub fn first_error(&self) -> Option<(u64, u64)> {
        self.first_error
    }

    /// Next value the checker expects.
    pub fn expected(&self) -> u64 {
        self.expected
    }
}

impl Default for SequenceChecker {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Per-producer ordering for values built with [`tag`].
#[derive(Debug, Clone)]
pub struct PartitionedChecker {
    checkers: Vec<SequenceChecker>,
    unknown: u64,
}

impl PartitionedChecker {
    pub fn new(producers: usize) -> Self {
        Self {
            checkers: vec![SequenceChecker::default(); producers],
            unknown: 0,
        }
    }

    pub fn check(&mut self, value: u64) -> bool {
        let (producer, seq) = untag(value);
        match self.checkers.get_mut(producer) {
            Some(checker) => checker.check(seq),
            None => {
                self.unknown += 1;
                false
            }
        }
    }

    pub fn received(&self) -> u64 {
        self.checkers.iter().map(SequenceChecker::received).sum::<u64>() + self.unknown
    }

    pub fn errors(&self) -> u64 {
        self.checkers.iter().map(SequenceChecker::errors).sum::<u64>() + self.unknown
    }

    pub fn producer(&self, producer: usize) -> Option<&SequenceChecker> {
        self.checkers.get(producer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_checker() {
        let mut checker = SequenceChecker::new(0);
        assert!(checker.check(0));
        assert!(checker.check(1));
        assert!(!checker.check(3)); // gap
        assert!(checker.check(4));
        assert!(!checker.check(4)); // duplicate

        assert_eq!(checker.received(), 5);
        assert_eq!(checker.errors(), 2);
        assert_eq!(checker.first_error(), Some((2, 3)));
    }

    #[test]
    fn test_tagging() {
        let value = tag(3, 12345);
        assert_eq!(untag(value), (3, 12345));
        assert_eq!(untag(tag(0, 0)), (0, 0));
    }

    #[test]
    fn test_partitioned_checker() {
        let mut checker = PartitionedChecker::new(2);
        assert!(checker.check(tag(0, 0)));
        assert!(checker.check(tag(1, 0)));
        assert!(checker.check(tag(0, 1)));
        assert!(checker.check(tag(1, 1)));
        assert!(!checker.check(tag(1, 5)));
        assert!(!checker.check(tag(7, 0)));

        assert_eq!(checker.received(), 6);
        assert_eq!(checker.errors(), 2);
        assert_eq!(checker.producer(0).map(SequenceChecker::expected), Some(2));
    }
}
