use std::collections::{HashSet, VecDeque};

/// Number of reliable sequence numbers remembered per circuit.
pub const ARCHIVE_CAPACITY: usize = 200;

/// Bounded memory of recently received reliable sequence numbers.
///
/// Only covers the reordering and resend window of a peer; once more than `capacity` distinct
/// numbers were recorded the oldest ones are forgotten and would be accepted again.
pub(crate) struct DuplicateArchive {
    order: VecDeque<u32>,
    seen: HashSet<u32>,
    capacity: usize,
}

impl DuplicateArchive {
    pub(crate) fn new() -> Self {
        Self::with_capacity(ARCHIVE_CAPACITY)
    }

    pub(crate) fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0);
        DuplicateArchive {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Records `sequence`, returning `false` if it is already archived.
    pub(crate) fn try_record(&mut self, sequence: u32) -> bool {
        if !self.seen.insert(sequence) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(sequence);
        true
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }
}
