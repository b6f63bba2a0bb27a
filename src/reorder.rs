//! Ordering reassembler
//!
//! Workers finish blocks in whatever order the scheduler lets them. The
//! consumer side parks early arrivals here and releases them strictly in
//! sequence order, one contiguous run at a time.

use std::collections::BTreeMap;

/// Buffers out-of-order results until their predecessors arrive
#[derive(Debug)]
pub struct Reassembler<T> {
    next: u64,
    pending: BTreeMap<u64, T>,
}

impl<T> Default for Reassembler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Reassembler<T> {
    pub fn new() -> Self {
        Self {
            next: 0,
            pending: BTreeMap::new(),
        }
    }

    /// Sequence number of the next item to be released
    #[inline]
    pub fn next_sequence(&self) -> u64 {
        self.next
    }

    /// Park a result. Sequence numbers are unique per stream; a number that
    /// was already released is ignored.
    pub fn insert(&mut self, seq: u64, item: T) {
        if seq < self.next {
            tracing::warn!(seq, next = self.next, "dropping already-released block");
            return;
        }
        self.pending.insert(seq, item);
    }

    /// Release the next item if it has arrived
    pub fn pop_ready(&mut self) -> Option<T> {
        let item = self.pending.remove(&self.next)?;
        self.next += 1;
        Some(item)
    }

    /// Number of results waiting on a predecessor
    #[inline]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order_passthrough() {
        let mut r = Reassembler::new();
        r.insert(0, "a");
        assert_eq!(r.pop_ready(), Some("a"));
        r.insert(1, "b");
        assert_eq!(r.pop_ready(), Some("b"));
        assert_eq!(r.pop_ready(), None);
        assert_eq!(r.next_sequence(), 2);
    }

    #[test]
    fn test_out_of_order_release() {
        let mut r = Reassembler::new();
        r.insert(2, 'c');
        r.insert(1, 'b');
        assert_eq!(r.pop_ready(), None);
        assert_eq!(r.pending(), 2);

        r.insert(0, 'a');
        let released: Vec<char> = std::iter::from_fn(|| r.pop_ready()).collect();
        assert_eq!(released, vec!['a', 'b', 'c']);
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn test_reverse_arrival() {
        let mut r = Reassembler::new();
        for seq in (0..100u64).rev() {
            r.insert(seq, seq);
        }
        let released: Vec<u64> = std::iter::from_fn(|| r.pop_ready()).collect();
        assert_eq!(released, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_stale_sequence_ignored() {
        let mut r = Reassembler::new();
        r.insert(0, 1);
        r.pop_ready();
        r.insert(0, 2);
        assert_eq!(r.pending(), 0);
        assert_eq!(r.pop_ready(), None);
    }
}
