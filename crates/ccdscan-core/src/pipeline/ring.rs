//! Lookback buffer of raw lines indexed by absolute line number.

use std::collections::VecDeque;

#[derive(Debug)]
pub struct LineRing {
    lines: VecDeque<Vec<u8>>,
    /// Line number of `lines[0]`.
    first: u64,
    capacity: usize,
}

impl LineRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.max(1)),
            first: 0,
            capacity: capacity.max(1),
        }
    }

    /// Append the next raw line, evicting the oldest when full.
    pub fn push(&mut self, line: Vec<u8>) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
            self.first += 1;
        }
        self.lines.push_back(line);
    }

    pub fn get(&self, line: u64) -> Option<&[u8]> {
        let idx = line.checked_sub(self.first)?;
        self.lines.get(idx as usize).map(Vec::as_slice)
    }

    /// Number of the next line `push` will store.
    pub fn next_line(&self) -> u64 {
        self.first + self.lines.len() as u64
    }

    pub fn contains(&self, line: u64) -> bool {
        line >= self.first && line < self.next_line()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_eviction_and_indexing() {
        let mut ring = LineRing::new(3);
        for n in 0..5u8 {
            ring.push(vec![n]);
        }
        assert_eq!(ring.len(), 3);
        assert!(ring.get(1).is_none());
        assert_eq!(ring.get(2), Some(&[2u8][..]));
        assert_eq!(ring.get(4), Some(&[4u8][..]));
        assert!(ring.get(5).is_none());
        assert_eq!(ring.next_line(), 5);
        assert!(ring.contains(3));
    }
}
