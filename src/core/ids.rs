//! Module-wide ID allocation.
//!
//! A single [`IdAllocator`] owned by the orchestrator hands out disjoint
//! [`IdRange`]s before a parallel phase starts. Workers draw names from their
//! own range and never touch shared state.

/// Single owner of the module-wide counter.
#[derive(Debug, Clone, Default)]
pub struct IdAllocator {
    next: u64,
}

impl IdAllocator {
    pub fn new(start: u64) -> Self {
        Self { next: start }
    }

    /// Reserve `len` consecutive ids.
    pub fn reserve(&mut self, len: u64) -> IdRange {
        let range = IdRange { next: self.next, end: self.next + len };
        self.next += len;
        range
    }

    /// Reserve one range per unit, in unit order.
    pub fn reserve_batches(&mut self, sizes: &[u64]) -> Vec<IdRange> {
        sizes.iter().map(|len| self.reserve(*len)).collect()
    }

    pub fn peek(&self) -> u64 {
        self.next
    }
}

/// A pre-reserved block of ids owned by one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdRange {
    next: u64,
    end: u64,
}

impl IdRange {
    pub fn empty() -> Self {
        Self { next: 0, end: 0 }
    }

    pub fn remaining(&self) -> u64 {
        self.end - self.next
    }
}

impl Iterator for IdRange {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        if self.next < self.end {
            self.next += 1;
            Some(self.next - 1)
        } else {
            None
        }
    }
}
