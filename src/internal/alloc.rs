//! The old generation allocator, shared by all segments.
//!
//! Large objects are carved first fit from the bottom of the old generation, small objects live in
//! size classed pages claimed from the top. The two regions must never meet; if they do, the heap
//! is exhausted.

pub mod large;
pub mod small;

use self::{
    large::LargeAlloc,
    small::{SmallAlloc, SmallSweep},
};
use crate::{object::OBJECT_ALIGN, vm::PAGE_SIZE};

/// Number of small slots a segment takes from the shared allocator at once.
pub const SMALL_BATCH: usize = 16;

#[derive(Debug)]
pub struct OldSpace {
    small:       SmallAlloc,
    large:       LargeAlloc,
    small_limit: usize,
}

/// Result of a sweep of the whole old generation.
#[derive(Debug, Default)]
pub struct Sweep {
    pub freed:       Vec<(usize, usize)>,
    pub freed_pages: Vec<usize>,
    pub live_bytes:  usize,
}

impl OldSpace {
    pub fn new(start: usize, end: usize, small_limit: usize) -> Self {
        debug_assert_eq!(start % PAGE_SIZE, 0);
        debug_assert_eq!(end % PAGE_SIZE, 0);
        OldSpace {
            small: SmallAlloc::new(end / PAGE_SIZE, small_limit),
            large: LargeAlloc::new(start),
            small_limit,
        }
    }

    #[inline]
    pub fn is_small(&self, size: usize) -> bool {
        size <= self.small_limit
    }

    /// Takes a batch of small slots for a segment's cache.
    pub fn take_small(&mut self, size: usize, n: usize) -> Vec<usize> {
        debug_assert!(self.is_small(size) && size % OBJECT_ALIGN == 0);
        let floor = self.large.top();
        self.small.take(size, n, floor)
    }

    pub fn alloc(&mut self, size: usize) -> Option<usize> {
        if self.is_small(size) {
            self.take_small(size, 1).pop()
        } else {
            let limit = self.small.bottom();
            self.large.alloc(size, limit)
        }
    }

    /// Gives back a small slot that was cached by a segment but never handed out.
    pub fn release_cached(&mut self, addr: usize) {
        self.small.release_cached(addr)
    }

    /// Frees the object at `addr`, returning the number of bytes released.
    pub fn free(&mut self, addr: usize) -> Option<usize> {
        if self.small.contains(addr) {
            self.small.free(addr)
        } else {
            self.large.free(addr)
        }
    }

    /// Frees every object for which `is_live` is false.
    pub fn sweep(&mut self, mut is_live: impl FnMut(usize) -> bool) -> Sweep {
        let SmallSweep {
            mut freed,
            freed_pages,
            mut live_bytes,
        } = self.small.sweep(&mut is_live);

        let dead: Vec<usize> = self
            .large
            .used()
            .filter(|&(addr, _)| !is_live(addr))
            .map(|(addr, _)| addr)
            .collect();
        for addr in dead {
            if let Some(size) = self.large.free(addr) {
                freed.push((addr, size));
            }
        }
        live_bytes += self.large.used_bytes();

        Sweep {
            freed,
            freed_pages,
            live_bytes,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn regions() {
        let start = 16 * PAGE_SIZE;
        let end = 32 * PAGE_SIZE;
        let mut old = OldSpace::new(start, end, 256);
        let small = old.alloc(48).unwrap();
        let big = old.alloc(2 * PAGE_SIZE).unwrap();
        assert_eq!(small, 31 * PAGE_SIZE);
        assert_eq!(big, start);

        let sweep = old.sweep(|addr| addr == big);
        assert_eq!(sweep.freed, vec![(small, 48)]);
        assert_eq!(sweep.freed_pages, vec![31]);
        assert_eq!(sweep.live_bytes, 2 * PAGE_SIZE);
        assert_eq!(old.free(big), Some(2 * PAGE_SIZE));
    }

    #[test]
    fn exhaustion() {
        let mut old = OldSpace::new(16 * PAGE_SIZE, 20 * PAGE_SIZE, 256);
        assert!(old.alloc(16).is_some());
        assert!(old.alloc(3 * PAGE_SIZE).is_some());
        assert!(old.alloc(PAGE_SIZE).is_none());
        assert!(old.alloc(32).is_none());
    }
}
