//! First fit allocator for old objects above the small object limit. The region grows upwards from
//! the start of the old generation.

use std::collections::BTreeMap;

#[derive(Debug)]
pub struct LargeAlloc {
    start: usize,
    top:   usize,
    free:  BTreeMap<usize, usize>,
    used:  BTreeMap<usize, usize>,
}

impl LargeAlloc {
    pub fn new(start: usize) -> Self {
        LargeAlloc {
            start,
            top: start,
            free: BTreeMap::new(),
            used: BTreeMap::new(),
        }
    }

    /// First address above the region.
    #[inline]
    pub fn top(&self) -> usize {
        self.top
    }

    /// Allocates `size` bytes without growing the region past `limit`.
    pub fn alloc(&mut self, size: usize, limit: usize) -> Option<usize> {
        let found = self
            .free
            .iter()
            .find(|&(_, &len)| len >= size)
            .map(|(&addr, &len)| (addr, len));
        let addr = match found {
            Some((addr, len)) => {
                let _ = self.free.remove(&addr);
                if len > size {
                    let _ = self.free.insert(addr + size, len - size);
                }
                addr
            }
            None => {
                if self.top + size > limit {
                    return None;
                }
                let addr = self.top;
                self.top += size;
                addr
            }
        };
        let _ = self.used.insert(addr, size);
        Some(addr)
    }

    /// Frees the chunk at `addr`, returning its size.
    pub fn free(&mut self, addr: usize) -> Option<usize> {
        let size = self.used.remove(&addr)?;
        let mut start = addr;
        let mut len = size;
        if let Some(next_len) = self.free.remove(&(addr + size)) {
            len += next_len;
        }
        let prev = self
            .free
            .range(..addr)
            .next_back()
            .map(|(&a, &l)| (a, l));
        if let Some((prev_addr, prev_len)) = prev {
            if prev_addr + prev_len == addr {
                let _ = self.free.remove(&prev_addr);
                start = prev_addr;
                len += prev_len;
            }
        }
        if start + len == self.top {
            self.top = start;
        } else {
            let _ = self.free.insert(start, len);
        }
        Some(size)
    }

    #[inline]
    pub fn size_of(&self, addr: usize) -> Option<usize> {
        self.used.get(&addr).copied()
    }

    pub fn used(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.used.iter().map(|(&a, &l)| (a, l))
    }

    pub fn used_bytes(&self) -> usize {
        self.used.values().sum()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.top == self.start
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn first_fit_and_coalesce() {
        let mut a = LargeAlloc::new(0x10000);
        let x = a.alloc(512, 0x20000).unwrap();
        let y = a.alloc(1024, 0x20000).unwrap();
        let z = a.alloc(512, 0x20000).unwrap();
        assert_eq!((x, y, z), (0x10000, 0x10200, 0x10600));

        assert_eq!(a.free(y), Some(1024));
        // reuses the hole
        assert_eq!(a.alloc(256, 0x20000), Some(0x10200));
        assert_eq!(a.free(0x10200), Some(256));
        assert_eq!(a.free(x), Some(512));
        // freeing the topmost chunk shrinks the region through the coalesced holes
        assert_eq!(a.free(z), Some(512));
        assert!(a.is_empty());
        assert_eq!(a.free(z), None);
    }

    #[test]
    fn respects_limit() {
        let mut a = LargeAlloc::new(0x10000);
        assert_eq!(a.alloc(0x800, 0x10800), Some(0x10000));
        assert_eq!(a.alloc(16, 0x10800), None);
    }
}
