//! Size classed page allocator for small old objects. Pages are claimed from the top of the old
//! generation downwards, and every page holds slots of a single size.

use crate::{object::OBJECT_ALIGN, vm::PAGE_SIZE};
use fxhash::FxHashMap;

const SLOT_WORDS: usize = PAGE_SIZE / OBJECT_ALIGN / 64;

#[derive(Debug)]
struct SmallPage {
    slot_size: usize,
    /// Slots that are allocated, or handed to a segment's cache.
    taken:     [u64; SLOT_WORDS],
}

impl SmallPage {
    #[inline]
    fn slots(&self) -> usize {
        PAGE_SIZE / self.slot_size
    }

    #[inline]
    fn is_taken(&self, slot: usize) -> bool {
        self.taken[slot / 64] & (1 << (slot % 64)) != 0
    }

    #[inline]
    fn set_taken(&mut self, slot: usize, taken: bool) {
        if taken {
            self.taken[slot / 64] |= 1 << (slot % 64)
        } else {
            self.taken[slot / 64] &= !(1 << (slot % 64))
        }
    }

    #[inline]
    fn is_empty(&self) -> bool {
        self.taken.iter().all(|&w| w == 0)
    }
}

#[inline]
fn class_of(size: usize) -> usize {
    size / OBJECT_ALIGN - 1
}

#[derive(Debug)]
pub struct SmallAlloc {
    pages:       FxHashMap<usize, SmallPage>,
    free_slots:  Vec<Vec<usize>>,
    free_pages:  Vec<usize>,
    bottom_page: usize,
}

/// Result of sweeping the small object pages.
#[derive(Debug, Default)]
pub struct SmallSweep {
    pub freed:       Vec<(usize, usize)>,
    pub freed_pages: Vec<usize>,
    pub live_bytes:  usize,
}

impl SmallAlloc {
    pub fn new(end_page: usize, limit: usize) -> Self {
        SmallAlloc {
            pages:       FxHashMap::default(),
            free_slots:  vec![Vec::new(); limit / OBJECT_ALIGN],
            free_pages:  Vec::new(),
            bottom_page: end_page,
        }
    }

    /// Lowest address of the region.
    #[inline]
    pub fn bottom(&self) -> usize {
        self.bottom_page * PAGE_SIZE
    }

    fn claim_page(&mut self, slot_size: usize, floor: usize) -> Option<()> {
        let page = match self.free_pages.pop() {
            Some(page) => page,
            None => {
                if (self.bottom_page - 1) * PAGE_SIZE < floor {
                    return None;
                }
                self.bottom_page -= 1;
                self.bottom_page
            }
        };
        self.pages.insert(
            page,
            SmallPage {
                slot_size,
                taken: [0; SLOT_WORDS],
            },
        );
        let free = &mut self.free_slots[class_of(slot_size)];
        let slots = PAGE_SIZE / slot_size;
        free.extend((0..slots).rev().map(|slot| page * PAGE_SIZE + slot * slot_size));
        Some(())
    }

    /// Takes up to `n` slots of `size` bytes, claiming a new page when the class has none free.
    /// `floor` is the top of the large object region.
    pub fn take(&mut self, size: usize, n: usize, floor: usize) -> Vec<usize> {
        let class = class_of(size);
        if self.free_slots[class].is_empty() && self.claim_page(size, floor).is_none() {
            return Vec::new();
        }
        let free = &mut self.free_slots[class];
        let at = free.len().saturating_sub(n);
        let taken: Vec<usize> = free.drain(at..).rev().collect();
        for &addr in &taken {
            self.mark(addr, true);
        }
        taken
    }

    fn mark(&mut self, addr: usize, taken: bool) {
        if let Some(page) = self.pages.get_mut(&(addr / PAGE_SIZE)) {
            let slot = (addr % PAGE_SIZE) / page.slot_size;
            page.set_taken(slot, taken);
        }
    }

    /// Returns a cached, never used slot. It is made available again by the next sweep.
    pub fn release_cached(&mut self, addr: usize) {
        self.mark(addr, false)
    }

    /// Frees an allocated slot, returning its size.
    pub fn free(&mut self, addr: usize) -> Option<usize> {
        let page = self.pages.get_mut(&(addr / PAGE_SIZE))?;
        let slot = (addr % PAGE_SIZE) / page.slot_size;
        if !page.is_taken(slot) {
            return None;
        }
        page.set_taken(slot, false);
        let size = page.slot_size;
        self.free_slots[class_of(size)].push(addr);
        Some(size)
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        self.pages.contains_key(&(addr / PAGE_SIZE))
    }

    /// Frees every taken slot for which `is_live` is false, returns fully free pages to the page
    /// pool and rebuilds the free lists.
    pub fn sweep(&mut self, mut is_live: impl FnMut(usize) -> bool) -> SmallSweep {
        let mut result = SmallSweep::default();
        self.free_slots.iter_mut().for_each(Vec::clear);
        let mut pages: Vec<usize> = self.pages.keys().copied().collect();
        pages.sort_unstable();
        for page_no in pages.into_iter().rev() {
            let page = match self.pages.get_mut(&page_no) {
                Some(page) => page,
                None => continue,
            };
            let base = page_no * PAGE_SIZE;
            let mut free = Vec::new();
            for slot in 0..page.slots() {
                let addr = base + slot * page.slot_size;
                if page.is_taken(slot) {
                    if is_live(addr) {
                        result.live_bytes += page.slot_size;
                        continue;
                    }
                    page.set_taken(slot, false);
                    result.freed.push((addr, page.slot_size));
                }
                free.push(addr);
            }
            if page.is_empty() {
                let _ = self.pages.remove(&page_no);
                self.free_pages.push(page_no);
                result.freed_pages.push(page_no);
            } else {
                let class = class_of(page.slot_size);
                self.free_slots[class].extend(free.into_iter().rev());
            }
        }
        result
    }
}
