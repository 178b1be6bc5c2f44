//! The virtual memory backend.
//!
//! Every segment sees the old generation through its own [`VirtualMemory`]. Pages are mapped
//! lazily: an access to an unmapped page fails with a [`PageFault`], which the engine resolves by
//! privatizing the page (copying the committed page and reverting it to the segment's snapshot) and
//! mapping the copy. [`SimulatedMemory`] implements this in software by checking every access.

use fxhash::FxHashMap;
use thiserror::Error;

/// Size of a page of the logical address space.
pub const PAGE_SIZE: usize = 4096;

/// The contents of one page.
pub type Page = [u8; PAGE_SIZE];

/// An access touched a page that is not mapped in this view.
#[derive(Error, Copy, Clone, Debug, PartialEq, Eq)]
#[error("access to unmapped page {page}")]
pub struct PageFault {
    pub page: usize,
}

#[inline]
pub(crate) fn page_of(addr: usize) -> usize {
    addr / PAGE_SIZE
}

/// Splits `[addr, addr + len)` into `(addr, len)` pieces that do not cross a page boundary.
#[inline]
pub(crate) fn page_chunks(addr: usize, len: usize) -> impl Iterator<Item = (usize, usize)> {
    let end = addr + len;
    let mut cur = addr;
    std::iter::from_fn(move || {
        if cur >= end {
            return None;
        }
        let page_end = (page_of(cur) + 1) * PAGE_SIZE;
        let chunk_end = page_end.min(end);
        let chunk = (cur, chunk_end - cur);
        cur = chunk_end;
        Some(chunk)
    })
}

/// A segment's private view of the old generation.
pub trait VirtualMemory: Send {
    /// Makes `page` accessible with the given contents, replacing any previous mapping.
    fn map(&mut self, page: usize, contents: Box<Page>);

    /// Makes `page` inaccessible. Returns whether it was mapped.
    fn unmap(&mut self, page: usize) -> bool;

    fn is_mapped(&self, page: usize) -> bool;

    /// Number of mapped pages.
    fn mapped_pages(&self) -> usize;

    /// Reads `buf.len()` bytes at `addr`. Nothing is read if any touched page is unmapped.
    fn read(&self, addr: usize, buf: &mut [u8]) -> Result<(), PageFault>;

    /// Writes `data` at `addr`. Nothing is written if any touched page is unmapped.
    fn write(&mut self, addr: usize, data: &[u8]) -> Result<(), PageFault>;

    /// Unmaps every page.
    fn unmap_all(&mut self);
}

/// A [`VirtualMemory`] that keeps its pages in a hash map and checks every access.
#[derive(Default)]
pub struct SimulatedMemory {
    pages: FxHashMap<usize, Box<Page>>,
}

impl std::fmt::Debug for SimulatedMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedMemory")
            .field("mapped_pages", &self.pages.len())
            .finish()
    }
}

impl SimulatedMemory {
    pub fn new() -> Self {
        Self::default()
    }

    fn check(&self, addr: usize, len: usize) -> Result<(), PageFault> {
        page_chunks(addr, len)
            .map(|(a, _)| page_of(a))
            .find(|page| !self.pages.contains_key(page))
            .map_or(Ok(()), |page| Err(PageFault { page }))
    }
}

impl VirtualMemory for SimulatedMemory {
    fn map(&mut self, page: usize, contents: Box<Page>) {
        let _ = self.pages.insert(page, contents);
    }

    fn unmap(&mut self, page: usize) -> bool {
        self.pages.remove(&page).is_some()
    }

    #[inline]
    fn is_mapped(&self, page: usize) -> bool {
        self.pages.contains_key(&page)
    }

    #[inline]
    fn mapped_pages(&self) -> usize {
        self.pages.len()
    }

    fn read(&self, addr: usize, buf: &mut [u8]) -> Result<(), PageFault> {
        self.check(addr, buf.len())?;
        let mut done = 0;
        for (a, len) in page_chunks(addr, buf.len()) {
            let page = &self.pages[&page_of(a)];
            let off = a % PAGE_SIZE;
            buf[done..done + len].copy_from_slice(&page[off..off + len]);
            done += len;
        }
        Ok(())
    }

    fn write(&mut self, addr: usize, data: &[u8]) -> Result<(), PageFault> {
        self.check(addr, data.len())?;
        let mut done = 0;
        for (a, len) in page_chunks(addr, data.len()) {
            if let Some(page) = self.pages.get_mut(&page_of(a)) {
                let off = a % PAGE_SIZE;
                page[off..off + len].copy_from_slice(&data[done..done + len]);
            }
            done += len;
        }
        Ok(())
    }

    fn unmap_all(&mut self) {
        self.pages.clear()
    }
}
