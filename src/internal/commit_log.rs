//! The committed state of the old generation: the committed pages and the log of commits that
//! segments replay forward (when validating) or backward (when privatizing a page).

use crate::{
    object::ObjRef,
    vm::{page_chunks, page_of, Page, PAGE_SIZE},
};
use fxhash::FxHashMap;
use parking_lot::RwLock;
use std::{collections::VecDeque, mem};

/// One change made by a commit. `backup` is `None` for objects created by the committing
/// transaction; those are published so that segments with the page mapped can see them.
pub struct UndoRecord {
    pub obj:    ObjRef,
    pub offset: usize,
    pub backup: Option<Box<[u8]>>,
    pub data:   Box<[u8]>,
}

impl UndoRecord {
    #[inline]
    pub fn addr(&self) -> usize {
        self.obj.addr() + self.offset
    }
}

/// An immutable record of one commit.
pub struct CommitLogEntry {
    pub rev:     u64,
    pub segment: usize,
    pub records: Vec<UndoRecord>,
}

impl CommitLogEntry {
    /// Memory held by the entry.
    fn footprint(&self) -> usize {
        mem::size_of::<CommitLogEntry>()
            + self
                .records
                .iter()
                .map(|r| {
                    mem::size_of::<UndoRecord>()
                        + r.data.len()
                        + r.backup.as_ref().map_or(0, |b| b.len())
                })
                .sum::<usize>()
    }
}

pub struct CommitLog {
    /// Revision of the last entry dropped from the front of the log.
    base:    u64,
    entries: VecDeque<CommitLogEntry>,
    bytes:   usize,
}

impl CommitLog {
    fn new() -> Self {
        CommitLog {
            base:    0,
            entries: VecDeque::new(),
            bytes:   0,
        }
    }

    #[inline]
    pub fn head(&self) -> u64 {
        self.base + self.entries.len() as u64
    }

    #[inline]
    pub fn base(&self) -> u64 {
        self.base
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Memory held by the retained entries. Counts toward the major collection trigger.
    #[inline]
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Entries committed after revision `rev`, oldest first.
    pub fn after(&self, rev: u64) -> impl DoubleEndedIterator<Item = &CommitLogEntry> + '_ {
        debug_assert!(rev >= self.base, "commit log entries after {} were dropped", rev);
        let skip = rev.saturating_sub(self.base) as usize;
        self.entries.range(skip.min(self.entries.len())..)
    }

    pub fn push(&mut self, segment: usize, records: Vec<UndoRecord>) -> u64 {
        let rev = self.head() + 1;
        let entry = CommitLogEntry {
            rev,
            segment,
            records,
        };
        self.bytes += entry.footprint();
        self.entries.push_back(entry);
        rev
    }

    /// Drops every entry with a revision of at most `rev`.
    pub fn trim(&mut self, rev: u64) {
        while self.base < rev {
            match self.entries.pop_front() {
                Some(entry) => self.bytes -= entry.footprint(),
                None => break,
            }
            self.base += 1;
        }
    }

    pub fn clear(&mut self) {
        let head = self.head();
        self.trim(head);
    }
}

/// The committed pages and the commit log, behind the process wide ordering lock.
pub struct SharedHeap {
    pages:   FxHashMap<usize, Box<Page>>,
    pub log: CommitLog,
}

impl SharedHeap {
    pub fn new() -> Self {
        SharedHeap {
            pages: FxHashMap::default(),
            log:   CommitLog::new(),
        }
    }

    /// A copy of the committed page, zeroed if nothing was ever committed there.
    pub fn copy_page(&self, page: usize) -> Box<Page> {
        match self.pages.get(&page) {
            Some(p) => p.clone(),
            None => Box::new([0; PAGE_SIZE]),
        }
    }

    pub fn read(&self, addr: usize, buf: &mut [u8]) {
        let mut done = 0;
        for (a, len) in page_chunks(addr, buf.len()) {
            match self.pages.get(&page_of(a)) {
                Some(page) => {
                    let off = a % PAGE_SIZE;
                    buf[done..done + len].copy_from_slice(&page[off..off + len])
                }
                None => buf[done..done + len].iter_mut().for_each(|b| *b = 0),
            }
            done += len;
        }
    }

    pub fn write(&mut self, addr: usize, data: &[u8]) {
        let mut done = 0;
        for (a, len) in page_chunks(addr, data.len()) {
            let page = self
                .pages
                .entry(page_of(a))
                .or_insert_with(|| Box::new([0; PAGE_SIZE]));
            let off = a % PAGE_SIZE;
            page[off..off + len].copy_from_slice(&data[done..done + len]);
            done += len;
        }
    }

    /// Writes only into pages that exist.
    pub fn write_existing(&mut self, addr: usize, data: &[u8]) {
        let mut done = 0;
        for (a, len) in page_chunks(addr, data.len()) {
            if let Some(page) = self.pages.get_mut(&page_of(a)) {
                let off = a % PAGE_SIZE;
                page[off..off + len].copy_from_slice(&data[done..done + len]);
            }
            done += len;
        }
    }

    pub fn drop_page(&mut self, page: usize) {
        let _ = self.pages.remove(&page);
    }

    pub fn committed_pages(&self) -> usize {
        self.pages.len()
    }
}

/// How a segment reaches the shared heap while resolving page faults: by taking the read lock, or
/// through a guard the caller already holds.
#[derive(Copy, Clone)]
pub enum SharedAccess<'a> {
    Lock(&'a RwLock<SharedHeap>),
    Held(&'a SharedHeap),
}

impl SharedAccess<'_> {
    #[inline]
    pub fn with<R>(self, f: impl FnOnce(&SharedHeap) -> R) -> R {
        match self {
            SharedAccess::Lock(lock) => f(&lock.read()),
            SharedAccess::Held(heap) => f(heap),
        }
    }
}
