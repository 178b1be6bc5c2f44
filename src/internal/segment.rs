//! Segments: parallel views of the same logical heap, one per running transaction.
//!
//! The nursery of a segment is a plain byte array at the same addresses in every segment. The old
//! generation is seen through the segment's [`VirtualMemory`]; a page is privatized on first access
//! by copying the committed page and reverting every commit newer than the segment's snapshot.

use crate::{
    host::{Host, Marker, ObjectHeader},
    internal::{
        commit_log::{SharedAccess, SharedHeap},
        read_markers::{ReadMarkers, FIRST_READ_VERSION},
        thread::{Roots, ThreadState},
        undo_log::UndoLog,
    },
    object::{flags, header_flags, read_u64_at, round_size, ObjRef, OBJECT_ALIGN},
    stats::Stats,
    tx::AbortReason,
    vm::{page_chunks, page_of, PageFault, VirtualMemory, PAGE_SIZE},
};
use fxhash::FxHashMap;
use parking_lot::{Condvar, Mutex};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering::*},
    Arc,
};

/// Where the nursery and the old generation live in the logical address space. Page 0 is never
/// used, so address 0 is the null reference.
#[derive(Copy, Clone, Debug)]
pub struct Layout {
    pub nursery_start: usize,
    pub nursery_end:   usize,
    pub old_start:     usize,
    pub old_end:       usize,
}

impl Layout {
    pub fn new(nursery_size: usize, heap_size: usize) -> Self {
        let nursery_start = PAGE_SIZE;
        let nursery_end = nursery_start + nursery_size;
        Layout {
            nursery_start,
            nursery_end,
            old_start: nursery_end,
            old_end: nursery_end + heap_size,
        }
    }

    #[inline]
    pub fn in_nursery(&self, addr: usize) -> bool {
        addr >= self.nursery_start && addr < self.nursery_end
    }

    #[inline]
    pub fn in_old(&self, addr: usize) -> bool {
        addr >= self.old_start && addr < self.old_end
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TxState {
    None,
    Regular,
    Inevitable,
}

/// The parts of a segment other threads read without locking its data.
#[derive(Debug, Default)]
pub struct SegmentSignals {
    /// An `AbortReason` delivered by a collector, or 0.
    pub must_abort:     AtomicU8,
    pub last_validated: AtomicU64,
    pub has_pages:      AtomicBool,
}

pub struct Segment {
    pub signals: Arc<SegmentSignals>,
    pub data:    Mutex<SegmentData>,
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad("Segment { .. }")
    }
}

impl Segment {
    pub fn new(index: usize, layout: Layout, memory: Box<dyn VirtualMemory>, classes: usize) -> Self {
        let signals = Arc::new(SegmentSignals::default());
        Segment {
            data: Mutex::new(SegmentData {
                index,
                layout,
                signals: signals.clone(),
                memory,
                nursery: vec![0; layout.nursery_end - layout.nursery_start].into_boxed_slice(),
                nursery_used: 0,
                markers: ReadMarkers::default(),
                read_version: FIRST_READ_VERSION,
                state: TxState::None,
                aborted: None,
                last_validated: 0,
                undo: UndoLog::default(),
                objects_pointing_to_nursery: Vec::new(),
                old_objects_with_cards_set: Vec::new(),
                large_overflow_objects: Vec::new(),
                young_outside_nursery: FxHashMap::default(),
                shadows: FxHashMap::default(),
                young_destructors: Vec::new(),
                old_destructors: Vec::new(),
                young_weakrefs: Vec::new(),
                old_weakrefs: Vec::new(),
                young_finalizers: Vec::new(),
                finalizers: Vec::new(),
                overflow_number: 0,
                small_cache: vec![Vec::new(); classes],
                thread: None,
                saved_roots: Roots::default(),
                marker: None,
                stats: Stats::default(),
            }),
            signals,
        }
    }
}

pub struct SegmentData {
    pub index:          usize,
    pub layout:         Layout,
    pub signals:        Arc<SegmentSignals>,
    pub memory:         Box<dyn VirtualMemory>,
    pub nursery:        Box<[u8]>,
    pub nursery_used:   usize,
    pub markers:        ReadMarkers,
    pub read_version:   u8,
    pub state:          TxState,
    /// Set once the running transaction's data structures were rolled back.
    pub aborted:        Option<AbortReason>,
    /// Revision of the last commit log entry this segment's view reflects.
    pub last_validated: u64,
    pub undo:           UndoLog,

    pub objects_pointing_to_nursery: Vec<ObjRef>,
    pub old_objects_with_cards_set:  Vec<ObjRef>,
    /// Old objects created by the running transaction.
    pub large_overflow_objects:      Vec<ObjRef>,
    /// Young objects too large for the nursery, with their sizes.
    pub young_outside_nursery:       FxHashMap<ObjRef, usize>,
    /// Young object to the old location reserved by `identity`.
    pub shadows:                     FxHashMap<ObjRef, ObjRef>,

    pub young_destructors: Vec<ObjRef>,
    pub old_destructors:   Vec<ObjRef>,
    pub young_weakrefs:    Vec<ObjRef>,
    pub old_weakrefs:      Vec<ObjRef>,
    pub young_finalizers:  Vec<ObjRef>,
    /// Old objects with finalizers created by the running transaction.
    pub finalizers:        Vec<ObjRef>,

    pub overflow_number: u32,
    pub small_cache:     Vec<Vec<usize>>,
    pub thread:          Option<Arc<ThreadState>>,
    pub saved_roots:     Roots,
    pub marker:          Option<Marker>,
    pub stats:           Stats,
}

impl std::fmt::Debug for SegmentData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentData")
            .field("index", &self.index)
            .field("state", &self.state)
            .field("last_validated", &self.last_validated)
            .field("nursery_used", &self.nursery_used)
            .field("undo", &self.undo)
            .finish()
    }
}

impl SegmentData {
    #[inline]
    pub fn is_running(&self) -> bool {
        self.state != TxState::None && self.aborted.is_none()
    }

    #[inline]
    pub fn in_nursery(&self, obj: ObjRef) -> bool {
        self.layout.in_nursery(obj.addr())
    }

    /// Nursery objects, and large objects allocated by this transaction outside the nursery.
    #[inline]
    pub fn is_young(&self, obj: ObjRef) -> bool {
        self.in_nursery(obj) || self.young_outside_nursery.contains_key(&obj)
    }

    #[inline]
    pub fn is_overflow_flags(&self, flags: u32) -> bool {
        flags != flags::FORWARDED
            && self.overflow_number != 0
            && flags & flags::OVERFLOW_MASK == self.overflow_number
    }

    pub fn set_last_validated(&mut self, rev: u64) {
        self.last_validated = rev;
        self.signals.last_validated.store(rev, Release);
    }

    /// Snapshot restoration for segments whose revision fell behind a trimmed commit log. Such a
    /// segment has no pages mapped, so there is nothing to replay.
    pub fn catch_up(&mut self, heap: &SharedHeap) {
        if self.last_validated < heap.log.base() {
            invariant!(
                self.memory.mapped_pages() == 0,
                "segment with mapped pages fell behind the commit log"
            );
            self.set_last_validated(heap.log.base());
        }
    }

    /// Maps `page`, reconstructed as of this segment's snapshot.
    #[inline(never)]
    #[cold]
    pub fn privatize(&mut self, shared: SharedAccess<'_>, page: usize) {
        invariant!(
            self.layout.in_old(page * PAGE_SIZE),
            "access outside of the old generation"
        );
        let contents = shared.with(|heap| {
            self.catch_up(heap);
            // published before the lock is released, so trimming can not skip this segment
            self.signals.has_pages.store(true, Release);
            let mut contents = heap.copy_page(page);
            let lo = page * PAGE_SIZE;
            let hi = lo + PAGE_SIZE;
            for entry in heap.log.after(self.last_validated).rev() {
                for record in entry.records.iter().rev() {
                    if let Some(backup) = &record.backup {
                        let start = record.addr().max(lo);
                        let end = (record.addr() + backup.len()).min(hi);
                        if start < end {
                            let from = start - record.addr();
                            contents[start - lo..end - lo]
                                .copy_from_slice(&backup[from..from + (end - start)]);
                        }
                    }
                }
            }
            contents
        });
        self.memory.map(page, contents);
        self.stats.privatized_pages();
    }

    pub fn read(&mut self, shared: SharedAccess<'_>, addr: usize, buf: &mut [u8]) {
        if self.layout.in_nursery(addr) {
            let off = addr - self.layout.nursery_start;
            buf.copy_from_slice(&self.nursery[off..off + buf.len()]);
            return;
        }
        while let Err(PageFault { page }) = self.memory.read(addr, buf) {
            self.privatize(shared, page)
        }
    }

    pub fn write(&mut self, shared: SharedAccess<'_>, addr: usize, data: &[u8]) {
        if self.layout.in_nursery(addr) {
            let off = addr - self.layout.nursery_start;
            self.nursery[off..off + data.len()].copy_from_slice(data);
            return;
        }
        while let Err(PageFault { page }) = self.memory.write(addr, data) {
            self.privatize(shared, page)
        }
    }

    /// Writes `data` into the pages of this view that are mapped, skipping the rest.
    pub fn import(&mut self, addr: usize, data: &[u8]) {
        let mut done = 0;
        for (a, len) in page_chunks(addr, data.len()) {
            if self.memory.is_mapped(page_of(a)) {
                let _mapped = self.memory.write(a, &data[done..done + len]);
                debug_assert!(_mapped.is_ok());
            }
            done += len;
        }
    }

    #[inline]
    pub fn read_u64(&mut self, shared: SharedAccess<'_>, addr: usize) -> u64 {
        let mut raw = [0; 8];
        self.read(shared, addr, &mut raw);
        u64::from_le_bytes(raw)
    }

    #[inline]
    pub fn write_u64(&mut self, shared: SharedAccess<'_>, addr: usize, value: u64) {
        self.write(shared, addr, &value.to_le_bytes())
    }

    #[inline]
    pub fn flags(&mut self, shared: SharedAccess<'_>, obj: ObjRef) -> u32 {
        let mut raw = [0; 4];
        self.read(shared, obj.addr(), &mut raw);
        u32::from_le_bytes(raw)
    }

    #[inline]
    pub fn set_flags(&mut self, shared: SharedAccess<'_>, obj: ObjRef, value: u32) {
        self.write(shared, obj.addr(), &value.to_le_bytes())
    }

    pub fn header(&mut self, shared: SharedAccess<'_>, obj: ObjRef) -> ObjectHeader {
        let mut raw = [0; OBJECT_ALIGN];
        self.read(shared, obj.addr(), &mut raw);
        ObjectHeader::from_bytes(&raw)
    }

    /// Size of `obj` in this view.
    pub fn object_size(&mut self, host: &dyn Host, shared: SharedAccess<'_>, obj: ObjRef) -> usize {
        if let Some(&size) = self.young_outside_nursery.get(&obj) {
            return size;
        }
        round_size(host.size_of(self.header(shared, obj)))
    }

    pub fn read_object(&mut self, host: &dyn Host, shared: SharedAccess<'_>, obj: ObjRef) -> Vec<u8> {
        let size = self.object_size(host, shared, obj);
        let mut bytes = vec![0; size];
        self.read(shared, obj.addr(), &mut bytes);
        bytes
    }

    /// The new location of an evacuated nursery object.
    #[inline]
    pub fn forwarded(&self, obj: ObjRef) -> Option<ObjRef> {
        if !self.in_nursery(obj) {
            return None;
        }
        let off = obj.addr() - self.layout.nursery_start;
        let bytes = &self.nursery[off..off + OBJECT_ALIGN];
        if header_flags(bytes) == flags::FORWARDED {
            ObjRef::from_raw(read_u64_at(bytes, 8))
        } else {
            None
        }
    }

    /// Pops a cached small slot of `size` bytes.
    #[inline]
    pub fn cached_slot(&mut self, size: usize) -> Option<usize> {
        self.small_cache
            .get_mut(size / OBJECT_ALIGN - 1)
            .and_then(Vec::pop)
    }

    pub fn cache_slots(&mut self, size: usize, slots: Vec<usize>) {
        if let Some(cache) = self.small_cache.get_mut(size / OBJECT_ALIGN - 1) {
            cache.extend(slots.into_iter().rev())
        }
    }

    pub fn drain_small_cache(&mut self) -> Vec<usize> {
        self.small_cache.iter_mut().flat_map(|c| c.drain(..)).collect()
    }

    /// Starts a new read version, clearing all markers when the version space is exhausted.
    pub fn next_read_version(&mut self) {
        if self.read_version == u8::MAX {
            self.markers.clear();
            self.read_version = FIRST_READ_VERSION;
        } else {
            self.read_version += 1;
        }
    }

    #[inline]
    pub fn mark_read(&mut self, obj: ObjRef) {
        let version = self.read_version;
        self.markers.set(obj.addr(), version)
    }

    #[inline]
    pub fn was_read(&self, obj: ObjRef) -> bool {
        self.markers.get(obj.addr()) == self.read_version
    }

    /// Unmaps every page, e.g. when the runtime shuts down.
    pub fn unmap_all(&mut self) {
        self.memory.unmap_all();
        self.signals.has_pages.store(false, Release);
    }
}

/// The bounded set of free segments. Threads without a free segment block on a condition
/// variable.
#[derive(Debug)]
pub struct SegmentPool {
    free: Mutex<u64>,
    cond: Condvar,
}

impl SegmentPool {
    pub fn new(segments: usize) -> Self {
        let free = if segments == 64 {
            u64::MAX
        } else {
            (1u64 << segments) - 1
        };
        SegmentPool {
            free: Mutex::new(free),
            cond: Condvar::new(),
        }
    }

    /// Acquires a segment, `preferred` if it is free. `on_wait` runs once if the caller has to
    /// block, and `on_wake` once it got a segment after blocking.
    pub fn acquire(
        &self,
        preferred: Option<usize>,
        on_wait: impl FnOnce(),
        on_wake: impl FnOnce(),
    ) -> usize {
        let mut free = self.free.lock();
        let mut on_wait = Some(on_wait);
        while *free == 0 {
            if let Some(f) = on_wait.take() {
                f()
            }
            self.cond.wait(&mut free);
        }
        let index = match preferred {
            Some(p) if *free & (1 << p) != 0 => p,
            _ => free.trailing_zeros() as usize,
        };
        *free &= !(1 << index);
        if on_wait.is_none() {
            on_wake()
        }
        index
    }

    pub fn release(&self, index: usize) {
        let mut free = self.free.lock();
        debug_assert_eq!(*free & (1 << index), 0, "released a free segment");
        *free |= 1 << index;
        drop(free);
        self.cond.notify_one();
    }

    pub fn all_free(&self, segments: usize) -> bool {
        self.free.lock().count_ones() as usize == segments
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        internal::commit_log::UndoRecord,
        vm::SimulatedMemory,
    };
    use crossbeam_utils::thread;
    use parking_lot::RwLock;
    use std::sync::atomic::AtomicUsize;

    fn segment() -> SegmentData {
        let layout = Layout::new(4 * PAGE_SIZE, 64 * PAGE_SIZE);
        Segment::new(0, layout, Box::new(SimulatedMemory::new()), 16)
            .data
            .into_inner()
    }

    #[test]
    fn privatize_reverts_newer_commits() {
        let mut seg = segment();
        let addr = seg.layout.old_start + 64;
        let obj = ObjRef::from_addr(addr).unwrap();
        let mut heap = SharedHeap::new();

        heap.write(addr, &[1; 16]);
        heap.log.push(1, vec![]);
        seg.set_last_validated(1);

        // another segment commits 2 over 1
        heap.write(addr, &[2; 16]);
        heap.log.push(
            1,
            vec![UndoRecord {
                obj,
                offset: 0,
                backup: Some(vec![1; 16].into()),
                data: vec![2; 16].into(),
            }],
        );

        let lock = RwLock::new(heap);
        let mut buf = [0; 16];
        seg.read(SharedAccess::Lock(&lock), addr, &mut buf);
        assert_eq!(buf, [1; 16]);
        assert!(seg.signals.has_pages.load(Relaxed));

        // import brings the page forward
        seg.import(addr, &[2; 16]);
        seg.read(SharedAccess::Lock(&lock), addr, &mut buf);
        assert_eq!(buf, [2; 16]);
    }

    #[test]
    fn nursery_access() {
        let mut seg = segment();
        let lock = RwLock::new(SharedHeap::new());
        let addr = seg.layout.nursery_start + 32;
        seg.write_u64(SharedAccess::Lock(&lock), addr, 77);
        assert_eq!(seg.read_u64(SharedAccess::Lock(&lock), addr), 77);
        assert_eq!(seg.memory.mapped_pages(), 0);
    }

    #[test]
    fn read_version_wraps() {
        let mut seg = segment();
        let obj = ObjRef::from_addr(seg.layout.old_start).unwrap();
        seg.read_version = u8::MAX;
        seg.mark_read(obj);
        assert!(seg.was_read(obj));
        seg.next_read_version();
        assert_eq!(seg.read_version, FIRST_READ_VERSION);
        assert_eq!(seg.markers.get(obj.addr()), 0);
    }

    #[test]
    fn pool_blocks() {
        let pool = SegmentPool::new(1);
        let waited = AtomicUsize::new(0);
        let first = pool.acquire(None, || {}, || {});
        assert_eq!(first, 0);
        thread::scope(|s| {
            s.spawn(|_| {
                let seg = pool.acquire(
                    Some(0),
                    || {
                        waited.fetch_add(1, SeqCst);
                    },
                    || {},
                );
                pool.release(seg);
            });
            while waited.load(SeqCst) == 0 {
                std::thread::yield_now();
            }
            pool.release(first);
        })
        .unwrap();
        assert!(pool.all_free(1));
    }
}
