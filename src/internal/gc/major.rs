use crate::{
    host::{ObjectHeader, ObjectView, TimingEvent},
    internal::{
        commit_log::{SharedAccess, SharedHeap},
        frw_lock::PauseWriteGuard,
        segment::SegmentData,
        state::RuntimeState,
        thread::NO_SEGMENT,
    },
    object::{read_u64_at, round_size, ObjRef, OBJECT_ALIGN},
    tx::AbortReason,
};
use fxhash::FxHashSet;
use parking_lot::{MutexGuard, RwLockWriteGuard};
use std::{mem, sync::atomic::Ordering::*, time::Instant};
use tracing::info;

/// Which copy of an object the collector reads: the committed one, or the one in a segment that
/// created or modified it.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(super) enum View {
    Shared,
    Segment(usize),
}

pub(super) struct Collector<'a> {
    pub rt:       &'a RuntimeState,
    pub segments: Vec<MutexGuard<'a, SegmentData>>,
    pub shared:   RwLockWriteGuard<'a, SharedHeap>,
    pub marked:   FxHashSet<ObjRef>,
    worklist:     Vec<(ObjRef, View)>,
}

/// Reads a committed object.
fn read_shared(rt: &RuntimeState, shared: &SharedHeap, obj: ObjRef) -> Vec<u8> {
    let mut head = [0; OBJECT_ALIGN];
    shared.read(obj.addr(), &mut head);
    let size = round_size(rt.host.size_of(ObjectHeader::from_bytes(&head)));
    let mut bytes = vec![0; size];
    shared.read(obj.addr(), &mut bytes);
    bytes
}

impl<'a> Collector<'a> {
    pub fn read_object(&mut self, obj: ObjRef, view: View) -> Vec<u8> {
        match view {
            View::Shared => read_shared(self.rt, &self.shared, obj),
            View::Segment(s) => {
                let shared: &SharedHeap = &self.shared;
                self.segments[s].read_object(&*self.rt.host, SharedAccess::Held(shared), obj)
            }
        }
    }

    /// The view to read `obj` in, given the view of the object that referenced it. Only objects
    /// created by a segment's running transaction need that segment's view.
    pub fn view_of(&mut self, obj: ObjRef, hint: View) -> View {
        if let View::Segment(s) = hint {
            let shared: &SharedHeap = &self.shared;
            let data = &mut *self.segments[s];
            let flags = data.flags(SharedAccess::Held(shared), obj);
            if data.is_overflow_flags(flags) {
                return hint;
            }
        }
        View::Shared
    }

    pub fn children(&mut self, obj: ObjRef, view: View) -> Vec<ObjRef> {
        let bytes = self.read_object(obj, view);
        let mut children = Vec::new();
        self.rt
            .host
            .trace(ObjectView::new(obj, &bytes), &mut |offset| {
                if let Some(child) = ObjRef::from_raw(read_u64_at(&bytes, offset)) {
                    children.push(child)
                }
            });
        children
    }

    fn mark(&mut self, obj: ObjRef, hint: View) {
        if self.marked.insert(obj) {
            let view = self.view_of(obj, hint);
            self.worklist.push((obj, view))
        }
    }

    fn mark_all(&mut self) {
        while let Some((obj, view)) = self.worklist.pop() {
            for child in self.children(obj, view) {
                self.mark(child, view)
            }
        }
    }

    /// Brings every segment up to date with the commit log, aborting running transactions that
    /// conflict, and empties the nurseries of the ones that survive.
    fn synchronize_segments(&mut self) {
        let rt = self.rt;
        for s in 0..self.segments.len() {
            let shared: &SharedHeap = &self.shared;
            let data = &mut *self.segments[s];
            let running = data.is_running();
            if let Err(reason) = rt.validate(data, shared, AbortReason::MajorGc) {
                data.signals.must_abort.store(reason.to_u8(), Release);
            }
            if running && data.is_running() {
                rt.minor_collection(data, SharedAccess::Held(shared));
            }
        }
        self.shared.log.clear();
        rt.log_bytes.store(0, Relaxed);
    }

    fn mark_roots(&mut self) {
        for s in 0..self.segments.len() {
            if !self.segments[s].is_running() {
                continue;
            }
            let modified: Vec<ObjRef> = self.segments[s].undo.objects().collect();
            for obj in modified {
                let _ = self.marked.insert(obj);
                self.worklist.push((obj, View::Shared));
                self.worklist.push((obj, View::Segment(s)));
            }
            let finalizers = self.segments[s].finalizers.clone();
            for obj in finalizers {
                self.mark(obj, View::Segment(s))
            }
            let saved: Vec<ObjRef> = self.segments[s].saved_roots.iter().collect();
            for obj in saved {
                self.mark(obj, View::Shared)
            }
        }

        let global: Vec<ObjRef> = {
            let gc = self.rt.gc.lock();
            gc.prebuilt
                .iter()
                .chain(gc.run_finalizers.iter())
                .copied()
                .collect()
        };
        for obj in global {
            self.mark(obj, View::Shared)
        }

        let rt = self.rt;
        let threads = rt.threads.lock();
        for thread in threads.iter() {
            let hint = match thread.segment() {
                Some(s) if self.segments[s].is_running() => View::Segment(s),
                _ => View::Shared,
            };
            let roots: Vec<ObjRef> = thread.roots.lock().iter().collect();
            for obj in roots {
                self.mark(obj, hint)
            }
        }
    }

    /// Calls the light finalizers of dead objects.
    fn destructors(&mut self) {
        for s in 0..self.segments.len() {
            let list = mem::take(&mut self.segments[s].old_destructors);
            let mut alive = Vec::with_capacity(list.len());
            for obj in list {
                if self.marked.contains(&obj) {
                    alive.push(obj);
                    continue;
                }
                let view = self.view_of(obj, View::Segment(s));
                let bytes = self.read_object(obj, view);
                self.rt.host.destructor(ObjectView::new(obj, &bytes));
            }
            self.segments[s].old_destructors = alive;
        }
    }

    /// Frees every unmarked old object. Returns the freed and the surviving byte counts.
    fn sweep(&mut self) -> (usize, usize) {
        let marked = &self.marked;
        let sweep = {
            let mut old = self.rt.old_space.lock();
            for data in self.segments.iter_mut() {
                for addr in data.drain_small_cache() {
                    old.release_cached(addr)
                }
            }
            old.sweep(|addr| ObjRef::from_addr(addr).map_or(false, |obj| marked.contains(&obj)))
        };

        let mut freed = 0;
        for &(addr, size) in &sweep.freed {
            freed += size;
            for data in self.segments.iter_mut() {
                data.markers.reset_range(addr, size)
            }
        }
        for &page in &sweep.freed_pages {
            for data in self.segments.iter_mut() {
                let _ = data.memory.unmap(page);
            }
            self.shared.drop_page(page);
        }
        for data in self.segments.iter_mut() {
            let mapped = data.memory.mapped_pages() > 0;
            data.signals.has_pages.store(mapped, Release);
        }
        (freed, sweep.live_bytes)
    }
}

impl RuntimeState {
    /// Collects the old generation. Requires the world to be stopped.
    pub fn major_collection(&self, _world: &PauseWriteGuard<'_>) {
        let started = Instant::now();
        self.timing(NO_SEGMENT, TimingEvent::MajorGcStart, None);

        let segments = self.segments.iter().map(|s| s.data.lock()).collect();
        let shared = self.shared.write();
        let mut collector = Collector {
            rt: self,
            segments,
            shared,
            marked: FxHashSet::default(),
            worklist: Vec::new(),
        };

        collector.synchronize_segments();
        collector.mark_roots();
        collector.mark_all();
        collector.finalizers();
        collector.weakrefs();
        collector.destructors();
        for data in collector.segments.iter_mut() {
            let marked = &collector.marked;
            data.large_overflow_objects.retain(|obj| marked.contains(obj));
        }
        let (freed, live) = collector.sweep();
        drop(collector);

        let threshold =
            ((live as f64 * self.config.major_gc_factor) as usize).max(self.config.min_major_threshold);
        self.bytes_in_use.store(live, Relaxed);
        self.threshold.store(threshold, Relaxed);
        self.major_requested.store(false, Release);
        self.gc.lock().collections += 1;
        {
            let mut stats = self.stats.lock();
            stats.major_collections();
            stats.major_freed_bytes(freed);
        }
        info!(
            target: "segstm::gc",
            freed,
            live,
            threshold,
            elapsed_us = started.elapsed().as_micros() as u64,
            "major collection"
        );
        self.timing(NO_SEGMENT, TimingEvent::MajorGcDone, None);
    }
}
