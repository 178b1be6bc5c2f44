//! Everything a runtime shares between its threads.

use crate::{
    config::Config,
    error::{fatal, FatalError},
    host::{Host, Marker, TimingEvent},
    internal::{
        alloc::{OldSpace, SMALL_BATCH},
        commit_log::{SharedAccess, SharedHeap},
        frw_lock::{PauseGuard, PauseLock, PauseWriteGuard},
        gc::GcState,
        segment::{Layout, Segment, SegmentData, SegmentPool},
        thread::ThreadList,
    },
    object::{flags, OBJECT_ALIGN},
    stats::Stats,
    tx::AbortReason,
    vm::VirtualMemory,
};
use crossbeam_utils::CachePadded;
use parking_lot::{Mutex, RwLock};
use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering::*},
    Arc,
};

/// Value of the inevitable slot when no transaction is inevitable.
pub const NO_OWNER: usize = usize::MAX;

const OVERFLOW_NUMBERS: u32 = flags::OVERFLOW_MASK / flags::OVERFLOW_NUMBER_BIT0;

pub struct RuntimeState {
    pub config: Config,
    pub layout: Layout,
    pub host:   Arc<dyn Host>,

    /// Held for reading by every running transaction.
    pub pause:           PauseLock,
    /// Number of threads waiting for the write side of `pause`.
    pub pause_requested: AtomicUsize,
    pub major_requested: AtomicBool,

    pub shared:           RwLock<SharedHeap>,
    /// Mirror of the commit log head, readable without the lock.
    pub head_rev:         AtomicU64,
    /// Segment of the inevitable transaction, or `NO_OWNER`.
    pub inevitable_owner: AtomicUsize,

    pub segments: Box<[CachePadded<Segment>]>,
    pub pool:     SegmentPool,

    pub old_space:    Mutex<OldSpace>,
    pub bytes_in_use: AtomicUsize,
    /// Mirror of the commit log's memory, readable without the lock.
    pub log_bytes:    AtomicUsize,
    pub threshold:    AtomicUsize,

    pub gc:                 Mutex<GcState>,
    pub threads:            Mutex<ThreadList>,
    overflow_counter:       AtomicU32,
    pub finalizers_running: AtomicBool,
    pub stats:              Mutex<Stats>,
}

impl std::fmt::Debug for RuntimeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeState")
            .field("config", &self.config)
            .field("layout", &self.layout)
            .field("head_rev", &self.head_rev)
            .field("bytes_in_use", &self.bytes_in_use)
            .field("log_bytes", &self.log_bytes)
            .finish()
    }
}

impl RuntimeState {
    pub fn new(
        config: Config,
        host: Arc<dyn Host>,
        memory: &dyn Fn() -> Box<dyn VirtualMemory>,
    ) -> Self {
        let layout = Layout::new(config.nursery_size, config.heap_size);
        let classes = config.small_object_limit / OBJECT_ALIGN;
        let segments = (0..config.segments)
            .map(|index| CachePadded::new(Segment::new(index, layout, memory(), classes)))
            .collect();
        RuntimeState {
            layout,
            host,
            pause: PauseLock::new(()),
            pause_requested: AtomicUsize::new(0),
            major_requested: AtomicBool::new(false),
            shared: RwLock::new(SharedHeap::new()),
            head_rev: AtomicU64::new(0),
            inevitable_owner: AtomicUsize::new(NO_OWNER),
            segments,
            pool: SegmentPool::new(config.segments),
            old_space: Mutex::new(OldSpace::new(
                layout.old_start,
                layout.old_end,
                config.small_object_limit,
            )),
            bytes_in_use: AtomicUsize::new(0),
            log_bytes: AtomicUsize::new(0),
            threshold: AtomicUsize::new(config.min_major_threshold),
            gc: Mutex::new(GcState::default()),
            threads: Mutex::new(ThreadList::default()),
            overflow_counter: AtomicU32::new(0),
            finalizers_running: AtomicBool::new(false),
            stats: Mutex::new(Stats::default()),
            config,
        }
    }

    #[inline]
    pub fn segment(&self, index: usize) -> &Segment {
        &self.segments[index]
    }

    #[inline]
    pub fn shared_access(&self) -> SharedAccess<'_> {
        SharedAccess::Lock(&self.shared)
    }

    #[inline]
    pub fn timing(&self, segment: usize, event: TimingEvent, marker: Option<Marker>) {
        self.host.timing_event(segment, event, marker)
    }

    /// A fresh overflow number, never 0.
    pub fn next_overflow_number(&self) -> u32 {
        loop {
            let n = self.overflow_counter.fetch_add(1, Relaxed).wrapping_add(1) % OVERFLOW_NUMBERS;
            if n != 0 {
                return n * flags::OVERFLOW_NUMBER_BIT0;
            }
        }
    }

    /// Counts `bytes` of new old objects and requests a major collection when the threshold is
    /// crossed.
    pub fn account_alloc(&self, bytes: usize) {
        let used = self.bytes_in_use.fetch_add(bytes, Relaxed) + bytes;
        self.check_threshold(used + self.log_bytes.load(Relaxed))
    }

    /// Records the commit log's current memory. Called with the shared heap write-locked.
    pub fn account_log(&self, heap: &SharedHeap) {
        let log = heap.log.bytes();
        self.log_bytes.store(log, Relaxed);
        self.check_threshold(self.bytes_in_use.load(Relaxed) + log)
    }

    #[inline]
    fn check_threshold(&self, used: usize) {
        if unlikely!(used > self.threshold.load(Relaxed))
            && !self.major_requested.swap(true, AcqRel)
        {
            tracing::debug!(
                target: "segstm::gc",
                used,
                threshold = self.threshold.load(Relaxed),
                "major collection requested"
            );
        }
    }

    pub fn account_free(&self, bytes: usize) {
        let _ = self
            .bytes_in_use
            .fetch_update(Relaxed, Relaxed, |used| Some(used.saturating_sub(bytes)));
    }

    /// Allocates `size` bytes in the old generation for `data`. Exhausting the old generation is
    /// fatal.
    pub fn alloc_old(&self, data: &mut SegmentData, size: usize) -> usize {
        let addr = if size <= self.config.small_object_limit {
            match data.cached_slot(size) {
                Some(addr) => Some(addr),
                None => {
                    let mut slots = self.old_space.lock().take_small(size, SMALL_BATCH);
                    if slots.is_empty() {
                        None
                    } else {
                        let first = slots.remove(0);
                        data.cache_slots(size, slots);
                        Some(first)
                    }
                }
            }
        } else {
            self.old_space.lock().alloc(size)
        };
        match addr {
            Some(addr) => {
                self.account_alloc(size);
                addr
            }
            None => fatal(FatalError::OutOfMemory { requested: size }),
        }
    }

    /// Returns an old allocation made by a transaction that never published it.
    pub fn free_old(&self, addr: usize) {
        if let Some(size) = self.old_space.lock().free(addr) {
            self.account_free(size)
        }
    }

    /// Takes the write side of the pause lock, stopping every transaction at its next safe point.
    pub fn stop_the_world(&self) -> PauseWriteGuard<'_> {
        let _ = self.pause_requested.fetch_add(1, AcqRel);
        let guard = self.pause.write();
        let _ = self.pause_requested.fetch_sub(1, AcqRel);
        guard
    }

    /// Runs a pending major collection. Must not be called with the pause lock held.
    pub fn major_collection_if_requested(&self) {
        if self.major_requested.load(Acquire) {
            let world = self.stop_the_world();
            if self.major_requested.swap(false, AcqRel) {
                self.major_collection(&world)
            }
        }
    }

    pub fn request_major_collection(&self) {
        self.major_requested.store(true, Release)
    }

    /// The abort reason a collector delivered to `segment`, if any.
    #[inline]
    pub fn must_abort(&self, segment: usize) -> Result<(), AbortReason> {
        let reason = self.segment(segment).signals.must_abort.load(Acquire);
        match AbortReason::from_u8(reason) {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }

    /// A point where the running transaction on `segment` allows a stop-the-world pause.
    #[inline]
    pub fn safe_point(&self, segment: usize, pause: &mut PauseGuard<'_>) -> Result<(), AbortReason> {
        if unlikely!(
            self.pause_requested.load(Acquire) != 0 || self.major_requested.load(Acquire)
        ) {
            PauseGuard::unlocked(pause, || {
                self.major_collection_if_requested();
                std::thread::yield_now()
            });
        }
        self.must_abort(segment)
    }

    /// Smallest revision still needed by a segment that has pages mapped.
    pub fn oldest_needed_rev(&self, head: u64) -> u64 {
        self.segments
            .iter()
            .filter(|s| s.signals.has_pages.load(Acquire))
            .map(|s| s.signals.last_validated.load(Acquire))
            .min()
            .unwrap_or(head)
    }

    cfg_if::cfg_if! {
        if #[cfg(feature = "stats")] {
            /// Moves a segment's counters into the runtime totals.
            pub fn merge_stats(&self, stats: &mut Stats) {
                self.stats.lock().merge(stats);
                *stats = Stats::default();
            }
        } else {
            #[inline]
            pub fn merge_stats(&self, _stats: &mut Stats) {}
        }
    }
}
