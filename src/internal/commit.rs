//! Starting, validating, committing and aborting transactions.
//!
//! A commit appends an entry to the commit log under the shared write lock; that lock is the single
//! ordering point between transactions. Validation replays the entries a segment has not seen yet
//! into its mapped pages and aborts the running transaction if one of them touched an object in its
//! read set.

use crate::{
    error::{fatal, FatalError},
    host::{ObjectView, TimingEvent},
    internal::{
        commit_log::{SharedAccess, SharedHeap, UndoRecord},
        frw_lock::PauseGuard,
        parking,
        segment::{SegmentData, TxState},
        state::{RuntimeState, NO_OWNER},
        thread::{Roots, ThreadState, NO_SEGMENT},
        undo_log::UndoSlice,
    },
    object::{flags::*, ObjRef},
    tx::AbortReason,
};
use fxhash::FxHashSet;
use std::{
    mem,
    sync::{atomic::Ordering::*, Arc},
};
use tracing::{debug, trace};

impl RuntimeState {
    /// Begins a transaction on `segment` for `thread`. The caller owns the segment and holds the
    /// pause lock for reading.
    pub fn start_transaction(&self, segment: usize, thread: &Arc<ThreadState>) {
        let seg = self.segment(segment);
        let mut data = seg.data.lock();
        debug_assert_eq!(data.state, TxState::None, "segment already in use");
        seg.signals.must_abort.store(0, Release);
        data.state = TxState::Regular;
        data.aborted = None;
        data.next_read_version();
        data.overflow_number = self.next_overflow_number();
        data.saved_roots = thread.roots.lock().clone();
        data.thread = Some(thread.clone());
        thread.segment.store(segment, Release);
        {
            let heap = self.shared.read();
            let _fresh = self.validate(&mut data, &heap, AbortReason::ValidateInflight);
            debug_assert!(_fresh.is_ok(), "conflict without a read set");
        }
        let marker = data.marker;
        drop(data);
        trace!(target: "segstm::tx", segment, thread = thread.id, "transaction started");
        self.timing(segment, TimingEvent::TransactionStart, marker);
    }

    /// Replays every commit after `data.last_validated` into the mapped pages of `data`.
    ///
    /// If the segment runs a transaction and one of the replayed commits changed an object it has
    /// read, the transaction is aborted with `phase` (or `WriteWrite` if it modified the object
    /// too). Segments without a running transaction are only brought up to date.
    pub fn validate(
        &self,
        data: &mut SegmentData,
        heap: &SharedHeap,
        phase: AbortReason,
    ) -> Result<(), AbortReason> {
        data.catch_up(heap);
        let check = data.is_running();
        let mut conflict = None;
        let mut entries = 0;
        for entry in heap.log.after(data.last_validated) {
            entries += 1;
            debug_assert_ne!(entry.segment, data.index, "own commit after own snapshot");
            for record in &entry.records {
                if check
                    && conflict.is_none()
                    && record.backup.is_some()
                    && data.was_read(record.obj)
                {
                    let reason = if data.undo.contains(record.obj) {
                        AbortReason::WriteWrite
                    } else {
                        phase
                    };
                    debug!(
                        target: "segstm::tx",
                        segment = data.index,
                        obj = ?record.obj,
                        rev = entry.rev,
                        %reason,
                        "conflict"
                    );
                    // the rollback must happen before the newer data lands on top of it
                    self.restore_undo(data, SharedAccess::Held(heap));
                    conflict = Some(reason);
                }
                data.import(record.addr(), &record.data);
            }
        }
        data.set_last_validated(heap.log.head());
        data.stats.validated_entries(entries);
        match conflict {
            Some(reason) => {
                self.abort_data_structures(data, SharedAccess::Held(heap), reason);
                Err(reason)
            }
            None => Ok(()),
        }
    }

    fn restore_undo(&self, data: &mut SegmentData, access: SharedAccess<'_>) {
        let slices: Vec<UndoSlice> = data.undo.drain().collect();
        for slice in slices.iter().rev() {
            data.write(access, slice.obj.addr() + slice.offset, &slice.backup)
        }
    }

    /// Rolls back everything the running transaction did to `data`. Idempotent.
    pub fn abort_data_structures(
        &self,
        data: &mut SegmentData,
        access: SharedAccess<'_>,
        reason: AbortReason,
    ) {
        if data.state == TxState::None || data.aborted.is_some() {
            return;
        }
        if data.state == TxState::Inevitable {
            if !std::thread::panicking() {
                fatal(FatalError::InevitableAbort(reason))
            }
            data.state = TxState::Regular;
            self.release_inevitable(data.index);
        }

        self.restore_undo(data, access);
        self.reset_cards(data, access, false);

        for obj in mem::take(&mut data.young_destructors) {
            let bytes = data.read_object(&*self.host, access, obj);
            self.host.destructor(ObjectView::new(obj, &bytes));
        }

        let used = data.nursery_used;
        data.nursery[..used].iter_mut().for_each(|b| *b = 0);
        data.nursery_used = 0;
        for (obj, size) in mem::take(&mut data.young_outside_nursery) {
            data.markers.reset_range(obj.addr(), size);
            self.free_old(obj.addr());
        }
        for (_, shadow) in mem::take(&mut data.shadows) {
            self.free_old(shadow.addr());
        }
        self.free_overflow_objects(data, access);
        data.objects_pointing_to_nursery.clear();
        data.young_weakrefs.clear();
        data.young_finalizers.clear();
        data.finalizers.clear();

        if let Some(thread) = &data.thread {
            *thread.roots.lock() = data.saved_roots.clone();
        }
        data.overflow_number = self.next_overflow_number();
        data.aborted = Some(reason);
        data.stats.abort(reason);
        debug!(target: "segstm::tx", segment = data.index, %reason, "transaction aborted");
        self.timing(data.index, TimingEvent::TransactionAbort, data.marker);
    }

    /// Frees the objects the aborted transaction moved out of its nursery. Nothing outside the
    /// segment can reference them.
    fn free_overflow_objects(&self, data: &mut SegmentData, access: SharedAccess<'_>) {
        let created: FxHashSet<ObjRef> = data.large_overflow_objects.drain(..).collect();
        if created.is_empty() {
            return;
        }
        let destructors = mem::take(&mut data.old_destructors);
        for obj in destructors {
            if created.contains(&obj) {
                let bytes = data.read_object(&*self.host, access, obj);
                self.host.destructor(ObjectView::new(obj, &bytes));
            } else {
                data.old_destructors.push(obj)
            }
        }
        data.old_weakrefs.retain(|obj| !created.contains(obj));
        for obj in created {
            let size = data.object_size(&*self.host, access, obj);
            data.markers.reset_range(obj.addr(), size);
            self.free_old(obj.addr());
        }
    }

    /// Commits the transaction running on `segment`. On error the transaction was aborted.
    pub fn commit(&self, segment: usize, pause: &mut PauseGuard<'_>) -> Result<(), AbortReason> {
        self.safe_point(segment, pause)?;
        let seg = self.segment(segment);
        let mut data = seg.data.lock();
        if let Some(reason) = data.aborted {
            return Err(reason);
        }
        self.minor_collection(&mut data, self.shared_access());

        if !data.undo.is_empty() || !data.large_overflow_objects.is_empty() {
            loop {
                let mut heap = self.shared.write();
                let owner = self.inevitable_owner.load(Acquire);
                if owner != NO_OWNER && owner != segment {
                    drop(heap);
                    data.stats.inevitable_waits();
                    let marker = data.marker;
                    drop(data);
                    self.timing(segment, TimingEvent::WaitInevitable, marker);
                    parking::park_while_owned(
                        &self.inevitable_owner,
                        owner,
                        self.config.wait_interval,
                    );
                    self.timing(segment, TimingEvent::WaitDone, marker);
                    self.safe_point(segment, pause)?;
                    data = seg.data.lock();
                    continue;
                }
                self.validate(&mut data, &heap, AbortReason::ValidateCommit)?;
                self.publish(&mut data, &mut heap);
                break;
            }
        }

        if data.state == TxState::Inevitable {
            data.state = TxState::Regular;
            self.release_inevitable(segment);
        }
        if !data.finalizers.is_empty() {
            let finalizers = mem::take(&mut data.finalizers);
            self.gc.lock().objects_with_finalizers.extend(finalizers);
        }
        data.old_objects_with_cards_set.clear();
        trace!(target: "segstm::tx", segment, rev = data.last_validated, "transaction committed");
        self.timing(segment, TimingEvent::TransactionCommit, data.marker);
        Ok(())
    }

    /// Appends the changes of `data` to the commit log and the committed pages.
    fn publish(&self, data: &mut SegmentData, heap: &mut SharedHeap) {
        let access = SharedAccess::Held(heap);
        let modified: Vec<ObjRef> = data.undo.objects().collect();
        for &obj in &modified {
            let flags = data.flags(access, obj);
            data.set_flags(
                access,
                obj,
                (flags & !(WB_EXECUTED | CARDS_SET)) | WRITE_BARRIER,
            );
        }
        self.reset_cards(data, access, true);
        let created = mem::take(&mut data.large_overflow_objects);
        for &obj in &created {
            let flags = data.flags(access, obj);
            data.set_flags(
                access,
                obj,
                (flags & !(OVERFLOW_MASK | WB_EXECUTED | CARDS_SET)) | WRITE_BARRIER,
            );
        }

        let slices: Vec<UndoSlice> = data.undo.drain().collect();
        data.stats.undo_slices(slices.len());
        let mut records = Vec::with_capacity(slices.len() + created.len());
        for slice in slices {
            let mut current = vec![0; slice.backup.len()];
            data.read(
                SharedAccess::Held(heap),
                slice.obj.addr() + slice.offset,
                &mut current,
            );
            records.push(UndoRecord {
                obj:    slice.obj,
                offset: slice.offset,
                backup: Some(slice.backup),
                data:   current.into(),
            });
        }
        for obj in created {
            let bytes = data.read_object(&*self.host, SharedAccess::Held(heap), obj);
            records.push(UndoRecord {
                obj,
                offset: 0,
                backup: None,
                data: bytes.into(),
            });
        }
        for record in &records {
            heap.write(record.addr(), &record.data);
        }
        data.stats.commit_records(records.len());

        let rev = heap.log.push(data.index, records);
        self.head_rev.store(rev, Release);
        data.set_last_validated(rev);
        let keep = self.oldest_needed_rev(rev);
        heap.log.trim(keep);
        self.account_log(heap);
    }

    /// Makes the transaction on `segment` inevitable. With `wait` unset, fails with
    /// [`AbortReason::Inevitable`] (aborting the transaction) instead of waiting for another
    /// inevitable transaction.
    pub fn become_inevitable(
        &self,
        segment: usize,
        pause: &mut PauseGuard<'_>,
        reason: &str,
        wait: bool,
    ) -> Result<(), AbortReason> {
        let seg = self.segment(segment);
        loop {
            self.safe_point(segment, pause)?;
            let mut data = seg.data.lock();
            if let Some(reason) = data.aborted {
                return Err(reason);
            }
            if data.state == TxState::Inevitable {
                return Ok(());
            }
            let heap = self.shared.write();
            self.validate(&mut data, &heap, AbortReason::ValidateInflight)?;
            match self
                .inevitable_owner
                .compare_exchange(NO_OWNER, segment, AcqRel, Acquire)
            {
                Ok(_) => {
                    data.state = TxState::Inevitable;
                    drop(heap);
                    debug!(target: "segstm::tx", segment, reason, "became inevitable");
                    self.timing(segment, TimingEvent::BecomeInevitable, data.marker);
                    return Ok(());
                }
                Err(_) if !wait => {
                    self.abort_data_structures(
                        &mut data,
                        SharedAccess::Held(&heap),
                        AbortReason::Inevitable,
                    );
                    return Err(AbortReason::Inevitable);
                }
                Err(owner) => {
                    drop(heap);
                    data.stats.inevitable_waits();
                    let marker = data.marker;
                    drop(data);
                    self.timing(segment, TimingEvent::WaitInevitable, marker);
                    parking::park_while_owned(
                        &self.inevitable_owner,
                        owner,
                        self.config.wait_interval,
                    );
                    self.timing(segment, TimingEvent::WaitDone, marker);
                }
            }
        }
    }

    pub fn release_inevitable(&self, segment: usize) {
        if self
            .inevitable_owner
            .compare_exchange(segment, NO_OWNER, AcqRel, Acquire)
            .is_ok()
        {
            parking::unpark_all(&self.inevitable_owner);
        }
    }

    /// Detaches the finished transaction from `data`.
    pub fn end_transaction(&self, data: &mut SegmentData) {
        if let Some(thread) = data.thread.take() {
            thread.segment.store(NO_SEGMENT, Release);
            thread.last_segment.store(data.index, Relaxed);
        }
        data.state = TxState::None;
        data.marker = None;
        data.saved_roots = Roots::default();
        self.merge_stats(&mut data.stats);
    }
}
