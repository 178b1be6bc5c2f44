//! Per thread state, [`ThreadKey`], used to run transactions.
//!
//! A handle is acquired with [`Runtime::register_thread`](crate::runtime::Runtime::register_thread)
//! and unregisters the thread when dropped.

use crate::{
    error::{fatal, FatalError},
    host::TimingEvent,
    internal::{
        state::RuntimeState,
        thread::{ThreadState, NO_SEGMENT},
    },
    object::{flags::WRITE_BARRIER, round_size, ObjRef, HEADER_SIZE},
    rw::RwTx,
    tx::Error,
};
use core::{
    cell::Cell,
    fmt::{self, Debug, Formatter},
};
use std::sync::{atomic::Ordering::*, Arc};
use tracing::{debug, trace};

/// A registered thread.
///
/// `ThreadKey` holds the thread's shadow stack and runs its transactions. It is not `Sync`: each
/// OS thread registers its own.
pub struct ThreadKey {
    pub(crate) rt:     Arc<RuntimeState>,
    pub(crate) thread: Arc<ThreadState>,
    pub(crate) in_tx:  Cell<bool>,
    last_retries:      Cell<usize>,
}

impl Debug for ThreadKey {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter.pad("ThreadKey { .. }")
    }
}

impl Drop for ThreadKey {
    fn drop(&mut self) {
        let _ = self.rt.threads.lock().unregister(self.thread.id);
        debug!(target: "segstm::segment", thread = self.thread.id, "thread unregistered");
    }
}

impl ThreadKey {
    pub(crate) fn new(rt: Arc<RuntimeState>) -> Self {
        let thread = rt.threads.lock().register();
        debug!(target: "segstm::segment", thread = thread.id, "thread registered");
        ThreadKey {
            rt,
            thread,
            in_tx: Cell::new(false),
            last_retries: Cell::new(0),
        }
    }

    /// Starts a transaction, blocking until a segment is free.
    ///
    /// # Panics
    ///
    /// Panics if a transaction is already running on this thread.
    pub fn start(&self) -> RwTx<'_> {
        assert!(
            !self.in_tx.replace(true),
            "nested transactions are not supported"
        );
        let rt = &*self.rt;
        rt.major_collection_if_requested();

        let preferred = match self.thread.last_segment.load(Relaxed) {
            seg if seg < rt.segments.len() => Some(seg),
            _ => None,
        };
        let seg = rt.pool.acquire(
            preferred,
            || {
                rt.stats.lock().segment_waits();
                debug!(target: "segstm::segment", thread = self.thread.id, "waiting for a free segment");
                rt.timing(NO_SEGMENT, TimingEvent::WaitFreeSegment, None);
            },
            || rt.timing(NO_SEGMENT, TimingEvent::WaitDone, None),
        );
        let pause = rt.pause.read();
        rt.start_transaction(seg, &self.thread);
        RwTx::new(self, seg, pause)
    }

    /// Starts a transaction and makes it inevitable.
    pub fn start_inevitable(&self) -> RwTx<'_> {
        loop {
            let mut tx = self.start();
            match tx.become_inevitable("start_inevitable") {
                Ok(()) => return tx,
                Err(e) => tx.rollback(e.reason()),
            }
        }
    }

    /// Runs `f` in a transaction, retrying until it commits. Pending finalizers run afterwards.
    ///
    /// # Panics
    ///
    /// Panics if a transaction is already running on this thread.
    pub fn rw<F, O>(&self, mut f: F) -> O
    where
        F: FnMut(&mut RwTx<'_>) -> Result<O, Error>,
    {
        self.retry_loop(false, &mut f)
    }

    /// Like [`rw`](ThreadKey::rw), but the transaction is inevitable from the start. `f` must not
    /// return an error, since an inevitable transaction can not be rolled back.
    pub fn rw_inevitable<F, O>(&self, mut f: F) -> O
    where
        F: FnMut(&mut RwTx<'_>) -> Result<O, Error>,
    {
        self.retry_loop(true, &mut f)
    }

    fn retry_loop<O>(
        &self,
        inevitable: bool,
        f: &mut dyn FnMut(&mut RwTx<'_>) -> Result<O, Error>,
    ) -> O {
        let mut retries = 0;
        loop {
            let mut tx = if inevitable {
                self.start_inevitable()
            } else {
                self.start()
            };
            let result = match f(&mut tx) {
                Ok(o) => tx.commit().map(|()| o),
                Err(e) => {
                    tx.rollback(e.reason());
                    Err(e)
                }
            };
            match result {
                Ok(o) => {
                    self.last_retries.set(retries);
                    self.rt.stats.lock().transaction_retries(retries);
                    self.run_finalizers();
                    return o;
                }
                Err(e) => {
                    trace!(target: "segstm::tx", reason = %e.reason(), retries, "retrying");
                    retries += 1
                }
            }
        }
    }

    /// Number of retries the last successful [`rw`](ThreadKey::rw) needed.
    #[inline]
    pub fn last_retry_count(&self) -> usize {
        self.last_retries.get()
    }

    /// Runs the finalizers of objects found unreachable by the major collector, each in its own
    /// transaction. Only one thread runs finalizers at a time; others return immediately.
    pub fn run_finalizers(&self) {
        let rt = &*self.rt;
        if self.in_tx.get() || rt.finalizers_running.swap(true, Acquire) {
            return;
        }
        loop {
            let next = rt.gc.lock().run_finalizers.front().copied();
            let obj = match next {
                Some(obj) => obj,
                None => break,
            };
            let host = rt.host.clone();
            self.retry_loop(false, &mut |tx: &mut RwTx<'_>| host.finalizer(tx, obj));
            let mut gc = rt.gc.lock();
            if gc.run_finalizers.front() == Some(&obj) {
                let _ = gc.run_finalizers.pop_front();
            }
            drop(gc);
            rt.stats.lock().finalizers_run();
        }
        rt.finalizers_running.store(false, Release);
    }

    /// Installs an old object that exists before any transaction uses it, with `payload` following
    /// the header. The object is always alive. Stops the world.
    ///
    /// # Panics
    ///
    /// Panics if called inside a transaction.
    pub fn allocate_preexisting(&self, tag: u32, payload: &[u8]) -> ObjRef {
        assert!(!self.in_tx.get(), "allocate_preexisting inside a transaction");
        let rt = &*self.rt;
        let size = round_size(HEADER_SIZE + payload.len());
        let mut bytes = vec![0; size];
        bytes[..4].copy_from_slice(&WRITE_BARRIER.to_le_bytes());
        bytes[4..8].copy_from_slice(&tag.to_le_bytes());
        bytes[HEADER_SIZE..HEADER_SIZE + payload.len()].copy_from_slice(payload);

        let _world = rt.stop_the_world();
        let addr = match rt.old_space.lock().alloc(size) {
            Some(addr) => addr,
            None => fatal(FatalError::OutOfMemory { requested: size }),
        };
        rt.account_alloc(size);
        rt.shared.write().write(addr, &bytes);
        for seg in rt.segments.iter() {
            let mut data = seg.data.lock();
            data.import(addr, &bytes);
            data.markers.reset_range(addr, size);
        }
        let obj = ObjRef::at(addr);
        rt.gc.lock().prebuilt.push(obj);
        debug!(target: "segstm::gc", ?obj, size, "preexisting object installed");
        obj
    }

    #[inline]
    pub fn push_root(&self, obj: ObjRef) {
        self.thread.roots.lock().shadow_stack.push(obj)
    }

    #[inline]
    pub fn pop_root(&self) -> Option<ObjRef> {
        self.thread.roots.lock().shadow_stack.pop()
    }

    #[inline]
    pub fn peek_root(&self) -> Option<ObjRef> {
        self.thread.roots.lock().shadow_stack.last().copied()
    }

    /// Runs a major collection if `level > 0`. Outside a transaction this thread has no young
    /// objects, so there is nothing for a minor collection to do.
    pub fn collect(&self, level: u32) {
        assert!(!self.in_tx.get(), "use RwTx::collect inside a transaction");
        if level > 0 {
            self.rt.request_major_collection();
            self.rt.major_collection_if_requested();
        }
    }
}
