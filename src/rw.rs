//! Read write transactions.
//!
//! An [`RwTx`] owns a segment for its whole life. Every object access goes through the segment's
//! view of the heap: [`read`](RwTx::read) and [`write`](RwTx::write) are the barriers, and the
//! plain accessors ([`load`](RwTx::load), [`store`](RwTx::store), ...) assume the matching barrier
//! was already called on the object in this transaction.
//!
//! Objects returned by the allocation methods are young. Any call that may run a minor collection
//! (allocation, [`check`](RwTx::check), [`collect`](RwTx::collect)) moves them; references that
//! must survive such a call belong on the shadow stack ([`push_root`](RwTx::push_root)).

use crate::{
    error::{fatal, FatalError},
    host::Marker,
    internal::{frw_lock::PauseGuard, segment::SegmentData, state::RuntimeState},
    object::{read_u64_at, round_size, ObjRef, HEADER_SIZE},
    thread_key::ThreadKey,
    tx::{AbortReason, Error},
};
use core::fmt::{self, Debug, Formatter};
use parking_lot::MutexGuard;

/// A read write transaction.
///
/// Dropping an `RwTx` without calling [`commit`](RwTx::commit) aborts it.
pub struct RwTx<'a> {
    key:   &'a ThreadKey,
    seg:   usize,
    pause: Option<PauseGuard<'a>>,
}

impl Debug for RwTx<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RwTx").field("segment", &self.seg).finish()
    }
}

impl Drop for RwTx<'_> {
    fn drop(&mut self) {
        if self.pause.is_some() {
            self.finish(Err(AbortReason::Manual))
        }
    }
}

impl<'a> RwTx<'a> {
    #[inline]
    pub(crate) fn new(key: &'a ThreadKey, seg: usize, pause: PauseGuard<'a>) -> Self {
        RwTx {
            key,
            seg,
            pause: Some(pause),
        }
    }

    #[inline]
    fn rt(&self) -> &'a RuntimeState {
        let key: &'a ThreadKey = self.key;
        &key.rt
    }

    #[inline]
    fn data(&self) -> MutexGuard<'a, SegmentData> {
        self.rt().segment(self.seg).data.lock()
    }

    fn pause(&mut self) -> &mut PauseGuard<'a> {
        match &mut self.pause {
            Some(pause) => pause,
            None => fatal(FatalError::Invariant("transaction used after it finished")),
        }
    }

    #[inline]
    fn live(data: &SegmentData) -> Result<(), Error> {
        match data.aborted {
            Some(reason) => Err(reason.into()),
            None => Ok(()),
        }
    }

    /// Index of the segment running this transaction.
    #[inline]
    pub fn segment(&self) -> usize {
        self.seg
    }

    /// Read barrier: adds `obj` to the read set.
    #[inline]
    pub fn read(&mut self, obj: ObjRef) -> Result<ObjRef, Error> {
        self.rt().read_barrier(&mut self.data(), obj)?;
        Ok(obj)
    }

    /// Write barrier: must be called before the first store to `obj` in this transaction.
    #[inline]
    pub fn write(&mut self, obj: ObjRef) -> Result<ObjRef, Error> {
        self.rt().write_barrier(&mut self.data(), obj)?;
        Ok(obj)
    }

    /// Write barrier for item `index` of the array part of `obj`. For large arrays only the card
    /// holding the item is backed up.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds of a card marked array.
    #[inline]
    pub fn write_card(&mut self, obj: ObjRef, index: usize) -> Result<(), Error> {
        self.rt().write_card(&mut self.data(), obj, index)?;
        Ok(())
    }

    #[inline]
    pub fn load(&self, obj: ObjRef, offset: usize) -> u64 {
        let rt = self.rt();
        self.data().read_u64(rt.shared_access(), obj.addr() + offset)
    }

    #[inline]
    pub fn store(&mut self, obj: ObjRef, offset: usize, value: u64) {
        let rt = self.rt();
        self.data()
            .write_u64(rt.shared_access(), obj.addr() + offset, value)
    }

    #[inline]
    pub fn load_ref(&self, obj: ObjRef, offset: usize) -> Option<ObjRef> {
        ObjRef::from_raw(self.load(obj, offset))
    }

    #[inline]
    pub fn store_ref(&mut self, obj: ObjRef, offset: usize, value: Option<ObjRef>) {
        self.store(obj, offset, ObjRef::to_raw(value))
    }

    pub fn load_bytes(&self, obj: ObjRef, offset: usize, buf: &mut [u8]) {
        let rt = self.rt();
        self.data().read(rt.shared_access(), obj.addr() + offset, buf)
    }

    pub fn store_bytes(&mut self, obj: ObjRef, offset: usize, bytes: &[u8]) {
        let rt = self.rt();
        self.data().write(rt.shared_access(), obj.addr() + offset, bytes)
    }

    /// [`read`](RwTx::read) followed by [`load`](RwTx::load).
    #[inline]
    pub fn get(&mut self, obj: ObjRef, offset: usize) -> Result<u64, Error> {
        self.read(obj)?;
        Ok(self.load(obj, offset))
    }

    /// [`write`](RwTx::write) followed by [`store`](RwTx::store).
    #[inline]
    pub fn set(&mut self, obj: ObjRef, offset: usize, value: u64) -> Result<(), Error> {
        self.write(obj)?;
        self.store(obj, offset, value);
        Ok(())
    }

    #[inline]
    pub fn get_ref(&mut self, obj: ObjRef, offset: usize) -> Result<Option<ObjRef>, Error> {
        self.read(obj)?;
        Ok(self.load_ref(obj, offset))
    }

    #[inline]
    pub fn set_ref(
        &mut self,
        obj: ObjRef,
        offset: usize,
        value: Option<ObjRef>,
    ) -> Result<(), Error> {
        self.write(obj)?;
        self.store_ref(obj, offset, value);
        Ok(())
    }

    /// Allocates a zeroed young object of `size` bytes, header included, with type `tag`.
    ///
    /// May run a minor collection.
    pub fn allocate(&mut self, size: usize, tag: u32) -> Result<ObjRef, Error> {
        self.check()?;
        let rt = self.rt();
        let mut data = self.data();
        Self::live(&data)?;
        Ok(rt.allocate_young(&mut data, size, tag))
    }

    /// Like [`allocate`](RwTx::allocate). Once the object is committed and becomes unreachable,
    /// [`Host::finalizer`](crate::host::Host::finalizer) runs for it in its own transaction.
    pub fn allocate_with_finalizer(&mut self, size: usize, tag: u32) -> Result<ObjRef, Error> {
        let obj = self.allocate(size, tag)?;
        self.data().young_finalizers.push(obj);
        Ok(obj)
    }

    /// Like [`allocate`](RwTx::allocate). When the object dies, or the transaction creating it
    /// aborts, the collector calls [`Host::destructor`](crate::host::Host::destructor).
    pub fn allocate_with_destructor(&mut self, size: usize, tag: u32) -> Result<ObjRef, Error> {
        let obj = self.allocate(size, tag)?;
        self.data().young_destructors.push(obj);
        Ok(obj)
    }

    /// Allocates a weak reference to `target`. The last word of the object is the weak slot; the
    /// host's `trace` must not report it.
    pub fn allocate_weakref(
        &mut self,
        size: usize,
        tag: u32,
        target: ObjRef,
    ) -> Result<ObjRef, Error> {
        assert!(
            round_size(size) >= HEADER_SIZE + 8,
            "a weak reference needs room for its slot"
        );
        self.push_root(target);
        let weakref = self.allocate(size, tag);
        let target = self.pop_root();
        let weakref = weakref?;
        let rt = self.rt();
        let mut data = self.data();
        let slot = weakref.addr() + round_size(size) - 8;
        data.write_u64(rt.shared_access(), slot, ObjRef::to_raw(target));
        data.young_weakrefs.push(weakref);
        Ok(weakref)
    }

    /// The target of `weakref`, or `None` once the target was collected.
    pub fn weakref_get(&mut self, weakref: ObjRef) -> Result<Option<ObjRef>, Error> {
        self.read(weakref)?;
        let rt = self.rt();
        let mut data = self.data();
        let bytes = data.read_object(&*rt.host, rt.shared_access(), weakref);
        Ok(ObjRef::from_raw(read_u64_at(&bytes, bytes.len() - 8)))
    }

    /// Makes the transaction inevitable, waiting for another inevitable transaction to finish if
    /// needed. An inevitable transaction never aborts; rolling one back is a fatal error.
    pub fn become_inevitable(&mut self, reason: &str) -> Result<(), Error> {
        let (rt, seg) = (self.rt(), self.seg);
        rt.become_inevitable(seg, self.pause(), reason, true)?;
        Ok(())
    }

    /// Like [`become_inevitable`](RwTx::become_inevitable), but aborts with
    /// [`AbortReason::Inevitable`] instead of waiting.
    pub fn try_become_inevitable(&mut self, reason: &str) -> Result<(), Error> {
        let (rt, seg) = (self.rt(), self.seg);
        rt.become_inevitable(seg, self.pause(), reason, false)?;
        Ok(())
    }

    #[inline]
    pub fn is_inevitable(&self) -> bool {
        self.rt().inevitable_owner.load(std::sync::atomic::Ordering::Acquire) == self.seg
    }

    /// A safe point: lets a pending major collection run, and reports an abort requested by
    /// another thread.
    #[inline]
    pub fn check(&mut self) -> Result<(), Error> {
        let (rt, seg) = (self.rt(), self.seg);
        rt.safe_point(seg, self.pause())?;
        Self::live(&self.data())
    }

    /// Runs a minor collection, and with `level > 0` a major collection after it.
    pub fn collect(&mut self, level: u32) -> Result<(), Error> {
        self.check()?;
        let rt = self.rt();
        {
            let mut data = self.data();
            Self::live(&data)?;
            rt.minor_collection(&mut data, rt.shared_access());
        }
        if level > 0 {
            rt.request_major_collection();
            self.check()?;
        }
        Ok(())
    }

    /// The address `obj` keeps for the rest of its life, usable as an identity hash.
    pub fn identity(&mut self, obj: ObjRef) -> ObjRef {
        let rt = self.rt();
        rt.identity(&mut self.data(), obj)
    }

    /// Whether the next minor collection moves `obj`.
    pub fn can_move(&self, obj: ObjRef) -> bool {
        self.rt().can_move(&self.data(), obj)
    }

    /// Sets the source location reported with timing events.
    pub fn set_marker(&mut self, marker: Option<Marker>) {
        self.data().marker = marker
    }

    #[inline]
    pub fn push_root(&mut self, obj: ObjRef) {
        self.key.push_root(obj)
    }

    #[inline]
    pub fn pop_root(&mut self) -> Option<ObjRef> {
        self.key.pop_root()
    }

    #[inline]
    pub fn peek_root(&self) -> Option<ObjRef> {
        self.key.peek_root()
    }

    pub fn thread_local(&self) -> Option<ObjRef> {
        self.key.thread.roots.lock().thread_local
    }

    pub fn set_thread_local(&mut self, obj: Option<ObjRef>) {
        self.key.thread.roots.lock().thread_local = obj
    }

    /// Commits the transaction. On error nothing it did is visible, and the caller should retry.
    pub fn commit(mut self) -> Result<(), Error> {
        let (rt, seg) = (self.rt(), self.seg);
        let result = rt.commit(seg, self.pause());
        self.finish(result);
        result.map_err(Error::from)
    }

    /// Aborts the transaction.
    pub fn abort(mut self) {
        self.finish(Err(AbortReason::Manual))
    }

    pub(crate) fn rollback(mut self, reason: AbortReason) {
        self.finish(Err(reason))
    }

    fn finish(&mut self, outcome: Result<(), AbortReason>) {
        let rt = self.rt();
        {
            let mut data = self.data();
            if let Err(reason) = outcome {
                rt.abort_data_structures(&mut data, rt.shared_access(), reason);
            }
            rt.end_transaction(&mut data);
        }
        self.pause = None;
        rt.pool.release(self.seg);
        self.key.in_tx.set(false);
    }
}
