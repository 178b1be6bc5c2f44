//! The interface between the engine and the host runtime that owns the object layouts.

use crate::{
    object::{header_tag, read_u64_at, ObjRef, HEADER_SIZE},
    rw::RwTx,
    tx::Error,
};
use core::fmt::{self, Debug, Formatter};

/// What the engine knows about an object before it knows the object's size: the type tag and the
/// first payload word.
///
/// Hosts with variable sized objects are expected to keep the length in the first payload word.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ObjectHeader {
    pub tag:  u32,
    pub word: u64,
}

impl ObjectHeader {
    #[inline]
    pub(crate) fn from_bytes(bytes: &[u8]) -> Self {
        ObjectHeader {
            tag:  header_tag(bytes),
            word: read_u64_at(bytes, HEADER_SIZE),
        }
    }
}

/// A read only copy of an object's bytes, header included, as seen by one segment (or as
/// committed).
#[derive(Copy, Clone)]
pub struct ObjectView<'a> {
    obj:   ObjRef,
    bytes: &'a [u8],
}

impl Debug for ObjectView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectView")
            .field("obj", &self.obj)
            .field("tag", &self.tag())
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl<'a> ObjectView<'a> {
    #[inline]
    pub(crate) fn new(obj: ObjRef, bytes: &'a [u8]) -> Self {
        ObjectView { obj, bytes }
    }

    #[inline]
    pub fn obj(&self) -> ObjRef {
        self.obj
    }

    #[inline]
    pub fn tag(&self) -> u32 {
        header_tag(self.bytes)
    }

    #[inline]
    pub fn header(&self) -> ObjectHeader {
        ObjectHeader::from_bytes(self.bytes)
    }

    /// Size of the object in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// All bytes of the object, header included.
    #[inline]
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    #[inline]
    pub fn read_u64(&self, offset: usize) -> u64 {
        read_u64_at(self.bytes, offset)
    }

    #[inline]
    pub fn read_ref(&self, offset: usize) -> Option<ObjRef> {
        ObjRef::from_raw(self.read_u64(offset))
    }
}

/// Describes the array part of an object that supports card marking: items of `item_size` bytes
/// starting at `base_offset` and running to the end of the object.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CardLayout {
    pub base_offset: usize,
    pub item_size:   usize,
}

/// An opaque source location supplied by the host and handed back with timing events.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Marker {
    pub location: u64,
    pub object:   Option<ObjRef>,
}

/// Points in the life of a transaction or a collection reported to [`Host::timing_event`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TimingEvent {
    TransactionStart,
    TransactionCommit,
    TransactionAbort,
    BecomeInevitable,
    WaitFreeSegment,
    WaitInevitable,
    WaitDone,
    MinorGcStart,
    MinorGcDone,
    MajorGcStart,
    MajorGcDone,
}

/// Callbacks the engine needs from its host.
///
/// # Contract
///
/// * `size_of` must agree with the size the object was allocated with.
/// * `trace` reports the offset of every reference field. For weak references the last word, the
///   weak slot, must not be reported.
/// * `destructor` runs in the middle of a collection and must not touch the heap other than through
///   the given view.
pub trait Host: Send + Sync + 'static {
    /// Size in bytes of the object, header included.
    fn size_of(&self, header: ObjectHeader) -> usize;

    /// Calls `visit` with the byte offset of every reference field of the object.
    fn trace(&self, obj: ObjectView<'_>, visit: &mut dyn FnMut(usize));

    /// Returns the array layout of objects that may use card marking.
    fn card_layout(&self, _header: ObjectHeader) -> Option<CardLayout> {
        None
    }

    /// Like `trace`, but only for references stored in items `start..stop` of a card marked object.
    fn trace_cards(
        &self,
        obj: ObjectView<'_>,
        start: usize,
        stop: usize,
        visit: &mut dyn FnMut(usize),
    ) {
        match self.card_layout(obj.header()) {
            Some(layout) => {
                let lo = layout.base_offset + start * layout.item_size;
                let hi = layout.base_offset + stop * layout.item_size;
                self.trace(obj, &mut |offset| {
                    if offset >= lo && offset < hi {
                        visit(offset)
                    }
                })
            }
            None => self.trace(obj, visit),
        }
    }

    /// Light finalizer, run by the collector when an object allocated with
    /// `allocate_with_destructor` dies.
    fn destructor(&self, _obj: ObjectView<'_>) {}

    /// General finalizer, run in its own transaction after the object was found unreachable.
    fn finalizer(&self, _tx: &mut RwTx<'_>, _obj: ObjRef) -> Result<(), Error> {
        Ok(())
    }

    /// Profiling hook.
    fn timing_event(&self, _segment: usize, _event: TimingEvent, _marker: Option<Marker>) {}
}
