//! The major collector: a stop-the-world mark and sweep over the old generation, run while holding
//! the write side of the pause lock.

mod finalizer;
mod major;
mod weakref;

use crate::object::ObjRef;
use std::collections::VecDeque;

/// Collector state shared by all segments.
#[derive(Default, Debug)]
pub struct GcState {
    /// Committed objects whose finalizer has not run yet.
    pub objects_with_finalizers: Vec<ObjRef>,
    /// Unreachable objects waiting for their finalizer, in the order they were found.
    pub run_finalizers:          VecDeque<ObjRef>,
    /// Objects installed with `allocate_preexisting`. Always alive.
    pub prebuilt:                Vec<ObjRef>,
    /// Completed major collections.
    pub collections:             u64,
}
