//! Registered threads and their roots.

use crate::object::ObjRef;
use fxhash::FxHashMap;
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicUsize, Ordering::Relaxed},
    Arc,
};

pub const NO_SEGMENT: usize = usize::MAX;

/// A thread's shadow stack and thread local object.
#[derive(Default, Clone, Debug)]
pub struct Roots {
    pub shadow_stack: Vec<ObjRef>,
    pub thread_local: Option<ObjRef>,
}

impl Roots {
    pub fn for_each_mut(&mut self, mut f: impl FnMut(&mut ObjRef)) {
        self.shadow_stack.iter_mut().for_each(&mut f);
        if let Some(obj) = &mut self.thread_local {
            f(obj)
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = ObjRef> + '_ {
        self.shadow_stack
            .iter()
            .copied()
            .chain(self.thread_local.iter().copied())
    }
}

/// The part of a registered thread the collectors can see.
#[derive(Debug)]
pub struct ThreadState {
    pub id:           usize,
    pub roots:        Mutex<Roots>,
    /// Segment of the running transaction, or `NO_SEGMENT`.
    pub segment:      AtomicUsize,
    /// Segment used by the previous transaction, preferred by the next one.
    pub last_segment: AtomicUsize,
}

impl ThreadState {
    #[inline]
    pub fn segment(&self) -> Option<usize> {
        match self.segment.load(Relaxed) {
            NO_SEGMENT => None,
            seg => Some(seg),
        }
    }
}

#[derive(Default, Debug)]
pub struct ThreadList {
    next_id: usize,
    threads: FxHashMap<usize, Arc<ThreadState>>,
}

impl ThreadList {
    pub fn register(&mut self) -> Arc<ThreadState> {
        let id = self.next_id;
        self.next_id += 1;
        let thread = Arc::new(ThreadState {
            id,
            roots: Mutex::new(Roots::default()),
            segment: AtomicUsize::new(NO_SEGMENT),
            last_segment: AtomicUsize::new(NO_SEGMENT),
        });
        let _ = self.threads.insert(id, thread.clone());
        thread
    }

    pub fn unregister(&mut self, id: usize) -> Option<Arc<ThreadState>> {
        self.threads.remove(&id)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ThreadState>> + '_ {
        self.threads.values()
    }
}
