//! Ordering of general finalizers.
//!
//! An unreachable object with a finalizer keeps alive everything it references, and an object is
//! only finalized if no other unreachable finalizable object can reach it. Each object is in one of
//! four states, derived from the `marked` and `ordering` sets:
//!
//! | state | marked | ordering | meaning                                        |
//! |-------|--------|----------|------------------------------------------------|
//! | 0     | no     | no       | unreachable, not visited yet                   |
//! | 1     | no     | yes      | reached while scanning from a finalizer        |
//! | 2     | yes    | yes      | kept alive by the finalizer being processed    |
//! | 3     | yes    | no       | alive                                          |

use super::major::{Collector, View};
use crate::object::ObjRef;
use fxhash::FxHashSet;
use std::mem;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum State {
    Unreached,
    Reached,
    Pending,
    Alive,
}

struct Ordering<'c, 'a> {
    gc:       &'c mut Collector<'a>,
    ordering: FxHashSet<ObjRef>,
}

impl Ordering<'_, '_> {
    fn state(&self, obj: ObjRef) -> State {
        match (self.gc.marked.contains(&obj), self.ordering.contains(&obj)) {
            (false, false) => State::Unreached,
            (false, true) => State::Reached,
            (true, true) => State::Pending,
            (true, false) => State::Alive,
        }
    }

    /// Marks everything in state 1 reachable from `obj`, moving it to state 2.
    fn bump_1_to_2(&mut self, obj: ObjRef) {
        let mut pending = vec![obj];
        while let Some(y) = pending.pop() {
            if self.state(y) == State::Reached {
                let _ = self.gc.marked.insert(y);
                pending.extend(self.gc.children(y, View::Shared));
            }
        }
    }

    fn bump_2_to_3(&mut self, obj: ObjRef) {
        let mut pending = vec![obj];
        while let Some(y) = pending.pop() {
            if self.state(y) == State::Pending {
                let _ = self.ordering.remove(&y);
                pending.extend(self.gc.children(y, View::Shared));
            }
        }
    }

    /// Visits everything reachable from the unreachable finalizable object `x`.
    fn scan(&mut self, x: ObjRef) {
        let mut pending = vec![x];
        while let Some(y) = pending.pop() {
            match self.state(y) {
                State::Unreached => {
                    let _ = self.ordering.insert(y);
                    pending.extend(self.gc.children(y, View::Shared));
                }
                State::Pending => self.bump_2_to_3(y),
                State::Reached | State::Alive => {}
            }
        }
        self.bump_1_to_2(x);
    }
}

impl Collector<'_> {
    /// Moves unreachable finalizable objects whose finalizer may run to `run_finalizers`, keeping
    /// them and everything they reference alive.
    pub(super) fn finalizers(&mut self) {
        let rt = self.rt;
        let candidates = mem::take(&mut rt.gc.lock().objects_with_finalizers);
        if candidates.is_empty() {
            return;
        }

        let mut keep = Vec::with_capacity(candidates.len());
        let mut unreachable = Vec::new();
        let mut order = Ordering {
            gc:       self,
            ordering: FxHashSet::default(),
        };
        for x in candidates {
            if order.gc.marked.contains(&x) {
                keep.push(x);
                continue;
            }
            debug_assert_ne!(order.state(x), State::Reached, "finalizer in state 1");
            unreachable.push(x);
            order.scan(x);
        }

        let mut ready = Vec::new();
        for x in unreachable {
            match order.state(x) {
                State::Pending => {
                    ready.push(x);
                    order.bump_2_to_3(x);
                }
                State::Alive => keep.push(x),
                state => unreachable!("finalizable object left in {:?}", state),
            }
        }
        debug_assert!(order.ordering.is_empty(), "ordering set not drained");

        let mut gc = rt.gc.lock();
        gc.objects_with_finalizers.extend(keep);
        gc.run_finalizers.extend(ready);
    }
}
