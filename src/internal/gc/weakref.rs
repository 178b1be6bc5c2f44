use super::major::{Collector, View};
use crate::{
    internal::commit_log::SharedAccess,
    object::{read_u64_at, ObjRef},
};
use std::mem;

impl Collector<'_> {
    /// Forgets dead weak references and clears the ones whose target died.
    pub(super) fn weakrefs(&mut self) {
        for s in 0..self.segments.len() {
            let list = mem::take(&mut self.segments[s].old_weakrefs);
            let mut alive = Vec::with_capacity(list.len());
            for weakref in list {
                if !self.marked.contains(&weakref) {
                    continue;
                }
                alive.push(weakref);
                let view = self.view_of(weakref, View::Segment(s));
                let bytes = self.read_object(weakref, view);
                let slot = bytes.len() - 8;
                match ObjRef::from_raw(read_u64_at(&bytes, slot)) {
                    Some(target) if !self.marked.contains(&target) => {
                        self.clear_slot(weakref.addr() + slot, view)
                    }
                    _ => {}
                }
            }
            self.segments[s].old_weakrefs = alive;
        }
    }

    fn clear_slot(&mut self, addr: usize, view: View) {
        let zero = [0; 8];
        match view {
            View::Shared => {
                for data in self.segments.iter_mut() {
                    data.import(addr, &zero);
                    data.undo.overwrite(addr, &zero)
                }
                self.shared.write_existing(addr, &zero);
            }
            View::Segment(s) => {
                let shared = &*self.shared;
                self.segments[s].write(SharedAccess::Held(shared), addr, &zero)
            }
        }
    }
}
