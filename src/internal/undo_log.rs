//! The undo log of the running transaction: a backup of every byte range of a committed object
//! that the transaction may have changed.

use crate::{
    object::ObjRef,
    vm::page_chunks,
};
use fxhash::FxHashSet;

/// The original bytes of `[obj + offset, obj + offset + backup.len())`. Never crosses a page.
pub struct UndoSlice {
    pub obj:    ObjRef,
    pub offset: usize,
    pub backup: Box<[u8]>,
}

#[derive(Default)]
pub struct UndoLog {
    slices:  Vec<UndoSlice>,
    objects: FxHashSet<ObjRef>,
}

impl std::fmt::Debug for UndoLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UndoLog")
            .field("slices", &self.slices.len())
            .field("objects", &self.objects.len())
            .finish()
    }
}

impl UndoLog {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slices.len()
    }

    /// Whether the transaction backed up any part of `obj`.
    #[inline]
    pub fn contains(&self, obj: ObjRef) -> bool {
        self.objects.contains(&obj)
    }

    pub fn objects(&self) -> impl Iterator<Item = ObjRef> + '_ {
        self.objects.iter().copied()
    }

    pub fn slices(&self) -> &[UndoSlice] {
        &self.slices
    }

    /// Records the original contents `bytes` of `obj` starting at `offset`, one slice per page.
    pub fn push(&mut self, obj: ObjRef, offset: usize, bytes: &[u8]) {
        let _ = self.objects.insert(obj);
        let start = obj.addr() + offset;
        let mut done = 0;
        for (addr, len) in page_chunks(start, bytes.len()) {
            self.slices.push(UndoSlice {
                obj,
                offset: addr - obj.addr(),
                backup: bytes[done..done + len].into(),
            });
            done += len;
        }
    }

    /// Marks `obj` as modified without recording bytes.
    pub fn touch(&mut self, obj: ObjRef) {
        let _ = self.objects.insert(obj);
    }

    pub fn drain(&mut self) -> impl Iterator<Item = UndoSlice> + '_ {
        self.objects.clear();
        self.slices.drain(..)
    }

    pub fn clear(&mut self) {
        self.slices.clear();
        self.objects.clear();
    }

    /// Replaces the backed up bytes of `[addr, addr + bytes.len())` wherever a slice covers them,
    /// so that a rollback restores `bytes` there.
    pub fn overwrite(&mut self, addr: usize, bytes: &[u8]) {
        let end = addr + bytes.len();
        for slice in &mut self.slices {
            let start = slice.obj.addr() + slice.offset;
            let lo = start.max(addr);
            let hi = (start + slice.backup.len()).min(end);
            if lo < hi {
                slice.backup[lo - start..hi - start].copy_from_slice(&bytes[lo - addr..hi - addr])
            }
        }
    }
}
