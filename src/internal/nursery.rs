//! Young objects: bump allocation in the segment's nursery and the minor collection that moves the
//! survivors into the old generation.
//!
//! Survivors get the segment's current overflow number until they are published by a commit. Only
//! young objects move; old objects stay where they are for their whole life.

use crate::{
    host::{ObjectView, TimingEvent},
    internal::{
        commit_log::SharedAccess,
        read_markers::CARD_MARKED,
        segment::SegmentData,
        state::RuntimeState,
    },
    object::{flags::*, header_flags, read_u64_at, round_size, ObjRef, HEADER_SIZE, MIN_OBJECT_SIZE},
};
use std::mem;
use tracing::trace;

/// Objects moved by a minor collection whose fields still need fixing.
#[derive(Default)]
struct Scan {
    worklist:  Vec<ObjRef>,
    survivors: usize,
}

/// Where a young object went during a minor collection.
enum Fate {
    Moved(ObjRef),
    Dead,
    Old,
}

impl RuntimeState {
    /// Allocates a zeroed young object of `size` bytes with type `tag`. May run a minor
    /// collection, which moves every young object.
    pub fn allocate_young(&self, data: &mut SegmentData, size: usize, tag: u32) -> ObjRef {
        let size = round_size(size.max(MIN_OBJECT_SIZE));
        let access = self.shared_access();
        let mut header = [0; HEADER_SIZE];
        header[4..8].copy_from_slice(&tag.to_le_bytes());

        if size > self.config.large_object_size || size > data.nursery.len() {
            let addr = self.alloc_old(data, size);
            let mut bytes = vec![0; size];
            bytes[..HEADER_SIZE].copy_from_slice(&header);
            data.write(access, addr, &bytes);
            data.markers.reset_range(addr, size);
            let obj = ObjRef::at(addr);
            let _ = data.young_outside_nursery.insert(obj, size);
            return obj;
        }

        if data.nursery_used + size > data.nursery.len() {
            self.minor_collection(data, access);
        }
        let offset = data.nursery_used;
        data.nursery_used += size;
        data.nursery[offset..offset + HEADER_SIZE].copy_from_slice(&header);
        ObjRef::at(data.layout.nursery_start + offset)
    }

    /// The address `obj` will keep for the rest of its life. Young objects in the nursery get a
    /// reserved old slot that the next minor collection moves them into.
    pub fn identity(&self, data: &mut SegmentData, obj: ObjRef) -> ObjRef {
        if !data.in_nursery(obj) {
            return obj;
        }
        if let Some(&shadow) = data.shadows.get(&obj) {
            return shadow;
        }
        let access = self.shared_access();
        let size = data.object_size(&*self.host, access, obj);
        let addr = self.alloc_old(data, size);
        let shadow = ObjRef::at(addr);
        let _ = data.shadows.insert(obj, shadow);
        let flags = data.flags(access, obj);
        data.set_flags(access, obj, flags | HAS_SHADOW);
        shadow
    }

    /// Whether a minor collection may change the address of `obj`.
    #[inline]
    pub fn can_move(&self, data: &SegmentData, obj: ObjRef) -> bool {
        data.in_nursery(obj) && !data.shadows.contains_key(&obj)
    }

    /// Moves `obj` out of the nursery if it is young, returning its new location.
    fn evacuate(
        &self,
        data: &mut SegmentData,
        access: SharedAccess<'_>,
        obj: ObjRef,
        scan: &mut Scan,
    ) -> ObjRef {
        if data.in_nursery(obj) {
            if let Some(new) = data.forwarded(obj) {
                return new;
            }
            let size = data.object_size(&*self.host, access, obj);
            let addr = match data.shadows.remove(&obj) {
                Some(shadow) => shadow.addr(),
                None => self.alloc_old(data, size),
            };
            let offset = obj.addr() - data.layout.nursery_start;
            let mut bytes = data.nursery[offset..offset + size].to_vec();
            let flags = (header_flags(&bytes) & !HAS_SHADOW) | WRITE_BARRIER | data.overflow_number;
            bytes[..4].copy_from_slice(&flags.to_le_bytes());
            data.write(access, addr, &bytes);

            let nursery = &mut data.nursery[offset..offset + MIN_OBJECT_SIZE];
            nursery[..4].copy_from_slice(&FORWARDED.to_le_bytes());
            nursery[8..16].copy_from_slice(&(addr as u64).to_le_bytes());

            let new = ObjRef::at(addr);
            data.large_overflow_objects.push(new);
            scan.worklist.push(new);
            scan.survivors += size;
            new
        } else if let Some(size) = data.young_outside_nursery.remove(&obj) {
            let flags = data.flags(access, obj);
            data.set_flags(access, obj, flags | WRITE_BARRIER | data.overflow_number);
            data.large_overflow_objects.push(obj);
            scan.worklist.push(obj);
            scan.survivors += size;
            obj
        } else {
            obj
        }
    }

    /// Evacuates the young objects referenced by the fields of `obj` at `offsets`.
    fn fix_references(
        &self,
        data: &mut SegmentData,
        access: SharedAccess<'_>,
        obj: ObjRef,
        bytes: &[u8],
        offsets: &[usize],
        scan: &mut Scan,
    ) {
        for &offset in offsets {
            if let Some(child) = ObjRef::from_raw(read_u64_at(bytes, offset)) {
                if data.is_young(child) {
                    let new = self.evacuate(data, access, child, scan);
                    if new != child {
                        data.write_u64(access, obj.addr() + offset, new.addr() as u64);
                    }
                }
            }
        }
    }

    fn trace_and_fix(
        &self,
        data: &mut SegmentData,
        access: SharedAccess<'_>,
        obj: ObjRef,
        scan: &mut Scan,
    ) {
        let bytes = data.read_object(&*self.host, access, obj);
        let mut offsets = Vec::new();
        self.host
            .trace(ObjectView::new(obj, &bytes), &mut |offset| offsets.push(offset));
        self.fix_references(data, access, obj, &bytes, &offsets, scan);
    }

    fn fate(&self, data: &SegmentData, obj: ObjRef) -> Fate {
        if data.in_nursery(obj) {
            match data.forwarded(obj) {
                Some(new) => Fate::Moved(new),
                None => Fate::Dead,
            }
        } else if data.young_outside_nursery.contains_key(&obj) {
            Fate::Dead
        } else {
            Fate::Old
        }
    }

    /// Moves every reachable young object of `data` into the old generation and empties the
    /// nursery.
    pub fn minor_collection(&self, data: &mut SegmentData, access: SharedAccess<'_>) {
        let segment = data.index;
        self.timing(segment, TimingEvent::MinorGcStart, data.marker);
        let mut scan = Scan::default();

        // written cards of old arrays
        let with_cards = data.old_objects_with_cards_set.clone();
        for obj in with_cards {
            if data.flags(access, obj) & CARDS_SET == 0 {
                continue;
            }
            let cards = match self.cards(data, access, obj) {
                Some(cards) => cards,
                None => continue,
            };
            let bytes = data.read_object(&*self.host, access, obj);
            let mut offsets = Vec::new();
            for card in 1..=cards.count {
                if data.markers.card(obj.addr(), card) != CARD_MARKED {
                    continue;
                }
                let (start, stop) = cards.items_of(card);
                self.host.trace_cards(
                    ObjectView::new(obj, &bytes),
                    start,
                    stop,
                    &mut |offset| offsets.push(offset),
                );
                let traced = data.read_version;
                data.markers.set_card(obj.addr(), card, traced);
            }
            self.fix_references(data, access, obj, &bytes, &offsets, &mut scan);
        }

        // roots
        if let Some(thread) = data.thread.clone() {
            let mut roots = thread.roots.lock();
            roots.for_each_mut(|root| {
                if data.is_young(*root) {
                    *root = self.evacuate(data, access, *root, &mut scan)
                }
            });
        }
        for obj in mem::take(&mut data.young_finalizers) {
            let new = self.evacuate(data, access, obj, &mut scan);
            data.finalizers.push(new);
        }

        // old objects written by the transaction
        for obj in mem::take(&mut data.objects_pointing_to_nursery) {
            self.trace_and_fix(data, access, obj, &mut scan);
            let flags = data.flags(access, obj);
            data.set_flags(access, obj, flags | WRITE_BARRIER);
        }

        while let Some(obj) = scan.worklist.pop() {
            self.trace_and_fix(data, access, obj, &mut scan);
        }

        self.collect_young_weakrefs(data, access);

        for obj in mem::take(&mut data.young_destructors) {
            match self.fate(data, obj) {
                Fate::Moved(new) => data.old_destructors.push(new),
                Fate::Old => data.old_destructors.push(obj),
                Fate::Dead => {
                    let bytes = data.read_object(&*self.host, access, obj);
                    self.host.destructor(ObjectView::new(obj, &bytes));
                }
            }
        }

        for (obj, size) in mem::take(&mut data.young_outside_nursery) {
            data.markers.reset_range(obj.addr(), size);
            self.free_old(obj.addr());
        }
        for (_, shadow) in mem::take(&mut data.shadows) {
            self.free_old(shadow.addr());
        }
        let used = data.nursery_used;
        data.nursery[..used].iter_mut().for_each(|b| *b = 0);
        data.nursery_used = 0;

        data.stats.minor_collections();
        data.stats.minor_survivor_bytes(scan.survivors);
        trace!(target: "segstm::gc", segment, survivors = scan.survivors, "minor collection");
        self.timing(segment, TimingEvent::MinorGcDone, data.marker);
    }

    /// Weak references that survived keep their target if it survived too, and are cleared
    /// otherwise.
    fn collect_young_weakrefs(&self, data: &mut SegmentData, access: SharedAccess<'_>) {
        for weakref in mem::take(&mut data.young_weakrefs) {
            let weakref = match self.fate(data, weakref) {
                Fate::Moved(new) => new,
                Fate::Old => weakref,
                Fate::Dead => continue,
            };
            let size = data.object_size(&*self.host, access, weakref);
            let slot = weakref.addr() + size - 8;
            if let Some(target) = ObjRef::from_raw(data.read_u64(access, slot)) {
                let value = match self.fate(data, target) {
                    Fate::Moved(new) => new.addr() as u64,
                    Fate::Old => target.addr() as u64,
                    Fate::Dead => 0,
                };
                data.write_u64(access, slot, value);
            }
            data.old_weakrefs.push(weakref);
        }
    }
}
