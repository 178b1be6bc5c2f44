//! Read and write barriers, including card marking for large arrays.

use crate::{
    host::CardLayout,
    internal::{
        commit_log::SharedAccess,
        read_markers::{CARD_CLEAR, CARD_MARKED},
        segment::SegmentData,
        state::RuntimeState,
    },
    object::{flags::*, round_size, ObjRef, OBJECT_ALIGN},
    tx::AbortReason,
};
use std::sync::atomic::Ordering::Acquire;

/// The card marking geometry of one object.
#[derive(Copy, Clone, Debug)]
pub struct Cards {
    pub layout: CardLayout,
    pub size:   usize,
    pub items:  usize,
    pub count:  usize,
    per_card:   usize,
}

impl Cards {
    /// Card (1 based) covering item `index`.
    #[inline]
    pub fn card_of(&self, index: usize) -> usize {
        index / self.per_card + 1
    }

    /// Items covered by `card`.
    #[inline]
    pub fn items_of(&self, card: usize) -> (usize, usize) {
        let start = (card - 1) * self.per_card;
        (start, (start + self.per_card).min(self.items))
    }

    /// Byte range of `card` within the object.
    #[inline]
    pub fn bytes_of(&self, card: usize) -> (usize, usize) {
        let (start, stop) = self.items_of(card);
        (
            self.layout.base_offset + start * self.layout.item_size,
            self.layout.base_offset + stop * self.layout.item_size,
        )
    }
}

impl RuntimeState {
    /// Brings `data` up to date with the commit log if anything was committed since it last looked.
    #[inline]
    pub fn validate_if_behind(&self, data: &mut SegmentData) -> Result<(), AbortReason> {
        if self.head_rev.load(Acquire) != data.last_validated {
            let heap = self.shared.read();
            self.validate(data, &heap, AbortReason::ValidateInflight)?;
        }
        Ok(())
    }

    #[inline]
    pub fn read_barrier(&self, data: &mut SegmentData, obj: ObjRef) -> Result<(), AbortReason> {
        if let Some(reason) = data.aborted {
            return Err(reason);
        }
        if data.is_young(obj) {
            return Ok(());
        }
        self.validate_if_behind(data)?;
        data.mark_read(obj);
        Ok(())
    }

    #[inline]
    pub fn write_barrier(&self, data: &mut SegmentData, obj: ObjRef) -> Result<(), AbortReason> {
        if let Some(reason) = data.aborted {
            return Err(reason);
        }
        if data.is_young(obj) {
            return Ok(());
        }
        let flags = data.flags(self.shared_access(), obj);
        if likely!(flags & WRITE_BARRIER == 0) {
            Ok(())
        } else {
            self.write_slowpath(data, obj, flags)
        }
    }

    #[inline(never)]
    #[cold]
    fn write_slowpath(
        &self,
        data: &mut SegmentData,
        obj: ObjRef,
        flags: u32,
    ) -> Result<(), AbortReason> {
        let access = self.shared_access();
        if data.is_overflow_flags(flags) {
            data.set_flags(access, obj, flags & !(WRITE_BARRIER | CARDS_SET));
            data.objects_pointing_to_nursery.push(obj);
            return Ok(());
        }

        self.validate_if_behind(data)?;
        data.mark_read(obj);
        let flags = data.flags(access, obj);

        if flags & CARDS_SET != 0 {
            if let Some(cards) = self.cards(data, access, obj) {
                self.backup_unmarked_cards(data, obj, &cards);
                for card in 1..=cards.count {
                    data.markers.set_card(obj.addr(), card, CARD_CLEAR)
                }
            }
        } else if flags & WB_EXECUTED == 0 {
            let bytes = data.read_object(&*self.host, access, obj);
            data.undo.push(obj, 0, &bytes);
        }
        data.set_flags(
            access,
            obj,
            (flags & !(WRITE_BARRIER | CARDS_SET)) | WB_EXECUTED,
        );
        data.objects_pointing_to_nursery.push(obj);
        Ok(())
    }

    /// The card geometry of `obj`, if it is large enough and its host layout has an array part.
    pub fn cards(
        &self,
        data: &mut SegmentData,
        access: SharedAccess<'_>,
        obj: ObjRef,
    ) -> Option<Cards> {
        let header = data.header(access, obj);
        let layout = self.host.card_layout(header)?;
        let size = round_size(self.host.size_of(header));
        if size < self.config.min_card_object_size
            || layout.item_size == 0
            || layout.base_offset >= size
        {
            return None;
        }
        let per_card = self.config.card_size;
        let items = (size - layout.base_offset) / layout.item_size;
        let count = (items + per_card - 1) / per_card;
        // the card states live in the markers following the object's own marker
        if (count + 1) * OBJECT_ALIGN > size {
            return None;
        }
        Some(Cards {
            layout,
            size,
            items,
            count,
            per_card,
        })
    }

    fn backup_unmarked_cards(&self, data: &mut SegmentData, obj: ObjRef, cards: &Cards) {
        let access = self.shared_access();
        for card in 1..=cards.count {
            let state = data.markers.card(obj.addr(), card);
            if state == CARD_MARKED || state == data.read_version {
                continue;
            }
            let (lo, hi) = cards.bytes_of(card);
            let mut backup = vec![0; hi - lo];
            data.read(access, obj.addr() + lo, &mut backup);
            data.undo.push(obj, lo, &backup);
        }
    }

    /// Write barrier for item `index` of the array part of `obj`. Only the card holding the item is
    /// backed up.
    pub fn write_card(
        &self,
        data: &mut SegmentData,
        obj: ObjRef,
        index: usize,
    ) -> Result<(), AbortReason> {
        if let Some(reason) = data.aborted {
            return Err(reason);
        }
        if data.is_young(obj) {
            return Ok(());
        }
        let access = self.shared_access();
        let flags = data.flags(access, obj);
        if flags & WRITE_BARRIER == 0 {
            return Ok(());
        }
        let whole_object_done = flags & WB_EXECUTED != 0 && flags & CARDS_SET == 0;
        let cards = match self.cards(data, access, obj) {
            Some(cards) if !data.is_overflow_flags(flags) && !whole_object_done => cards,
            _ => return self.write_slowpath(data, obj, flags),
        };
        assert!(
            index < cards.items,
            "item {} out of range for an array of {} items",
            index,
            cards.items
        );

        self.validate_if_behind(data)?;
        data.mark_read(obj);
        let flags = data.flags(access, obj);
        if flags & CARDS_SET == 0 {
            let mut head = vec![0; cards.layout.base_offset];
            data.read(access, obj.addr(), &mut head);
            data.undo.push(obj, 0, &head);
            data.undo.touch(obj);
            data.set_flags(access, obj, flags | CARDS_SET | WB_EXECUTED);
            data.old_objects_with_cards_set.push(obj);
        }

        let card = cards.card_of(index);
        let state = data.markers.card(obj.addr(), card);
        if state == CARD_MARKED {
            return Ok(());
        }
        if state != data.read_version {
            let (lo, hi) = cards.bytes_of(card);
            let mut backup = vec![0; hi - lo];
            data.read(access, obj.addr() + lo, &mut backup);
            data.undo.push(obj, lo, &backup);
        }
        data.markers.set_card(obj.addr(), card, CARD_MARKED);
        Ok(())
    }

    /// Forgets the card states of every object with cards set, optionally clearing `CARDS_SET`.
    pub fn reset_cards(&self, data: &mut SegmentData, access: SharedAccess<'_>, clear_flags: bool) {
        for obj in std::mem::take(&mut data.old_objects_with_cards_set) {
            if let Some(cards) = self.cards(data, access, obj) {
                for card in 1..=cards.count {
                    data.markers.set_card(obj.addr(), card, CARD_CLEAR)
                }
            }
            if clear_flags {
                let flags = data.flags(access, obj);
                data.set_flags(access, obj, flags & !CARDS_SET);
            }
        }
    }
}
