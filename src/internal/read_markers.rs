//! Per segment read markers: one byte per 16 bytes of address space.
//!
//! An object is in the read set of the running transaction iff the marker at its address equals the
//! segment's read version. The markers that follow an object's own marker double as its card
//! states.

use crate::object::OBJECT_ALIGN;
use fxhash::FxHashMap;

const CHUNK: usize = 4096;

pub const CARD_CLEAR: u8 = 0;
pub const CARD_MARKED: u8 = 1;

/// The first read version. Smaller values are card states.
pub const FIRST_READ_VERSION: u8 = 2;

#[derive(Default)]
pub struct ReadMarkers {
    chunks: FxHashMap<usize, Box<[u8; CHUNK]>>,
}

impl std::fmt::Debug for ReadMarkers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad("ReadMarkers { .. }")
    }
}

#[inline]
fn index(addr: usize) -> (usize, usize) {
    let i = addr / OBJECT_ALIGN;
    (i / CHUNK, i % CHUNK)
}

impl ReadMarkers {
    #[inline]
    pub fn get(&self, addr: usize) -> u8 {
        let (chunk, off) = index(addr);
        self.chunks.get(&chunk).map_or(0, |c| c[off])
    }

    #[inline]
    pub fn set(&mut self, addr: usize, value: u8) {
        let (chunk, off) = index(addr);
        if value == 0 {
            if let Some(c) = self.chunks.get_mut(&chunk) {
                c[off] = 0;
            }
        } else {
            self.chunks
                .entry(chunk)
                .or_insert_with(|| Box::new([0; CHUNK]))[off] = value;
        }
    }

    /// Card state `card` (1 based) of the object at `addr`.
    #[inline]
    pub fn card(&self, addr: usize, card: usize) -> u8 {
        self.get(addr + card * OBJECT_ALIGN)
    }

    #[inline]
    pub fn set_card(&mut self, addr: usize, card: usize, value: u8) {
        self.set(addr + card * OBJECT_ALIGN, value)
    }

    /// Clears the markers of `[addr, addr + size)`: the object's read marker and all of its cards.
    pub fn reset_range(&mut self, addr: usize, size: usize) {
        let mut a = addr;
        while a < addr + size {
            self.set(a, 0);
            a += OBJECT_ALIGN;
        }
    }

    pub fn clear(&mut self) {
        self.chunks.clear()
    }
}
