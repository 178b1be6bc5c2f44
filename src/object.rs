//! Managed object references and the object header.
//!
//! Every object starts with an 8 byte header: a little endian `u32` of engine flags followed by a
//! little endian `u32` type tag owned by the host. The host's payload starts at
//! [`HEADER_SIZE`]. References stored inside objects are little endian `u64` addresses, `0` being
//! the null reference.

use core::{
    fmt::{self, Debug, Formatter},
    num::NonZeroU64,
};

/// All objects are aligned to, and sized in multiples of, this many bytes.
pub const OBJECT_ALIGN: usize = 16;

/// Size of the engine's object header.
pub const HEADER_SIZE: usize = 8;

/// Smallest object size.
pub const MIN_OBJECT_SIZE: usize = 16;

/// A reference to a managed object.
///
/// This is a stable integer address in the runtime's logical address space, the same in every
/// segment. Objects in a nursery move when a minor collection evacuates them, after which the old
/// reference must not be used; references on the shadow stack are updated by the collector.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjRef(NonZeroU64);

impl Debug for ObjRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "ObjRef({:#x})", self.0.get())
    }
}

impl ObjRef {
    #[inline]
    pub(crate) fn from_addr(addr: usize) -> Option<Self> {
        debug_assert_eq!(addr % OBJECT_ALIGN, 0, "misaligned object address");
        NonZeroU64::new(addr as u64).map(ObjRef)
    }

    /// The object at `addr`, which the allocator handed out and therefore is never null.
    #[inline]
    pub(crate) fn at(addr: usize) -> Self {
        match Self::from_addr(addr) {
            Some(obj) => obj,
            None => crate::error::fatal(crate::error::FatalError::Invariant(
                "object at the null address",
            )),
        }
    }

    #[inline]
    pub fn addr(self) -> usize {
        self.0.get() as usize
    }

    /// Encoding of a nullable reference as stored in object memory.
    #[inline]
    pub fn to_raw(obj: Option<ObjRef>) -> u64 {
        obj.map_or(0, |o| o.0.get())
    }

    /// Decodes a reference as stored in object memory.
    #[inline]
    pub fn from_raw(raw: u64) -> Option<ObjRef> {
        NonZeroU64::new(raw).map(ObjRef)
    }
}

/// Rounds a requested object size up to the allocation granularity.
#[inline]
pub(crate) fn round_size(size: usize) -> usize {
    let size = size.max(MIN_OBJECT_SIZE);
    (size + OBJECT_ALIGN - 1) & !(OBJECT_ALIGN - 1)
}

pub(crate) mod flags {
    /// Committed old object: the first write in a transaction must take the slow path.
    pub const WRITE_BARRIER: u32 = 0x01;
    /// Young object with an old location reserved for it by `identity`.
    pub const HAS_SHADOW: u32 = 0x02;
    /// The object was backed up by the current transaction.
    pub const WB_EXECUTED: u32 = 0x04;
    /// Some cards of the object were backed up by the current transaction.
    pub const CARDS_SET: u32 = 0x08;

    pub const OVERFLOW_NUMBER_BIT0: u32 = 0x100;
    pub const OVERFLOW_MASK: u32 = !(OVERFLOW_NUMBER_BIT0 - 1);

    /// A nursery object that was evacuated; the new address follows the header.
    pub const FORWARDED: u32 = u32::MAX;
}

#[inline]
pub(crate) fn header_flags(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

#[inline]
pub(crate) fn header_tag(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]])
}

#[inline]
pub(crate) fn read_u64_at(bytes: &[u8], offset: usize) -> u64 {
    let mut raw = [0; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

#[inline]
pub(crate) fn write_u64_at(bytes: &mut [u8], offset: usize, value: u64) {
    bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rounding() {
        assert_eq!(round_size(0), 16);
        assert_eq!(round_size(9), 16);
        assert_eq!(round_size(17), 32);
        assert_eq!(round_size(4096), 4096);
    }

    #[test]
    fn raw_refs() {
        let obj = ObjRef::from_addr(0x1230).unwrap();
        assert_eq!(ObjRef::from_raw(ObjRef::to_raw(Some(obj))), Some(obj));
        assert_eq!(ObjRef::from_raw(0), None);
        assert_eq!(ObjRef::to_raw(None), 0);
        assert_eq!(format!("{:?}", obj), "ObjRef(0x1230)");
    }

    #[test]
    fn overflow_bits_do_not_overlap_flags() {
        use flags::*;
        let all = WRITE_BARRIER | HAS_SHADOW | WB_EXECUTED | CARDS_SET;
        assert_eq!(all & OVERFLOW_MASK, 0);
        assert_eq!(OVERFLOW_NUMBER_BIT0 & OVERFLOW_MASK, OVERFLOW_NUMBER_BIT0);
    }
}
