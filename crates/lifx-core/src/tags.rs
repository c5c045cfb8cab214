//! Gateway-local tag ids and 64-bit tag masks.
//!
//! A tag is a bit position (0..64) in a gateway's tag mask. The same label can
//! map to different ids on different gateways.

use serde::Serialize;
use std::fmt;

use crate::{DomainError, DomainResult};

/// Number of tag slots each gateway offers.
pub const MAX_TAGS: usize = 64;

/// De Bruijn multiplier used to map an isolated bit to its index.
const DEBRUIJN_MULTIPLIER: u64 = 0x03f7_9d71_b4cb_0a89;

/// Bit index lookup table for `DEBRUIJN_MULTIPLIER`.
const DEBRUIJN_SEQUENCE: [u8; 64] = [
    0, 47, 1, 56, 48, 27, 2, 60, //
    57, 49, 41, 37, 28, 16, 3, 61, //
    54, 58, 35, 52, 50, 42, 21, 44, //
    38, 32, 29, 23, 17, 11, 4, 62, //
    46, 55, 26, 59, 40, 36, 15, 53, //
    34, 51, 20, 43, 31, 22, 10, 45, //
    25, 39, 14, 33, 19, 30, 9, 24, //
    13, 18, 8, 12, 7, 6, 5, 63, //
];

// ============================================================================
// Tag Id
// ============================================================================

/// A tag slot on one gateway, always in `0..64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TagId(u8);

impl TagId {
    /// Creates a tag id, rejecting values outside of `0..64`.
    pub fn new(id: u32) -> DomainResult<Self> {
        if id as usize >= MAX_TAGS {
            return Err(DomainError::InvalidTagId(id));
        }
        Ok(Self(id as u8))
    }

    /// Returns the id as a slot index.
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Returns the single-bit mask for this id.
    pub fn value(self) -> TagMask {
        TagMask(1u64 << self.0)
    }
}

impl fmt::Display for TagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Tag Mask
// ============================================================================

/// A set of tag ids packed into 64 bits, as transmitted on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(transparent)]
pub struct TagMask(u64);

impl TagMask {
    /// The empty mask.
    pub const EMPTY: TagMask = TagMask(0);

    /// Creates a mask from its raw bits.
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Returns the raw bits.
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Returns true if no bit is set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns true if `id` is set.
    pub fn contains(self, id: TagId) -> bool {
        self.0 & id.value().0 != 0
    }

    /// Returns true if all 64 slots are set.
    pub fn is_full(self) -> bool {
        self.0 == u64::MAX
    }

    /// Number of set bits.
    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Returns a copy with `id` set.
    #[must_use]
    pub fn with(self, id: TagId) -> Self {
        Self(self.0 | id.value().0)
    }

    /// Returns a copy with `id` cleared.
    #[must_use]
    pub fn without(self, id: TagId) -> Self {
        Self(self.0 & !id.value().0)
    }

    /// Lowest set bit, found in constant time with a De Bruijn multiply.
    pub fn lowest_set(self) -> Option<TagId> {
        if self.0 == 0 {
            return None;
        }
        // Keeps the lowest set bit and every bit below it.
        let smeared = self.0 ^ (self.0 - 1);
        let slot = (smeared.wrapping_mul(DEBRUIJN_MULTIPLIER) >> 58) as usize;
        DEBRUIJN_SEQUENCE.get(slot).map(|&id| TagId(id))
    }

    /// Lowest unset bit, `None` when every slot is taken.
    pub fn lowest_unset(self) -> Option<TagId> {
        TagMask(!self.0).lowest_set()
    }

    /// Iterates over the set ids in increasing order.
    pub fn iter(self) -> TagIter {
        TagIter(self.0)
    }
}

impl std::ops::Not for TagMask {
    type Output = TagMask;

    fn not(self) -> TagMask {
        TagMask(!self.0)
    }
}

impl std::ops::BitAnd for TagMask {
    type Output = TagMask;

    fn bitand(self, rhs: TagMask) -> TagMask {
        TagMask(self.0 & rhs.0)
    }
}

impl std::ops::BitOr for TagMask {
    type Output = TagMask;

    fn bitor(self, rhs: TagMask) -> TagMask {
        TagMask(self.0 | rhs.0)
    }
}

impl fmt::Display for TagMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<TagId> for TagMask {
    fn from(id: TagId) -> Self {
        id.value()
    }
}

/// Iterator over the ids set in a `TagMask`.
pub struct TagIter(u64);

impl Iterator for TagIter {
    type Item = TagId;

    fn next(&mut self) -> Option<TagId> {
        let id = TagMask(self.0).lowest_set()?;
        self.0 &= self.0 - 1;
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_id_bounds() {
        assert!(TagId::new(0).is_ok());
        assert!(TagId::new(63).is_ok());
        assert_eq!(TagId::new(64), Err(DomainError::InvalidTagId(64)));
    }

    #[test]
    fn test_lowest_set_matches_trailing_zeros() {
        for bit in 0..64 {
            let mask = TagMask::from_bits(1u64 << bit);
            assert_eq!(mask.lowest_set().unwrap().index(), bit);

            let noisy = TagMask::from_bits(u64::MAX << bit);
            assert_eq!(noisy.lowest_set().unwrap().index(), bit);
        }
        assert_eq!(TagMask::EMPTY.lowest_set(), None);
    }

    #[test]
    fn test_lowest_unset() {
        assert_eq!(TagMask::EMPTY.lowest_unset().unwrap().index(), 0);
        assert_eq!(TagMask::from_bits(0b0111).lowest_unset().unwrap().index(), 3);
        assert_eq!(
            TagMask::from_bits(u64::MAX >> 1).lowest_unset().unwrap().index(),
            63
        );
        assert_eq!(TagMask::from_bits(u64::MAX).lowest_unset(), None);
    }

    #[test]
    fn test_iter_and_ops() {
        let mask = TagMask::from_bits((1 << 42) | (1 << 3) | 1);
        let ids: Vec<usize> = mask.iter().map(TagId::index).collect();
        assert_eq!(ids, vec![0, 3, 42]);

        let id = TagId::new(42).unwrap();
        assert!(mask.contains(id));
        assert!(!mask.without(id).contains(id));
        assert_eq!(mask.without(id).with(id), mask);
        assert_eq!(mask.count(), 3);
        assert_eq!(TagMask::from_bits(u64::MAX).iter().count(), 64);
    }
}
