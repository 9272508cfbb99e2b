//! A tagged offset is a pool offset (concretely the distance in bytes from the
//! start of the persistent pool) with additional data folded into it, such as
//! the type of the node it refers to.
//!
//! Every object handed out by the pool is aligned to a cache line, so the
//! lowest bits of any valid offset are always zero. Those bits are used to
//! carry the data. Offsets are used instead of native pointers because the base
//! address of the mapping changes from one process to the next, while the
//! offsets stored inside the pool must stay meaningful across restarts.

use std::{fmt, num::NonZeroU64};

/// The alignment that every pool allocation is guaranteed to have.
pub const OFFSET_ALIGNMENT: u64 = 64;

/// A non-zero pool offset which carries several bits of metadata.
///
/// The zero offset is reserved for the pool superblock, so it can never refer
/// to a node and is used as the "null" value inside the persisted atomics.
#[repr(transparent)]
pub struct TaggedOffset<const NUM_BITS: u32>(NonZeroU64);

impl<const NUM_BITS: u32> TaggedOffset<NUM_BITS> {
    /// A mask for data-carrying bits of the offset.
    pub const DATA_MASK: u64 = !Self::OFFSET_MASK;
    /// A mask for the non-data-carrying bits of the offset.
    pub const OFFSET_MASK: u64 = {
        assert!(
            (1 << NUM_BITS) <= OFFSET_ALIGNMENT,
            "need the pool alignment to have sufficient bits"
        );

        u64::MAX << NUM_BITS
    };

    /// Create a new tagged offset from a possibly zero offset.
    ///
    /// If the offset is zero, returns `None`.
    ///
    /// # PANICS
    ///  - Panics if the given `offset` is not aligned to [`OFFSET_ALIGNMENT`].
    pub fn new(offset: u64) -> Option<Self> {
        let offset = NonZeroU64::new(offset)?;

        assert_eq!(
            offset.get() % OFFSET_ALIGNMENT,
            0,
            "this offset was not aligned"
        );

        Some(TaggedOffset(offset))
    }

    /// Create a new tagged offset and immediately set data on it.
    ///
    /// Returns `None` if the given offset is zero.
    ///
    /// # PANICS
    ///  - Panics if the given `offset` is not aligned to [`OFFSET_ALIGNMENT`].
    pub fn new_with_data(offset: u64, data: u64) -> Option<Self> {
        let mut tagged = TaggedOffset::new(offset)?;
        tagged.set_data(data);
        Some(tagged)
    }

    /// Reconstruct a tagged offset from the raw word stored in the pool.
    ///
    /// Returns `None` for the zero word.
    pub fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(TaggedOffset)
    }

    /// Return the raw word that should be written into the pool.
    pub fn to_raw(self) -> u64 {
        self.0.get()
    }

    /// Produce the offset without the data bits.
    pub fn to_offset(self) -> u64 {
        self.0.get() & Self::OFFSET_MASK
    }

    /// Produce the data this tagged offset carries.
    pub fn to_data(self) -> u64 {
        self.0.get() & Self::DATA_MASK
    }

    /// Update the data this tagged offset carries to a new value.
    ///
    /// # PANICS
    ///  - Panics if any bits other than the lowest `NUM_BITS` are non-zero in
    ///    the new `data` value.
    pub fn set_data(&mut self, data: u64) {
        assert_eq!(
            data & Self::OFFSET_MASK,
            0,
            "cannot set more data beyond the lowest NUM_BITS"
        );

        let raw = (self.0.get() & Self::OFFSET_MASK) | data;

        // The offset part is non-zero and aligned, so the combination can never
        // be zero.
        self.0 = NonZeroU64::new(raw).unwrap_or(self.0);
    }
}

impl<const NUM_BITS: u32> std::hash::Hash for TaggedOffset<NUM_BITS> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl<const NUM_BITS: u32> Ord for TaggedOffset<NUM_BITS> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl<const NUM_BITS: u32> PartialOrd for TaggedOffset<NUM_BITS> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<const NUM_BITS: u32> Eq for TaggedOffset<NUM_BITS> {}

impl<const NUM_BITS: u32> PartialEq for TaggedOffset<NUM_BITS> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<const NUM_BITS: u32> Clone for TaggedOffset<NUM_BITS> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<const NUM_BITS: u32> Copy for TaggedOffset<NUM_BITS> {}

impl<const NUM_BITS: u32> fmt::Debug for TaggedOffset<NUM_BITS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaggedOffset")
            .field("offset", &format_args!("{:#x}", self.to_offset()))
            .field("data", &self.to_data())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successful_tag() {
        let mut tagged = TaggedOffset::<3>::new_with_data(4096, 0b101).unwrap();

        assert_eq!(tagged.to_offset(), 4096);
        assert_eq!(tagged.to_data(), 0b101);

        tagged.set_data(0b010);

        assert_eq!(tagged.to_offset(), 4096);
        assert_eq!(tagged.to_data(), 0b010);
    }

    #[test]
    fn zero_offset_is_none() {
        assert!(TaggedOffset::<3>::new(0).is_none());
        assert!(TaggedOffset::<3>::from_raw(0).is_none());
    }

    #[test]
    fn raw_round_trip_keeps_data() {
        let tagged = TaggedOffset::<3>::new_with_data(64 * 1234, 0b110).unwrap();
        let raw = tagged.to_raw();

        let restored = TaggedOffset::<3>::from_raw(raw).unwrap();
        assert_eq!(restored, tagged);
        assert_eq!(restored.to_offset(), 64 * 1234);
        assert_eq!(restored.to_data(), 0b110);
    }

    #[test]
    #[should_panic]
    fn unaligned_offset() {
        let _ = TaggedOffset::<3>::new(4100);
    }

    #[test]
    #[should_panic]
    fn set_data_beyond_capacity() {
        let mut p = TaggedOffset::<3>::new(4096).unwrap();

        p.set_data(0b1111);
    }

    #[test]
    fn set_data_different_widths() {
        let mut p1 = TaggedOffset::<1>::new(128).unwrap();
        let mut p6 = TaggedOffset::<6>::new(128).unwrap();

        p1.set_data(1);
        p6.set_data(0b111111);

        assert_eq!(p1.to_data(), 1);
        assert_eq!(p6.to_data(), 0b111111);
        assert_eq!(p1.to_offset(), 128);
        assert_eq!(p6.to_offset(), 128);
    }
}
