use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use crossbeam_epoch::Guard;

use crate::{
    key::fingerprint,
    nodes::{bits, pack_slot, unpack_slot, Header, Node, NodePtr, NodeType, OpaqueNodePtr, Prefix},
    pool::{PmPool, PoolObject},
    Result,
};

/// Number of slices in a [`FingerprintBucket`].
pub const FINGERPRINT_BUCKET_CAPACITY: usize = 64;

/// A bucket of key slices, each leading to a child.
///
/// A bucket at level `L` with slice length `m` routes a key by the bytes
/// `key[L..L + m]`. Each occupied slot packs the fingerprint of its slice next
/// to the offset of a separately allocated buffer holding the slice bytes.
/// Siblings never hold equal slices, and a fingerprint hit is always checked
/// against the slice bytes.
#[repr(C, align(64))]
pub struct FingerprintBucket {
    /// The common node fields. The prefix is unused.
    pub header: Header,
    bitmap: AtomicU64,
    slice_len: AtomicU64,
    slices: [AtomicU64; FINGERPRINT_BUCKET_CAPACITY],
    children: [AtomicU64; FINGERPRINT_BUCKET_CAPACITY],
}

// SAFETY: `FingerprintBucket` is `repr(C)`, made only of atomics and arrays of
// atomics, and has an alignment of 64.
unsafe impl PoolObject for FingerprintBucket {}

impl Node for FingerprintBucket {
    const TYPE: NodeType = NodeType::FingerprintBucket;
}

impl fmt::Debug for FingerprintBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FingerprintBucket")
            .field("header", &self.header)
            .field("slice_len", &self.slice_len())
            .field("bitmap", &format_args!("{:#066b}", self.bitmap()))
            .finish()
    }
}

/// An occupied slot of a [`FingerprintBucket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slice<'a> {
    /// Index of the slot.
    pub slot: usize,
    /// The key bytes this slot routes on.
    pub bytes: &'a [u8],
    /// Where keys with these bytes continue.
    pub child: OpaqueNodePtr,
}

impl FingerprintBucket {
    /// Allocate an empty bucket at `level` routing on slices of `slice_len`
    /// bytes.
    pub fn allocate(
        pool: &PmPool,
        generation: u64,
        level: usize,
        slice_len: usize,
    ) -> Result<NodePtr<Self>> {
        debug_assert!(slice_len > 0);
        let ptr = NodePtr::<Self>::allocate(pool)?;
        let bucket = ptr.read(pool);
        bucket
            .header
            .init(Self::TYPE, level, Prefix::empty(), generation);
        bucket.slice_len.store(slice_len as u64, Ordering::Relaxed);
        Ok(ptr)
    }

    fn bitmap(&self) -> u64 {
        self.bitmap.load(Ordering::Acquire)
    }

    /// Number of key bytes each slice consumes.
    pub fn slice_len(&self) -> usize {
        self.slice_len.load(Ordering::Relaxed) as usize
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.bitmap().count_ones() as usize
    }

    /// Return true if no slot is occupied.
    pub fn is_empty(&self) -> bool {
        self.bitmap() == 0
    }

    /// Return true if every slot is occupied.
    pub fn is_full(&self) -> bool {
        self.bitmap() == u64::MAX
    }

    /// The occupied slot at `slot`.
    pub fn get<'a>(&self, pool: &'a PmPool, _guard: &'a Guard, slot: usize) -> Option<Slice<'a>> {
        let (_, buffer) = unpack_slot(self.slices[slot].load(Ordering::Acquire))?;
        let child = OpaqueNodePtr::from_raw(self.children[slot].load(Ordering::Acquire))?;
        // SAFETY: Slice buffers are immutable once published and `_guard` keeps
        // this one from being freed while the slice is alive.
        let bytes = unsafe { pool.bytes(buffer, self.slice_len()) };
        Some(Slice { slot, bytes, child })
    }

    /// Find the slot routing `slice`.
    pub fn find<'a>(&self, pool: &'a PmPool, guard: &'a Guard, slice: &[u8]) -> Option<Slice<'a>> {
        if slice.len() != self.slice_len() {
            return None;
        }
        let wanted = fingerprint(slice);
        bits(self.bitmap()).find_map(|slot| {
            let (fingerprint, _) = unpack_slot(self.slices[slot].load(Ordering::Acquire))?;
            if fingerprint != wanted {
                return None;
            }
            self.get(pool, guard, slot)
                .filter(|found| found.bytes == slice)
        })
    }

    /// Every occupied slot, ordered by slice bytes.
    pub fn sorted<'a>(&self, pool: &'a PmPool, guard: &'a Guard) -> Vec<Slice<'a>> {
        let mut slices: Vec<_> = bits(self.bitmap())
            .filter_map(|slot| self.get(pool, guard, slot))
            .collect();
        slices.sort_unstable_by(|a, b| a.bytes.cmp(b.bytes));
        slices
    }

    /// Offset of the buffer holding the bytes of `slot`.
    pub fn buffer(&self, slot: usize) -> Option<u64> {
        unpack_slot(self.slices[slot].load(Ordering::Acquire)).map(|(_, buffer)| buffer)
    }

    /// Offsets of every slice buffer referenced by a slot, including slots
    /// whose child was never written.
    pub fn buffers(&self) -> impl Iterator<Item = u64> + '_ {
        self.slices
            .iter()
            .filter_map(|slice| unpack_slot(slice.load(Ordering::Acquire)))
            .map(|(_, buffer)| buffer)
    }

    /// Copy `slice` into a new buffer and route it to `child`. Returns `false`
    /// if the bucket is full.
    pub fn insert(&self, pool: &PmPool, slice: &[u8], child: OpaqueNodePtr) -> Result<bool> {
        debug_assert_eq!(slice.len(), self.slice_len());
        let free = !self.bitmap();
        if free == 0 {
            return Ok(false);
        }
        let slot = free.trailing_zeros() as usize;

        let buffer = pool.allocate(slice.len())?;
        // SAFETY: The buffer was just allocated and is not published.
        unsafe { pool.write_bytes(buffer, slice) };
        pool.flush(buffer, slice.len());

        self.children[slot].store(child.to_raw(), Ordering::Release);
        pool.persist(&self.children[slot]);
        self.slices[slot].store(pack_slot(fingerprint(slice), buffer), Ordering::Release);
        pool.persist(&self.slices[slot]);
        self.bitmap.fetch_or(1 << slot, Ordering::AcqRel);
        pool.persist(&self.bitmap);
        Ok(true)
    }

    /// Route an occupied slot to a new child.
    pub fn change_child_at(&self, pool: &PmPool, slot: usize, child: OpaqueNodePtr) {
        self.children[slot].store(child.to_raw(), Ordering::Release);
        pool.persist(&self.children[slot]);
    }

    /// Clear `slot`, returning its child and the offset of its slice buffer.
    /// The buffer must be retired by the caller.
    pub fn remove_at(&self, pool: &PmPool, slot: usize) -> Option<(OpaqueNodePtr, u64)> {
        let (_, buffer) = unpack_slot(self.slices[slot].swap(0, Ordering::AcqRel))?;
        pool.persist(&self.slices[slot]);
        let child = OpaqueNodePtr::from_raw(self.children[slot].swap(0, Ordering::AcqRel));
        pool.persist(&self.children[slot]);
        self.bitmap.fetch_and(!(1 << slot), Ordering::AcqRel);
        pool.persist(&self.bitmap);
        Some((child?, buffer))
    }

    /// Rebuild the bitmap after a crash. A slot is live only if both its slice
    /// and its child were written, half written slots are cleared.
    pub fn reload(&self, pool: &PmPool) -> u32 {
        let mut bitmap = 0u64;
        for slot in 0..FINGERPRINT_BUCKET_CAPACITY {
            let slice = self.slices[slot].load(Ordering::Relaxed);
            let child = self.children[slot].load(Ordering::Relaxed);
            let live = unpack_slot(slice).is_some() && OpaqueNodePtr::from_raw(child).is_some();
            if live {
                bitmap |= 1 << slot;
            } else if slice != 0 || child != 0 {
                self.slices[slot].store(0, Ordering::Relaxed);
                self.children[slot].store(0, Ordering::Relaxed);
                pool.persist(&self.slices[slot]);
                pool.persist(&self.children[slot]);
            }
        }

        let previous = self.bitmap.swap(bitmap, Ordering::AcqRel);
        if previous != bitmap {
            pool.persist(&self.bitmap);
        }
        (previous ^ bitmap).count_ones()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{nodes::LeafBucket, LeafLayout};

    fn child(pool: &PmPool) -> OpaqueNodePtr {
        LeafBucket::allocate(pool, 1, 5).unwrap().to_opaque()
    }

    #[test]
    fn find_verifies_slice_bytes() {
        let pool = PmPool::anonymous(1 << 20, LeafLayout::Bucketed).unwrap();
        let guard = crossbeam_epoch::pin();
        let bucket = FingerprintBucket::allocate(&pool, 1, 2, 3).unwrap();
        let bucket = bucket.read(&pool);

        let first = child(&pool);
        let second = child(&pool);
        assert!(bucket.insert(&pool, b"abc", first).unwrap());
        assert!(bucket.insert(&pool, b"abd", second).unwrap());

        let found = bucket.find(&pool, &guard, b"abd").unwrap();
        assert_eq!(found.child, second);
        assert_eq!(found.bytes, b"abd");
        assert!(bucket.find(&pool, &guard, b"abe").is_none());
        assert!(bucket.find(&pool, &guard, b"ab").is_none());

        // [0, 131] and [1, 0] hash to the same fingerprint
        assert_eq!(fingerprint(&[0, 131]), fingerprint(&[1, 0]));
        let bucket = FingerprintBucket::allocate(&pool, 1, 0, 2).unwrap();
        let bucket = bucket.read(&pool);
        assert!(bucket.insert(&pool, &[0, 131], first).unwrap());
        assert!(bucket.find(&pool, &guard, &[1, 0]).is_none());
        assert!(bucket.insert(&pool, &[1, 0], second).unwrap());
        assert_eq!(bucket.find(&pool, &guard, &[1, 0]).unwrap().child, second);
        assert_eq!(bucket.find(&pool, &guard, &[0, 131]).unwrap().child, first);
    }

    #[test]
    fn sorted_orders_by_bytes() {
        let pool = PmPool::anonymous(1 << 20, LeafLayout::Bucketed).unwrap();
        let guard = crossbeam_epoch::pin();
        let bucket = FingerprintBucket::allocate(&pool, 1, 0, 2).unwrap();
        let bucket = bucket.read(&pool);

        for slice in [b"zz", b"aa", b"mm"] {
            let node = child(&pool);
            bucket.insert(&pool, slice, node).unwrap();
        }

        let order: Vec<_> = bucket
            .sorted(&pool, &guard)
            .into_iter()
            .map(|slice| slice.bytes)
            .collect();
        assert_eq!(order, vec![&b"aa"[..], b"mm", b"zz"]);
    }

    #[test]
    fn remove_returns_buffer() {
        let pool = PmPool::anonymous(1 << 20, LeafLayout::Bucketed).unwrap();
        let guard = crossbeam_epoch::pin();
        let bucket = FingerprintBucket::allocate(&pool, 1, 0, 4).unwrap();
        let bucket = bucket.read(&pool);
        let node = child(&pool);
        bucket.insert(&pool, b"wxyz", node).unwrap();

        let buffer = bucket.buffer(0).unwrap();
        assert_eq!(bucket.remove_at(&pool, 0), Some((node, buffer)));
        assert!(bucket.is_empty());
        assert!(bucket.find(&pool, &guard, b"wxyz").is_none());
        assert_eq!(bucket.remove_at(&pool, 0), None);
    }

    #[test]
    fn reload_clears_half_written_slots() {
        let pool = PmPool::anonymous(1 << 20, LeafLayout::Bucketed).unwrap();
        let bucket = FingerprintBucket::allocate(&pool, 1, 0, 1).unwrap();
        let bucket = bucket.read(&pool);
        let node = child(&pool);
        bucket.insert(&pool, b"a", node).unwrap();

        // Child written but the slice never published
        bucket.children[3].store(node.to_raw(), Ordering::Relaxed);

        assert_eq!(bucket.reload(&pool), 0);
        assert_eq!(bucket.children[3].load(Ordering::Relaxed), 0);
        assert_eq!(bucket.len(), 1);
    }
}
