use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use crossbeam_epoch::Guard;

use crate::{
    key::fingerprint,
    nodes::{Header, LeafNode, Node, NodePtr, NodeType, Prefix},
    pool::{PmPool, PoolObject, MAX_POOL_CAPACITY},
    Result,
};

/// Number of leaf slots in a [`LeafBucket`].
pub const LEAF_BUCKET_CAPACITY: usize = 64;

const FINGERPRINT_SHIFT: u32 = MAX_POOL_CAPACITY.trailing_zeros();
const OFFSET_MASK: u64 = MAX_POOL_CAPACITY - 1;

/// Pack a fingerprint and an offset below [`MAX_POOL_CAPACITY`] into one word.
pub(crate) const fn pack_slot(fingerprint: u16, offset: u64) -> u64 {
    ((fingerprint as u64) << FINGERPRINT_SHIFT) | (offset & OFFSET_MASK)
}

/// Split a slot word into its fingerprint and offset. An empty slot returns
/// `None`.
pub(crate) const fn unpack_slot(word: u64) -> Option<(u16, u64)> {
    let offset = word & OFFSET_MASK;
    if offset == 0 {
        None
    } else {
        Some(((word >> FINGERPRINT_SHIFT) as u16, offset))
    }
}

/// Iterate over the set bits of a bitmap, lowest first.
pub(crate) fn bits(mut bitmap: u64) -> impl Iterator<Item = usize> {
    std::iter::from_fn(move || {
        if bitmap == 0 {
            return None;
        }
        let bit = bitmap.trailing_zeros() as usize;
        bitmap &= bitmap - 1;
        Some(bit)
    })
}

/// Terminal container for the leaves that share a path in the tree.
///
/// Every occupied slot holds the fingerprint of the full key next to the leaf
/// offset. The leaves of a bucket are not sorted.
#[repr(C, align(64))]
pub struct LeafBucket {
    /// The common node fields. The level is the depth at which the bucket
    /// hangs, the prefix is unused.
    pub header: Header,
    bitmap: AtomicU64,
    slots: [AtomicU64; LEAF_BUCKET_CAPACITY],
}

// SAFETY: `LeafBucket` is `repr(C)`, made only of atomics and arrays of
// atomics, and has an alignment of 64.
unsafe impl PoolObject for LeafBucket {}

impl Node for LeafBucket {
    const TYPE: NodeType = NodeType::LeafBucket;
}

impl fmt::Debug for LeafBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeafBucket")
            .field("header", &self.header)
            .field("bitmap", &format_args!("{:#066b}", self.bitmap()))
            .finish()
    }
}

impl LeafBucket {
    /// Allocate an empty bucket at depth `level`.
    pub fn allocate(pool: &PmPool, generation: u64, level: usize) -> Result<NodePtr<Self>> {
        let ptr = NodePtr::<Self>::allocate(pool)?;
        ptr.read(pool)
            .header
            .init(Self::TYPE, level, Prefix::empty(), generation);
        Ok(ptr)
    }

    fn bitmap(&self) -> u64 {
        self.bitmap.load(Ordering::Acquire)
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

    /// The fingerprint and leaf stored at `slot`.
    pub fn slot(&self, slot: usize) -> Option<(u16, NodePtr<LeafNode>)> {
        let (fingerprint, offset) = unpack_slot(self.slots[slot].load(Ordering::Acquire))?;
        Some((fingerprint, NodePtr::new(offset)))
    }

    /// All occupied slots with their leaves, in slot order.
    pub fn leaves(&self) -> impl Iterator<Item = (usize, NodePtr<LeafNode>)> + '_ {
        bits(self.bitmap()).filter_map(|slot| Some((slot, self.slot(slot)?.1)))
    }

    /// Find the slot holding `key`.
    pub fn find(
        &self,
        pool: &PmPool,
        guard: &Guard,
        key: &[u8],
    ) -> Option<(usize, NodePtr<LeafNode>)> {
        let wanted = fingerprint(key);
        bits(self.bitmap()).find_map(|slot| {
            let (fingerprint, leaf) = self.slot(slot)?;
            (fingerprint == wanted && leaf.key(pool, guard) == key).then_some((slot, leaf))
        })
    }

    /// Publish `leaf` in a free slot. Returns `false` if the bucket is full.
    ///
    /// The slot is durable before its bit is set, so that a reader following
    /// the bitmap never sees an empty slot.
    pub fn insert(&self, pool: &PmPool, fingerprint: u16, leaf: NodePtr<LeafNode>) -> bool {
        let free = !self.bitmap();
        if free == 0 {
            return false;
        }
        let slot = free.trailing_zeros() as usize;

        self.slots[slot].store(pack_slot(fingerprint, leaf.offset()), Ordering::Release);
        pool.persist(&self.slots[slot]);
        self.bitmap.fetch_or(1 << slot, Ordering::AcqRel);
        pool.persist(&self.bitmap);
        true
    }

    /// Point an occupied slot to a new leaf for the same key.
    pub fn replace_at(&self, pool: &PmPool, slot: usize, fingerprint: u16, leaf: NodePtr<LeafNode>) {
        self.slots[slot].store(pack_slot(fingerprint, leaf.offset()), Ordering::Release);
        pool.persist(&self.slots[slot]);
    }

    /// Clear `slot` and return the leaf it held.
    pub fn remove_at(&self, pool: &PmPool, slot: usize) -> Option<NodePtr<LeafNode>> {
        let (_, offset) = unpack_slot(self.slots[slot].swap(0, Ordering::AcqRel))?;
        pool.persist(&self.slots[slot]);
        self.bitmap.fetch_and(!(1 << slot), Ordering::AcqRel);
        pool.persist(&self.bitmap);
        Some(NodePtr::new(offset))
    }

    /// Rebuild the bitmap from the slots after a crash. Returns the number of
    /// bits that changed.
    pub fn reload(&self, pool: &PmPool) -> u32 {
        let bitmap = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| unpack_slot(slot.load(Ordering::Relaxed)).is_some())
            .fold(0u64, |bitmap, (slot, _)| bitmap | (1 << slot));

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
    use crate::LeafLayout;

    fn bucket(pool: &PmPool) -> &LeafBucket {
        LeafBucket::allocate(pool, 1, 3).unwrap().read(pool)
    }

    fn put(pool: &PmPool, bucket: &LeafBucket, key: &[u8]) -> NodePtr<LeafNode> {
        let leaf = NodePtr::<LeafNode>::create(pool, key, b"v").unwrap();
        assert!(bucket.insert(pool, fingerprint(key), leaf));
        leaf
    }

    #[test]
    fn slot_packing() {
        assert_eq!(unpack_slot(0), None);
        assert_eq!(unpack_slot(pack_slot(0xBEEF, 4096)), Some((0xBEEF, 4096)));
        assert_eq!(unpack_slot(pack_slot(7, 0)), None);
    }

    #[test]
    fn bits_iterates_in_order() {
        assert_eq!(bits(0).count(), 0);
        assert_eq!(bits(0b1010_0001).collect::<Vec<_>>(), vec![0, 5, 7]);
        assert_eq!(bits(u64::MAX).count(), 64);
    }

    #[test]
    fn insert_find_remove() {
        let pool = PmPool::anonymous(1 << 20, LeafLayout::Bucketed).unwrap();
        let guard = crossbeam_epoch::pin();
        let bucket = bucket(&pool);

        let apple = put(&pool, bucket, b"apple");
        put(&pool, bucket, b"app");
        assert_eq!(bucket.len(), 2);
        assert_eq!(bucket.header.level(), 3);

        assert_eq!(bucket.find(&pool, &guard, b"apple"), Some((0, apple)));
        assert_eq!(bucket.find(&pool, &guard, b"appl"), None);

        assert_eq!(bucket.remove_at(&pool, 0), Some(apple));
        assert_eq!(bucket.remove_at(&pool, 0), None);
        assert_eq!(bucket.find(&pool, &guard, b"apple"), None);
        assert_eq!(bucket.len(), 1);

        // The freed slot is handed out again
        put(&pool, bucket, b"apricot");
        assert_eq!(bucket.find(&pool, &guard, b"apricot").map(|(slot, _)| slot), Some(0));
    }

    #[test]
    fn full_bucket_rejects_insert() {
        let pool = PmPool::anonymous(1 << 20, LeafLayout::Bucketed).unwrap();
        let bucket = bucket(&pool);

        for n in 0..LEAF_BUCKET_CAPACITY {
            put(&pool, bucket, format!("key{n:04}").as_bytes());
        }
        assert!(bucket.is_full());

        let extra = NodePtr::<LeafNode>::create(&pool, b"extra", b"").unwrap();
        assert!(!bucket.insert(&pool, fingerprint(b"extra"), extra));
        assert_eq!(bucket.leaves().count(), LEAF_BUCKET_CAPACITY);
    }

    #[test]
    fn reload_matches_bitmap_to_slots() {
        let pool = PmPool::anonymous(1 << 20, LeafLayout::Bucketed).unwrap();
        let bucket = bucket(&pool);
        put(&pool, bucket, b"a");
        put(&pool, bucket, b"b");

        // Torn insert: slot written but the bit never set
        let leaf = NodePtr::<LeafNode>::create(&pool, b"c", b"").unwrap();
        bucket.slots[9].store(pack_slot(fingerprint(b"c"), leaf.offset()), Ordering::Relaxed);
        // Torn remove: slot cleared but the bit still set
        bucket.slots[1].store(0, Ordering::Relaxed);

        assert_eq!(bucket.reload(&pool), 2);
        assert_eq!(
            bucket.leaves().map(|(slot, _)| slot).collect::<Vec<_>>(),
            vec![0, 9]
        );
        assert_eq!(bucket.reload(&pool), 0);
    }
}
