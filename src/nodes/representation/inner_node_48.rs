use std::{
    fmt,
    sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering},
};

use crate::{
    nodes::{Header, InnerNode, InnerNode16, InnerNode256, Node, NodeType, OpaqueNodePtr},
    pool::{PmPool, PoolObject},
};

/// Number of child slots of an [`InnerNode48`].
const NODE48_CAPACITY: usize = 48;

/// A slot index stored in the key index of an [`InnerNode48`].
///
/// The pool hands out zeroed memory, so zero is the empty marker and slot `i`
/// is stored as `i + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct SlotIndex(u8);

impl SlotIndex {
    /// The index value of a key fragment without a child.
    pub const EMPTY: Self = SlotIndex(0);

    /// Encode the index of a child slot.
    pub fn new(slot: usize) -> Self {
        debug_assert!(slot < NODE48_CAPACITY);
        SlotIndex(slot as u8 + 1)
    }

    /// Return true if the given index is the empty marker.
    pub fn is_empty(self) -> bool {
        self == Self::EMPTY
    }

    /// The child slot this index refers to.
    pub fn slot(self) -> Option<usize> {
        let slot = usize::from(self.0).checked_sub(1)?;
        (slot < NODE48_CAPACITY).then_some(slot)
    }
}

/// Node that references up to 48 children
#[repr(C, align(64))]
pub struct InnerNode48 {
    /// The common node fields.
    pub header: Header,
    count: AtomicU32,
    /// Maps a key fragment to a [`SlotIndex`] into `children`
    child_indices: [AtomicU8; 256],
    children: [AtomicU64; NODE48_CAPACITY],
}

// SAFETY: `InnerNode48` is `repr(C)`, made only of atomics and arrays of
// atomics, and has an alignment of 64.
unsafe impl PoolObject for InnerNode48 {}

impl Node for InnerNode48 {
    const TYPE: NodeType = NodeType::Node48;
}

impl fmt::Debug for InnerNode48 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InnerNode48")
            .field("header", &self.header)
            .field("count", &self.count)
            .field("children", &self.children())
            .finish()
    }
}

impl InnerNode48 {
    fn index_of(&self, key_fragment: u8) -> SlotIndex {
        SlotIndex(self.child_indices[usize::from(key_fragment)].load(Ordering::Acquire))
    }
}

impl InnerNode for InnerNode48 {
    type GrownNode = InnerNode256;
    type ShrunkNode = InnerNode16;

    fn header(&self) -> &Header {
        &self.header
    }

    fn lookup_child(&self, key_fragment: u8) -> Option<OpaqueNodePtr> {
        let slot = self.index_of(key_fragment).slot()?;
        OpaqueNodePtr::from_raw(self.children[slot].load(Ordering::Acquire))
    }

    fn write_child(
        &self,
        pool: &PmPool,
        key_fragment: u8,
        child: OpaqueNodePtr,
        flush: bool,
    ) -> bool {
        if self.change_child(pool, key_fragment, child) {
            return true;
        }

        let Some(slot) = self
            .children
            .iter()
            .position(|child| child.load(Ordering::Relaxed) == 0)
        else {
            return false;
        };

        // The child goes in first so that readers following the index never
        // see an empty slot
        self.children[slot].store(child.to_raw(), Ordering::Release);
        if flush {
            pool.persist(&self.children[slot]);
        }
        let index = &self.child_indices[usize::from(key_fragment)];
        index.store(SlotIndex::new(slot).0, Ordering::Release);
        if flush {
            pool.persist(index);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn change_child(&self, pool: &PmPool, key_fragment: u8, child: OpaqueNodePtr) -> bool {
        let Some(slot) = self.index_of(key_fragment).slot() else {
            return false;
        };
        self.children[slot].store(child.to_raw(), Ordering::Release);
        pool.persist(&self.children[slot]);
        true
    }

    fn remove_child(&self, pool: &PmPool, key_fragment: u8) -> Option<OpaqueNodePtr> {
        let slot = self.index_of(key_fragment).slot()?;

        let index = &self.child_indices[usize::from(key_fragment)];
        index.store(SlotIndex::EMPTY.0, Ordering::Release);
        pool.persist(index);

        let child = OpaqueNodePtr::from_raw(self.children[slot].swap(0, Ordering::AcqRel));
        pool.persist(&self.children[slot]);
        self.count.fetch_sub(1, Ordering::Relaxed);
        child
    }

    fn num_children(&self) -> usize {
        self.count.load(Ordering::Relaxed) as usize
    }

    fn children(&self) -> Vec<(u8, OpaqueNodePtr)> {
        (0..=u8::MAX)
            .filter_map(|key_fragment| Some((key_fragment, self.lookup_child(key_fragment)?)))
            .collect()
    }

    /// Drops child slots that no key fragment points to. Those are left
    /// behind when a crash hits between writing a child and its index.
    fn recount(&self, pool: &PmPool) {
        let mut referenced = [false; NODE48_CAPACITY];
        for index in &self.child_indices {
            let index = SlotIndex(index.load(Ordering::Relaxed));
            if let Some(slot) = index.slot() {
                referenced[slot] = true;
            } else if !index.is_empty() {
                index_reset(pool, self, index);
            }
        }

        for (slot, child) in self.children.iter().enumerate() {
            if !referenced[slot] && child.load(Ordering::Relaxed) != 0 {
                child.store(0, Ordering::Relaxed);
                pool.persist(child);
            }
        }

        let live = self.children().len();
        self.count.store(live as u32, Ordering::Relaxed);
    }

    fn is_full(&self) -> bool {
        self.num_children() >= NODE48_CAPACITY
    }
}

/// Clear every index entry holding the out of range `index`.
fn index_reset(pool: &PmPool, node: &InnerNode48, index: SlotIndex) {
    for entry in &node.child_indices {
        if entry.load(Ordering::Relaxed) == index.0 {
            entry.store(SlotIndex::EMPTY.0, Ordering::Relaxed);
            pool.persist(entry);
        }
    }
}
