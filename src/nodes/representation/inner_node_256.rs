use std::{
    fmt,
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
};

use crate::{
    nodes::{Header, InnerNode, InnerNode48, Node, NodeType, OpaqueNodePtr},
    pool::{PmPool, PoolObject},
};

/// Node that references up to 256 children, one slot per key fragment
#[repr(C, align(64))]
pub struct InnerNode256 {
    /// The common node fields.
    pub header: Header,
    count: AtomicU32,
    children: [AtomicU64; 256],
}

// SAFETY: `InnerNode256` is `repr(C)`, made only of atomics and arrays of
// atomics, and has an alignment of 64.
unsafe impl PoolObject for InnerNode256 {}

impl Node for InnerNode256 {
    const TYPE: NodeType = NodeType::Node256;
}

impl fmt::Debug for InnerNode256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InnerNode256")
            .field("header", &self.header)
            .field("count", &self.count)
            .field("children", &self.children())
            .finish()
    }
}

impl InnerNode for InnerNode256 {
    type GrownNode = InnerNode256;
    type ShrunkNode = InnerNode48;

    fn header(&self) -> &Header {
        &self.header
    }

    fn lookup_child(&self, key_fragment: u8) -> Option<OpaqueNodePtr> {
        OpaqueNodePtr::from_raw(self.children[usize::from(key_fragment)].load(Ordering::Acquire))
    }

    fn write_child(
        &self,
        pool: &PmPool,
        key_fragment: u8,
        child: OpaqueNodePtr,
        flush: bool,
    ) -> bool {
        let slot = &self.children[usize::from(key_fragment)];
        let previous = slot.swap(child.to_raw(), Ordering::AcqRel);
        if flush {
            pool.persist(slot);
        }
        if previous == 0 {
            self.count.fetch_add(1, Ordering::Relaxed);
        }
        true
    }

    fn change_child(&self, pool: &PmPool, key_fragment: u8, child: OpaqueNodePtr) -> bool {
        if self.lookup_child(key_fragment).is_none() {
            return false;
        }
        self.write_child(pool, key_fragment, child, true)
    }

    fn remove_child(&self, pool: &PmPool, key_fragment: u8) -> Option<OpaqueNodePtr> {
        let slot = &self.children[usize::from(key_fragment)];
        let child = OpaqueNodePtr::from_raw(slot.swap(0, Ordering::AcqRel))?;
        pool.persist(slot);
        self.count.fetch_sub(1, Ordering::Relaxed);
        Some(child)
    }

    fn num_children(&self) -> usize {
        self.count.load(Ordering::Relaxed) as usize
    }

    fn children(&self) -> Vec<(u8, OpaqueNodePtr)> {
        (0..=u8::MAX)
            .filter_map(|key_fragment| Some((key_fragment, self.lookup_child(key_fragment)?)))
            .collect()
    }

    fn recount(&self, _pool: &PmPool) {
        let live = self
            .children
            .iter()
            .filter(|child| child.load(Ordering::Relaxed) != 0)
            .count();
        self.count.store(live as u32, Ordering::Relaxed);
    }

    fn is_full(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        nodes::{LeafNode, Prefix},
        LeafLayout,
    };

    fn child(n: u64) -> OpaqueNodePtr {
        OpaqueNodePtr::new::<LeafNode>(4096 + 64 * n).unwrap()
    }

    #[test]
    fn every_fragment_has_a_slot() {
        let pool = PmPool::anonymous(1 << 20, LeafLayout::Bucketed).unwrap();
        let node = InnerNode256::allocate(&pool, 1, 0, Prefix::empty()).unwrap();
        let node = node.read(&pool);

        for key in 0..=u8::MAX {
            assert!(node.write_child(&pool, key, child(u64::from(key)), false));
        }
        assert_eq!(node.num_children(), 256);
        assert!(!node.is_full());

        assert!(node.change_child(&pool, 200, child(1000)));
        assert_eq!(node.num_children(), 256);
        assert_eq!(node.lookup_child(200), Some(child(1000)));

        assert_eq!(node.remove_child(&pool, 0), Some(child(0)));
        assert!(!node.change_child(&pool, 0, child(1)));
        assert_eq!(node.num_children(), 255);
        assert!(!node.should_shrink());
    }

    #[test]
    fn shrink_threshold() {
        let pool = PmPool::anonymous(1 << 20, LeafLayout::Bucketed).unwrap();
        let node = InnerNode256::allocate(&pool, 1, 0, Prefix::empty()).unwrap();
        let node = node.read(&pool);

        for key in 0..38u8 {
            node.write_child(&pool, key, child(u64::from(key)), true);
        }
        assert!(!node.should_shrink());
        node.remove_child(&pool, 0);
        assert!(node.should_shrink());
    }
}
