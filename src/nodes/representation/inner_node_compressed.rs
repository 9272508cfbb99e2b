use std::{
    fmt,
    sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering},
};

use paste::paste;

use crate::{
    nodes::{Header, InnerNode, InnerNode48, Node, NodeType, OpaqueNodePtr},
    pool::{PmPool, PoolObject},
};

/// Node with a small append-only array of `(key fragment, child)` pairs.
///
/// New children are written at `compact_count` and only become visible once
/// `compact_count` is bumped, so a torn insert leaves an ignored slot behind.
/// Removing a child clears the child word and leaves a dead slot that is
/// dropped when the node is rebuilt.
#[repr(C, align(64))]
pub struct InnerNodeCompressed<const SIZE: usize> {
    /// The common node fields.
    pub header: Header,
    /// Number of live children
    count: AtomicU32,
    /// Number of slots ever handed out
    compact_count: AtomicU32,
    keys: [AtomicU8; SIZE],
    children: [AtomicU64; SIZE],
}

// SAFETY: `InnerNodeCompressed` is `repr(C)`, made only of atomics and arrays
// of atomics, and has an alignment of 64.
unsafe impl<const SIZE: usize> PoolObject for InnerNodeCompressed<SIZE> {}

macro_rules! compressed_node_types {
    ($($size:literal),*) => {
        paste! {
            $(
                #[doc = "Node that references up to " $size " children"]
                pub type [<InnerNode $size>] = InnerNodeCompressed<$size>;

                impl Node for [<InnerNode $size>] {
                    const TYPE: NodeType = NodeType::[<Node $size>];
                }
            )*
        }
    };
}

compressed_node_types!(4, 16);

impl<const SIZE: usize> fmt::Debug for InnerNodeCompressed<SIZE> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InnerNodeCompressed")
            .field("SIZE", &SIZE)
            .field("header", &self.header)
            .field("count", &self.count)
            .field("compact_count", &self.compact_count)
            .field(
                "children",
                &self
                    .live_slots()
                    .map(|(_, key, child)| (key, child))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl<const SIZE: usize> InnerNodeCompressed<SIZE> {
    fn compact_count(&self) -> usize {
        (self.compact_count.load(Ordering::Acquire) as usize).min(SIZE)
    }

    fn live_slots(&self) -> impl Iterator<Item = (usize, u8, OpaqueNodePtr)> + '_ {
        (0..self.compact_count()).filter_map(|slot| {
            let child = OpaqueNodePtr::from_raw(self.children[slot].load(Ordering::Acquire))?;
            Some((slot, self.keys[slot].load(Ordering::Relaxed), child))
        })
    }

    fn find_slot(&self, key_fragment: u8) -> Option<usize> {
        self.live_slots()
            .find(|(_, key, _)| *key == key_fragment)
            .map(|(slot, _, _)| slot)
    }
}

macro_rules! impl_compressed_inner_node {
    ($size:literal, $grown:ty, $shrunk:ty) => {
        impl InnerNode for InnerNodeCompressed<$size> {
            type GrownNode = $grown;
            type ShrunkNode = $shrunk;

            fn header(&self) -> &Header {
                &self.header
            }

            fn lookup_child(&self, key_fragment: u8) -> Option<OpaqueNodePtr> {
                self.live_slots()
                    .find(|(_, key, _)| *key == key_fragment)
                    .map(|(_, _, child)| child)
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

                let slot = self.compact_count();
                if slot == $size {
                    return false;
                }

                self.keys[slot].store(key_fragment, Ordering::Relaxed);
                self.children[slot].store(child.to_raw(), Ordering::Release);
                if flush {
                    pool.persist(&self.keys[slot]);
                    pool.persist(&self.children[slot]);
                }
                self.compact_count
                    .store(slot as u32 + 1, Ordering::Release);
                if flush {
                    pool.persist(&self.compact_count);
                }
                self.count.fetch_add(1, Ordering::Relaxed);
                true
            }

            fn change_child(&self, pool: &PmPool, key_fragment: u8, child: OpaqueNodePtr) -> bool {
                let Some(slot) = self.find_slot(key_fragment) else {
                    return false;
                };
                self.children[slot].store(child.to_raw(), Ordering::Release);
                pool.persist(&self.children[slot]);
                true
            }

            fn remove_child(&self, pool: &PmPool, key_fragment: u8) -> Option<OpaqueNodePtr> {
                let slot = self.find_slot(key_fragment)?;
                let child = OpaqueNodePtr::from_raw(self.children[slot].swap(0, Ordering::AcqRel));
                pool.persist(&self.children[slot]);
                self.count.fetch_sub(1, Ordering::Relaxed);
                child
            }

            fn num_children(&self) -> usize {
                self.count.load(Ordering::Relaxed) as usize
            }

            fn children(&self) -> Vec<(u8, OpaqueNodePtr)> {
                let mut children: Vec<_> = self
                    .live_slots()
                    .map(|(_, key, child)| (key, child))
                    .collect();
                children.sort_unstable_by_key(|(key, _)| *key);
                children
            }

            fn recount(&self, _pool: &PmPool) {
                let live = self.live_slots().count();
                self.count.store(live as u32, Ordering::Relaxed);
            }

            fn is_full(&self) -> bool {
                self.compact_count() == $size
            }
        }
    };
}

impl_compressed_inner_node!(4, InnerNode16, InnerNode4);
impl_compressed_inner_node!(16, InnerNode48, InnerNode4);
