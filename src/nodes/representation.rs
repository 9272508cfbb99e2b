//! Trie node representation
//!
//! Every node lives inside the [`PmPool`] and is referred to by its offset.
//! The type of a node is folded into the low bits of the offset, so a child
//! slot is a single word that can be swapped atomically.

use std::{fmt, marker::PhantomData, mem::size_of};

use crate::{
    pool::{PmPool, PoolObject},
    tagged_pointer::TaggedOffset,
    Result,
};

mod header;
pub use header::*;

mod inner_node_256;
pub use inner_node_256::*;

mod inner_node_48;
pub use inner_node_48::*;

mod inner_node_compressed;
pub use inner_node_compressed::*;

mod leaf;
pub use leaf::*;

mod leaf_bucket;
pub use leaf_bucket::*;

mod fingerprint_bucket;
pub use fingerprint_bucket::*;

#[cfg(test)]
mod tests;

/// The runtime type of a node, stored in the tag bits of every child slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum NodeType {
    /// Fixed node that references up to 4 children
    Node4 = 0b000,
    /// Fixed node that references up to 16 children
    Node16 = 0b001,
    /// Fixed node that references up to 48 children
    Node48 = 0b010,
    /// Fixed node that references up to 256 children
    Node256 = 0b011,
    /// Node that contains a single key and value
    Leaf = 0b100,
    /// Terminal container of up to 64 leaves sharing a path
    LeafBucket = 0b101,
    /// Container of up to 64 key slices identified by fingerprints
    FingerprintBucket = 0b110,
}

impl NodeType {
    /// All node types, in tag order.
    pub const ALL: [NodeType; 7] = [
        NodeType::Node4,
        NodeType::Node16,
        NodeType::Node48,
        NodeType::Node256,
        NodeType::Leaf,
        NodeType::LeafBucket,
        NodeType::FingerprintBucket,
    ];

    /// The upper bound on the number of children that this type can hold.
    pub const fn upper_capacity(self) -> usize {
        match self {
            NodeType::Node4 => 4,
            NodeType::Node16 => 16,
            NodeType::Node48 => 48,
            NodeType::Node256 => 256,
            NodeType::Leaf => 0,
            NodeType::LeafBucket => LEAF_BUCKET_CAPACITY,
            NodeType::FingerprintBucket => FINGERPRINT_BUCKET_CAPACITY,
        }
    }

    /// Converts a tag value back to a [`NodeType`].
    pub const fn from_u8(src: u8) -> Option<NodeType> {
        match src {
            0b000 => Some(NodeType::Node4),
            0b001 => Some(NodeType::Node16),
            0b010 => Some(NodeType::Node48),
            0b011 => Some(NodeType::Node256),
            0b100 => Some(NodeType::Leaf),
            0b101 => Some(NodeType::LeafBucket),
            0b110 => Some(NodeType::FingerprintBucket),
            _ => None,
        }
    }

    /// Return true for the four fixed fan-out types.
    pub const fn is_inner(self) -> bool {
        matches!(
            self,
            NodeType::Node4 | NodeType::Node16 | NodeType::Node48 | NodeType::Node256
        )
    }

    /// The fixed fan-out type that can hold `num_children` children.
    pub const fn inner_for_children(num_children: usize) -> NodeType {
        match num_children {
            0..=4 => NodeType::Node4,
            5..=16 => NodeType::Node16,
            17..=48 => NodeType::Node48,
            _ => NodeType::Node256,
        }
    }

    /// Return true if a fixed node of this type with the specified number of
    /// children should be shrunk.
    pub const fn should_shrink_inner_node(self, num_children: usize) -> bool {
        match self {
            NodeType::Node16 => num_children <= 3,
            NodeType::Node48 => num_children <= 12,
            NodeType::Node256 => num_children <= 37,
            _ => false,
        }
    }

    /// Size of the pool allocation of a node of this type. Leaves have a
    /// variable size and return `None`.
    pub const fn allocation_size(self) -> Option<usize> {
        match self {
            NodeType::Node4 => Some(size_of::<InnerNode4>()),
            NodeType::Node16 => Some(size_of::<InnerNode16>()),
            NodeType::Node48 => Some(size_of::<InnerNode48>()),
            NodeType::Node256 => Some(size_of::<InnerNode256>()),
            NodeType::Leaf => None,
            NodeType::LeafBucket => Some(size_of::<LeafBucket>()),
            NodeType::FingerprintBucket => Some(size_of::<FingerprintBucket>()),
        }
    }
}

/// All node types which carry a runtime tag.
pub trait Node: private::Sealed {
    /// The runtime type of the node.
    const TYPE: NodeType;
}

/// An opaque reference to a node of any type.
///
/// Need to check the runtime type and then cast to a [`NodePtr`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct OpaqueNodePtr(TaggedOffset<3>);

impl fmt::Debug for OpaqueNodePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OpaqueNodePtr")
            .field(&self.node_type())
            .field(&format_args!("{:#x}", self.offset()))
            .finish()
    }
}

impl OpaqueNodePtr {
    /// Reference the node of type `N` at `offset`.
    pub fn new<N: Node>(offset: u64) -> Option<Self> {
        TaggedOffset::new_with_data(offset, N::TYPE as u64).map(OpaqueNodePtr)
    }

    /// Decode a child slot. Returns `None` for an empty slot or an unknown
    /// tag.
    #[inline]
    pub fn from_raw(raw: u64) -> Option<Self> {
        let tagged = TaggedOffset::from_raw(raw)?;
        if tagged.to_offset() == 0 {
            return None;
        }
        NodeType::from_u8(tagged.to_data() as u8)?;
        Some(OpaqueNodePtr(tagged))
    }

    /// The word to write into a child slot.
    #[inline]
    pub fn to_raw(self) -> u64 {
        self.0.to_raw()
    }

    /// Offset of the node inside the pool.
    #[inline]
    pub fn offset(self) -> u64 {
        self.0.to_offset()
    }

    /// Retrieve the runtime node type information.
    #[inline]
    pub fn node_type(self) -> NodeType {
        // `from_raw` and `new` only accept valid tags
        NodeType::from_u8(self.0.to_data() as u8).unwrap_or(NodeType::Leaf)
    }

    /// Return `true` if this references a node of type `N`.
    #[inline]
    pub fn is<N: Node>(self) -> bool {
        self.node_type() == N::TYPE
    }

    /// Create a typed reference if the node is of type `N`.
    #[inline]
    pub fn cast<N: Node>(self) -> Option<NodePtr<N>> {
        if self.is::<N>() {
            Some(NodePtr::new(self.offset()))
        } else {
            None
        }
    }

    /// Cast this reference into an enum that carries the concrete type.
    pub fn to_node_ptr(self) -> ConcreteNodePtr {
        let offset = self.offset();
        match self.node_type() {
            NodeType::Node4 => ConcreteNodePtr::Node4(NodePtr::new(offset)),
            NodeType::Node16 => ConcreteNodePtr::Node16(NodePtr::new(offset)),
            NodeType::Node48 => ConcreteNodePtr::Node48(NodePtr::new(offset)),
            NodeType::Node256 => ConcreteNodePtr::Node256(NodePtr::new(offset)),
            NodeType::Leaf => ConcreteNodePtr::Leaf(NodePtr::new(offset)),
            NodeType::LeafBucket => ConcreteNodePtr::LeafBucket(NodePtr::new(offset)),
            NodeType::FingerprintBucket => {
                ConcreteNodePtr::FingerprintBucket(NodePtr::new(offset))
            },
        }
    }

    /// View the node as a fixed fan-out node, if it is one.
    #[inline]
    pub fn inner(self, pool: &PmPool) -> Option<InnerNodeRef<'_>> {
        Some(match self.to_node_ptr() {
            ConcreteNodePtr::Node4(ptr) => InnerNodeRef::Node4(ptr.read(pool)),
            ConcreteNodePtr::Node16(ptr) => InnerNodeRef::Node16(ptr.read(pool)),
            ConcreteNodePtr::Node48(ptr) => InnerNodeRef::Node48(ptr.read(pool)),
            ConcreteNodePtr::Node256(ptr) => InnerNodeRef::Node256(ptr.read(pool)),
            _ => return None,
        })
    }

    /// The header of the node, or `None` for a leaf.
    pub fn header(self, pool: &PmPool) -> Option<&Header> {
        match self.to_node_ptr() {
            ConcreteNodePtr::Leaf(_) => None,
            ConcreteNodePtr::LeafBucket(ptr) => Some(&ptr.read(pool).header),
            ConcreteNodePtr::FingerprintBucket(ptr) => Some(&ptr.read(pool).header),
            _ => self.inner(pool).map(InnerNodeRef::header),
        }
    }
}

/// A reference to a node with its concrete type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcreteNodePtr {
    /// Fixed node with up to 4 children
    Node4(NodePtr<InnerNode4>),
    /// Fixed node with up to 16 children
    Node16(NodePtr<InnerNode16>),
    /// Fixed node with up to 48 children
    Node48(NodePtr<InnerNode48>),
    /// Fixed node with up to 256 children
    Node256(NodePtr<InnerNode256>),
    /// Single key and value
    Leaf(NodePtr<LeafNode>),
    /// Terminal container of leaves
    LeafBucket(NodePtr<LeafBucket>),
    /// Container of fingerprinted key slices
    FingerprintBucket(NodePtr<FingerprintBucket>),
}

impl ConcreteNodePtr {
    /// Drop the type information again.
    pub fn to_opaque(self) -> OpaqueNodePtr {
        match self {
            ConcreteNodePtr::Node4(ptr) => ptr.to_opaque(),
            ConcreteNodePtr::Node16(ptr) => ptr.to_opaque(),
            ConcreteNodePtr::Node48(ptr) => ptr.to_opaque(),
            ConcreteNodePtr::Node256(ptr) => ptr.to_opaque(),
            ConcreteNodePtr::Leaf(ptr) => ptr.to_opaque(),
            ConcreteNodePtr::LeafBucket(ptr) => ptr.to_opaque(),
            ConcreteNodePtr::FingerprintBucket(ptr) => ptr.to_opaque(),
        }
    }
}

/// A typed reference to a node inside the pool.
#[repr(transparent)]
pub struct NodePtr<N>(u64, PhantomData<fn() -> N>);

impl<N> Clone for NodePtr<N> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<N> Copy for NodePtr<N> {}

impl<N> PartialEq for NodePtr<N> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<N> Eq for NodePtr<N> {}

impl<N> fmt::Debug for NodePtr<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NodePtr")
            .field(&format_args!("{:#x}", self.0))
            .finish()
    }
}

impl<N: Node> NodePtr<N> {
    /// Reference the node at `offset`.
    #[inline]
    pub fn new(offset: u64) -> Self {
        NodePtr(offset, PhantomData)
    }

    /// Offset of the node inside the pool.
    #[inline]
    pub fn offset(self) -> u64 {
        self.0
    }

    /// Cast node pointer back to an opaque version, losing type information.
    #[inline]
    pub fn to_opaque(self) -> OpaqueNodePtr {
        // Node offsets come from the allocator, so they are aligned and
        // non-zero
        OpaqueNodePtr(
            TaggedOffset::new_with_data(self.0, N::TYPE as u64)
                .unwrap_or_else(|| panic!("node pointer to the superblock")),
        )
    }
}

impl<N: Node + PoolObject> NodePtr<N> {
    /// View the node in place.
    #[inline]
    pub fn read(self, pool: &PmPool) -> &N {
        pool.get(self.0)
    }

    /// Allocate a zeroed node of type `N`.
    pub fn allocate(pool: &PmPool) -> Result<Self> {
        Ok(NodePtr::new(pool.allocate(size_of::<N>())?))
    }

    /// Make the whole node durable.
    pub fn persist(self, pool: &PmPool) {
        pool.flush(self.0, size_of::<N>());
    }
}

/// The common interface of the four fixed fan-out node types.
///
/// Every mutating method must only be called while holding the write lock of
/// the node, or on a node that is not reachable yet.
pub trait InnerNode: Node + PoolObject {
    /// The type of the next larger node type.
    type GrownNode: InnerNode;

    /// The type of the next smaller node type.
    type ShrunkNode: InnerNode;

    /// Get the `Header` of the node.
    fn header(&self) -> &Header;

    /// Search through this node for a child node that corresponds to the given
    /// key fragment.
    fn lookup_child(&self, key_fragment: u8) -> Option<OpaqueNodePtr>;

    /// Write a child pointer with key fragment to this node.
    ///
    /// If the key fragment already exists in the node, the existing child
    /// pointer is overwritten. Returns `false` if there is no room left.
    fn write_child(
        &self,
        pool: &PmPool,
        key_fragment: u8,
        child: OpaqueNodePtr,
        flush: bool,
    ) -> bool;

    /// Replace the child at an existing key fragment. Returns `false` if the
    /// key fragment is absent.
    fn change_child(&self, pool: &PmPool, key_fragment: u8, child: OpaqueNodePtr) -> bool;

    /// Attempt to remove a child pointer at the key fragment from this node.
    fn remove_child(&self, pool: &PmPool, key_fragment: u8) -> Option<OpaqueNodePtr>;

    /// Number of live children.
    fn num_children(&self) -> usize;

    /// All `(key fragment, child)` pairs, ordered by key fragment.
    fn children(&self) -> Vec<(u8, OpaqueNodePtr)>;

    /// Recompute derived counters after a crash.
    fn recount(&self, pool: &PmPool);

    /// Returns true if this node has no more space to write a new child.
    fn is_full(&self) -> bool;

    /// Allocate an empty node at `level` with the given prefix.
    fn allocate(
        pool: &PmPool,
        generation: u64,
        level: usize,
        prefix: Prefix,
    ) -> Result<NodePtr<Self>> {
        let ptr = NodePtr::<Self>::allocate(pool)?;
        ptr.read(pool)
            .header()
            .init(Self::TYPE, level, prefix, generation);
        Ok(ptr)
    }

    /// Copy every child of this node into `target`.
    fn copy_children_into<T: InnerNode>(&self, pool: &PmPool, target: &T) {
        for (key_fragment, child) in self.children() {
            let written = target.write_child(pool, key_fragment, child, false);
            debug_assert!(written, "target node too small for the copied children");
        }
    }

    /// Return true if the node holds few enough children to be shrunk.
    fn should_shrink(&self) -> bool {
        Self::TYPE.should_shrink_inner_node(self.num_children())
    }
}

/// A shared view of a fixed fan-out node of any size.
#[derive(Debug, Clone, Copy)]
pub enum InnerNodeRef<'p> {
    /// Fixed node with up to 4 children
    Node4(&'p InnerNode4),
    /// Fixed node with up to 16 children
    Node16(&'p InnerNode16),
    /// Fixed node with up to 48 children
    Node48(&'p InnerNode48),
    /// Fixed node with up to 256 children
    Node256(&'p InnerNode256),
}

macro_rules! dispatch {
    ($self:expr, $node:ident => $body:expr) => {
        match $self {
            InnerNodeRef::Node4($node) => $body,
            InnerNodeRef::Node16($node) => $body,
            InnerNodeRef::Node48($node) => $body,
            InnerNodeRef::Node256($node) => $body,
        }
    };
}

impl<'p> InnerNodeRef<'p> {
    /// The runtime type of the node.
    pub fn node_type(self) -> NodeType {
        match self {
            InnerNodeRef::Node4(_) => NodeType::Node4,
            InnerNodeRef::Node16(_) => NodeType::Node16,
            InnerNodeRef::Node48(_) => NodeType::Node48,
            InnerNodeRef::Node256(_) => NodeType::Node256,
        }
    }

    /// Get the `Header` of the node.
    pub fn header(self) -> &'p Header {
        dispatch!(self, node => node.header())
    }

    /// See [`InnerNode::lookup_child`].
    pub fn lookup_child(self, key_fragment: u8) -> Option<OpaqueNodePtr> {
        dispatch!(self, node => node.lookup_child(key_fragment))
    }

    /// See [`InnerNode::write_child`].
    pub fn write_child(self, pool: &PmPool, key_fragment: u8, child: OpaqueNodePtr) -> bool {
        dispatch!(self, node => node.write_child(pool, key_fragment, child, true))
    }

    /// See [`InnerNode::change_child`].
    pub fn change_child(self, pool: &PmPool, key_fragment: u8, child: OpaqueNodePtr) -> bool {
        dispatch!(self, node => node.change_child(pool, key_fragment, child))
    }

    /// See [`InnerNode::remove_child`].
    pub fn remove_child(self, pool: &PmPool, key_fragment: u8) -> Option<OpaqueNodePtr> {
        dispatch!(self, node => node.remove_child(pool, key_fragment))
    }

    /// See [`InnerNode::num_children`].
    pub fn num_children(self) -> usize {
        dispatch!(self, node => node.num_children())
    }

    /// See [`InnerNode::children`].
    pub fn children(self) -> Vec<(u8, OpaqueNodePtr)> {
        dispatch!(self, node => node.children())
    }

    /// See [`InnerNode::recount`].
    pub fn recount(self, pool: &PmPool) {
        dispatch!(self, node => node.recount(pool))
    }

    /// See [`InnerNode::is_full`].
    pub fn is_full(self) -> bool {
        dispatch!(self, node => node.is_full())
    }

    /// See [`InnerNode::should_shrink`].
    pub fn should_shrink(self) -> bool {
        dispatch!(self, node => node.should_shrink())
    }

    /// The children with key fragments in `start..=end`, ordered.
    pub fn children_between(self, start: u8, end: u8) -> Vec<(u8, OpaqueNodePtr)> {
        let mut children = self.children();
        children.retain(|(key_fragment, _)| (start..=end).contains(key_fragment));
        children
    }

    /// The only child other than the one at `key_fragment`, if there is
    /// exactly one.
    pub fn second_child(self, key_fragment: u8) -> Option<(u8, OpaqueNodePtr)> {
        let mut others = self
            .children()
            .into_iter()
            .filter(|(other, _)| *other != key_fragment);
        match (others.next(), others.next()) {
            (Some(child), None) => Some(child),
            _ => None,
        }
    }
}

pub(crate) mod private {
    /// This trait is used to seal other traits, such that they cannot be
    /// implemented outside of the crate.
    pub trait Sealed {}

    impl Sealed for super::InnerNode4 {}
    impl Sealed for super::InnerNode16 {}
    impl Sealed for super::InnerNode48 {}
    impl Sealed for super::InnerNode256 {}
    impl Sealed for super::LeafNode {}
    impl Sealed for super::LeafBucket {}
    impl Sealed for super::FingerprintBucket {}
}
