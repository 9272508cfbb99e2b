//! Utilities for inspecting the trie structure.
//!
//! Visitors read nodes without taking their locks. The output is only exact
//! while no other thread writes to the tree.

mod dot_printer;
mod recovery;
mod tree_stats;
mod well_formed;

use crossbeam_epoch::Guard;

use crate::{
    nodes::{
        ConcreteNodePtr, FingerprintBucket, InnerNodeRef, LeafBucket, LeafNode, NodePtr,
        OpaqueNodePtr,
    },
    pool::PmPool,
};
pub use dot_printer::*;
pub(crate) use recovery::Recovery;
pub use recovery::RecoveryReport;
pub use tree_stats::*;
pub use well_formed::*;

/// The pool that node offsets are resolved against, together with a pinned
/// epoch that keeps retired nodes alive for the length of a traversal.
#[derive(Clone, Copy)]
pub struct TreeView<'a> {
    pub(crate) pool: &'a PmPool,
    pub(crate) guard: &'a Guard,
}

impl<'a> TreeView<'a> {
    pub(crate) fn new(pool: &'a PmPool, guard: &'a Guard) -> Self {
        TreeView { pool, guard }
    }

    /// The pool holding the nodes.
    pub fn pool(&self) -> &'a PmPool {
        self.pool
    }

    /// The epoch guard pinned for the traversal.
    pub fn guard(&self) -> &'a Guard {
        self.guard
    }

    /// Offset of a node that was resolved through this view.
    pub fn offset_of<T>(&self, node: &T) -> u64 {
        self.pool.offset_of(node)
    }
}

/// The `Visitable` trait allows [`Visitor`]s to traverse the structure of the
/// implementing type and produce some output.
pub trait Visitable {
    /// This function provides the default traversal behavior for the
    /// implementing type.
    ///
    /// The implementation should call `visit_with(view, visitor)` for all
    /// children of the node. If there are none, it should just produce the
    /// default output.
    fn super_visit_with<V: Visitor>(&self, view: TreeView<'_>, visitor: &mut V) -> V::Output;

    /// This function will traverse the implementing type and execute any
    /// specific logic from the given [`Visitor`].
    ///
    /// Types with a hook in the [`Visitor`] trait override this to call the
    /// hook, for example `visitor.visit_leaf_bucket(view, self)`.
    fn visit_with<V: Visitor>(&self, view: TreeView<'_>, visitor: &mut V) -> V::Output {
        self.super_visit_with(view, visitor)
    }
}

impl Visitable for OpaqueNodePtr {
    fn super_visit_with<V: Visitor>(&self, view: TreeView<'_>, visitor: &mut V) -> V::Output {
        let pool = view.pool;
        match self.to_node_ptr() {
            ConcreteNodePtr::Leaf(leaf) => leaf.visit_with(view, visitor),
            ConcreteNodePtr::LeafBucket(bucket) => bucket.read(pool).visit_with(view, visitor),
            ConcreteNodePtr::FingerprintBucket(bucket) => {
                bucket.read(pool).visit_with(view, visitor)
            },
            ConcreteNodePtr::Node4(node) => {
                InnerNodeRef::Node4(node.read(pool)).visit_with(view, visitor)
            },
            ConcreteNodePtr::Node16(node) => {
                InnerNodeRef::Node16(node.read(pool)).visit_with(view, visitor)
            },
            ConcreteNodePtr::Node48(node) => {
                InnerNodeRef::Node48(node.read(pool)).visit_with(view, visitor)
            },
            ConcreteNodePtr::Node256(node) => {
                InnerNodeRef::Node256(node.read(pool)).visit_with(view, visitor)
            },
        }
    }
}

impl Visitable for InnerNodeRef<'_> {
    fn super_visit_with<V: Visitor>(&self, view: TreeView<'_>, visitor: &mut V) -> V::Output {
        combine_child_output(
            self.children().into_iter().map(|(_, child)| child),
            view,
            visitor,
        )
    }

    fn visit_with<V: Visitor>(&self, view: TreeView<'_>, visitor: &mut V) -> V::Output {
        visitor.visit_inner(view, *self)
    }
}

impl Visitable for LeafBucket {
    fn super_visit_with<V: Visitor>(&self, view: TreeView<'_>, visitor: &mut V) -> V::Output {
        combine_child_output(
            self.leaves().map(|(_, leaf)| leaf.to_opaque()),
            view,
            visitor,
        )
    }

    fn visit_with<V: Visitor>(&self, view: TreeView<'_>, visitor: &mut V) -> V::Output {
        visitor.visit_leaf_bucket(view, self)
    }
}

impl Visitable for FingerprintBucket {
    fn super_visit_with<V: Visitor>(&self, view: TreeView<'_>, visitor: &mut V) -> V::Output {
        combine_child_output(
            self.sorted(view.pool, view.guard)
                .into_iter()
                .map(|slice| slice.child),
            view,
            visitor,
        )
    }

    fn visit_with<V: Visitor>(&self, view: TreeView<'_>, visitor: &mut V) -> V::Output {
        visitor.visit_fingerprint_bucket(view, self)
    }
}

impl Visitable for NodePtr<LeafNode> {
    fn super_visit_with<V: Visitor>(&self, _view: TreeView<'_>, visitor: &mut V) -> V::Output {
        visitor.default_output()
    }

    fn visit_with<V: Visitor>(&self, view: TreeView<'_>, visitor: &mut V) -> V::Output {
        visitor.visit_leaf(view, *self)
    }
}

/// The `Visitor` trait allows creating new operations on the radix tree by
/// overriding specific handling methods for each of the node kinds.
pub trait Visitor: Sized {
    /// The type of value that the visitor produces.
    type Output;

    /// Produce the default value of the [`Self::Output`] type.
    fn default_output(&self) -> Self::Output;

    /// Combine two instances of the [`Self::Output`] type for this [`Visitor`].
    fn combine_output(&self, o1: Self::Output, o2: Self::Output) -> Self::Output;

    /// Visit a fixed node of any size.
    fn visit_inner(&mut self, view: TreeView<'_>, t: InnerNodeRef<'_>) -> Self::Output {
        t.super_visit_with(view, self)
    }

    /// Visit a [`LeafBucket`].
    fn visit_leaf_bucket(&mut self, view: TreeView<'_>, t: &LeafBucket) -> Self::Output {
        t.super_visit_with(view, self)
    }

    /// Visit a [`FingerprintBucket`].
    fn visit_fingerprint_bucket(
        &mut self,
        view: TreeView<'_>,
        t: &FingerprintBucket,
    ) -> Self::Output {
        t.super_visit_with(view, self)
    }

    /// Visit a leaf.
    fn visit_leaf(&mut self, view: TreeView<'_>, t: NodePtr<LeafNode>) -> Self::Output {
        t.super_visit_with(view, self)
    }
}

fn combine_child_output<V: Visitor>(
    mut iter: impl Iterator<Item = OpaqueNodePtr>,
    view: TreeView<'_>,
    visitor: &mut V,
) -> V::Output {
    if let Some(first) = iter.next() {
        let mut accum = first.visit_with(view, visitor);
        for child in iter {
            let output = child.visit_with(view, visitor);
            accum = visitor.combine_output(accum, output);
        }

        accum
    } else {
        visitor.default_output()
    }
}

/// Escape key bytes for display.
pub(crate) fn escape_bytes(bytes: &[u8]) -> String {
    bytes.escape_ascii().to_string()
}
