//! Trie node lookup and manipulation
//!
//! Every operation is a single attempt that either completes or reports that
//! it observed a concurrent modification. Nothing is published by an attempt
//! until it holds the write locks it needs, so a failed attempt can simply be
//! started again from the root.

use crossbeam_epoch::Guard;

use crate::{
    error::NeedRestart,
    key::fingerprint,
    nodes::{
        visitor::TreeView, ConcreteNodePtr, FingerprintBucket, Header, InnerNode, InnerNode16,
        InnerNode256, InnerNode4, InnerNode48, InnerNodeRef, LeafBucket, LeafNode, NodePtr,
        NodeType, OpaqueNodePtr, Prefix,
    },
    pool::PmPool,
    reclaim::Reclaimer,
    tree::TreeStats,
    LeafLayout, Result, TreeConfig,
};

mod delete;
mod insert;
mod lookup;
mod prefix;
mod range;
mod split;
mod update;

pub(crate) use delete::*;
pub(crate) use insert::*;
pub(crate) use lookup::*;
pub(crate) use prefix::*;
pub(crate) use range::*;
pub(crate) use update::*;

#[cfg(test)]
mod tests;

/// Everything a single attempt of an operation needs.
pub(crate) struct Ctx<'a> {
    pub pool: &'a PmPool,
    pub reclaimer: &'a Reclaimer,
    pub guard: &'a Guard,
    pub config: &'a TreeConfig,
    pub stats: &'a TreeStats,
    pub root: NodePtr<InnerNode256>,
    pub generation: u64,
}

impl<'a> Ctx<'a> {
    /// The pool and guard, for code shared with the visitors.
    pub fn view(&self) -> TreeView<'a> {
        TreeView::new(self.pool, self.guard)
    }

    /// The leaf layout of the open pool.
    pub fn layout(&self) -> LeafLayout {
        self.config.leaf_layout
    }

    /// Schedule an unlinked node to be freed once no reader can see it. The
    /// slice buffers still referenced by a fingerprint bucket go with it.
    pub fn retire(&self, ptr: OpaqueNodePtr) {
        match ptr.to_node_ptr() {
            ConcreteNodePtr::Leaf(leaf) => {
                let size = leaf.allocation_size(self.pool);
                self.reclaimer.retire(self.guard, ptr.offset(), size);
            },
            ConcreteNodePtr::FingerprintBucket(bucket) => {
                let node = bucket.read(self.pool);
                for buffer in node.buffers() {
                    self.retire_buffer(buffer, node.slice_len());
                }
                self.retire_sized(ptr);
            },
            _ => self.retire_sized(ptr),
        }
    }

    fn retire_sized(&self, ptr: OpaqueNodePtr) {
        if let Some(size) = ptr.node_type().allocation_size() {
            self.reclaimer.retire(self.guard, ptr.offset(), size);
        }
    }

    /// Schedule a fingerprint slice buffer to be freed.
    pub fn retire_buffer(&self, offset: u64, len: usize) {
        self.reclaimer.retire(self.guard, offset, len);
    }
}

/// Allocate an empty fixed node of the given type.
pub(crate) fn allocate_inner(
    pool: &PmPool,
    generation: u64,
    node_type: NodeType,
    level: usize,
    prefix: Prefix,
) -> Result<OpaqueNodePtr> {
    Ok(match node_type {
        NodeType::Node4 => InnerNode4::allocate(pool, generation, level, prefix)?.to_opaque(),
        NodeType::Node16 => InnerNode16::allocate(pool, generation, level, prefix)?.to_opaque(),
        NodeType::Node48 => InnerNode48::allocate(pool, generation, level, prefix)?.to_opaque(),
        _ => InnerNode256::allocate(pool, generation, level, prefix)?.to_opaque(),
    })
}

/// Allocations made by an attempt that are not reachable yet.
///
/// Unless [`Staging::commit`] is called, everything is handed back to the pool
/// when the staging area is dropped.
pub(crate) struct Staging<'c, 'a> {
    ctx: &'c Ctx<'a>,
    nodes: Vec<OpaqueNodePtr>,
}

impl<'c, 'a> Staging<'c, 'a> {
    pub fn new(ctx: &'c Ctx<'a>) -> Self {
        Staging {
            ctx,
            nodes: Vec::new(),
        }
    }

    /// Write a new leaf.
    pub fn leaf(&mut self, key: &[u8], value: &[u8]) -> Result<NodePtr<LeafNode>> {
        let leaf = NodePtr::<LeafNode>::create(self.ctx.pool, key, value)?;
        self.nodes.push(leaf.to_opaque());
        Ok(leaf)
    }

    /// Allocate an empty leaf bucket at depth `level`.
    pub fn leaf_bucket(&mut self, level: usize) -> Result<NodePtr<LeafBucket>> {
        let bucket = LeafBucket::allocate(self.ctx.pool, self.ctx.generation, level)?;
        self.nodes.push(bucket.to_opaque());
        Ok(bucket)
    }

    /// Allocate a leaf bucket at depth `level` holding the given leaves, and
    /// make it durable.
    pub fn leaf_bucket_with(
        &mut self,
        level: usize,
        leaves: impl IntoIterator<Item = (u16, NodePtr<LeafNode>)>,
    ) -> Result<NodePtr<LeafBucket>> {
        let ptr = self.leaf_bucket(level)?;
        let bucket = ptr.read(self.ctx.pool);
        for (fingerprint, leaf) in leaves {
            let inserted = bucket.insert(self.ctx.pool, fingerprint, leaf);
            debug_assert!(inserted, "too many leaves for a new bucket");
        }
        ptr.persist(self.ctx.pool);
        Ok(ptr)
    }

    /// Allocate an empty fingerprint bucket.
    pub fn fingerprint_bucket(
        &mut self,
        level: usize,
        slice_len: usize,
    ) -> Result<NodePtr<FingerprintBucket>> {
        let bucket =
            FingerprintBucket::allocate(self.ctx.pool, self.ctx.generation, level, slice_len)?;
        self.nodes.push(bucket.to_opaque());
        Ok(bucket)
    }

    /// Allocate an empty fixed node.
    pub fn inner(
        &mut self,
        node_type: NodeType,
        level: usize,
        prefix: Prefix,
    ) -> Result<OpaqueNodePtr> {
        let node = allocate_inner(
            self.ctx.pool,
            self.ctx.generation,
            node_type,
            level,
            prefix,
        )?;
        self.nodes.push(node);
        Ok(node)
    }

    /// Allocate a fixed node holding `children`, and make it durable.
    pub fn inner_with(
        &mut self,
        node_type: NodeType,
        level: usize,
        prefix: Prefix,
        children: impl IntoIterator<Item = (u8, OpaqueNodePtr)>,
    ) -> Result<OpaqueNodePtr> {
        let ptr = self.inner(node_type, level, prefix)?;
        let pool = self.ctx.pool;

        macro_rules! fill {
            ($node:expr) => {{
                let node = $node.read(pool);
                for (key_fragment, child) in children {
                    let written = node.write_child(pool, key_fragment, child, false);
                    debug_assert!(written, "too many children for a new node");
                }
                $node.persist(pool);
            }};
        }

        match ptr.to_node_ptr() {
            ConcreteNodePtr::Node4(node) => fill!(node),
            ConcreteNodePtr::Node16(node) => fill!(node),
            ConcreteNodePtr::Node48(node) => fill!(node),
            ConcreteNodePtr::Node256(node) => fill!(node),
            _ => unreachable!("allocate_inner only returns fixed nodes"),
        }
        Ok(ptr)
    }

    /// The new child for a key that has no path below `depth` yet. A bucket
    /// holding a single leaf, or the leaf itself in the direct layout.
    pub fn terminal(&mut self, depth: usize, key: &[u8], value: &[u8]) -> Result<OpaqueNodePtr> {
        let leaf = self.leaf(key, value)?;
        match self.ctx.layout() {
            LeafLayout::Bucketed => Ok(self
                .leaf_bucket_with(depth, [(fingerprint(key), leaf)])?
                .to_opaque()),
            LeafLayout::Direct => Ok(leaf.to_opaque()),
        }
    }

    /// The allocations are published, keep them.
    pub fn commit(mut self) {
        self.nodes.clear();
    }
}

impl Drop for Staging<'_, '_> {
    fn drop(&mut self) {
        let pool = self.ctx.pool;
        for node in self.nodes.drain(..).rev() {
            let size = match node.to_node_ptr() {
                ConcreteNodePtr::Leaf(leaf) => leaf.allocation_size(pool),
                ConcreteNodePtr::FingerprintBucket(bucket) => {
                    let bucket = bucket.read(pool);
                    for buffer in bucket.buffers() {
                        self.ctx.reclaimer.discard(buffer, bucket.slice_len());
                    }
                    NodeType::FingerprintBucket.allocation_size().unwrap_or_default()
                },
                _ => node.node_type().allocation_size().unwrap_or_default(),
            };
            self.ctx.reclaimer.discard(node.offset(), size);
        }
    }
}

/// A node resolved to a reference of its concrete type.
#[derive(Debug, Clone, Copy)]
pub(crate) enum View<'a> {
    Inner(InnerNodeRef<'a>),
    LeafBucket(&'a LeafBucket),
    Fingerprint(&'a FingerprintBucket),
    Leaf(NodePtr<LeafNode>),
}

impl<'a> View<'a> {
    pub fn of(pool: &'a PmPool, ptr: OpaqueNodePtr) -> Self {
        match ptr.to_node_ptr() {
            ConcreteNodePtr::Leaf(leaf) => View::Leaf(leaf),
            ConcreteNodePtr::LeafBucket(bucket) => View::LeafBucket(bucket.read(pool)),
            ConcreteNodePtr::FingerprintBucket(bucket) => View::Fingerprint(bucket.read(pool)),
            ConcreteNodePtr::Node4(node) => View::Inner(InnerNodeRef::Node4(node.read(pool))),
            ConcreteNodePtr::Node16(node) => View::Inner(InnerNodeRef::Node16(node.read(pool))),
            ConcreteNodePtr::Node48(node) => View::Inner(InnerNodeRef::Node48(node.read(pool))),
            ConcreteNodePtr::Node256(node) => View::Inner(InnerNodeRef::Node256(node.read(pool))),
        }
    }
}

/// The parent node of a node during a descent.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Parent<'a> {
    /// A fixed node, `slot` is the key fragment.
    Inner(InnerNodeRef<'a>),
    /// A fingerprint bucket, `slot` is the slot index.
    Fingerprint(&'a FingerprintBucket),
}

/// The link from a parent to one of its children, together with the version
/// of the parent at the time the link was read.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Edge<'a> {
    pub parent: Parent<'a>,
    pub version: u64,
    pub slot: usize,
    /// The node the edge pointed to when it was read.
    pub child: OpaqueNodePtr,
}

impl<'a> Edge<'a> {
    /// The edge under key fragment `key_fragment` of a fixed node.
    pub fn inner(
        node: InnerNodeRef<'a>,
        version: u64,
        key_fragment: u8,
        child: OpaqueNodePtr,
    ) -> Self {
        Edge {
            parent: Parent::Inner(node),
            version,
            slot: usize::from(key_fragment),
            child,
        }
    }

    /// The edge at `slot` of a fingerprint bucket.
    pub fn slice(
        bucket: &'a FingerprintBucket,
        version: u64,
        slot: usize,
        child: OpaqueNodePtr,
    ) -> Self {
        Edge {
            parent: Parent::Fingerprint(bucket),
            version,
            slot,
            child,
        }
    }

    /// Header of the parent.
    pub fn header(&self) -> &'a Header {
        match self.parent {
            Parent::Inner(node) => node.header(),
            Parent::Fingerprint(bucket) => &bucket.header,
        }
    }

    /// Number of children of the parent.
    pub fn fanout(&self) -> usize {
        match self.parent {
            Parent::Inner(node) => node.num_children(),
            Parent::Fingerprint(bucket) => bucket.len(),
        }
    }

    /// Check that the parent did not change since the edge was read.
    pub fn validate(&self) -> Result<(), NeedRestart> {
        self.header().read_unlock_or_restart(self.version)
    }

    /// Lock the parent, failing if it changed since the edge was read.
    pub fn lock(&self) -> Result<(), NeedRestart> {
        self.header().lock_version_or_restart(self.version)
    }

    /// Release the lock taken by [`Edge::lock`].
    pub fn unlock(&self) {
        self.header().write_unlock();
    }

    /// Point the edge to `child`. The parent must be locked.
    pub fn replace(&self, pool: &PmPool, child: OpaqueNodePtr) {
        match self.parent {
            Parent::Inner(node) => {
                let changed = node.change_child(pool, self.slot as u8, child);
                debug_assert!(changed, "replaced a missing child");
            },
            Parent::Fingerprint(bucket) => bucket.change_child_at(pool, self.slot, child),
        }
    }

    /// Remove the edge from the parent. The parent must be locked.
    pub fn remove(&self, ctx: &Ctx<'_>) {
        match self.parent {
            Parent::Inner(node) => {
                node.remove_child(ctx.pool, self.slot as u8);
            },
            Parent::Fingerprint(bucket) => {
                if let Some((_, buffer)) = bucket.remove_at(ctx.pool, self.slot) {
                    ctx.retire_buffer(buffer, bucket.slice_len());
                }
            },
        }
    }
}

/// The header of a node that is not a leaf.
pub(crate) fn header_of<'a>(pool: &'a PmPool, ptr: OpaqueNodePtr) -> Result<&'a Header, NeedRestart> {
    // A leaf can only show up here if a torn read produced a bogus pointer
    ptr.header(pool).ok_or(NeedRestart)
}

/// The children of any node that is not a leaf, ordered by key.
pub(crate) fn children_of(view: TreeView<'_>, ptr: OpaqueNodePtr) -> Vec<OpaqueNodePtr> {
    match ptr.to_node_ptr() {
        ConcreteNodePtr::Leaf(_) => Vec::new(),
        ConcreteNodePtr::LeafBucket(bucket) => bucket
            .read(view.pool)
            .leaves()
            .map(|(_, leaf)| leaf.to_opaque())
            .collect(),
        ConcreteNodePtr::FingerprintBucket(bucket) => bucket
            .read(view.pool)
            .sorted(view.pool, view.guard)
            .into_iter()
            .map(|slice| slice.child)
            .collect(),
        _ => ptr
            .inner(view.pool)
            .map(|node| node.children().into_iter().map(|(_, child)| child).collect())
            .unwrap_or_default(),
    }
}

/// Find any leaf below `ptr`.
///
/// Every key below a node shares the node's path, so the bytes of any leaf
/// can stand in for prefix bytes that are not stored inline. The search
/// backtracks out of subtrees that turn out to be empty.
pub(crate) fn any_leaf(view: TreeView<'_>, ptr: OpaqueNodePtr) -> Option<NodePtr<LeafNode>> {
    let mut stack = vec![ptr];
    while let Some(ptr) = stack.pop() {
        match ptr.to_node_ptr() {
            ConcreteNodePtr::Leaf(leaf) => return Some(leaf),
            ConcreteNodePtr::LeafBucket(bucket) => {
                if let Some((_, leaf)) = bucket.read(view.pool).leaves().next() {
                    return Some(leaf);
                }
            },
            _ => stack.extend(children_of(view, ptr).into_iter().rev()),
        }
    }
    None
}

/// Unlink the subtree behind `edge` if it holds no leaf other than one with
/// the key `except`.
///
/// Every node of the subtree is locked before anything is changed, so that a
/// concurrent writer inside the subtree either finishes first or restarts on
/// an obsolete node. Returns `false` if the subtree holds other leaves.
pub(crate) fn unlink_subtree(
    ctx: &Ctx<'_>,
    edge: &Edge<'_>,
    except: Option<&[u8]>,
) -> Result<bool, NeedRestart> {
    edge.lock()?;

    let mut locked = Vec::new();
    let mut leaves = Vec::new();
    let mut stack = vec![edge.child];
    let mut clean = true;
    while let Some(ptr) = stack.pop() {
        if let ConcreteNodePtr::Leaf(leaf) = ptr.to_node_ptr() {
            leaves.push(leaf);
            continue;
        }
        let header = match header_of(ctx.pool, ptr) {
            Ok(header) => header,
            Err(restart) => {
                unlock_all(ctx, edge, &locked);
                return Err(restart);
            },
        };
        if let Err(restart) = header.write_lock_or_restart(ctx.generation) {
            unlock_all(ctx, edge, &locked);
            return Err(restart);
        }
        locked.push(ptr);
        stack.extend(children_of(ctx.view(), ptr));
    }

    for leaf in &leaves {
        if Some(leaf.key(ctx.pool, ctx.guard)) != except {
            clean = false;
        }
    }
    if !clean {
        unlock_all(ctx, edge, &locked);
        return Ok(false);
    }

    edge.remove(ctx);
    edge.unlock();
    for ptr in locked {
        if let Ok(header) = header_of(ctx.pool, ptr) {
            header.write_unlock_obsolete();
        }
        ctx.retire(ptr);
    }
    for leaf in leaves {
        ctx.retire(leaf.to_opaque());
    }
    Ok(true)
}

fn unlock_all(ctx: &Ctx<'_>, edge: &Edge<'_>, locked: &[OpaqueNodePtr]) {
    for ptr in locked {
        if let Ok(header) = header_of(ctx.pool, *ptr) {
            header.write_unlock();
        }
    }
    edge.unlock();
}
