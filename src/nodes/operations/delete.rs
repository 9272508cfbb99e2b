use crate::{
    error::NeedRestart,
    nodes::{
        any_leaf, header_of, locate, unlink_subtree, Ctx, Edge, InnerNodeRef, LeafNode, NodePtr,
        NodeType, OpaqueNodePtr, Parent, Prefix, Staging, Target,
    },
    tree::OperationResult,
};

/// Remove `key`.
///
/// Taking a leaf out of a bucket that keeps other leaves only locks the
/// bucket. The last leaf of a bucket takes the bucket with it, and every
/// ancestor left without children along the way, so that no empty node stays
/// reachable. In the direct layout a node left with a single child is replaced
/// by that child, and an underfull node by a smaller copy.
pub(crate) fn remove(ctx: &Ctx<'_>, key: &[u8]) -> Result<OperationResult, NeedRestart> {
    let Some(location) = locate(ctx, key)? else {
        return Ok(OperationResult::NotFound);
    };

    match location.target {
        Target::Bucket {
            bucket,
            version,
            slot,
            leaf,
        } => {
            if bucket.len() > 1 {
                bucket.header.lock_version_or_restart(version)?;
                let removed = bucket.remove_at(ctx.pool, slot);
                bucket.header.write_unlock();

                debug_assert_eq!(removed, Some(leaf));
                ctx.retire(leaf.to_opaque());
                return Ok(OperationResult::Success);
            }
            remove_last(ctx, &location.path, key)
        },
        Target::Direct(leaf) => {
            let Some((edge, above)) = location.path.split_last() else {
                return Err(NeedRestart);
            };
            match edge.parent {
                Parent::Inner(node) => remove_direct(
                    ctx,
                    DirectLeaf {
                        edge,
                        above,
                        node,
                        depth: location.depth,
                        leaf,
                    },
                ),
                Parent::Fingerprint(_) => remove_last(ctx, &location.path, key),
            }
        },
    }
}

/// Unlink the highest ancestor that only leads to `key`.
fn remove_last(ctx: &Ctx<'_>, path: &[Edge<'_>], key: &[u8]) -> Result<OperationResult, NeedRestart> {
    // Never above the root, which may be empty
    let mut anchor = path.len().checked_sub(1).ok_or(NeedRestart)?;
    while anchor > 0 && path[anchor].fanout() == 1 {
        anchor -= 1;
    }

    if unlink_subtree(ctx, &path[anchor], Some(key))? {
        Ok(OperationResult::Success)
    } else {
        // Something was inserted next to the key in the meantime
        Err(NeedRestart)
    }
}

/// A leaf that hangs directly from a fixed node.
struct DirectLeaf<'e, 'a> {
    /// The edge from the node to the leaf.
    edge: &'e Edge<'a>,
    /// The edges from the root to the node.
    above: &'e [Edge<'a>],
    node: InnerNodeRef<'a>,
    /// Depth at which the node hangs.
    depth: usize,
    leaf: NodePtr<LeafNode>,
}

fn remove_direct(ctx: &Ctx<'_>, target: DirectLeaf<'_, '_>) -> Result<OperationResult, NeedRestart> {
    let DirectLeaf {
        edge,
        above,
        node,
        depth,
        leaf,
    } = target;
    let header = node.header();
    let key_fragment = edge.slot as u8;

    let Some(parent_edge) = above.last() else {
        // The root keeps its place whatever its size
        edge.lock()?;
        node.remove_child(ctx.pool, key_fragment);
        edge.unlock();
        ctx.retire(leaf.to_opaque());
        return Ok(OperationResult::Success);
    };

    let num_children = node.num_children();
    if num_children == 1 {
        // Only left like this by a crash, prune the node with the leaf
        return if unlink_subtree(ctx, parent_edge, Some(leaf.key(ctx.pool, ctx.guard)))? {
            Ok(OperationResult::Success)
        } else {
            Err(NeedRestart)
        };
    }

    if num_children == 2 {
        if let Some((_, sibling)) = node.second_child(key_fragment) {
            if let Some(result) = collapse(ctx, parent_edge, edge, node, depth, sibling, leaf)? {
                return Ok(result);
            }
        }
    }

    if node.node_type().should_shrink_inner_node(num_children - 1) {
        let mut staging = Staging::new(ctx);
        let children = node
            .children()
            .into_iter()
            .filter(|(other, _)| *other != key_fragment);
        let node_type = NodeType::inner_for_children(num_children - 1);
        if let Ok(shrunk) = staging.inner_with(node_type, header.level(), header.prefix(), children) {
            parent_edge.lock()?;
            if let Err(restart) = edge.lock() {
                parent_edge.unlock();
                return Err(restart);
            }
            parent_edge.replace(ctx.pool, shrunk);
            header.write_unlock_obsolete();
            parent_edge.unlock();
            staging.commit();

            ctx.retire(parent_edge.child);
            ctx.retire(leaf.to_opaque());
            return Ok(OperationResult::Success);
        }
        // Out of space for the copy, keep the larger node
    }

    edge.lock()?;
    node.remove_child(ctx.pool, key_fragment);
    edge.unlock();
    ctx.retire(leaf.to_opaque());
    Ok(OperationResult::Success)
}

/// Replace a node with two children by the child that stays.
///
/// A fixed node that takes the place of its parent inherits the parent's
/// prefix and key fragment in front of its own prefix. The prefix is rebuilt
/// from any leaf below it, since the leaves hold the whole path. Returns `None`
/// if the sibling cannot move up.
fn collapse(
    ctx: &Ctx<'_>,
    parent_edge: &Edge<'_>,
    edge: &Edge<'_>,
    node: InnerNodeRef<'_>,
    depth: usize,
    sibling: OpaqueNodePtr,
    leaf: NodePtr<LeafNode>,
) -> Result<Option<OperationResult>, NeedRestart> {
    let header = node.header();
    let sibling_header = match sibling.node_type() {
        NodeType::Leaf => None,
        node_type if node_type.is_inner() => Some(header_of(ctx.pool, sibling)?),
        // A bucket stays at the depth it was created for
        _ => return Ok(None),
    };

    let prefix = match sibling_header {
        Some(sibling_header) => {
            let Some(any) = any_leaf(ctx.view(), sibling) else {
                return Ok(None);
            };
            let bytes = any
                .key(ctx.pool, ctx.guard)
                .get(depth..sibling_header.level())
                .ok_or(NeedRestart)?;
            Some(Prefix::new(bytes, bytes.len()))
        },
        None => None,
    };

    parent_edge.lock()?;
    if let Err(restart) = edge.lock() {
        parent_edge.unlock();
        return Err(restart);
    }
    if let Some(sibling_header) = sibling_header {
        if let Err(restart) = sibling_header.write_lock_or_restart(ctx.generation) {
            edge.unlock();
            parent_edge.unlock();
            return Err(restart);
        }
    }

    // The sibling is published before its prefix grows. A crash in between
    // leaves a prefix that is too short, inserts heal it and reads skip it
    parent_edge.replace(ctx.pool, sibling);
    if let (Some(sibling_header), Some(prefix)) = (sibling_header, prefix) {
        sibling_header.set_prefix(ctx.pool, prefix);
        sibling_header.write_unlock();
    }
    header.write_unlock_obsolete();
    parent_edge.unlock();

    ctx.retire(parent_edge.child);
    ctx.retire(leaf.to_opaque());
    Ok(Some(OperationResult::Success))
}
