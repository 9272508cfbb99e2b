use super::split::{split_fingerprint_bucket, split_leaf_bucket};
use crate::{
    error::{Interrupt, NeedRestart},
    key::{common_prefix_len, fingerprint},
    nodes::{
        check_prefix_pessimistic, unlink_subtree, Ctx, Edge, InnerNodeRef, NodeType,
        OpaqueNodePtr, PessimisticMatch, Prefix, Staging, View,
    },
    tree::OperationResult,
    Error,
};

/// The error for a key that cannot get its own path.
pub(crate) fn prefix_conflict(key: &[u8]) -> Interrupt {
    Interrupt::Fatal(Error::KeyPrefixConflict { key: key.into() })
}

/// Insert `key` with `value`, unless the key is already present.
///
/// The descent is optimistic like a lookup, except that prefixes are checked
/// exactly so that a mismatch can be turned into a new branch. Only the nodes
/// that change are locked, and only at the end of the descent:
///
///  - a node with room for the new child,
///  - a full node, together with its parent, to replace it with a larger one,
///  - a bucket with room for the new leaf,
///  - a node whose prefix diverges from the key, together with its parent, to
///    put a new 4-way node above it.
///
/// Splitting a full bucket changes the shape of the tree below the parent, so
/// the insert is restarted afterwards.
pub(crate) fn insert(
    ctx: &Ctx<'_>,
    key: &[u8],
    value: &[u8],
) -> Result<OperationResult, Interrupt> {
    let mut edge: Option<Edge<'_>> = None;
    let mut node = ctx.root.to_opaque();
    let mut depth = 0;

    loop {
        match View::of(ctx.pool, node) {
            View::Inner(inner) => {
                let header = inner.header();
                let version = header.read_lock_or_restart(ctx.generation)?;
                if let Some(edge) = &edge {
                    edge.validate()?;
                }

                match check_prefix_pessimistic(ctx, node, header, version, key, depth)? {
                    PessimisticMatch::Match => {},
                    PessimisticMatch::KeyEnds => {
                        header.read_unlock_or_restart(version)?;
                        return Err(prefix_conflict(key));
                    },
                    PessimisticMatch::Diverges { position, prefix } => {
                        let edge = edge.ok_or(NeedRestart)?;
                        let split = PrefixSplit {
                            edge: &edge,
                            inner,
                            version,
                            depth,
                            position,
                            prefix: &prefix,
                        };
                        split.apply(ctx, key, value)?;
                        return Ok(OperationResult::Success);
                    },
                    PessimisticMatch::Empty => {
                        let edge = edge.ok_or(NeedRestart)?;
                        unlink_subtree(ctx, &edge, None)?;
                        return Err(Interrupt::Restart);
                    },
                }

                let level = header.level();
                ctx.stats.max_level.record_max(level as u64);
                let key_fragment = key[level];
                let child = inner.lookup_child(key_fragment);
                header.read_unlock_or_restart(version)?;

                let Some(child) = child else {
                    add_child(
                        ctx,
                        edge.as_ref(),
                        (node, inner, version),
                        key_fragment,
                        key,
                        value,
                    )?;
                    return Ok(OperationResult::Success);
                };
                edge = Some(Edge::inner(inner, version, key_fragment, child));
                node = child;
                depth = level + 1;
            },
            View::Fingerprint(bucket) => {
                let header = &bucket.header;
                let version = header.read_lock_or_restart(ctx.generation)?;
                if let Some(edge) = &edge {
                    edge.validate()?;
                }

                let level = header.level();
                let end = level + bucket.slice_len();
                let Some(slice) = key.get(level..end) else {
                    let edge = edge.ok_or(NeedRestart)?;
                    split_fingerprint_bucket(ctx, &edge, bucket, version, key)?;
                    return Err(Interrupt::Restart);
                };

                match bucket.find(ctx.pool, ctx.guard, slice) {
                    Some(found) => {
                        header.read_unlock_or_restart(version)?;
                        edge = Some(Edge::slice(bucket, version, found.slot, found.child));
                        node = found.child;
                        depth = end;
                    },
                    None if !bucket.is_full() => {
                        let mut staging = Staging::new(ctx);
                        let child = staging.terminal(end, key, value)?;

                        header.lock_version_or_restart(version)?;
                        let inserted = bucket.insert(ctx.pool, slice, child);
                        header.write_unlock();

                        if !inserted? {
                            return Err(Interrupt::Restart);
                        }
                        staging.commit();
                        return Ok(OperationResult::Success);
                    },
                    None => {
                        let edge = edge.ok_or(NeedRestart)?;
                        split_fingerprint_bucket(ctx, &edge, bucket, version, key)?;
                        return Err(Interrupt::Restart);
                    },
                }
            },
            View::LeafBucket(bucket) => {
                let header = &bucket.header;
                let version = header.read_lock_or_restart(ctx.generation)?;
                if let Some(edge) = &edge {
                    edge.validate()?;
                }

                if bucket.find(ctx.pool, ctx.guard, key).is_some() {
                    header.read_unlock_or_restart(version)?;
                    return Ok(OperationResult::Existed);
                }

                if bucket.is_full() {
                    let edge = edge.ok_or(NeedRestart)?;
                    split_leaf_bucket(ctx, &edge, bucket, version, key)?;
                    return Err(Interrupt::Restart);
                }

                let mut staging = Staging::new(ctx);
                let leaf = staging.leaf(key, value)?;

                header.lock_version_or_restart(version)?;
                let inserted = bucket.insert(ctx.pool, fingerprint(key), leaf);
                header.write_unlock();

                if !inserted {
                    return Err(Interrupt::Restart);
                }
                staging.commit();
                return Ok(OperationResult::Success);
            },
            View::Leaf(leaf) => {
                let edge = edge.ok_or(NeedRestart)?;
                edge.validate()?;

                let existing = leaf.key(ctx.pool, ctx.guard);
                if existing == key {
                    return Ok(OperationResult::Existed);
                }

                // Both keys share the path down to `depth`, the new node
                // discriminates on the first byte where they differ
                let split = depth + common_prefix_len(existing, key, depth);
                if existing.len() <= split || key.len() <= split {
                    return Err(prefix_conflict(key));
                }

                let mut staging = Staging::new(ctx);
                let child = staging.terminal(split + 1, key, value)?;
                let node4 = staging.inner_with(
                    NodeType::Node4,
                    split,
                    Prefix::new(&key[depth..split], split - depth),
                    [(existing[split], leaf.to_opaque()), (key[split], child)],
                )?;

                edge.lock()?;
                edge.replace(ctx.pool, node4);
                edge.unlock();
                staging.commit();
                return Ok(OperationResult::Success);
            },
        }
    }
}

/// Hang a new terminal for `key` under `key_fragment` of a fixed node that has
/// no child there.
fn add_child(
    ctx: &Ctx<'_>,
    edge: Option<&Edge<'_>>,
    (node, inner, version): (OpaqueNodePtr, InnerNodeRef<'_>, u64),
    key_fragment: u8,
    key: &[u8],
    value: &[u8],
) -> Result<(), Interrupt> {
    let header = inner.header();
    let mut staging = Staging::new(ctx);
    let child = staging.terminal(header.level() + 1, key, value)?;

    if !inner.is_full() {
        header.lock_version_or_restart(version)?;
        let written = inner.write_child(ctx.pool, key_fragment, child);
        header.write_unlock();

        if !written {
            return Err(Interrupt::Restart);
        }
        staging.commit();
        return Ok(());
    }

    // The root has a slot for every byte, so a full node always has a parent
    let edge = edge.ok_or(NeedRestart)?;
    grow(ctx, &mut staging, edge, (node, inner, version), (key_fragment, child))?;
    staging.commit();
    Ok(())
}

/// Replace a full node by a copy with room for `extra`.
///
/// A compact node that is full only because of removed slots is rebuilt at
/// its own size.
fn grow(
    ctx: &Ctx<'_>,
    staging: &mut Staging<'_, '_>,
    edge: &Edge<'_>,
    (node, inner, version): (OpaqueNodePtr, InnerNodeRef<'_>, u64),
    extra: (u8, OpaqueNodePtr),
) -> Result<(), Interrupt> {
    let header = inner.header();
    let mut children = inner.children();
    children.push(extra);

    let node_type = NodeType::inner_for_children(children.len());
    let grown = staging.inner_with(node_type, header.level(), header.prefix(), children)?;

    edge.lock()?;
    if let Err(restart) = header.lock_version_or_restart(version) {
        edge.unlock();
        return Err(restart.into());
    }
    edge.replace(ctx.pool, grown);
    header.write_unlock_obsolete();
    edge.unlock();

    ctx.retire(node);
    ctx.stats.grown_nodes.increment();
    tracing::debug!(
        from = ?inner.node_type(),
        to = ?node_type,
        level = header.level(),
        "replaced full node"
    );
    Ok(())
}

/// A fixed node whose prefix diverges from the inserted key.
struct PrefixSplit<'e, 'a> {
    edge: &'e Edge<'a>,
    inner: InnerNodeRef<'a>,
    version: u64,
    /// Depth at which the node hangs.
    depth: usize,
    /// First prefix byte that differs from the key, relative to `depth`.
    position: usize,
    /// The full prefix of the node.
    prefix: &'e [u8],
}

impl PrefixSplit<'_, '_> {
    /// Put a new 4-way node holding the shared part of the prefix between the
    /// parent and the node, and shorten the prefix of the node.
    ///
    /// The new node is published before the old prefix is shortened. A crash
    /// in between leaves a prefix that is too long, which is healed by the
    /// next insert passing through the node.
    fn apply(self, ctx: &Ctx<'_>, key: &[u8], value: &[u8]) -> Result<(), Interrupt> {
        let header = self.inner.header();
        let level = header.level();
        let split = self.depth + self.position;

        let mut staging = Staging::new(ctx);
        let child = staging.terminal(split + 1, key, value)?;
        let node4 = staging.inner_with(
            NodeType::Node4,
            split,
            Prefix::new(&self.prefix[..self.position], self.position),
            [
                (self.prefix[self.position], self.edge.child),
                (key[split], child),
            ],
        )?;
        let shortened = Prefix::new(&self.prefix[self.position + 1..], level - split - 1);

        self.edge.lock()?;
        if let Err(restart) = header.lock_version_or_restart(self.version) {
            self.edge.unlock();
            return Err(restart.into());
        }
        self.edge.replace(ctx.pool, node4);
        header.set_prefix(ctx.pool, shortened);
        header.write_unlock();
        self.edge.unlock();

        staging.commit();
        tracing::debug!(level = split, below = level, "split node prefix");
        Ok(())
    }
}
