use crate::{
    error::NeedRestart,
    nodes::{check_prefix, Ctx, Edge, Header, LeafBucket, LeafNode, NodePtr, PrefixMatch, View},
};

/// Search for the leaf holding `key`.
///
/// Every node is read optimistically: its version is read before and
/// validated after the fields that decide where to go next. The version of
/// the parent is validated once the version of the child is known, so the
/// path is consistent from the root down to the leaf.
pub(crate) fn lookup(ctx: &Ctx<'_>, key: &[u8]) -> Result<Option<NodePtr<LeafNode>>, NeedRestart> {
    let mut node = ctx.root.to_opaque();
    let mut depth = 0;
    let mut parent: Option<(&Header, u64)> = None;

    loop {
        match View::of(ctx.pool, node) {
            View::Inner(inner) => {
                let header = inner.header();
                let version = header.read_lock_or_restart(ctx.generation)?;
                if let Some((header, version)) = parent {
                    header.read_unlock_or_restart(version)?;
                }

                if check_prefix(header, key, depth) == PrefixMatch::Mismatch {
                    header.read_unlock_or_restart(version)?;
                    return Ok(None);
                }

                let level = header.level();
                let child = inner.lookup_child(key[level]);
                header.read_unlock_or_restart(version)?;

                let Some(child) = child else {
                    return Ok(None);
                };
                parent = Some((header, version));
                node = child;
                depth = level + 1;
            },
            View::Fingerprint(bucket) => {
                let header = &bucket.header;
                let version = header.read_lock_or_restart(ctx.generation)?;
                if let Some((header, version)) = parent {
                    header.read_unlock_or_restart(version)?;
                }

                let level = header.level();
                let end = level + bucket.slice_len();
                let child = key
                    .get(level..end)
                    .and_then(|slice| bucket.find(ctx.pool, ctx.guard, slice))
                    .map(|slice| slice.child);
                header.read_unlock_or_restart(version)?;

                let Some(child) = child else {
                    return Ok(None);
                };
                parent = Some((header, version));
                node = child;
                depth = end;
            },
            View::LeafBucket(bucket) => {
                let header = &bucket.header;
                let version = header.read_lock_or_restart(ctx.generation)?;
                if let Some((header, version)) = parent {
                    header.read_unlock_or_restart(version)?;
                }

                let found = bucket.find(ctx.pool, ctx.guard, key);
                header.read_unlock_or_restart(version)?;
                return Ok(found.map(|(_, leaf)| leaf));
            },
            View::Leaf(leaf) => {
                if let Some((header, version)) = parent {
                    header.read_unlock_or_restart(version)?;
                }
                return Ok((leaf.key(ctx.pool, ctx.guard) == key).then_some(leaf));
            },
        }
    }
}

/// Where a leaf was found by [`locate`].
#[derive(Debug)]
pub(crate) enum Target<'a> {
    /// The leaf sits in `slot` of a bucket, which was at `version`.
    Bucket {
        bucket: &'a LeafBucket,
        version: u64,
        slot: usize,
        leaf: NodePtr<LeafNode>,
    },
    /// The leaf hangs from the last edge of the path.
    Direct(NodePtr<LeafNode>),
}

impl Target<'_> {
    pub fn leaf(&self) -> NodePtr<LeafNode> {
        match self {
            Target::Bucket { leaf, .. } | Target::Direct(leaf) => *leaf,
        }
    }
}

/// The path from the root to the leaf holding a key.
#[derive(Debug)]
pub(crate) struct Location<'a> {
    /// Every edge followed from the root, the last one leads to the bucket or
    /// the leaf.
    pub path: Vec<Edge<'a>>,
    /// Depth of the node holding the leaf: the bucket, or the parent of a
    /// direct leaf.
    pub depth: usize,
    pub target: Target<'a>,
}

/// Like [`lookup`], but keep the edges that were followed so that the caller
/// can lock its way back up.
pub(crate) fn locate<'a>(ctx: &Ctx<'a>, key: &[u8]) -> Result<Option<Location<'a>>, NeedRestart> {
    let mut path: Vec<Edge<'a>> = Vec::new();
    let mut node = ctx.root.to_opaque();
    let mut depth = 0;
    let mut parent_depth = 0;

    loop {
        match View::of(ctx.pool, node) {
            View::Inner(inner) => {
                let header = inner.header();
                let version = header.read_lock_or_restart(ctx.generation)?;
                if let Some(edge) = path.last() {
                    edge.validate()?;
                }

                if check_prefix(header, key, depth) == PrefixMatch::Mismatch {
                    header.read_unlock_or_restart(version)?;
                    return Ok(None);
                }

                let level = header.level();
                let child = inner.lookup_child(key[level]);
                header.read_unlock_or_restart(version)?;

                let Some(child) = child else {
                    return Ok(None);
                };
                path.push(Edge::inner(inner, version, key[level], child));
                parent_depth = depth;
                node = child;
                depth = level + 1;
            },
            View::Fingerprint(bucket) => {
                let header = &bucket.header;
                let version = header.read_lock_or_restart(ctx.generation)?;
                if let Some(edge) = path.last() {
                    edge.validate()?;
                }

                let level = header.level();
                let end = level + bucket.slice_len();
                let found = key
                    .get(level..end)
                    .and_then(|slice| bucket.find(ctx.pool, ctx.guard, slice));
                header.read_unlock_or_restart(version)?;

                let Some(found) = found else {
                    return Ok(None);
                };
                path.push(Edge::slice(bucket, version, found.slot, found.child));
                parent_depth = depth;
                node = found.child;
                depth = end;
            },
            View::LeafBucket(bucket) => {
                let header = &bucket.header;
                let version = header.read_lock_or_restart(ctx.generation)?;
                if let Some(edge) = path.last() {
                    edge.validate()?;
                }

                let found = bucket.find(ctx.pool, ctx.guard, key);
                header.read_unlock_or_restart(version)?;

                return Ok(found.map(|(slot, leaf)| Location {
                    path,
                    depth,
                    target: Target::Bucket {
                        bucket,
                        version,
                        slot,
                        leaf,
                    },
                }));
            },
            View::Leaf(leaf) => {
                let edge = path.last().ok_or(NeedRestart)?;
                edge.validate()?;
                if leaf.key(ctx.pool, ctx.guard) != key {
                    return Ok(None);
                }
                return Ok(Some(Location {
                    path,
                    depth: parent_depth,
                    target: Target::Direct(leaf),
                }));
            },
        }
    }
}
