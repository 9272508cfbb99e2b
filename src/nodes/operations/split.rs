//! Splitting full buckets
//!
//! A bucket is never modified in place to make room. The replacement subtree
//! is built off to the side, made durable, and swapped in with a single write
//! to the parent slot. A crash before that write leaves unreachable nodes
//! behind, which the rebuild pass returns to the pool.

use std::collections::BTreeMap;

use super::insert::prefix_conflict;
use crate::{
    error::Interrupt,
    key::{common_prefix_len, fingerprint},
    nodes::{
        unlink_subtree, Ctx, Edge, FingerprintBucket, LeafBucket, LeafNode, NodePtr, NodeType,
        OpaqueNodePtr, Prefix, Staging,
    },
};

/// Replace a full leaf bucket by a node that routes on the first byte where
/// its keys differ.
///
/// The keys of the bucket and the key being inserted are compared from the
/// depth of the bucket. When they share bytes past that depth and fingerprint
/// buckets are enabled, the shared run and the first differing byte are
/// consumed by a fingerprint bucket. Otherwise a fixed node with the shared
/// run as its prefix takes the place of the bucket. Either way the leaves move
/// into one new bucket per distinct byte.
pub(crate) fn split_leaf_bucket(
    ctx: &Ctx<'_>,
    edge: &Edge<'_>,
    bucket: &LeafBucket,
    version: u64,
    key: &[u8],
) -> Result<(), Interrupt> {
    let header = &bucket.header;
    let depth = header.level();
    let leaves: Vec<(NodePtr<LeafNode>, &[u8])> = bucket
        .leaves()
        .map(|(_, leaf)| (leaf, leaf.key(ctx.pool, ctx.guard)))
        .collect();
    header.read_unlock_or_restart(version)?;

    let shared = leaves
        .iter()
        .map(|(_, other)| common_prefix_len(key, other, depth))
        .min()
        .unwrap_or(0);
    let split = depth + shared;
    if key.len() <= split || leaves.iter().any(|(_, other)| other.len() <= split) {
        return Err(prefix_conflict(key));
    }

    let mut groups: BTreeMap<u8, Vec<(NodePtr<LeafNode>, &[u8])>> = BTreeMap::new();
    for (leaf, other) in leaves {
        groups.entry(other[split]).or_default().push((leaf, other));
    }

    let mut staging = Staging::new(ctx);
    let replacement = if ctx.config.fingerprint_buckets && shared > 0 {
        let ptr = staging.fingerprint_bucket(depth, shared + 1)?;
        let node = ptr.read(ctx.pool);
        for group in groups.values() {
            let child = group_bucket(&mut staging, split + 1, group)?;
            let inserted = node.insert(ctx.pool, &group[0].1[depth..=split], child)?;
            debug_assert!(inserted, "more groups than fingerprint slots");
        }
        ptr.to_opaque()
    } else {
        let mut children = Vec::with_capacity(groups.len());
        for (key_fragment, group) in &groups {
            children.push((*key_fragment, group_bucket(&mut staging, split + 1, group)?));
        }
        staging.inner_with(
            NodeType::inner_for_children(children.len()),
            split,
            Prefix::new(&key[depth..split], shared),
            children,
        )?
    };

    edge.lock()?;
    if let Err(restart) = header.lock_version_or_restart(version) {
        edge.unlock();
        return Err(restart.into());
    }
    edge.replace(ctx.pool, replacement);
    header.write_unlock_obsolete();
    edge.unlock();
    staging.commit();

    // Only the bucket goes, the leaves moved to the new buckets
    ctx.retire(edge.child);
    ctx.stats.bucket_splits.increment();
    tracing::debug!(
        depth,
        shared,
        groups = groups.len(),
        into = ?replacement.node_type(),
        "split leaf bucket"
    );
    Ok(())
}

fn group_bucket(
    staging: &mut Staging<'_, '_>,
    depth: usize,
    group: &[(NodePtr<LeafNode>, &[u8])],
) -> crate::Result<OpaqueNodePtr> {
    let bucket = staging.leaf_bucket_with(
        depth,
        group.iter().map(|(leaf, key)| (fingerprint(key), *leaf)),
    )?;
    Ok(bucket.to_opaque())
}

/// Replace a fingerprint bucket that cannot take `key` by a fixed node that
/// routes on the first byte where the slices differ.
///
/// This happens when the bucket is full, or when `key` ends before a whole
/// slice. Slices that are consumed by the new node keep their child, the
/// others are trimmed and moved into one fingerprint bucket per byte.
pub(crate) fn split_fingerprint_bucket(
    ctx: &Ctx<'_>,
    edge: &Edge<'_>,
    bucket: &FingerprintBucket,
    version: u64,
    key: &[u8],
) -> Result<(), Interrupt> {
    let header = &bucket.header;
    let level = header.level();
    let slice_len = bucket.slice_len();
    let slices = bucket.sorted(ctx.pool, ctx.guard);
    header.read_unlock_or_restart(version)?;

    let Some(first) = slices.first() else {
        // Left empty by a crash
        unlink_subtree(ctx, edge, None)?;
        return Ok(());
    };

    let rest = key.get(level..).unwrap_or_default();
    let shared = slices
        .iter()
        .map(|slice| common_prefix_len(first.bytes, slice.bytes, 0))
        .chain([common_prefix_len(first.bytes, rest, 0)])
        .min()
        .unwrap_or(0);
    if rest.len() <= shared {
        return Err(prefix_conflict(key));
    }
    if shared >= slice_len {
        // Only possible if the bucket changed under us
        return Err(Interrupt::Restart);
    }

    let mut groups: BTreeMap<u8, Vec<(&[u8], OpaqueNodePtr)>> = BTreeMap::new();
    for slice in &slices {
        groups
            .entry(slice.bytes[shared])
            .or_default()
            .push((&slice.bytes[shared + 1..], slice.child));
    }

    let mut staging = Staging::new(ctx);
    let mut children = Vec::with_capacity(groups.len());
    for (key_fragment, group) in &groups {
        let child = if shared + 1 == slice_len {
            // Distinct slices that are used up by the new node
            group[0].1
        } else {
            let ptr = staging.fingerprint_bucket(level + shared + 1, slice_len - shared - 1)?;
            let node = ptr.read(ctx.pool);
            for (trimmed, child) in group {
                let inserted = node.insert(ctx.pool, trimmed, *child)?;
                debug_assert!(inserted, "more slices than fingerprint slots");
            }
            ptr.to_opaque()
        };
        children.push((*key_fragment, child));
    }
    let replacement = staging.inner_with(
        NodeType::inner_for_children(children.len()),
        level + shared,
        Prefix::new(&first.bytes[..shared], shared),
        children,
    )?;

    edge.lock()?;
    if let Err(restart) = header.lock_version_or_restart(version) {
        edge.unlock();
        return Err(restart.into());
    }
    edge.replace(ctx.pool, replacement);
    header.write_unlock_obsolete();
    edge.unlock();
    staging.commit();

    // The slice buffers of the old bucket go with it
    ctx.retire(edge.child);
    ctx.stats.fingerprint_splits.increment();
    tracing::debug!(
        level,
        slice_len,
        shared,
        groups = groups.len(),
        "split fingerprint bucket"
    );
    Ok(())
}
