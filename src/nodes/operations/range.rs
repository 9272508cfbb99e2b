use std::cmp::Ordering;

use crate::{
    error::NeedRestart,
    key::{compare_slice, Key},
    nodes::{load_prefix, Ctx, LeafNode, NodePtr, OpaqueNodePtr, View},
};

/// The part of the key space still to be collected below a node.
///
/// A bound is dropped as soon as the path to a node is known to be strictly
/// inside it, so that everything below the node is collected without further
/// comparisons.
#[derive(Debug, Clone, Copy)]
struct Bounds<'b> {
    /// Inclusive lower bound.
    start: Option<&'b [u8]>,
    /// Exclusive upper bound.
    end: Option<&'b [u8]>,
}

impl<'b> Bounds<'b> {
    fn contains(&self, key: &[u8]) -> bool {
        self.start.is_none_or(|start| key >= start) && self.end.is_none_or(|end| key < end)
    }

    /// Narrow the bounds to the keys that continue with `path`, which starts
    /// at byte `depth`. Returns `None` if no such key is inside the bounds.
    fn descend(mut self, path: &[u8], depth: usize) -> Option<Self> {
        if let Some(start) = self.start {
            match compare_slice(path, start, depth) {
                Ordering::Less => return None,
                Ordering::Greater => self.start = None,
                // Every key below is longer than the bound
                Ordering::Equal if start.len() <= depth + path.len() => self.start = None,
                Ordering::Equal => {},
            }
        }
        if let Some(end) = self.end {
            match compare_slice(path, end, depth) {
                Ordering::Greater => return None,
                Ordering::Less => self.end = None,
                Ordering::Equal if end.len() <= depth + path.len() => return None,
                Ordering::Equal => {},
            }
        }
        Some(self)
    }
}

/// Collect up to `limit` keys in `start..end` in ascending order.
///
/// Fixed nodes hand out their children in key order and fingerprint buckets
/// sort their slices, so the walk produces sorted output without buffering.
/// Only the leaves of a bucket are sorted explicitly. A node that changes
/// while it is read fails the whole scan.
pub(crate) fn scan(
    ctx: &Ctx<'_>,
    start: Option<&[u8]>,
    end: Option<&[u8]>,
    limit: usize,
) -> Result<Vec<Key>, NeedRestart> {
    let mut out = Vec::new();
    if let (Some(start), Some(end)) = (start, end) {
        if start >= end {
            return Ok(out);
        }
    }

    let mut scan = Scan {
        ctx,
        out: &mut out,
        limit,
    };
    scan.node(ctx.root.to_opaque(), 0, Bounds { start, end })?;
    Ok(out)
}

struct Scan<'s, 'c, 'a> {
    ctx: &'c Ctx<'a>,
    out: &'s mut Vec<Key>,
    limit: usize,
}

impl Scan<'_, '_, '_> {
    fn is_done(&self) -> bool {
        self.out.len() >= self.limit
    }

    fn push(&mut self, leaf: NodePtr<LeafNode>) {
        let ctx = self.ctx;
        self.out.push(Key::new(
            leaf.key(ctx.pool, ctx.guard),
            leaf.value(ctx.pool, ctx.guard),
        ));
    }

    fn node(&mut self, ptr: OpaqueNodePtr, depth: usize, bounds: Bounds<'_>) -> Result<(), NeedRestart> {
        if self.is_done() {
            return Ok(());
        }
        let ctx = self.ctx;

        match View::of(ctx.pool, ptr) {
            View::Leaf(leaf) => {
                if bounds.contains(leaf.key(ctx.pool, ctx.guard)) {
                    self.push(leaf);
                }
                Ok(())
            },
            View::LeafBucket(bucket) => {
                let version = bucket.header.read_lock_or_restart(ctx.generation)?;
                let mut leaves: Vec<_> = bucket
                    .leaves()
                    .map(|(_, leaf)| (leaf.key(ctx.pool, ctx.guard), leaf))
                    .filter(|(key, _)| bounds.contains(key))
                    .collect();
                bucket.header.read_unlock_or_restart(version)?;

                leaves.sort_unstable_by(|(a, _), (b, _)| a.cmp(b));
                for (_, leaf) in leaves {
                    if self.is_done() {
                        break;
                    }
                    self.push(leaf);
                }
                Ok(())
            },
            View::Fingerprint(bucket) => {
                let version = bucket.header.read_lock_or_restart(ctx.generation)?;
                let level = bucket.header.level();
                let below = level + bucket.slice_len();
                let children: Vec<_> = bucket
                    .sorted(ctx.pool, ctx.guard)
                    .into_iter()
                    .filter_map(|slice| Some((slice.child, bounds.descend(slice.bytes, level)?)))
                    .collect();
                bucket.header.read_unlock_or_restart(version)?;

                for (child, bounds) in children {
                    self.node(child, below, bounds)?;
                }
                Ok(())
            },
            View::Inner(inner) => {
                let header = inner.header();
                let version = header.read_lock_or_restart(ctx.generation)?;
                let level = header.level();

                // An empty bound is settled by the empty prefix of the root
                let bounds = load_prefix(ctx, ptr, header, depth)?
                    .and_then(|prefix| bounds.descend(&prefix, depth));
                let Some(bounds) = bounds else {
                    return header.read_unlock_or_restart(version);
                };

                let low = bounds.start.map_or(0, |start| start[level]);
                let high = bounds.end.map_or(u8::MAX, |end| end[level]);
                let children = inner.children_between(low, high);
                header.read_unlock_or_restart(version)?;

                for (key_fragment, child) in children {
                    let bounds = Bounds {
                        start: bounds.start.filter(|_| key_fragment == low),
                        end: bounds.end.filter(|_| key_fragment == high),
                    };
                    self.node(child, level + 1, bounds)?;
                }
                Ok(())
            },
        }
    }
}
