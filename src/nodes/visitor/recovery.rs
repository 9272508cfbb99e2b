//! Rebuild of the volatile state of a reopened pool.
//!
//! A crash can leave nodes locked, bucket bitmaps that disagree with their
//! slots, subtrees that lost their last leaf, and allocations that were never
//! linked into the tree. One single-threaded pass over the tree repairs the
//! nodes it reaches and collects every range that is still reachable. All
//! other space is handed back to the pool.

use super::{TreeView, Visitable, Visitor};
use crate::{
    nodes::{FingerprintBucket, InnerNodeRef, LeafBucket, LeafNode, NodePtr, NodeType},
    OpaqueNodePtr,
};

/// What the rebuild pass found and changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Fixed nodes and buckets still reachable.
    pub nodes: u64,
    /// Leaves still reachable.
    pub leaves: u64,
    /// Bucket slots whose bitmap bit was wrong.
    pub repaired_slots: u64,
    /// Subtrees without any leaf that were unlinked.
    pub pruned: u64,
    /// Bytes that became available for allocation again.
    pub reclaimed_bytes: u64,
}

pub(crate) struct Recovery {
    generation: u64,
    root: u64,
    live: Vec<(u64, usize)>,
    report: RecoveryReport,
}

impl Recovery {
    /// Repair the tree below `root` and rebuild the free lists of the pool.
    ///
    /// Nothing else may access the pool while this runs.
    pub(crate) fn run(view: TreeView<'_>, root: OpaqueNodePtr, generation: u64) -> RecoveryReport {
        let mut visitor = Recovery {
            generation,
            root: root.offset(),
            live: Vec::new(),
            report: RecoveryReport::default(),
        };
        root.visit_with(view, &mut visitor);

        let Recovery {
            live, mut report, ..
        } = visitor;
        report.reclaimed_bytes = view.pool.rebuild_free_lists(live);
        report
    }

    fn keep_node(&mut self, offset: u64, node_type: NodeType) {
        if let Some(size) = node_type.allocation_size() {
            self.live.push((offset, size));
        }
        self.report.nodes += 1;
    }
}

impl Visitor for Recovery {
    /// Whether the subtree still holds a leaf.
    type Output = bool;

    fn default_output(&self) -> Self::Output {
        false
    }

    fn combine_output(&self, o1: Self::Output, o2: Self::Output) -> Self::Output {
        o1 || o2
    }

    fn visit_inner(&mut self, view: TreeView<'_>, t: InnerNodeRef<'_>) -> Self::Output {
        let header = t.header();
        header.reset(self.generation);
        t.recount(view.pool);

        for (key_fragment, child) in t.children() {
            if !child.visit_with(view, self) {
                t.remove_child(view.pool, key_fragment);
                self.report.pruned += 1;
            }
        }

        let offset = view.offset_of(header);
        let kept = t.num_children() > 0 || offset == self.root;
        if kept {
            self.keep_node(offset, t.node_type());
        }
        kept
    }

    fn visit_leaf_bucket(&mut self, view: TreeView<'_>, t: &LeafBucket) -> Self::Output {
        t.header.reset(self.generation);
        self.report.repaired_slots += u64::from(t.reload(view.pool));

        if t.is_empty() {
            return false;
        }
        t.super_visit_with(view, self);
        self.keep_node(view.offset_of(t), NodeType::LeafBucket);
        true
    }

    fn visit_fingerprint_bucket(
        &mut self,
        view: TreeView<'_>,
        t: &FingerprintBucket,
    ) -> Self::Output {
        t.header.reset(self.generation);
        self.report.repaired_slots += u64::from(t.reload(view.pool));

        for slice in t.sorted(view.pool, view.guard) {
            if slice.child.visit_with(view, self) {
                if let Some(buffer) = t.buffer(slice.slot) {
                    self.live.push((buffer, t.slice_len()));
                }
            } else {
                // The slice buffer is not kept either
                t.remove_at(view.pool, slice.slot);
                self.report.pruned += 1;
            }
        }

        if t.is_empty() {
            return false;
        }
        self.keep_node(view.offset_of(t), NodeType::FingerprintBucket);
        true
    }

    fn visit_leaf(&mut self, view: TreeView<'_>, t: NodePtr<LeafNode>) -> Self::Output {
        self.live.push((t.offset(), t.allocation_size(view.pool)));
        self.report.leaves += 1;
        true
    }
}
