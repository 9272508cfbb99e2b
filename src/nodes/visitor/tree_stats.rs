use std::{
    fmt,
    ops::{Range, RangeInclusive},
};

use super::{TreeView, Visitable, Visitor};
use crate::{FingerprintBucket, InnerNodeRef, LeafBucket, LeafNode, NodePtr, NodeType, Tree};

/// A visitor of the radix tree which takes a census of its nodes: how many
/// nodes of each type, how full they are, and how many bytes they use.
#[derive(Debug)]
pub struct TreeStatsCollector {
    stats: NodeCensus,
}

impl TreeStatsCollector {
    /// Run the census on the given tree, then return the accumulated stats.
    ///
    /// Nodes are read without locks, so the counts are only exact while no
    /// other thread writes to the tree.
    pub fn collect(tree: &Tree) -> NodeCensus {
        let mut collector = TreeStatsCollector {
            stats: NodeCensus::new(),
        };

        tree.with_view(|view, root| root.visit_with(view, &mut collector));

        collector.stats
    }

    /// Iterate through the given tree and return the number of leaves.
    pub fn count_leaves(tree: &Tree) -> usize {
        struct LeafCounter;

        impl Visitor for LeafCounter {
            type Output = usize;

            fn default_output(&self) -> Self::Output {
                0
            }

            fn combine_output(&self, o1: Self::Output, o2: Self::Output) -> Self::Output {
                o1 + o2
            }

            fn visit_leaf(&mut self, _view: TreeView<'_>, _t: NodePtr<LeafNode>) -> Self::Output {
                1
            }
        }

        tree.with_view(|view, root| root.visit_with(view, &mut LeafCounter))
    }
}

fn capacity_range(node_type: NodeType) -> Range<u64> {
    0..(node_type.upper_capacity() as u64 + 1)
}

/// Counts of every node type present in a tree, and how they are filled.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeCensus {
    node4_num_children_dist: ExactHistogram,
    node16_num_children_dist: ExactHistogram,
    node48_num_children_dist: ExactHistogram,
    node256_num_children_dist: ExactHistogram,
    leaf_bucket_fill_dist: ExactHistogram,
    fingerprint_bucket_fill_dist: ExactHistogram,
    leaf_count: u64,
    total_key_bytes: u64,
    total_value_bytes: u64,
    total_leaf_bytes: u64,
    total_node_bytes: u64,
    max_level: usize,
}

impl fmt::Display for NodeCensus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        struct DisplayAsDebug<'a, T>(&'a T);

        impl<T: fmt::Display> fmt::Debug for DisplayAsDebug<'_, T> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                <T as fmt::Display>::fmt(self.0, f)
            }
        }

        f.debug_struct("NodeCensus")
            .field("node4", &DisplayAsDebug(&self.node4_num_children_dist))
            .field("node16", &DisplayAsDebug(&self.node16_num_children_dist))
            .field("node48", &DisplayAsDebug(&self.node48_num_children_dist))
            .field("node256", &DisplayAsDebug(&self.node256_num_children_dist))
            .field("leaf_buckets", &DisplayAsDebug(&self.leaf_bucket_fill_dist))
            .field(
                "fingerprint_buckets",
                &DisplayAsDebug(&self.fingerprint_bucket_fill_dist),
            )
            .field("leaf_count", &self.leaf_count)
            .field("total_key_bytes", &self.total_key_bytes)
            .field("total_value_bytes", &self.total_value_bytes)
            .field("total_node_bytes", &self.total_node_bytes)
            .field("max_level", &self.max_level)
            .field("empty_capacity", &self.empty_capacity())
            .finish()
    }
}

impl NodeCensus {
    fn new() -> Self {
        Self {
            node4_num_children_dist: ExactHistogram::new(capacity_range(NodeType::Node4)),
            node16_num_children_dist: ExactHistogram::new(capacity_range(NodeType::Node16)),
            node48_num_children_dist: ExactHistogram::new(capacity_range(NodeType::Node48)),
            node256_num_children_dist: ExactHistogram::new(capacity_range(NodeType::Node256)),
            leaf_bucket_fill_dist: ExactHistogram::new(capacity_range(NodeType::LeafBucket)),
            fingerprint_bucket_fill_dist: ExactHistogram::new(capacity_range(
                NodeType::FingerprintBucket,
            )),
            leaf_count: 0,
            total_key_bytes: 0,
            total_value_bytes: 0,
            total_leaf_bytes: 0,
            total_node_bytes: 0,
            max_level: 0,
        }
    }

    fn dist(&self, node_type: NodeType) -> Option<&ExactHistogram> {
        match node_type {
            NodeType::Node4 => Some(&self.node4_num_children_dist),
            NodeType::Node16 => Some(&self.node16_num_children_dist),
            NodeType::Node48 => Some(&self.node48_num_children_dist),
            NodeType::Node256 => Some(&self.node256_num_children_dist),
            NodeType::LeafBucket => Some(&self.leaf_bucket_fill_dist),
            NodeType::FingerprintBucket => Some(&self.fingerprint_bucket_fill_dist),
            NodeType::Leaf => None,
        }
    }

    /// Number of nodes of the given type present in the tree.
    pub fn count(&self, node_type: NodeType) -> u64 {
        match self.dist(node_type) {
            Some(dist) => dist.total_count(),
            None => self.leaf_count,
        }
    }

    /// Number of [`InnerNode4`][crate::nodes::InnerNode4]s present in the tree.
    pub fn node4_count(&self) -> u64 {
        self.count(NodeType::Node4)
    }

    /// Number of [`InnerNode16`][crate::nodes::InnerNode16]s present in the
    /// tree.
    pub fn node16_count(&self) -> u64 {
        self.count(NodeType::Node16)
    }

    /// Number of [`InnerNode48`][crate::nodes::InnerNode48]s present in the
    /// tree.
    pub fn node48_count(&self) -> u64 {
        self.count(NodeType::Node48)
    }

    /// Number of [`InnerNode256`][crate::nodes::InnerNode256]s present in the
    /// tree, the root included.
    pub fn node256_count(&self) -> u64 {
        self.count(NodeType::Node256)
    }

    /// Number of [`LeafBucket`]s present in the tree.
    pub fn leaf_bucket_count(&self) -> u64 {
        self.count(NodeType::LeafBucket)
    }

    /// Number of [`FingerprintBucket`]s present in the tree.
    pub fn fingerprint_bucket_count(&self) -> u64 {
        self.count(NodeType::FingerprintBucket)
    }

    /// Number of leaves present in the tree.
    pub fn leaf_count(&self) -> u64 {
        self.leaf_count
    }

    /// The deepest level of any fixed node or bucket.
    pub fn max_level(&self) -> usize {
        self.max_level
    }

    /// The number of empty slots in fixed nodes and buckets.
    ///
    /// This value is useful to measure occupancy in the tree, and how much
    /// space is potentially wasted.
    pub fn empty_capacity(&self) -> u64 {
        NodeType::ALL
            .into_iter()
            .filter_map(|node_type| Some((node_type, self.dist(node_type)?)))
            .flat_map(|(node_type, dist)| {
                dist.entries().map(move |(value, count)| {
                    count * (node_type.upper_capacity() as u64 - value)
                })
            })
            .sum()
    }

    /// Average number of leaves per leaf bucket.
    pub fn mean_bucket_fill(&self) -> f64 {
        let dist = &self.leaf_bucket_fill_dist;
        if dist.total_count() == 0 {
            return 0.0;
        }
        let leaves: u64 = dist.entries().map(|(value, count)| value * count).sum();
        leaves as f64 / dist.total_count() as f64
    }

    /// The total number of bytes of keys stored in the tree.
    pub fn total_key_bytes(&self) -> u64 {
        self.total_key_bytes
    }

    /// The total number of bytes of values stored in the tree.
    pub fn total_value_bytes(&self) -> u64 {
        self.total_value_bytes
    }

    /// The total number of pool bytes used by nodes other than leaves,
    /// fingerprint slice buffers included.
    pub fn total_node_bytes(&self) -> u64 {
        self.total_node_bytes
    }

    /// The total number of pool bytes used by leaves.
    pub fn total_leaf_bytes(&self) -> u64 {
        self.total_leaf_bytes
    }

    /// Returns the number of bytes of overhead per byte of key stored in the
    /// tree.
    ///
    /// Overhead in this case is all bytes used by nodes other than leaves.
    pub fn overhead_per_key_byte(&self) -> f64 {
        (self.total_node_bytes as f64) / (self.total_key_bytes as f64)
    }

    fn record_node(&mut self, node_type: NodeType, level: usize, filled: usize, extra: usize) {
        let dist = match node_type {
            NodeType::Node4 => &mut self.node4_num_children_dist,
            NodeType::Node16 => &mut self.node16_num_children_dist,
            NodeType::Node48 => &mut self.node48_num_children_dist,
            NodeType::Node256 => &mut self.node256_num_children_dist,
            NodeType::LeafBucket => &mut self.leaf_bucket_fill_dist,
            NodeType::FingerprintBucket => &mut self.fingerprint_bucket_fill_dist,
            NodeType::Leaf => return,
        };
        dist.record(filled as u64);
        self.total_node_bytes +=
            (node_type.allocation_size().unwrap_or_default() + extra) as u64;
        self.max_level = self.max_level.max(level);
    }
}

impl Visitor for TreeStatsCollector {
    type Output = ();

    fn default_output(&self) -> Self::Output {}

    fn combine_output(&self, _: Self::Output, _: Self::Output) -> Self::Output {}

    fn visit_inner(&mut self, view: TreeView<'_>, t: InnerNodeRef<'_>) -> Self::Output {
        t.super_visit_with(view, self);
        self.stats
            .record_node(t.node_type(), t.header().level(), t.num_children(), 0);
    }

    fn visit_leaf_bucket(&mut self, view: TreeView<'_>, t: &LeafBucket) -> Self::Output {
        t.super_visit_with(view, self);
        self.stats
            .record_node(NodeType::LeafBucket, t.header.level(), t.len(), 0);
    }

    fn visit_fingerprint_bucket(
        &mut self,
        view: TreeView<'_>,
        t: &FingerprintBucket,
    ) -> Self::Output {
        t.super_visit_with(view, self);
        let buffers = t.buffers().count() * crate::pool::round_to_cache_line(t.slice_len());
        self.stats.record_node(
            NodeType::FingerprintBucket,
            t.header.level(),
            t.len(),
            buffers,
        );
    }

    fn visit_leaf(&mut self, view: TreeView<'_>, t: NodePtr<LeafNode>) -> Self::Output {
        self.stats.leaf_count += 1;
        self.stats.total_key_bytes += t.key(view.pool, view.guard).len() as u64;
        self.stats.total_value_bytes += t.value(view.pool, view.guard).len() as u64;
        self.stats.total_leaf_bytes += t.allocation_size(view.pool) as u64;
    }
}

/// A discrete distribution of the values in a small range.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ExactHistogram {
    value_range: Range<u64>,
    counts: Vec<u64>,
    total_count: u64,
}

impl fmt::Display for ExactHistogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();

        let mut zeros: Vec<RangeInclusive<u64>> = vec![];
        map.entries(self.entries().filter(|(value, count)| {
            let is_zero = *count == 0;

            if is_zero {
                match zeros.last_mut() {
                    Some(last) if *last.end() + 1 == *value => {
                        *last = (*last.start())..=(*value);
                    },
                    _ => zeros.push(*value..=*value),
                }
            }

            !is_zero
        }));

        if !zeros.is_empty() {
            map.entry(
                &"zeros",
                &zeros
                    .into_iter()
                    .map(|range| {
                        if range.start() == range.end() {
                            range.start().to_string()
                        } else {
                            format!("{}..={}", range.start(), range.end())
                        }
                    })
                    .collect::<Vec<_>>(),
            );
        }

        map.entry(&"total", &self.total_count());

        map.finish()
    }
}

impl ExactHistogram {
    /// Create a new histogram that will accept the given range of values.
    fn new(value_range: Range<u64>) -> Self {
        Self {
            counts: vec![0; (value_range.end - value_range.start) as usize],
            value_range,
            total_count: 0,
        }
    }

    /// Record a value in the histogram, incrementing its count by 1.
    ///
    /// # Panics
    ///
    /// This method will panic if the given value is not in the `value_range`
    /// that this histogram was created with.
    fn record(&mut self, value: u64) {
        assert!(
            self.value_range.contains(&value),
            "Value was not in expected range [{}, {}): {value}",
            self.value_range.start,
            self.value_range.end,
        );

        self.counts[(value - self.value_range.start) as usize] += 1;
        self.total_count += 1;
    }

    /// Return an iterator over the pairs of `(value, count)`, including
    /// `count`s of 0.
    fn entries(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.counts
            .iter()
            .enumerate()
            .map(move |(idx, count)| (idx as u64 + self.value_range.start, *count))
    }

    /// Return the total number of values recorded.
    fn total_count(&self) -> u64 {
        self.total_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Key, LeafLayout, TreeConfig};

    #[test]
    fn exact_histogram_display_groups_zeros() {
        let mut hist = ExactHistogram::new(0..5);
        hist.record(1);
        hist.record(1);
        hist.record(4);

        assert_eq!(hist.total_count(), 3);
        assert_eq!(
            hist.to_string(),
            r#"{1: 2, 4: 1, "zeros": ["0", "2..=3"], "total": 3}"#
        );
    }

    #[test]
    fn census_of_empty_tree() {
        let tree = Tree::volatile(TreeConfig::default(), 1 << 22).unwrap();
        let census = TreeStatsCollector::collect(&tree);

        assert_eq!(census.node256_count(), 1);
        assert_eq!(census.leaf_count(), 0);
        assert_eq!(census.empty_capacity(), 256);
        assert_eq!(TreeStatsCollector::count_leaves(&tree), 0);
    }

    #[test]
    fn census_counts_buckets_and_leaves() {
        let tree = Tree::volatile(TreeConfig::default(), 1 << 22).unwrap();
        for key in ["apple", "app", "apricot", "banana"] {
            let _ = tree.insert(&Key::from((key, "v"))).unwrap();
        }

        let census = TreeStatsCollector::collect(&tree);
        assert_eq!(census.leaf_count(), 4);
        assert_eq!(census.leaf_bucket_count(), 2);
        assert_eq!(census.mean_bucket_fill(), 2.0);
        assert_eq!(census.total_key_bytes(), 5 + 3 + 7 + 6);
        assert_eq!(census.total_value_bytes(), 4);
        assert_eq!(census.max_level(), 1);
        assert_eq!(TreeStatsCollector::count_leaves(&tree), 4);
    }

    #[test]
    fn census_of_direct_layout_has_no_buckets() {
        let config = TreeConfig {
            leaf_layout: LeafLayout::Direct,
            ..TreeConfig::default()
        };
        let tree = Tree::volatile(config, 1 << 22).unwrap();
        for key in ["abc", "abd", "abe", "abf", "abg"] {
            let _ = tree.insert(&Key::from((key, "v"))).unwrap();
        }

        let census = TreeStatsCollector::collect(&tree);
        assert_eq!(census.leaf_count(), 5);
        assert_eq!(census.leaf_bucket_count(), 0);
        assert_eq!(census.node16_count(), 1);
        assert_eq!(census.node4_count(), 0);
        assert_eq!(census.max_level(), 2);
    }
}
