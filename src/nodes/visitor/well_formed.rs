use std::{
    collections::{hash_map::Entry, HashMap},
    fmt,
};

use super::{escape_bytes, TreeView, Visitable, Visitor};
use crate::{
    nodes::any_leaf, FingerprintBucket, Header, InnerNodeRef, LeafBucket, LeafNode, NodePtr,
    NodeType, OpaqueNodePtr, Tree,
};

/// A portion of an entire key that should uniquely identify each node in
/// the tree.
///
/// We assume that this should be unique for each node given no loops in the
/// tree.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct KeyPrefix(Box<[u8]>);

impl From<&[u8]> for KeyPrefix {
    fn from(src: &[u8]) -> Self {
        KeyPrefix(Box::from(src))
    }
}

impl<const LEN: usize> PartialEq<[u8; LEN]> for KeyPrefix {
    fn eq(&self, other: &[u8; LEN]) -> bool {
        self.0.as_ref() == other.as_slice()
    }
}

impl fmt::Display for KeyPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", escape_bytes(&self.0))
    }
}

/// An issue with the well-formed-ness of the tree. See the documentation on
/// [`WellFormedChecker`] for more context.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedTreeError {
    /// A loop was observed between nodes
    #[error(
        "Found a loop in the tree at node {offset:#x}, first observed at {first_observed} and \
         later at {later_observed}"
    )]
    LoopFound {
        /// Pool offset of the node that was observed more than once
        offset: u64,
        /// The key prefix when the node was first observed
        first_observed: KeyPrefix,
        /// The key prefix when the node was observed a second time
        later_observed: KeyPrefix,
    },
    /// A node other than the root had no children
    #[error("Found a {node_type:?} at {key_prefix} with {num_children} children")]
    WrongChildrenCount {
        /// The key prefix identifying the node
        key_prefix: KeyPrefix,
        /// The type of the node
        ///
        /// This field is guaranteed not to be [`NodeType::Leaf`]
        node_type: NodeType,
        /// The number of children found at the node
        num_children: usize,
    },
    /// The level of a node does not fit the path that leads to it
    #[error("Found a {node_type:?} at {key_prefix} with level {level}")]
    WrongLevel {
        /// The key prefix identifying the node
        key_prefix: KeyPrefix,
        /// The type of the node
        node_type: NodeType,
        /// The level recorded in the node header
        level: usize,
    },
    /// The prefix of a fixed node does not cover the bytes between the depth
    /// at which it hangs and its level
    #[error(
        "Found a node at {key_prefix} with level {level} and a prefix of {prefix_len} bytes"
    )]
    WrongPrefixLength {
        /// The key prefix identifying the node
        key_prefix: KeyPrefix,
        /// The level recorded in the node header
        level: usize,
        /// The logical length of the node prefix
        prefix_len: usize,
    },
    /// The type recorded in a node header differs from the type of the
    /// pointer to it
    #[error("Found a {tagged:?} at {key_prefix} whose header records {recorded:?}")]
    TypeMismatch {
        /// The key prefix identifying the node
        key_prefix: KeyPrefix,
        /// The type in the tag bits of the pointer
        tagged: NodeType,
        /// The type in the header
        recorded: Option<NodeType>,
    },
    /// The expected key prefix did not match the actual prefix that was present
    /// in the leaf
    #[error("Expected key prefix {expected_prefix}, found key \"{}\"", escape_bytes(.entire_key))]
    PrefixMismatch {
        /// The expected key prefix
        expected_prefix: KeyPrefix,
        /// The entire key
        entire_key: Box<[u8]>,
    },
}

/// A visitor of the radix tree which checks that the tree is well-formed.
///
/// "Well-formed" here means:
///  - every node is reachable through exactly one path,
///  - every node other than the root has at least one child,
///  - the header of every node agrees with the pointer to it,
///  - buckets sit at the depth where they hang, and the prefix of every fixed
///    node covers the bytes between that depth and its level,
///  - every key stored below a node continues the path to that node.
///
/// Prefixes left stale by an interrupted structure change are reported as
/// malformed, even though operations heal them on the fly.
pub struct WellFormedChecker {
    current_key_prefix: Vec<u8>,
    seen_nodes: HashMap<u64, KeyPrefix>,
    root: u64,
}

impl WellFormedChecker {
    /// Traverse the given tree and check that it is well-formed. Returns the
    /// number of leaves.
    ///
    /// The tree must not be modified while it is checked.
    pub fn check(tree: &Tree) -> Result<usize, MalformedTreeError> {
        tree.with_view(|view, root| {
            let mut visitor = WellFormedChecker {
                current_key_prefix: Vec::new(),
                seen_nodes: HashMap::new(),
                root: root.offset(),
            };
            root.visit_with(view, &mut visitor)
        })
    }

    fn key_prefix(&self) -> KeyPrefix {
        KeyPrefix::from(self.current_key_prefix.as_slice())
    }

    fn mark_seen(&mut self, offset: u64) -> Result<(), MalformedTreeError> {
        let key_prefix = self.key_prefix();
        match self.seen_nodes.entry(offset) {
            Entry::Occupied(entry) => Err(MalformedTreeError::LoopFound {
                offset,
                first_observed: entry.get().clone(),
                later_observed: key_prefix,
            }),
            Entry::Vacant(entry) => {
                entry.insert(key_prefix);
                Ok(())
            },
        }
    }

    /// The checks shared by fixed nodes and buckets.
    fn check_node(
        &mut self,
        view: TreeView<'_>,
        node_type: NodeType,
        header: &Header,
        num_children: usize,
    ) -> Result<(), MalformedTreeError> {
        let offset = view.offset_of(header);
        self.mark_seen(offset)?;

        if header.node_type() != Some(node_type) {
            return Err(MalformedTreeError::TypeMismatch {
                key_prefix: self.key_prefix(),
                tagged: node_type,
                recorded: header.node_type(),
            });
        }
        if num_children == 0 && offset != self.root {
            return Err(MalformedTreeError::WrongChildrenCount {
                key_prefix: self.key_prefix(),
                node_type,
                num_children,
            });
        }
        Ok(())
    }

    fn visit_child(
        &mut self,
        view: TreeView<'_>,
        path: &[u8],
        child: OpaqueNodePtr,
    ) -> Result<usize, MalformedTreeError> {
        let len = self.current_key_prefix.len();
        self.current_key_prefix.extend_from_slice(path);
        let output = child.visit_with(view, self);
        self.current_key_prefix.truncate(len);
        output
    }
}

impl Visitor for WellFormedChecker {
    type Output = Result<usize, MalformedTreeError>;

    fn default_output(&self) -> Self::Output {
        Ok(0)
    }

    fn combine_output(&self, o1: Self::Output, o2: Self::Output) -> Self::Output {
        Ok(o1? + o2?)
    }

    fn visit_inner(&mut self, view: TreeView<'_>, t: InnerNodeRef<'_>) -> Self::Output {
        let header = t.header();
        let children = t.children();
        self.check_node(view, t.node_type(), header, children.len())?;

        let depth = self.current_key_prefix.len();
        let level = header.level();
        if level < depth {
            return Err(MalformedTreeError::WrongLevel {
                key_prefix: self.key_prefix(),
                node_type: t.node_type(),
                level,
            });
        }
        let prefix = header.prefix();
        if prefix.count() != level - depth {
            return Err(MalformedTreeError::WrongPrefixLength {
                key_prefix: self.key_prefix(),
                level,
                prefix_len: prefix.count(),
            });
        }

        // Prefix bytes that are not stored inline are taken from any leaf, the
        // leaves themselves are checked against the whole path
        let mut path = prefix.stored().to_vec();
        if !prefix.is_complete() {
            let Some(leaf) = children
                .iter()
                .find_map(|(_, child)| any_leaf(view, *child))
            else {
                return Ok(0);
            };
            let key = leaf.key(view.pool, view.guard);
            match key.get(depth..level) {
                Some(bytes) if bytes.starts_with(&path) => path = bytes.to_vec(),
                _ => {
                    return Err(MalformedTreeError::PrefixMismatch {
                        expected_prefix: self.key_prefix(),
                        entire_key: key.into(),
                    })
                },
            }
        }

        let mut leaves = 0;
        for (key_fragment, child) in children {
            path.push(key_fragment);
            leaves += self.visit_child(view, &path, child)?;
            path.pop();
        }
        Ok(leaves)
    }

    fn visit_leaf_bucket(&mut self, view: TreeView<'_>, t: &LeafBucket) -> Self::Output {
        self.check_node(view, NodeType::LeafBucket, &t.header, t.len())?;
        if t.header.level() != self.current_key_prefix.len() {
            return Err(MalformedTreeError::WrongLevel {
                key_prefix: self.key_prefix(),
                node_type: NodeType::LeafBucket,
                level: t.header.level(),
            });
        }

        t.super_visit_with(view, self)
    }

    fn visit_fingerprint_bucket(
        &mut self,
        view: TreeView<'_>,
        t: &FingerprintBucket,
    ) -> Self::Output {
        self.check_node(view, NodeType::FingerprintBucket, &t.header, t.len())?;
        if t.header.level() != self.current_key_prefix.len() {
            return Err(MalformedTreeError::WrongLevel {
                key_prefix: self.key_prefix(),
                node_type: NodeType::FingerprintBucket,
                level: t.header.level(),
            });
        }

        let mut leaves = 0;
        for slice in t.sorted(view.pool, view.guard) {
            leaves += self.visit_child(view, slice.bytes, slice.child)?;
        }
        Ok(leaves)
    }

    fn visit_leaf(&mut self, view: TreeView<'_>, t: NodePtr<LeafNode>) -> Self::Output {
        self.mark_seen(t.offset())?;

        let key = t.key(view.pool, view.guard);
        if !key.starts_with(&self.current_key_prefix) {
            return Err(MalformedTreeError::PrefixMismatch {
                expected_prefix: self.key_prefix(),
                entire_key: key.into(),
            });
        }
        Ok(1)
    }
}
