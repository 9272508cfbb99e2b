use crate::{
    nodes::{NodeType, Prefix, LEAF_BUCKET_CAPACITY},
    Error, Key, LeafLayout, OperationResult, Tree, TreeConfig,
};

fn tree(leaf_layout: LeafLayout) -> Tree {
    Tree::volatile(
        TreeConfig {
            leaf_layout,
            ..TreeConfig::default()
        },
        1 << 24,
    )
    .unwrap()
}

fn insert_all<'k>(tree: &Tree, keys: impl IntoIterator<Item = &'k [u8]>) {
    for key in keys {
        assert_eq!(
            tree.insert(&Key::new(key, key)).unwrap(),
            OperationResult::Success,
            "{}",
            key.escape_ascii()
        );
    }
}

fn numbered(prefix: &str, range: impl IntoIterator<Item = usize>) -> Vec<Vec<u8>> {
    range
        .into_iter()
        .map(|idx| format!("{prefix}{idx:04}").into_bytes())
        .collect()
}

#[test]
fn direct_leaf_split_and_prefix_split() {
    let tree = tree(LeafLayout::Direct);
    insert_all(&tree, [&b"abc1"[..], b"abc2"]);

    // One node at level 3 with prefix "bc" below the root
    let census = tree.tree_stats();
    assert_eq!(census.node4_count(), 1);
    assert_eq!(census.max_level(), 3);

    insert_all(&tree, [&b"ab9"[..]]);
    let census = tree.tree_stats();
    assert_eq!(census.node4_count(), 2);
    assert_eq!(tree.check_well_formed(), Ok(3));

    for key in [&b"abc1"[..], b"abc2", b"ab9"] {
        assert_eq!(tree.lookup(key).as_deref(), Some(key));
    }
    assert_eq!(tree.lookup(b"ab"), None);
    assert_eq!(tree.lookup(b"abc"), None);
    assert_eq!(tree.lookup(b"abx1"), None);
}

#[test]
fn direct_nodes_grow_through_every_size() {
    let tree = tree(LeafLayout::Direct);
    let keys: Vec<[u8; 2]> = (0..=255u8).map(|byte| [b'x', byte]).collect();

    insert_all(&tree, keys.iter().take(4).map(|key| &key[..]));
    assert_eq!(tree.tree_stats().node4_count(), 1);

    insert_all(&tree, keys[4..16].iter().map(|key| &key[..]));
    let census = tree.tree_stats();
    assert_eq!((census.node4_count(), census.node16_count()), (0, 1));

    insert_all(&tree, keys[16..48].iter().map(|key| &key[..]));
    let census = tree.tree_stats();
    assert_eq!((census.node16_count(), census.node48_count()), (0, 1));

    insert_all(&tree, keys[48..].iter().map(|key| &key[..]));
    let census = tree.tree_stats();
    assert_eq!(census.node48_count(), 0);
    // The root and the full node below it
    assert_eq!(census.node256_count(), 2);
    assert_eq!(census.leaf_count(), 256);

    assert_eq!(tree.stats().grown_nodes, 3);
    assert_eq!(tree.check_well_formed(), Ok(256));
}

#[test]
fn direct_nodes_shrink_and_collapse() {
    let tree = tree(LeafLayout::Direct);
    let keys: Vec<[u8; 2]> = (0..=255u8).map(|byte| [b'x', byte]).collect();
    insert_all(&tree, keys.iter().map(|key| &key[..]));

    let mut remaining = keys.len();
    for key in &keys[..keys.len() - 1] {
        assert_eq!(tree.remove(key), OperationResult::Success);
        remaining -= 1;

        let census = tree.tree_stats();
        let below_root = census.node4_count()
            + census.node16_count()
            + census.node48_count()
            + (census.node256_count() - 1);
        match remaining {
            1 => assert_eq!(below_root, 0),
            _ => assert_eq!(below_root, 1),
        }
        if remaining == 12 {
            assert_eq!(census.node16_count(), 1);
        }
        if remaining == 3 {
            assert_eq!(census.node4_count(), 1);
        }
    }

    assert_eq!(tree.check_well_formed(), Ok(1));
    assert_eq!(tree.lookup(&[b'x', 255]).as_deref(), Some(&[b'x', 255][..]));
    assert_eq!(tree.remove(&[b'x', 0]), OperationResult::NotFound);
}

#[test]
fn collapse_moves_inner_sibling_up() {
    let tree = tree(LeafLayout::Direct);
    insert_all(&tree, [&b"abc1"[..], b"abc2", b"ab9"]);
    assert_eq!(tree.tree_stats().node4_count(), 2);

    assert_eq!(tree.remove(b"ab9"), OperationResult::Success);
    assert_eq!(tree.tree_stats().node4_count(), 1);
    assert_eq!(tree.check_well_formed(), Ok(2));

    assert_eq!(tree.lookup(b"abc1").as_deref(), Some(&b"abc1"[..]));
    assert_eq!(tree.lookup(b"abc2").as_deref(), Some(&b"abc2"[..]));
    assert_eq!(tree.lookup(b"ab9"), None);

    // The moved node still takes new keys below its rebuilt prefix
    insert_all(&tree, [&b"abc3"[..], b"azzz"]);
    assert_eq!(tree.check_well_formed(), Ok(4));
}

#[test]
fn direct_prefix_keys_conflict() {
    let tree = tree(LeafLayout::Direct);
    insert_all(&tree, [&b"apple"[..]]);

    assert!(matches!(
        tree.insert(&Key::from(("app", "v"))),
        Err(Error::KeyPrefixConflict { .. })
    ));
    assert!(matches!(
        tree.insert(&Key::from(("applesauce", "v"))),
        Err(Error::KeyPrefixConflict { .. })
    ));
    assert_eq!(tree.check_well_formed(), Ok(1));
}

#[test]
fn bucketed_prefix_keys_share_a_bucket() {
    let tree = tree(LeafLayout::Bucketed);
    insert_all(&tree, [&b"app"[..], b"apple", b"applesauce"]);

    let census = tree.tree_stats();
    assert_eq!(census.leaf_bucket_count(), 1);
    assert_eq!(tree.check_well_formed(), Ok(3));
    assert_eq!(tree.lookup(b"app").as_deref(), Some(&b"app"[..]));
}

#[test]
fn full_leaf_bucket_splits_into_fingerprint_bucket() {
    let tree = tree(LeafLayout::Bucketed);
    let keys = numbered("key", 0..LEAF_BUCKET_CAPACITY);
    insert_all(&tree, keys.iter().map(Vec::as_slice));

    let census = tree.tree_stats();
    assert_eq!(census.leaf_bucket_count(), 1);
    assert_eq!(tree.stats().bucket_splits, 0);

    let last = b"key0064".to_vec();
    insert_all(&tree, [last.as_slice()]);
    let census = tree.tree_stats();
    assert_eq!(tree.stats().bucket_splits, 1);
    assert_eq!(census.fingerprint_bucket_count(), 1);
    // One bucket per value of the third digit, "key000x" to "key006x"
    assert_eq!(census.leaf_bucket_count(), 7);
    assert_eq!(tree.check_well_formed(), Ok(65));

    for key in keys.iter().chain([&last]) {
        assert_eq!(tree.lookup(key).as_deref(), Some(key.as_slice()));
    }
}

#[test]
fn full_leaf_bucket_splits_into_inner_node_without_fingerprints() {
    let tree = Tree::volatile(
        TreeConfig {
            fingerprint_buckets: false,
            ..TreeConfig::default()
        },
        1 << 24,
    )
    .unwrap();
    let keys = numbered("key", 0..65);
    insert_all(&tree, keys.iter().map(Vec::as_slice));

    let census = tree.tree_stats();
    assert_eq!(census.fingerprint_bucket_count(), 0);
    // A node on the third digit with prefix "ey00", one bucket per digit
    // below it
    assert_eq!(census.count(NodeType::Node16), 1);
    assert_eq!(census.max_level(), 6);
    assert_eq!(census.leaf_bucket_count(), 7);
    assert_eq!(tree.check_well_formed(), Ok(65));
}

#[test]
fn full_fingerprint_bucket_splits() {
    let tree = tree(LeafLayout::Bucketed);
    let first = numbered("key", 0..65);
    insert_all(&tree, first.iter().map(Vec::as_slice));
    assert_eq!(tree.tree_stats().fingerprint_bucket_count(), 1);

    // Every key adds a slice of its own until the bucket is full
    let second: Vec<Vec<u8>> = (100..160)
        .map(|idx| format!("key{idx:03}0").into_bytes())
        .collect();
    insert_all(&tree, second.iter().map(Vec::as_slice));

    assert!(tree.stats().fingerprint_splits >= 1);
    assert_eq!(tree.check_well_formed(), Ok(125));
    for key in first.iter().chain(&second) {
        assert_eq!(tree.lookup(key).as_deref(), Some(key.as_slice()));
    }

    let scanned: Vec<_> = tree
        .range(None, None, 16)
        .map(|entry| entry.key().to_vec())
        .collect();
    let mut expected: Vec<_> = first.iter().chain(&second).cloned().collect();
    expected.sort();
    assert_eq!(scanned, expected);
}

#[test]
fn removing_last_leaf_unlinks_empty_path() {
    let tree = tree(LeafLayout::Bucketed);
    let keys = numbered("key", 0..65);
    insert_all(&tree, keys.iter().map(Vec::as_slice));

    for key in &keys {
        assert_eq!(tree.remove(key), OperationResult::Success);
    }

    let census = tree.tree_stats();
    assert_eq!(census.leaf_count(), 0);
    assert_eq!(census.leaf_bucket_count(), 0);
    assert_eq!(census.fingerprint_bucket_count(), 0);
    assert_eq!(census.node256_count(), 1);
    assert_eq!(tree.check_well_formed(), Ok(0));

    insert_all(&tree, [&b"key0001"[..]]);
    assert_eq!(tree.check_well_formed(), Ok(1));
}

#[test]
fn stale_prefix_is_recovered_by_insert() {
    let tree = tree(LeafLayout::Direct);
    insert_all(&tree, [&b"abcd1"[..], b"abcd2"]);

    // As if a crash hit between publishing a split and shortening the prefix
    // of the node below it
    tree.with_view(|view, root| {
        let root = root.inner(view.pool()).unwrap();
        let node = root.lookup_child(b'a').unwrap();
        let header = node.header(view.pool()).unwrap();
        assert_eq!(header.prefix().count(), 3);
        header.set_prefix(view.pool(), Prefix::new(b"abcd", 4));
    });
    assert!(tree.check_well_formed().is_err());

    // Reads still find their way
    assert_eq!(tree.lookup(b"abcd1").as_deref(), Some(&b"abcd1"[..]));

    insert_all(&tree, [&b"abcd3"[..]]);
    assert_eq!(tree.stats().prefix_recoveries, 1);
    assert_eq!(tree.check_well_formed(), Ok(3));
}

#[test]
fn long_prefixes_are_loaded_from_leaves() {
    let tree = tree(LeafLayout::Direct);
    let long_a = b"a_very_long_shared_prefix_1";
    let long_b = b"a_very_long_shared_prefix_2";
    insert_all(&tree, [&long_a[..], long_b]);

    // Diverges after the stored part of the prefix
    insert_all(&tree, [&b"a_very_long_shared_suffix"[..]]);
    // Diverges inside the stored part
    insert_all(&tree, [&b"a_vX"[..]]);

    assert_eq!(tree.check_well_formed(), Ok(4));
    assert_eq!(tree.lookup(b"a_very_long_shared_prefiX_1"), None);
    assert_eq!(tree.lookup(long_b).as_deref(), Some(&long_b[..]));
}

#[test]
fn duplicate_insert_keeps_first_value() {
    for layout in [LeafLayout::Bucketed, LeafLayout::Direct] {
        let tree = tree(layout);
        assert_eq!(
            tree.insert(&Key::from(("dup", "first"))).unwrap(),
            OperationResult::Success
        );
        assert_eq!(
            tree.insert(&Key::from(("dup", "second"))).unwrap(),
            OperationResult::Existed
        );
        assert_eq!(tree.lookup(b"dup").as_deref(), Some(&b"first"[..]));
    }
}
