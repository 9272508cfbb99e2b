mod common;

use common::{insert_keys, numbered_keys, volatile_tree};
use part::{visitor::DotPrinterSettings, Key, LeafLayout, OperationResult};

const LAYOUTS: [LeafLayout; 2] = [LeafLayout::Bucketed, LeafLayout::Direct];

fn keys_of(entries: &[Key]) -> Vec<&[u8]> {
    entries.iter().map(Key::key).collect()
}

#[test]
fn fruit_walkthrough() {
    let tree = volatile_tree(LeafLayout::Bucketed);

    for (key, value) in [("apple", "1"), ("app", "2"), ("apricot", "3")] {
        assert_eq!(
            tree.insert(&Key::from((key, value))).unwrap(),
            OperationResult::Success
        );
    }

    assert_eq!(tree.lookup(b"app").as_deref(), Some(&b"2"[..]));
    assert_eq!(tree.lookup(b"apple").as_deref(), Some(&b"1"[..]));
    assert_eq!(tree.lookup(b"ap"), None);

    let scan = tree.lookup_range(Some(&b"ap"[..]), Some(&b"aq"[..]), 10);
    assert_eq!(keys_of(&scan.entries), [&b"app"[..], b"apple", b"apricot"]);
    assert_eq!(
        scan.entries
            .iter()
            .map(|entry| entry.value())
            .collect::<Vec<_>>(),
        [&b"2"[..], b"1", b"3"]
    );
    assert_eq!(scan.continuation, None);

    assert_eq!(tree.remove(b"app"), OperationResult::Success);
    assert_eq!(tree.lookup(b"app"), None);
    assert_eq!(tree.lookup(b"apple").as_deref(), Some(&b"1"[..]));
    assert_eq!(tree.remove(b"app"), OperationResult::NotFound);
    assert_eq!(tree.check_well_formed(), Ok(2));
}

#[test]
fn duplicate_insert_reports_existing() {
    for layout in LAYOUTS {
        let tree = volatile_tree(layout);
        let keys = numbered_keys("dup", 100);
        insert_keys(&tree, &keys);

        for key in &keys {
            assert_eq!(
                tree.insert(&Key::new(key.as_slice(), &b"other"[..])).unwrap(),
                OperationResult::Existed
            );
            assert_eq!(tree.lookup(key).as_deref(), Some(key.as_slice()));
        }
        assert_eq!(tree.check_well_formed(), Ok(100));
    }
}

#[test]
fn bucket_split_keeps_every_key() {
    let tree = volatile_tree(LeafLayout::Bucketed);
    let keys = numbered_keys("key", 65);
    insert_keys(&tree, &keys);

    let stats = tree.stats();
    assert_eq!(stats.bucket_splits, 1);
    assert_eq!(stats.max_level, 0);

    for key in &keys {
        assert_eq!(tree.lookup(key).as_deref(), Some(key.as_slice()));
    }
    let all: Vec<_> = tree.range(None, None, 100).collect();
    assert_eq!(keys_of(&all), keys.iter().map(Vec::as_slice).collect::<Vec<_>>());
}

#[test]
fn range_continuation_resumes_scan() {
    for layout in LAYOUTS {
        let tree = volatile_tree(layout);
        let keys = numbered_keys("r", 250);
        insert_keys(&tree, &keys);

        let mut collected = Vec::new();
        let mut start: Option<Box<[u8]>> = Some(Box::from(&b"r0010"[..]));
        let end = &b"r0200"[..];
        while let Some(from) = start.take() {
            let scan = tree.lookup_range(Some(&*from), Some(end), 32);
            assert!(scan.entries.len() <= 32);
            collected.extend(scan.entries.iter().map(|entry| entry.key().to_vec()));
            start = scan.continuation;
        }

        assert_eq!(collected, keys[10..200]);
    }
}

#[test]
fn range_bounds_are_half_open() {
    let tree = volatile_tree(LeafLayout::Direct);
    insert_keys(&tree, &numbered_keys("b", 20));

    let scan = tree.lookup_range(Some(&b"b0005"[..]), Some(&b"b0008"[..]), 10);
    assert_eq!(keys_of(&scan.entries), [&b"b0005"[..], b"b0006", b"b0007"]);

    // Bounds that are not keys themselves
    let scan = tree.lookup_range(Some(&b"b00045"[..]), Some(&b"b0006"[..]), 10);
    assert_eq!(keys_of(&scan.entries), [&b"b0005"[..]]);

    let scan = tree.lookup_range(Some(&b"c"[..]), None, 10);
    assert!(scan.entries.is_empty());

    let scan = tree.lookup_range(None, Some(&b"b"[..]), 10);
    assert!(scan.entries.is_empty());

    let scan = tree.lookup_range(Some(&b"b0008"[..]), Some(&b"b0005"[..]), 10);
    assert!(scan.entries.is_empty());

    let scan = tree.lookup_range(None, None, 0);
    assert!(scan.entries.is_empty());
    assert_eq!(scan.continuation.as_deref(), Some(&b"b0000"[..]));
}

#[test]
fn direct_layout_round_trip() {
    let tree = volatile_tree(LeafLayout::Direct);
    let keys = numbered_keys("direct/", 1_000);
    insert_keys(&tree, &keys);

    let census = tree.tree_stats();
    assert_eq!(census.leaf_bucket_count(), 0);
    assert_eq!(census.fingerprint_bucket_count(), 0);
    assert_eq!(census.leaf_count(), 1_000);

    for key in keys.iter().step_by(2) {
        assert_eq!(tree.remove(key), OperationResult::Success);
    }
    for (idx, key) in keys.iter().enumerate() {
        assert_eq!(tree.contains_key(key), idx % 2 == 1);
    }
    assert_eq!(tree.check_well_formed(), Ok(500));
}

#[test]
fn update_and_remove_mixed() {
    for layout in LAYOUTS {
        let tree = volatile_tree(layout);
        let keys = numbered_keys("u", 300);
        insert_keys(&tree, &keys);

        for key in keys.iter().step_by(3) {
            assert_eq!(
                tree.update(&Key::new(key.as_slice(), &b"updated"[..])).unwrap(),
                OperationResult::Success
            );
        }
        for key in keys.iter().skip(1).step_by(3) {
            assert_eq!(tree.remove(key), OperationResult::Success);
        }

        for (idx, key) in keys.iter().enumerate() {
            let expected = match idx % 3 {
                0 => Some(b"updated".to_vec()),
                1 => None,
                _ => Some(key.clone()),
            };
            assert_eq!(tree.lookup(key), expected);
        }
        assert_eq!(tree.check_well_formed(), Ok(200));
    }
}

#[test]
fn dot_output_names_every_node() {
    let tree = volatile_tree(LeafLayout::Bucketed);
    insert_keys(&tree, &numbered_keys("dot", 70));

    let mut buffer = Vec::new();
    tree.write_dot(&mut buffer, DotPrinterSettings::default())
        .unwrap();
    let dot = String::from_utf8(buffer).unwrap();

    assert!(dot.starts_with("strict digraph G {"));
    assert!(dot.contains("Node256"));
    assert!(dot.contains("FingerprintBucket"));
    assert!(dot.contains("LeafBucket"));
}

#[test]
fn stats_track_pool_usage() {
    let tree = volatile_tree(LeafLayout::Bucketed);
    let before = tree.stats();
    insert_keys(&tree, &numbered_keys("s", 10));
    let after = tree.stats();

    assert!(after.pool_used > before.pool_used);
    assert_eq!(after.retired, 0);

    let census = tree.tree_stats();
    assert_eq!(census.leaf_count(), 10);
    assert!(census.total_node_bytes() > 0);
    assert!(census.overhead_per_key_byte() > 0.0);
}
