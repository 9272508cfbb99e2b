mod common;

use common::{file_config, init_tracing, insert_keys, numbered_keys};
use part::{Error, Key, LeafLayout, OperationResult, Tree};

#[test]
fn reopened_pool_keeps_every_key() {
    init_tracing();
    for layout in [LeafLayout::Bucketed, LeafLayout::Direct] {
        let dir = tempfile::tempdir().unwrap();
        let config = file_config(dir.path(), layout);
        let keys = numbered_keys("persist/", 1_000);

        let generation = {
            let tree = Tree::open(&config).unwrap();
            assert!(tree.recovery_report().is_none());
            insert_keys(&tree, &keys);
            tree.pool().generation()
        };

        let tree = Tree::open(&config).unwrap();
        assert_eq!(tree.pool().generation(), generation + 1);
        assert_eq!(tree.config().leaf_layout, layout);

        let report = tree.recovery_report().unwrap();
        assert_eq!(report.leaves, 1_000);
        assert_eq!(report.pruned, 0);

        for key in &keys {
            assert_eq!(tree.lookup(key).as_deref(), Some(key.as_slice()));
        }
        assert_eq!(tree.check_well_formed(), Ok(1_000));
    }
}

#[test]
fn removed_space_is_reclaimed_on_reopen() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let config = file_config(dir.path(), LeafLayout::Bucketed);
    let keys = numbered_keys("gap/", 2_000);

    {
        let tree = Tree::open(&config).unwrap();
        insert_keys(&tree, &keys);
        for key in keys.iter().step_by(2) {
            assert_eq!(tree.remove(key), OperationResult::Success);
        }
    }

    let tree = Tree::open(&config).unwrap();
    let report = tree.recovery_report().unwrap();
    assert_eq!(report.leaves, 1_000);
    let free = tree.stats().pool_free;
    assert!(free > 0);
    assert!(free <= report.reclaimed_bytes);

    // New leaves are carved out of the gaps
    insert_keys(&tree, &numbered_keys("gap/x", 10));
    assert!(tree.stats().pool_free < free);
    assert_eq!(tree.check_well_formed(), Ok(1_010));
}

#[test]
fn reopen_keeps_recorded_layout() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let config = file_config(dir.path(), LeafLayout::Direct);

    {
        let tree = Tree::open(&config).unwrap();
        let _ = tree.insert(&Key::from(("layout", "direct"))).unwrap();
    }

    let bucketed = file_config(dir.path(), LeafLayout::Bucketed);
    let tree = Tree::open(&bucketed).unwrap();
    assert_eq!(tree.config().leaf_layout, LeafLayout::Direct);
    assert_eq!(tree.tree_stats().leaf_bucket_count(), 0);
    assert_eq!(tree.lookup(b"layout").as_deref(), Some(&b"direct"[..]));
}

#[test]
fn repeated_reopen_with_writes_in_between() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let config = file_config(dir.path(), LeafLayout::Bucketed);

    for round in 0..4 {
        let tree = Tree::open(&config).unwrap();
        assert_eq!(tree.check_well_formed(), Ok(round * 100));

        let keys = numbered_keys(&format!("round{round}/"), 100);
        insert_keys(&tree, &keys);
    }
}

#[test]
fn rebuild_can_be_skipped() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let mut config = file_config(dir.path(), LeafLayout::Bucketed);

    {
        let tree = Tree::open(&config).unwrap();
        insert_keys(&tree, &numbered_keys("skip/", 10));
    }

    config.tree.rebuild_on_open = false;
    let tree = Tree::open(&config).unwrap();
    assert!(tree.recovery_report().is_none());
    assert_eq!(tree.lookup(b"skip/0003").as_deref(), Some(&b"skip/0003"[..]));
}

#[test]
fn foreign_file_is_rejected() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let config = file_config(dir.path(), LeafLayout::Bucketed);
    let path = config.pool.path.clone().unwrap();

    std::fs::write(&path, vec![0xAB; 1 << 16]).unwrap();
    assert!(matches!(
        Tree::open(&config),
        Err(Error::InvalidPool { .. })
    ));

    std::fs::write(&path, b"short").unwrap();
    assert!(matches!(
        Tree::open(&config),
        Err(Error::InvalidPool { .. })
    ));
}

#[test]
fn config_file_drives_open() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let text = format!(
        r#"
        [pool]
        path = "{}"
        capacity = 8388608
        flush = "msync"

        [tree]
        leaf_layout = "direct"
        "#,
        dir.path().join("from_toml.pool").display()
    );
    let config = part::Config::from_toml_str(&text).unwrap();

    let tree = Tree::open(&config).unwrap();
    assert_eq!(tree.pool().capacity(), 8 << 20);
    assert_eq!(tree.config().leaf_layout, LeafLayout::Direct);
    assert_eq!(
        tree.insert(&Key::from(("toml", "ok"))).unwrap(),
        OperationResult::Success
    );
}
