#![allow(dead_code)]

use std::sync::Once;

use part::{Config, FlushMode, Key, LeafLayout, OperationResult, PoolConfig, Tree, TreeConfig};
use tracing_subscriber::EnvFilter;

/// Install a log subscriber once per test binary. `RUST_LOG` overrides the
/// default filter.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("part=info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_ansi(false)
            .try_init();
    });
}

/// A tree in an anonymous pool of 64 MiB.
pub fn volatile_tree(leaf_layout: LeafLayout) -> Tree {
    init_tracing();
    Tree::volatile(
        TreeConfig {
            leaf_layout,
            ..TreeConfig::default()
        },
        64 << 20,
    )
    .unwrap()
}

/// Configuration of a file pool inside `dir`.
pub fn file_config(dir: &std::path::Path, leaf_layout: LeafLayout) -> Config {
    Config {
        pool: PoolConfig {
            capacity: 16 << 20,
            flush: FlushMode::Fence,
            ..PoolConfig::default_file(dir)
        },
        tree: TreeConfig {
            leaf_layout,
            ..TreeConfig::default()
        },
    }
}

/// Keys `{prefix}0000`, `{prefix}0001` and so on.
pub fn numbered_keys(prefix: &str, count: usize) -> Vec<Vec<u8>> {
    (0..count)
        .map(|idx| format!("{prefix}{idx:04}").into_bytes())
        .collect()
}

/// Insert every key with itself as the value, asserting that each is new.
pub fn insert_keys(tree: &Tree, keys: &[Vec<u8>]) {
    for key in keys {
        assert_eq!(
            tree.insert(&Key::new(key.as_slice(), key.as_slice())).unwrap(),
            OperationResult::Success,
            "insert {}",
            key.escape_ascii()
        );
    }
}
