//! Pool and tree configuration.
//!
//! Every field has a default, so a configuration file only needs to name the
//! settings it changes:
//!
//! ```
//! let config = part::Config::from_toml_str(
//!     r#"
//!     [pool]
//!     capacity = 1048576
//!     flush = "fence"
//!
//!     [tree]
//!     leaf_layout = "direct"
//!     "#,
//! )
//! .unwrap();
//!
//! assert_eq!(config.pool.capacity, 1 << 20);
//! assert_eq!(config.tree.leaf_layout, part::LeafLayout::Direct);
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::Result;

/// Default pool size, 64 MiB.
pub const DEFAULT_POOL_CAPACITY: u64 = 64 * 1024 * 1024;

/// File name used when a pool path is not configured but a file pool is
/// requested through [`PoolConfig::default_file`].
pub const DEFAULT_POOL_FILE: &str = "part.pool";

/// Top level configuration, one table per component.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Settings of the backing pool.
    pub pool: PoolConfig,
    /// Settings of the index structure.
    pub tree: TreeConfig,
}

impl Config {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}

/// How writes to the pool are made durable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushMode {
    /// Nothing is flushed. Only meaningful for volatile pools.
    None,
    /// Issue a sequentially consistent fence after each persisted write. This
    /// is the ordering half of a cache line write-back on a DAX mapping.
    Fence,
    /// Write the touched pages back to the file with `msync`.
    #[default]
    Msync,
}

/// Shape of the terminal level of the tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeafLayout {
    /// Leaves are grouped into buckets of leaves below the fixed nodes.
    #[default]
    Bucketed,
    /// Every leaf hangs directly from a fixed node.
    Direct,
}

impl LeafLayout {
    pub(crate) fn to_flag(self) -> u64 {
        match self {
            LeafLayout::Bucketed => 0,
            LeafLayout::Direct => 1,
        }
    }

    pub(crate) fn from_flag(flag: u64) -> Self {
        if flag & 1 == 1 {
            LeafLayout::Direct
        } else {
            LeafLayout::Bucketed
        }
    }
}

/// Settings of the backing pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Location of the pool file. An anonymous mapping is used when absent.
    pub path: Option<PathBuf>,
    /// Size of the pool in bytes, only used when the pool is created.
    pub capacity: u64,
    /// Durability mode of persisted writes.
    pub flush: FlushMode,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            path: None,
            capacity: DEFAULT_POOL_CAPACITY,
            flush: FlushMode::default(),
        }
    }
}

impl PoolConfig {
    /// A file pool named [`DEFAULT_POOL_FILE`] inside `dir`.
    pub fn default_file(dir: impl Into<PathBuf>) -> Self {
        PoolConfig {
            path: Some(dir.into().join(DEFAULT_POOL_FILE)),
            ..PoolConfig::default()
        }
    }
}

/// Settings of the index structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeConfig {
    /// Terminal layout used when the pool is created. On reopen the layout
    /// recorded in the pool wins.
    pub leaf_layout: LeafLayout,
    /// Allow bucket splits to produce fingerprint buckets along shared runs of
    /// key bytes.
    pub fingerprint_buckets: bool,
    /// Walk the whole tree when an existing pool is opened, repairing node
    /// metadata and returning unreachable space to the allocator.
    pub rebuild_on_open: bool,
}

impl Default for TreeConfig {
    fn default() -> Self {
        TreeConfig {
            leaf_layout: LeafLayout::Bucketed,
            fingerprint_buckets: true,
            rebuild_on_open: true,
        }
    }
}
