//! Error types shared by the pool and the tree.

use std::{fmt, path::PathBuf};

/// Errors which can be returned by the pool or by tree mutations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The pool has no free range large enough for the requested allocation.
    #[error("persistent pool exhausted: requested {requested} bytes, {available} bytes left")]
    PoolExhausted {
        /// Size of the failed allocation, after rounding.
        requested: usize,
        /// Bytes left between the bump cursor and the end of the pool.
        available: u64,
    },

    /// The key cannot be placed because it is a byte-for-byte prefix of a key
    /// on the same path, or another key on the same path is a prefix of it.
    #[error(
        "key {key:?} cannot be stored because it is a prefix of (or has as a prefix) a key that \
         shares its path in the tree"
    )]
    KeyPrefixConflict {
        /// The key that could not be inserted.
        key: Box<[u8]>,
    },

    /// The empty key has no discriminating byte and can never be stored.
    #[error("the empty key cannot be stored")]
    EmptyKey,

    /// The file does not contain a pool this crate can open.
    #[error("{} is not a valid pool: {reason}", path.display())]
    InvalidPool {
        /// Location of the rejected pool file.
        path: PathBuf,
        /// What failed validation.
        reason: String,
    },

    /// The configuration text could not be parsed.
    #[error("invalid configuration")]
    Config(#[from] toml::de::Error),

    /// Creating, sizing or mapping the pool file failed.
    #[error("pool I/O error")]
    Io(#[from] std::io::Error),
}

/// Result type used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Signal that an optimistic read or a lock attempt observed a concurrent
/// modification and the whole operation must start again from the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeedRestart;

impl fmt::Display for NeedRestart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("concurrent modification, operation must restart")
    }
}

/// The ways a single attempt of a mutating operation can end early.
#[derive(Debug)]
pub(crate) enum Interrupt {
    /// Retry the operation from the root.
    Restart,
    /// Give up and report the error to the caller.
    Fatal(Error),
}

impl From<NeedRestart> for Interrupt {
    fn from(_: NeedRestart) -> Self {
        Interrupt::Restart
    }
}

impl From<Error> for Interrupt {
    fn from(err: Error) -> Self {
        Interrupt::Fatal(err)
    }
}
