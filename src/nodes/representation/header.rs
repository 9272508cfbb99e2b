//! The common header of every node that is not a leaf

use std::sync::atomic::{fence, AtomicU64, Ordering};

use bytemuck::{Pod, Zeroable};

use crate::{error::NeedRestart, nodes::NodeType, pool::PmPool};

/// Number of prefix bytes stored inline in a header. Longer prefixes only
/// store their first bytes and the rest is read from any leaf below the node.
pub const MAX_STORED_PREFIX_LEN: usize = 4;

const OBSOLETE_BIT: u64 = 0b01;
const LOCKED_BIT: u64 = 0b10;
const VERSION_STEP: u64 = 0b100;

/// Generation value written while one thread clears a lock left behind by a
/// previous run of the process.
const GENERATION_RESETTING: u64 = u64::MAX;

/// Return true if the version word belongs to a node that was unlinked.
#[inline]
pub const fn is_obsolete(version: u64) -> bool {
    version & OBSOLETE_BIT != 0
}

/// Return true if the version word is write-locked.
#[inline]
pub const fn is_locked(version: u64) -> bool {
    version & LOCKED_BIT != 0
}

/// The compressed path of a node.
///
/// `count` is the logical number of prefix bytes, of which at most
/// [`MAX_STORED_PREFIX_LEN`] are kept in `bytes`. The struct is exactly one
/// word, so that the count and the bytes are always updated together.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct Prefix {
    count: u32,
    bytes: [u8; MAX_STORED_PREFIX_LEN],
}

impl Prefix {
    /// Create a prefix of logical length `count` from its leading `bytes`.
    ///
    /// Only the first `min(count, MAX_STORED_PREFIX_LEN)` bytes are kept.
    ///
    /// # Panics
    ///  - Panics if fewer bytes than can be stored are given.
    pub fn new(bytes: &[u8], count: usize) -> Self {
        let stored = count.min(MAX_STORED_PREFIX_LEN);
        assert!(
            bytes.len() >= stored,
            "a prefix of {count} bytes needs at least {stored} known bytes"
        );

        let mut prefix = Prefix {
            count: count as u32,
            bytes: [0; MAX_STORED_PREFIX_LEN],
        };
        prefix.bytes[..stored].copy_from_slice(&bytes[..stored]);
        prefix
    }

    /// An empty prefix.
    pub const fn empty() -> Self {
        Prefix {
            count: 0,
            bytes: [0; MAX_STORED_PREFIX_LEN],
        }
    }

    /// Logical length of the prefix.
    #[inline]
    pub fn count(&self) -> usize {
        self.count as usize
    }

    /// The bytes of the prefix that are stored inline.
    #[inline]
    pub fn stored(&self) -> &[u8] {
        &self.bytes[..self.count().min(MAX_STORED_PREFIX_LEN)]
    }

    /// Return true if every byte of the prefix is stored inline.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.count() <= MAX_STORED_PREFIX_LEN
    }

    fn pack(self) -> u64 {
        bytemuck::cast(self)
    }

    fn unpack(word: u64) -> Self {
        bytemuck::cast(word)
    }
}

/// The common header of fixed nodes and buckets.
///
/// The version word implements optimistic lock coupling. Bit 0 marks the node
/// obsolete, bit 1 is the write lock and the remaining bits count completed
/// writes.
#[derive(Debug)]
#[repr(C, align(8))]
pub struct Header {
    version: AtomicU64,
    generation: AtomicU64,
    /// Node type in the low byte, level in the upper half
    meta: AtomicU64,
    prefix: AtomicU64,
}

impl Header {
    /// Initialise the header of a freshly allocated node.
    pub fn init(&self, node_type: NodeType, level: usize, prefix: Prefix, generation: u64) {
        self.version.store(0, Ordering::Relaxed);
        self.generation.store(generation, Ordering::Relaxed);
        self.meta
            .store(node_type as u64 | ((level as u64) << 32), Ordering::Relaxed);
        self.prefix.store(prefix.pack(), Ordering::Relaxed);
    }

    /// The type recorded when the node was created.
    pub fn node_type(&self) -> Option<NodeType> {
        NodeType::from_u8(self.meta.load(Ordering::Relaxed) as u8)
    }

    /// Byte depth at which this node's discriminating byte is read.
    #[inline]
    pub fn level(&self) -> usize {
        (self.meta.load(Ordering::Relaxed) >> 32) as usize
    }

    /// Read the prefix.
    #[inline]
    pub fn prefix(&self) -> Prefix {
        Prefix::unpack(self.prefix.load(Ordering::Acquire))
    }

    /// Replace the prefix and make it durable.
    pub fn set_prefix(&self, pool: &PmPool, prefix: Prefix) {
        self.prefix.store(prefix.pack(), Ordering::Release);
        pool.persist(&self.prefix);
    }

    /// Raw version word, for debugging output.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Relaxed)
    }

    /// Start an optimistic read of this node.
    ///
    /// Fails if the node is locked or obsolete.
    #[inline]
    pub fn read_lock_or_restart(&self, generation: u64) -> Result<u64, NeedRestart> {
        self.check_generation(generation)?;

        let version = self.version.load(Ordering::Acquire);
        if is_locked(version) || is_obsolete(version) {
            return Err(NeedRestart);
        }
        Ok(version)
    }

    /// Validate that nothing was written to this node since `version` was
    /// read.
    #[inline]
    pub fn read_unlock_or_restart(&self, version: u64) -> Result<(), NeedRestart> {
        fence(Ordering::Acquire);
        if self.version.load(Ordering::Relaxed) == version {
            Ok(())
        } else {
            Err(NeedRestart)
        }
    }

    /// Upgrade an optimistic read at `version` to a write lock.
    #[inline]
    pub fn lock_version_or_restart(&self, version: u64) -> Result<(), NeedRestart> {
        self.version
            .compare_exchange(
                version,
                version + LOCKED_BIT,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .map_err(|_| NeedRestart)?;
        fence(Ordering::Release);
        Ok(())
    }

    /// Take the write lock without a previous optimistic read.
    pub fn write_lock_or_restart(&self, generation: u64) -> Result<(), NeedRestart> {
        let version = self.read_lock_or_restart(generation)?;
        self.lock_version_or_restart(version)
    }

    /// Release the write lock.
    #[inline]
    pub fn write_unlock(&self) {
        self.version.fetch_add(LOCKED_BIT, Ordering::Release);
    }

    /// Release the write lock and mark the node as unlinked.
    #[inline]
    pub fn write_unlock_obsolete(&self) {
        self.version
            .fetch_add(LOCKED_BIT | OBSOLETE_BIT, Ordering::Release);
    }

    /// Clear a write lock that survived a crash.
    ///
    /// The first visit of a node in a new generation stamps the node with the
    /// generation. No thread of the current generation can hold the lock of a
    /// node that still carries an old stamp, so a set lock bit is stale.
    #[inline]
    pub fn check_generation(&self, generation: u64) -> Result<(), NeedRestart> {
        let seen = self.generation.load(Ordering::Acquire);
        if seen == generation {
            return Ok(());
        }
        if seen == GENERATION_RESETTING {
            return Err(NeedRestart);
        }
        self.generation
            .compare_exchange(
                seen,
                GENERATION_RESETTING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| NeedRestart)?;

        let version = self.version.load(Ordering::Acquire);
        if is_locked(version) {
            tracing::warn!(version, generation, "cleared lock left behind by a crash");
            self.version
                .store((version & !LOCKED_BIT) + VERSION_STEP, Ordering::Release);
        }
        self.generation.store(generation, Ordering::Release);
        Ok(())
    }

    /// Reset the version word during single-threaded recovery.
    pub fn reset(&self, generation: u64) {
        let version = self.version.load(Ordering::Relaxed);
        self.version.store(
            (version & !(LOCKED_BIT | OBSOLETE_BIT)) + VERSION_STEP,
            Ordering::Relaxed,
        );
        self.generation.store(generation, Ordering::Relaxed);
    }
}
