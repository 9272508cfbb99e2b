use std::mem::size_of;

use bytemuck::{Pod, Zeroable};
use crossbeam_epoch::Guard;

use crate::{
    nodes::{Node, NodePtr, NodeType},
    pool::PmPool,
    Result,
};

/// A single key and value stored in the pool.
///
/// A leaf has no fixed layout type, it is a [`LeafHeader`] followed by the key
/// bytes and then the value bytes. Leaves are never modified after they have
/// been published, an update publishes a new leaf instead.
pub enum LeafNode {}

impl Node for LeafNode {
    const TYPE: NodeType = NodeType::Leaf;
}

/// Lengths stored in front of the key and value bytes of a leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct LeafHeader {
    key_len: u32,
    value_len: u32,
}

const LEAF_HEADER_LEN: usize = size_of::<LeafHeader>();

impl NodePtr<LeafNode> {
    /// Write a new leaf and make it durable. The returned leaf is not
    /// reachable yet.
    pub fn create(pool: &PmPool, key: &[u8], value: &[u8]) -> Result<Self> {
        let size = Self::allocation_size_for(key.len(), value.len());
        let offset = pool.allocate(size)?;
        let header = LeafHeader {
            key_len: key.len() as u32,
            value_len: value.len() as u32,
        };

        // SAFETY: The range was just allocated and is not published.
        unsafe {
            pool.write_bytes(offset, bytemuck::bytes_of(&header));
            pool.write_bytes(offset + LEAF_HEADER_LEN as u64, key);
            pool.write_bytes(offset + (LEAF_HEADER_LEN + key.len()) as u64, value);
        }
        pool.flush(offset, size);

        Ok(NodePtr::new(offset))
    }

    fn allocation_size_for(key_len: usize, value_len: usize) -> usize {
        LEAF_HEADER_LEN + key_len + value_len
    }

    fn leaf_header(self, pool: &PmPool) -> LeafHeader {
        // SAFETY: Published leaves are immutable and the caller holds a guard
        // that keeps this one from being freed.
        bytemuck::pod_read_unaligned(unsafe { pool.bytes(self.offset(), LEAF_HEADER_LEN) })
    }

    /// The key bytes of the leaf.
    pub fn key<'a>(self, pool: &'a PmPool, _guard: &'a Guard) -> &'a [u8] {
        let header = self.leaf_header(pool);
        // SAFETY: Published leaves are immutable and `_guard` keeps this one
        // from being freed while the slice is alive.
        unsafe {
            pool.bytes(
                self.offset() + LEAF_HEADER_LEN as u64,
                header.key_len as usize,
            )
        }
    }

    /// The value bytes of the leaf.
    pub fn value<'a>(self, pool: &'a PmPool, _guard: &'a Guard) -> &'a [u8] {
        let header = self.leaf_header(pool);
        // SAFETY: See `key`.
        unsafe {
            pool.bytes(
                self.offset() + (LEAF_HEADER_LEN + header.key_len as usize) as u64,
                header.value_len as usize,
            )
        }
    }

    /// Size of the pool allocation backing this leaf.
    pub fn allocation_size(self, pool: &PmPool) -> usize {
        let header = self.leaf_header(pool);
        Self::allocation_size_for(header.key_len as usize, header.value_len as usize)
    }
}
