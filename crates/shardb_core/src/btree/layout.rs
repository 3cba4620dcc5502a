//! On-disk block layout.
//!
//! ```text
//! head (block 0):  | magic (4) | root (4) | num_blocks (4) | depth (4) |
//! leaf:            | flags (4) | count (4) | left (4) | right (4) | (key, value)* |
//! inner:           | flags (4) | count (4) | lref (4) | (key, child (4))* |
//! ```
//!
//! All integers are little-endian. Bit 0 of `flags` marks a leaf.

use crate::error::{CoreError, CoreResult};

/// "SBT1"
pub(crate) const HEAD_MAGIC: u32 = 0x3154_4253;
/// Block number meaning "no block".
pub(crate) const NO_BLOCK: u32 = u32::MAX;

const FLAG_LEAF: u32 = 1;
const LEAF_HEADER: usize = 16;
const INNER_HEADER: usize = 12;
const CHILD_SIZE: usize = 4;

/// Smallest entry count a block must hold.
pub(crate) const MIN_CAPACITY: usize = 4;

pub(crate) fn get_u32(block: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([block[at], block[at + 1], block[at + 2], block[at + 3]])
}

pub(crate) fn put_u32(block: &mut [u8], at: usize, value: u32) {
    block[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

/// Tree-wide metadata kept in block 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Head {
    pub root: u32,
    pub num_blocks: u32,
    pub depth: u32,
}

impl Head {
    pub fn encode(&self, block: &mut [u8]) {
        put_u32(block, 0, HEAD_MAGIC);
        put_u32(block, 4, self.root);
        put_u32(block, 8, self.num_blocks);
        put_u32(block, 12, self.depth);
    }

    pub fn decode(block: &[u8]) -> CoreResult<Self> {
        if get_u32(block, 0) != HEAD_MAGIC {
            return Err(CoreError::invalid_format("B-tree head magic mismatch"));
        }
        let head = Self {
            root: get_u32(block, 4),
            num_blocks: get_u32(block, 8),
            depth: get_u32(block, 12),
        };
        if head.root == 0 || head.root >= head.num_blocks || head.depth == 0 {
            return Err(CoreError::invalid_format(format!(
                "B-tree head out of range: {head:?}"
            )));
        }
        Ok(head)
    }
}

/// Entry sizes and capacities for one page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Geometry {
    pub key_size: usize,
    pub value_size: usize,
    pub leaf_capacity: usize,
    pub inner_capacity: usize,
}

impl Geometry {
    pub fn new(page_size: usize, key_size: usize, value_size: usize) -> CoreResult<Self> {
        if key_size == 0 {
            return Err(CoreError::invalid_config("B-tree keys must not be empty"));
        }
        let leaf_capacity = page_size.saturating_sub(LEAF_HEADER) / (key_size + value_size);
        let inner_capacity = page_size.saturating_sub(INNER_HEADER) / (key_size + CHILD_SIZE);
        if leaf_capacity < MIN_CAPACITY || inner_capacity < MIN_CAPACITY {
            return Err(CoreError::invalid_config(format!(
                "page size {page_size} fits {leaf_capacity} leaf and {inner_capacity} inner \
                 entries, need at least {MIN_CAPACITY}"
            )));
        }
        Ok(Self {
            key_size,
            value_size,
            leaf_capacity,
            inner_capacity,
        })
    }

    pub fn capacity(&self, leaf: bool) -> usize {
        if leaf {
            self.leaf_capacity
        } else {
            self.inner_capacity
        }
    }

    /// A block is split before descending into it once it cannot take two
    /// more entries.
    pub fn is_full(&self, block: &[u8]) -> bool {
        count(block) + 1 >= self.capacity(is_leaf(block))
    }

    fn entry_size(&self, leaf: bool) -> usize {
        if leaf {
            self.key_size + self.value_size
        } else {
            self.key_size + CHILD_SIZE
        }
    }

    pub fn entry_offset(&self, leaf: bool, index: usize) -> usize {
        let header = if leaf { LEAF_HEADER } else { INNER_HEADER };
        header + index * self.entry_size(leaf)
    }

    pub fn key<'b>(&self, block: &'b [u8], index: usize) -> &'b [u8] {
        let at = self.entry_offset(is_leaf(block), index);
        &block[at..at + self.key_size]
    }

    pub fn value<'b>(&self, block: &'b [u8], index: usize) -> &'b [u8] {
        let at = self.entry_offset(true, index) + self.key_size;
        &block[at..at + self.value_size]
    }

    pub fn value_mut<'b>(&self, block: &'b mut [u8], index: usize) -> &'b mut [u8] {
        let at = self.entry_offset(true, index) + self.key_size;
        &mut block[at..at + self.value_size]
    }

    pub fn child(&self, block: &[u8], index: usize) -> u32 {
        get_u32(block, self.entry_offset(false, index) + self.key_size)
    }

    /// Child followed for partition point `slot`: `lref` for 0, otherwise
    /// the child of entry `slot - 1`.
    pub fn child_at_slot(&self, block: &[u8], slot: usize) -> u32 {
        if slot == 0 {
            lref(block)
        } else {
            self.child(block, slot - 1)
        }
    }

    /// Opens a gap at `index` and writes `key` and `tail` (value or child)
    /// into it.
    pub fn insert_entry(
        &self,
        block: &mut [u8],
        index: usize,
        key: &[u8],
        tail: &[u8],
    ) -> CoreResult<()> {
        let leaf = is_leaf(block);
        let n = count(block);
        if n >= self.capacity(leaf) || index > n {
            return Err(CoreError::invariant(format!(
                "insert at {index} into block with {n} of {} entries",
                self.capacity(leaf)
            )));
        }
        let size = self.entry_size(leaf);
        let at = self.entry_offset(leaf, index);
        let end = self.entry_offset(leaf, n);
        block.copy_within(at..end, at + size);
        block[at..at + self.key_size].copy_from_slice(key);
        block[at + self.key_size..at + size].copy_from_slice(tail);
        set_count(block, n + 1);
        Ok(())
    }

    /// Raw bytes of entries `from..to`.
    pub fn entries<'b>(&self, block: &'b [u8], from: usize, to: usize) -> &'b [u8] {
        let leaf = is_leaf(block);
        &block[self.entry_offset(leaf, from)..self.entry_offset(leaf, to)]
    }

    pub fn put_entries(&self, block: &mut [u8], bytes: &[u8]) {
        let at = self.entry_offset(is_leaf(block), 0);
        block[at..at + bytes.len()].copy_from_slice(bytes);
    }
}

pub(crate) fn is_leaf(block: &[u8]) -> bool {
    get_u32(block, 0) & FLAG_LEAF != 0
}

pub(crate) fn count(block: &[u8]) -> usize {
    get_u32(block, 4) as usize
}

pub(crate) fn set_count(block: &mut [u8], count: usize) {
    put_u32(block, 4, count as u32);
}

pub(crate) fn init_leaf(block: &mut [u8], left: u32, right: u32) {
    block.fill(0);
    put_u32(block, 0, FLAG_LEAF);
    put_u32(block, 8, left);
    put_u32(block, 12, right);
}

pub(crate) fn init_inner(block: &mut [u8], lref: u32) {
    block.fill(0);
    put_u32(block, 8, lref);
}

pub(crate) fn left(block: &[u8]) -> u32 {
    get_u32(block, 8)
}

pub(crate) fn right(block: &[u8]) -> u32 {
    get_u32(block, 12)
}

pub(crate) fn set_left(block: &mut [u8], value: u32) {
    put_u32(block, 8, value);
}

pub(crate) fn set_right(block: &mut [u8], value: u32) {
    put_u32(block, 12, value);
}

pub(crate) fn lref(block: &[u8]) -> u32 {
    get_u32(block, 8)
}
