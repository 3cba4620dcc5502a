//! Insertion, splitting and directional search.

use crate::btree::cursor::Cursor;
use crate::btree::layout::{self, Geometry, Head, NO_BLOCK};
use crate::cache::{PageCache, PageHandle};
use crate::error::{CoreError, CoreResult};
use std::cmp::Ordering;

/// Fixed-size encoding of B-tree keys and values.
pub trait KeyCodec: Send + Sync {
    /// Decoded key.
    type Key;
    /// Decoded value.
    type Value;

    /// Encoded key size in bytes.
    fn key_size(&self) -> usize;
    /// Encoded value size in bytes.
    fn value_size(&self) -> usize;
    /// Decodes a key from exactly `key_size` bytes.
    fn read_key(&self, bytes: &[u8]) -> Self::Key;
    /// Encodes a key into exactly `key_size` bytes.
    fn write_key(&self, key: &Self::Key, out: &mut [u8]);
    /// Decodes a value from exactly `value_size` bytes.
    fn read_value(&self, bytes: &[u8]) -> Self::Value;
    /// Encodes a value into exactly `value_size` bytes.
    fn write_value(&self, value: &Self::Value, out: &mut [u8]);
}

/// Position of one leaf entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ref {
    /// Leaf block number.
    pub block: u32,
    /// Entry index within the leaf.
    pub entry: u32,
}

/// A B+-tree of fixed-size entries stored in a page cache.
///
/// Comparisons are supplied per call as `FnMut(&Key) -> CoreResult<Ordering>`
/// returning how a stored key relates to the target. They may fail and may
/// perform I/O of their own.
pub struct Btree<C: KeyCodec> {
    cache: PageCache,
    codec: C,
    geometry: Geometry,
    head: Head,
}

/// Index of the first entry in `0..count` for which `pred` is false, given
/// that `pred` holds for a prefix.
fn partition_point<F>(count: usize, mut pred: F) -> CoreResult<usize>
where
    F: FnMut(usize) -> CoreResult<bool>,
{
    let (mut low, mut high) = (0, count);
    while low < high {
        let mid = low + (high - low) / 2;
        if pred(mid)? {
            low = mid + 1;
        } else {
            high = mid;
        }
    }
    Ok(low)
}

impl<C: KeyCodec> Btree<C> {
    /// Writes a fresh head and an empty root leaf.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] if a page cannot hold at least
    /// four entries, or an I/O error.
    pub fn create(cache: PageCache, codec: C) -> CoreResult<Self> {
        let geometry = Geometry::new(cache.page_size(), codec.key_size(), codec.value_size())?;
        let head = Head {
            root: 1,
            num_blocks: 2,
            depth: 1,
        };
        {
            let root = cache.initialize_page(1)?;
            layout::init_leaf(&mut root.write(), NO_BLOCK, NO_BLOCK);
        }
        let tree = Self {
            cache,
            codec,
            geometry,
            head,
        };
        tree.write_head()?;
        Ok(tree)
    }

    /// Opens a tree written by [`Btree::create`].
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidFormat`] if block 0 is not a B-tree head.
    pub fn open(cache: PageCache, codec: C) -> CoreResult<Self> {
        let geometry = Geometry::new(cache.page_size(), codec.key_size(), codec.value_size())?;
        let head = Head::decode(&cache.read_page(0)?.read())?;
        Ok(Self {
            cache,
            codec,
            geometry,
            head,
        })
    }

    fn write_head(&self) -> CoreResult<()> {
        let page = self.cache.read_page(0)?;
        self.head.encode(&mut page.write());
        Ok(())
    }

    pub(crate) fn page(&self, block: u32) -> CoreResult<PageHandle> {
        if block == 0 || block >= self.head.num_blocks {
            return Err(CoreError::invariant(format!(
                "block {block} outside tree of {} blocks",
                self.head.num_blocks
            )));
        }
        self.cache.read_page(u64::from(block))
    }

    fn allocate(&mut self) -> CoreResult<(u32, PageHandle)> {
        let block = self.head.num_blocks;
        if block == NO_BLOCK {
            return Err(CoreError::invariant("B-tree block numbers exhausted"));
        }
        self.head.num_blocks += 1;
        let page = self.cache.initialize_page(u64::from(block))?;
        Ok((block, page))
    }

    pub(crate) fn codec(&self) -> &C {
        &self.codec
    }

    pub(crate) fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    fn key_at(&self, page: &PageHandle, index: usize) -> C::Key {
        self.codec.read_key(self.geometry.key(&page.read(), index))
    }

    fn encode_key(&self, key: &C::Key) -> Vec<u8> {
        let mut bytes = vec![0; self.geometry.key_size];
        self.codec.write_key(key, &mut bytes);
        bytes
    }

    fn encode_value(&self, value: &C::Value) -> Vec<u8> {
        let mut bytes = vec![0; self.geometry.value_size];
        self.codec.write_value(value, &mut bytes);
        bytes
    }

    /// Number of `page`'s leading entries for which `pred` holds.
    fn count_while<F>(
        &self,
        page: &PageHandle,
        compare: &mut F,
        pred: fn(Ordering) -> bool,
    ) -> CoreResult<usize>
    where
        F: FnMut(&C::Key) -> CoreResult<Ordering>,
    {
        let count = layout::count(&page.read());
        partition_point(count, |index| {
            let key = self.key_at(page, index);
            Ok(pred(compare(&key)?))
        })
    }

    /// Inserts an entry after every stored key that compares less or equal.
    ///
    /// Full blocks met on the way down are split first, so the leaf always
    /// has room. Splitting the root adds a level.
    ///
    /// # Errors
    ///
    /// Returns the first error from `compare` or the page cache, or
    /// [`CoreError::InvariantViolation`] if block bookkeeping is broken.
    pub fn insert<F>(&mut self, key: &C::Key, value: &C::Value, mut compare: F) -> CoreResult<()>
    where
        F: FnMut(&C::Key) -> CoreResult<Ordering>,
    {
        let key_bytes = self.encode_key(key);
        let value_bytes = self.encode_value(value);
        let blocks_before = self.head.num_blocks;

        let root = self.page(self.head.root)?;
        if self.geometry.is_full(&root.read()) {
            let (new_root, parent) = self.allocate()?;
            layout::init_inner(&mut parent.write(), self.head.root);
            self.split_child(&parent, 0, &root)?;
            self.head.root = new_root;
            self.head.depth += 1;
            tracing::debug!(root = new_root, depth = self.head.depth, "B-tree root split");
        }
        drop(root);

        let mut current = self.page(self.head.root)?;
        loop {
            if layout::is_leaf(&current.read()) {
                let slot = self.count_while(&current, &mut compare, |o| o != Ordering::Greater)?;
                self.geometry
                    .insert_entry(&mut current.write(), slot, &key_bytes, &value_bytes)?;
                if self.head.num_blocks != blocks_before {
                    self.write_head()?;
                }
                return Ok(());
            }

            let slot = self.count_while(&current, &mut compare, |o| o == Ordering::Less)?;
            let child_block = self.geometry.child_at_slot(&current.read(), slot);
            let child = self.page(child_block)?;
            if !self.geometry.is_full(&child.read()) {
                current = child;
                continue;
            }

            let (separator, right_block) = self.split_child(&current, slot, &child)?;
            current = if compare(&separator)? == Ordering::Less {
                drop(child);
                self.page(right_block)?
            } else {
                child
            };
        }
    }

    /// Splits the full `child` reached through `slot` of `parent` and inserts
    /// the separator into `parent`. Returns the separator and the new right
    /// block.
    fn split_child(
        &mut self,
        parent: &PageHandle,
        slot: usize,
        child: &PageHandle,
    ) -> CoreResult<(C::Key, u32)> {
        let child_block = child.number() as u32;
        let n = layout::count(&child.read());
        if n < 3 {
            return Err(CoreError::invariant(format!(
                "split of block {child_block} holding only {n} entries"
            )));
        }

        let (right_block, right) = self.allocate()?;
        let geometry = self.geometry;
        let keep = n / 2;
        let mut left = child.write();
        let mut right_bytes = right.write();

        let (separator, moved, old_right) = if layout::is_leaf(&left) {
            let old_right = layout::right(&left);
            layout::init_leaf(&mut right_bytes, child_block, old_right);
            let moved = geometry.entries(&left, keep, n).to_vec();
            geometry.put_entries(&mut right_bytes, &moved);
            layout::set_count(&mut right_bytes, n - keep);
            layout::set_right(&mut left, right_block);
            let separator = self.codec.read_key(geometry.key(&left, keep - 1));
            (separator, n - keep, Some(old_right))
        } else {
            let separator = self.codec.read_key(geometry.key(&left, keep));
            layout::init_inner(&mut right_bytes, geometry.child(&left, keep));
            let moved = geometry.entries(&left, keep + 1, n).to_vec();
            geometry.put_entries(&mut right_bytes, &moved);
            layout::set_count(&mut right_bytes, n - keep - 1);
            (separator, n - keep - 1, None)
        };
        layout::set_count(&mut left, keep);
        drop(right_bytes);
        drop(left);

        match old_right {
            Some(neighbour) if neighbour != NO_BLOCK => {
                layout::set_left(&mut self.page(neighbour)?.write(), right_block);
            }
            _ => {}
        }

        if keep == 0 || moved == 0 || moved > geometry.capacity(old_right.is_some()) {
            return Err(CoreError::invariant(format!(
                "split of block {child_block} left {keep} and {moved} entries"
            )));
        }

        let separator_bytes = self.encode_key(&separator);
        self.geometry.insert_entry(
            &mut parent.write(),
            slot,
            &separator_bytes,
            &right_block.to_le_bytes(),
        )?;
        tracing::trace!(
            block = child_block,
            right = right_block,
            leaf = old_right.is_some(),
            "B-tree block split"
        );
        Ok((separator, right_block))
    }

    fn descend<F>(
        &self,
        compare: &mut F,
        pred: fn(Ordering) -> bool,
    ) -> CoreResult<(PageHandle, usize)>
    where
        F: FnMut(&C::Key) -> CoreResult<Ordering>,
    {
        let mut current = self.page(self.head.root)?;
        loop {
            let slot = self.count_while(&current, compare, pred)?;
            if layout::is_leaf(&current.read()) {
                return Ok((current, slot));
            }
            let child = self.geometry.child_at_slot(&current.read(), slot);
            current = self.page(child)?;
        }
    }

    /// First entry of the leftmost leaf.
    ///
    /// # Errors
    ///
    /// Returns an error if a page cannot be read.
    pub fn find_first(&self) -> CoreResult<Option<Ref>> {
        let mut current = self.page(self.head.root)?;
        loop {
            let (leaf, count, next) = {
                let block = current.read();
                (layout::is_leaf(&block), layout::count(&block), layout::lref(&block))
            };
            if leaf {
                return self.first_from(current.number() as u32, count);
            }
            current = self.page(next)?;
        }
    }

    fn first_from(&self, mut block: u32, mut count: usize) -> CoreResult<Option<Ref>> {
        // Only an empty root leaf has no entries; walk right for safety.
        while count == 0 {
            let next = layout::right(&self.page(block)?.read());
            if next == NO_BLOCK {
                return Ok(None);
            }
            block = next;
            count = layout::count(&self.page(block)?.read());
        }
        Ok(Some(Ref { block, entry: 0 }))
    }

    /// Leftmost entry that compares greater or equal to the target.
    ///
    /// # Errors
    ///
    /// Returns the first error from `compare` or the page cache.
    pub fn find_next<F>(&self, mut compare: F) -> CoreResult<Option<Ref>>
    where
        F: FnMut(&C::Key) -> CoreResult<Ordering>,
    {
        let (leaf, slot) = self.descend(&mut compare, |o| o == Ordering::Less)?;
        let (count, right) = {
            let block = leaf.read();
            (layout::count(&block), layout::right(&block))
        };
        if slot < count {
            return Ok(Some(Ref {
                block: leaf.number() as u32,
                entry: slot as u32,
            }));
        }
        if right == NO_BLOCK {
            return Ok(None);
        }
        drop(leaf);
        let count = layout::count(&self.page(right)?.read());
        self.first_from(right, count)
    }

    /// Rightmost entry that compares less or equal to the target.
    ///
    /// # Errors
    ///
    /// Returns the first error from `compare` or the page cache.
    pub fn find_prev<F>(&self, mut compare: F) -> CoreResult<Option<Ref>>
    where
        F: FnMut(&C::Key) -> CoreResult<Ordering>,
    {
        let (leaf, slot) = self.descend(&mut compare, |o| o != Ordering::Greater)?;
        let block = leaf.number() as u32;
        if slot > 0 {
            return Ok(Some(Ref {
                block,
                entry: slot as u32 - 1,
            }));
        }

        let mut left = layout::left(&leaf.read());
        drop(leaf);
        while left != NO_BLOCK {
            let page = self.page(left)?;
            let (count, next) = {
                let bytes = page.read();
                (layout::count(&bytes), layout::left(&bytes))
            };
            if count > 0 {
                return Ok(Some(Ref {
                    block: left,
                    entry: count as u32 - 1,
                }));
            }
            left = next;
        }
        Ok(None)
    }

    /// Opens a cursor at `start`; `None` yields an exhausted cursor.
    ///
    /// # Errors
    ///
    /// Returns an error if the leaf cannot be read or `start` points past its
    /// entries.
    pub fn cursor(&self, start: Option<Ref>) -> CoreResult<Cursor<'_, C>> {
        Cursor::new(self, start)
    }

    /// Writes dirty pages back.
    ///
    /// # Errors
    ///
    /// Returns an error if a write fails.
    pub fn flush(&self) -> CoreResult<()> {
        self.write_head()?;
        self.cache.flush()
    }

    /// Number of levels, 1 for a tree that is a single leaf.
    #[must_use]
    pub fn depth(&self) -> u32 {
        self.head.depth
    }

    /// Blocks in use, including the head.
    #[must_use]
    pub fn num_blocks(&self) -> u32 {
        self.head.num_blocks
    }

    /// Entries per leaf block.
    #[must_use]
    pub fn leaf_capacity(&self) -> usize {
        self.geometry.leaf_capacity
    }
}

impl<C: KeyCodec> std::fmt::Debug for Btree<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Btree")
            .field("head", &self.head)
            .field("geometry", &self.geometry)
            .finish()
    }
}
