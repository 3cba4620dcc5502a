//! Forward iteration over leaf entries.

use crate::btree::layout::{self, NO_BLOCK};
use crate::btree::tree::{Btree, KeyCodec, Ref};
use crate::cache::PageHandle;
use crate::error::{CoreError, CoreResult};

/// A position in the leaf chain.
///
/// The current leaf stays pinned while the cursor points into it. Once
/// [`Cursor::forward`] runs off the last leaf the cursor is exhausted for
/// good.
pub struct Cursor<'a, C: KeyCodec> {
    tree: &'a Btree<C>,
    page: Option<PageHandle>,
    entry: usize,
}

impl<'a, C: KeyCodec> Cursor<'a, C> {
    pub(crate) fn new(tree: &'a Btree<C>, start: Option<Ref>) -> CoreResult<Self> {
        let Some(start) = start else {
            return Ok(Self {
                tree,
                page: None,
                entry: 0,
            });
        };

        let page = tree.page(start.block)?;
        let count = {
            let block = page.read();
            if !layout::is_leaf(&block) {
                return Err(CoreError::invariant(format!(
                    "cursor placed on inner block {}",
                    start.block
                )));
            }
            layout::count(&block)
        };
        if start.entry as usize >= count {
            return Err(CoreError::invariant(format!(
                "cursor entry {} past {count} entries of block {}",
                start.entry, start.block
            )));
        }
        Ok(Self {
            tree,
            page: Some(page),
            entry: start.entry as usize,
        })
    }

    /// Whether the cursor points at an entry.
    #[must_use]
    pub fn valid(&self) -> bool {
        self.page.is_some()
    }

    /// The current position.
    #[must_use]
    pub fn position(&self) -> Option<Ref> {
        self.page.as_ref().map(|page| Ref {
            block: page.number() as u32,
            entry: self.entry as u32,
        })
    }

    fn current(&self) -> CoreResult<&PageHandle> {
        self.page
            .as_ref()
            .ok_or_else(|| CoreError::invariant("cursor read after end"))
    }

    /// Key at the cursor.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvariantViolation`] on an exhausted cursor.
    pub fn key(&self) -> CoreResult<C::Key> {
        let page = self.current()?;
        let block = page.read();
        Ok(self
            .tree
            .codec()
            .read_key(self.tree.geometry().key(&block, self.entry)))
    }

    /// Value at the cursor.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvariantViolation`] on an exhausted cursor.
    pub fn value(&self) -> CoreResult<C::Value> {
        let page = self.current()?;
        let block = page.read();
        Ok(self
            .tree
            .codec()
            .read_value(self.tree.geometry().value(&block, self.entry)))
    }

    /// Overwrites the value at the cursor in place.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvariantViolation`] on an exhausted cursor.
    pub fn set_value(&mut self, value: &C::Value) -> CoreResult<()> {
        let page = self.current()?;
        let mut block = page.write();
        let slot = self.tree.geometry().value_mut(&mut block, self.entry);
        self.tree.codec().write_value(value, slot);
        Ok(())
    }

    /// Moves to the next entry, crossing into the right sibling when the
    /// leaf is used up.
    ///
    /// # Errors
    ///
    /// Returns an error if the sibling cannot be read.
    pub fn forward(&mut self) -> CoreResult<()> {
        let Some(page) = self.page.take() else {
            return Ok(());
        };

        let (count, mut next) = {
            let block = page.read();
            (layout::count(&block), layout::right(&block))
        };
        if self.entry + 1 < count {
            self.entry += 1;
            self.page = Some(page);
            return Ok(());
        }
        drop(page);

        while next != NO_BLOCK {
            let page = self.tree.page(next)?;
            let (count, right) = {
                let block = page.read();
                (layout::count(&block), layout::right(&block))
            };
            if count > 0 {
                self.entry = 0;
                self.page = Some(page);
                return Ok(());
            }
            next = right;
        }
        Ok(())
    }
}

impl<C: KeyCodec> std::fmt::Debug for Cursor<'_, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("position", &self.position())
            .finish()
    }
}
