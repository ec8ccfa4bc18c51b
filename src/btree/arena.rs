//! Owning store for every page of a tree, addressed by [`PageId`].
//!
//! Ids are `slot index + 1` so that `0` stays free as the "no page" marker in
//! page headers. Released ids are recycled lowest-first, so a tree that is
//! cleared and refilled reuses the same slots instead of growing the arena.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use super::page::Page;
use crate::types::{PageId, PagetreeError, Result};

/// Arena of fixed-size pages.
#[derive(Default)]
pub struct PageArena {
    pages: Vec<Option<Page>>,
    free: BinaryHeap<Reverse<u64>>,
    limit: Option<usize>,
}

impl PageArena {
    /// Creates an arena that refuses to hold more than `limit` live pages.
    pub fn with_limit(limit: Option<usize>) -> Self {
        Self {
            pages: Vec::new(),
            free: BinaryHeap::new(),
            limit,
        }
    }

    /// Number of live pages.
    pub fn live_pages(&self) -> usize {
        self.pages.len() - self.free.len()
    }

    /// Fails with `OutOfPages` unless `count` more pages can be allocated.
    pub fn ensure_available(&self, count: usize) -> Result<()> {
        match self.limit {
            Some(limit) if self.live_pages() + count > limit => Err(PagetreeError::OutOfPages { limit }),
            _ => Ok(()),
        }
    }

    /// Allocates and initialises a page.
    pub fn allocate(&mut self, is_leaf: bool, is_root: bool) -> Result<PageId> {
        self.ensure_available(1)?;
        let mut page = Page::alloc();
        page.init(is_leaf, is_root);
        if let Some(Reverse(raw)) = self.free.pop() {
            let slot = self.slot_index(PageId(raw))?;
            self.pages[slot] = Some(page);
            return Ok(PageId(raw));
        }
        self.pages.push(Some(page));
        Ok(PageId(self.pages.len() as u64))
    }

    /// Returns `id` to the arena. The page must no longer be referenced.
    pub fn release(&mut self, id: PageId) -> Result<()> {
        let slot = self.slot_index(id)?;
        if self.pages[slot].take().is_none() {
            return Err(PagetreeError::Invalid("page released twice"));
        }
        self.free.push(Reverse(id.0));
        Ok(())
    }

    /// Shared access to a live page.
    pub fn get(&self, id: PageId) -> Result<&Page> {
        let slot = self.slot_index(id)?;
        self.pages[slot]
            .as_ref()
            .ok_or(PagetreeError::Corruption("dangling page reference"))
    }

    /// Exclusive access to a live page.
    pub fn get_mut(&mut self, id: PageId) -> Result<&mut Page> {
        let slot = self.slot_index(id)?;
        self.pages[slot]
            .as_mut()
            .ok_or(PagetreeError::Corruption("dangling page reference"))
    }

    /// Exclusive access to two distinct pages at once.
    pub fn pair_mut(&mut self, a: PageId, b: PageId) -> Result<(&mut Page, &mut Page)> {
        if a == b {
            return Err(PagetreeError::Invalid("pair_mut requires distinct pages"));
        }
        let ia = self.slot_index(a)?;
        let ib = self.slot_index(b)?;
        let (first, second) = if ia < ib {
            let (lo, hi) = self.pages.split_at_mut(ib);
            (&mut lo[ia], &mut hi[0])
        } else {
            let (lo, hi) = self.pages.split_at_mut(ia);
            (&mut hi[0], &mut lo[ib])
        };
        match (first.as_mut(), second.as_mut()) {
            (Some(pa), Some(pb)) => Ok((pa, pb)),
            _ => Err(PagetreeError::Corruption("dangling page reference")),
        }
    }

    fn slot_index(&self, id: PageId) -> Result<usize> {
        if id.0 == 0 || id.0 as usize > self.pages.len() {
            return Err(PagetreeError::Corruption("page id outside arena"));
        }
        Ok(id.0 as usize - 1)
    }
}
