//! Slotted page layout: header, slot array and the backward-growing payload area.
//!
//! ```text
//! 0         56                      slot_end        cell_offset           PAGE_SIZE
//! | header  | slot[0] slot[1] ...   |   free gap    | cells, tombstones ... |
//! ```
//!
//! The slot array grows upward from the header, cells are carved downward from
//! `cell_offset`. Dead cells are threaded into a first-fit free list through
//! their headers and reused before the gap is touched.

use std::cmp::Ordering;
use std::fmt;
use std::fmt::Write as _;

use super::cell::{self, CellRef, Tombstone};
use crate::types::page::{CELL_HDR_LEN, PAGE_HDR_LEN, PAGE_SIZE, SLOT_LEN};
use crate::types::{PageId, PagetreeError, Result};

const NEXT_OVERFLOW_OFFSET: usize = 0;
const LAST_OVERFLOW_OFFSET: usize = 8;
const RIGHTMOST_OFFSET: usize = 16;
const PARENT_OFFSET: usize = 24;
const SIZE_OFFSET: usize = 32;
const CELL_OFFSET_OFFSET: usize = 36;
const TOMBSTONE_OFFSET_OFFSET: usize = 40;
const TOMBSTONE_BYTES_OFFSET: usize = 44;
const FLAGS_OFFSET: usize = 48;

/// Header flag marking a leaf page.
pub const FLAG_LEAF: u16 = 1 << 0;
/// Header flag marking the current root.
pub const FLAG_ROOT: u16 = 1 << 1;

/// Upper bound on free-list hops; a longer walk means the list is cyclic.
const MAX_TOMBSTONE_HOPS: usize = PAGE_SIZE / CELL_HDR_LEN;

/// Outcome of a binary search over the slot array.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Probe {
    /// The key lives at this slot.
    Hit(usize),
    /// The key is absent and would be inserted at this slot.
    Miss(usize),
}

impl Probe {
    /// Whether the key was found.
    pub fn found(self) -> bool {
        matches!(self, Probe::Hit(_))
    }

    /// Exact index on a hit, insertion index on a miss.
    pub fn index(self) -> usize {
        match self {
            Probe::Hit(idx) | Probe::Miss(idx) => idx,
        }
    }
}

/// Orders keys by the bytes they share, then by length, so a key sorts before
/// any longer key it prefixes.
#[inline]
pub fn compare_keys(a: &[u8], b: &[u8]) -> Ordering {
    let shared = a.len().min(b.len());
    match a[..shared].cmp(&b[..shared]) {
        Ordering::Equal => a.len().cmp(&b.len()),
        other => other,
    }
}

/// One fixed-size page.
#[derive(Clone)]
pub struct Page {
    buf: Box<[u8]>,
}

impl Page {
    /// Allocates a zeroed page. Initialise it with [`Page::init`] before use.
    pub fn alloc() -> Self {
        Self {
            buf: vec![0u8; PAGE_SIZE].into_boxed_slice(),
        }
    }

    /// Resets the page to an empty leaf or internal page.
    pub fn init(&mut self, is_leaf: bool, is_root: bool) {
        self.buf[..PAGE_HDR_LEN].fill(0);
        let mut flags = 0;
        if is_leaf {
            flags |= FLAG_LEAF;
        }
        if is_root {
            flags |= FLAG_ROOT;
        }
        cell::write_u16(&mut self.buf, FLAGS_OFFSET, flags);
        self.set_cell_offset(PAGE_SIZE as u32);
    }

    /// Raw page bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Number of live slots.
    pub fn size(&self) -> usize {
        cell::read_u32(&self.buf, SIZE_OFFSET) as usize
    }

    /// Low-water mark of the payload area.
    pub fn cell_offset(&self) -> usize {
        cell::read_u32(&self.buf, CELL_OFFSET_OFFSET) as usize
    }

    /// Head of the free list, `0` when empty.
    pub fn tombstone_offset(&self) -> usize {
        cell::read_u32(&self.buf, TOMBSTONE_OFFSET_OFFSET) as usize
    }

    /// Bytes currently reclaimable through the free list.
    pub fn tombstone_bytes(&self) -> usize {
        cell::read_u32(&self.buf, TOMBSTONE_BYTES_OFFSET) as usize
    }

    /// Raw header flags.
    pub fn flags(&self) -> u16 {
        cell::read_u16(&self.buf, FLAGS_OFFSET)
    }

    /// Whether this is a leaf page.
    pub fn is_leaf(&self) -> bool {
        self.flags() & FLAG_LEAF != 0
    }

    /// Whether this page is flagged as the root.
    pub fn is_root(&self) -> bool {
        self.flags() & FLAG_ROOT != 0
    }

    /// Sets or clears the root flag.
    pub fn set_root(&mut self, is_root: bool) {
        let flags = if is_root {
            self.flags() | FLAG_ROOT
        } else {
            self.flags() & !FLAG_ROOT
        };
        cell::write_u16(&mut self.buf, FLAGS_OFFSET, flags);
    }

    /// Owning internal page, `None` for the root.
    pub fn parent(&self) -> Option<PageId> {
        PageId::from_raw(cell::read_u64(&self.buf, PARENT_OFFSET))
    }

    /// Updates the back-reference to the owning internal page.
    pub fn set_parent(&mut self, parent: Option<PageId>) {
        cell::write_u64(&mut self.buf, PARENT_OFFSET, PageId::to_raw(parent));
    }

    /// Child covering keys at or above the last separator (internal pages only).
    pub fn rightmost_child(&self) -> Option<PageId> {
        PageId::from_raw(cell::read_u64(&self.buf, RIGHTMOST_OFFSET))
    }

    /// Replaces the rightmost child reference.
    pub fn set_rightmost_child(&mut self, child: Option<PageId>) {
        cell::write_u64(&mut self.buf, RIGHTMOST_OFFSET, PageId::to_raw(child));
    }

    /// Overflow chain head. Always `None`: overflow pages are not implemented.
    pub fn next_overflow(&self) -> Option<PageId> {
        PageId::from_raw(cell::read_u64(&self.buf, NEXT_OVERFLOW_OFFSET))
    }

    /// Overflow chain tail. Always `None`: overflow pages are not implemented.
    pub fn last_overflow(&self) -> Option<PageId> {
        PageId::from_raw(cell::read_u64(&self.buf, LAST_OVERFLOW_OFFSET))
    }

    /// Byte offset one past the end of the slot array.
    pub fn slot_end(&self) -> usize {
        PAGE_HDR_LEN + SLOT_LEN * self.size()
    }

    /// Bytes between the slot array and the payload area.
    pub fn free_gap(&self) -> usize {
        self.cell_offset().saturating_sub(self.slot_end())
    }

    /// Payload offset referenced by slot `idx`.
    pub fn slot(&self, idx: usize) -> usize {
        cell::read_u32(&self.buf, PAGE_HDR_LEN + idx * SLOT_LEN) as usize
    }

    fn set_slot(&mut self, idx: usize, offset: usize) {
        cell::write_u32(&mut self.buf, PAGE_HDR_LEN + idx * SLOT_LEN, offset as u32);
    }

    fn set_size(&mut self, size: usize) {
        cell::write_u32(&mut self.buf, SIZE_OFFSET, size as u32);
    }

    fn set_cell_offset(&mut self, offset: u32) {
        cell::write_u32(&mut self.buf, CELL_OFFSET_OFFSET, offset);
    }

    fn set_tombstone_offset(&mut self, offset: usize) {
        cell::write_u32(&mut self.buf, TOMBSTONE_OFFSET_OFFSET, offset as u32);
    }

    fn set_tombstone_bytes(&mut self, bytes: usize) {
        cell::write_u32(&mut self.buf, TOMBSTONE_BYTES_OFFSET, bytes as u32);
    }

    /// Key of the cell behind slot `idx`.
    pub fn key_at(&self, idx: usize) -> &[u8] {
        cell::key_at(&self.buf, self.slot(idx))
    }

    /// Decoded cell behind slot `idx`.
    pub fn cell(&self, idx: usize) -> CellRef<'_> {
        cell::decode(&self.buf, self.slot(idx), self.is_leaf())
    }

    /// Footprint of the cell behind slot `idx`.
    pub fn cell_footprint(&self, idx: usize) -> usize {
        cell::footprint_at(&self.buf, self.slot(idx))
    }

    /// Raw bytes of the cell behind slot `idx`, header included.
    pub fn raw_cell(&self, idx: usize) -> &[u8] {
        let offset = self.slot(idx);
        &self.buf[offset..offset + cell::footprint_at(&self.buf, offset)]
    }

    /// Iterates the live cells in key order.
    pub fn cells(&self) -> impl Iterator<Item = CellRef<'_>> + '_ {
        (0..self.size()).map(move |idx| self.cell(idx))
    }

    /// Child reached through descent index `idx`: slot `idx`'s child while
    /// `idx < size`, the rightmost child at `idx == size`.
    pub fn child_at(&self, idx: usize) -> Result<PageId> {
        if self.is_leaf() {
            return Err(PagetreeError::Invalid("leaf pages have no children"));
        }
        let size = self.size();
        let child = if idx < size {
            cell::child(&self.buf, self.slot(idx))
        } else if idx == size {
            self.rightmost_child()
        } else {
            return Err(PagetreeError::Invalid("child index out of range"));
        };
        child.ok_or(PagetreeError::Corruption("internal page has a null child"))
    }

    /// Redirects descent index `idx` to `child`.
    pub fn set_child_at(&mut self, idx: usize, child: PageId) -> Result<()> {
        if self.is_leaf() {
            return Err(PagetreeError::Invalid("leaf pages have no children"));
        }
        let size = self.size();
        if idx < size {
            let offset = self.slot(idx);
            cell::set_child(&mut self.buf, offset, child);
        } else if idx == size {
            self.set_rightmost_child(Some(child));
        } else {
            return Err(PagetreeError::Invalid("child index out of range"));
        }
        Ok(())
    }

    /// Every child reference in key order, rightmost last.
    pub fn children(&self) -> Result<Vec<PageId>> {
        (0..=self.size()).map(|idx| self.child_at(idx)).collect()
    }

    /// Binary search over the slot array.
    pub fn binary_search(&self, key: &[u8]) -> Probe {
        let mut lo = 0usize;
        let mut hi = self.size();
        while lo < hi {
            let mid = (lo + hi) / 2;
            match compare_keys(key, self.key_at(mid)) {
                Ordering::Equal => return Probe::Hit(mid),
                Ordering::Greater => lo = mid + 1,
                Ordering::Less => hi = mid,
            }
        }
        Probe::Miss(lo)
    }

    /// Index of the child to follow for `key`. A separator is the smallest key
    /// of the subtree to its right, so an exact hit descends past it.
    pub fn descent_index(&self, key: &[u8]) -> usize {
        match self.binary_search(key) {
            Probe::Hit(idx) => idx + 1,
            Probe::Miss(idx) => idx,
        }
    }

    /// True when neither the free list nor the gap can hold a cell of this
    /// shape together with one more slot.
    pub fn is_full(&self, key_size: usize, value_size: usize) -> bool {
        let need = cell::footprint(key_size, value_size);
        let slots_after = self.slot_end() + SLOT_LEN;
        let cell_offset = self.cell_offset();
        if slots_after > cell_offset {
            return true;
        }
        if self.find_tombstone(need).is_some() {
            return false;
        }
        cell_offset - slots_after < need
    }

    /// Reserves space for a cell, preferring the free list over the gap.
    /// Returns `0` when the page has no room.
    pub fn acquire_offset(&mut self, key_size: usize, value_size: usize) -> usize {
        if self.is_full(key_size, value_size) {
            return 0;
        }
        let need = cell::footprint(key_size, value_size);
        if let Some(offset) = self.take_tombstone(need) {
            return offset;
        }
        self.cell_offset() - need
    }

    fn find_tombstone(&self, need: usize) -> Option<(Option<usize>, usize, Tombstone)> {
        let mut prev = None;
        let mut cur = self.tombstone_offset();
        let mut hops = 0;
        while cur != 0 && hops < MAX_TOMBSTONE_HOPS {
            let tombstone = cell::read_tombstone(&self.buf, cur);
            if tombstone.size as usize >= need {
                return Some((prev, cur, tombstone));
            }
            prev = Some(cur);
            cur = tombstone.next as usize;
            hops += 1;
        }
        None
    }

    fn take_tombstone(&mut self, need: usize) -> Option<usize> {
        let (prev, offset, tombstone) = self.find_tombstone(need)?;
        let remainder = tombstone.size as usize - need;
        let (replacement, reclaimed) = if remainder > CELL_HDR_LEN {
            let tail = offset + need;
            cell::write_tombstone(
                &mut self.buf,
                tail,
                Tombstone {
                    size: remainder as u32,
                    next: tombstone.next,
                },
            );
            (tail, need)
        } else {
            (tombstone.next as usize, tombstone.size as usize)
        };
        match prev {
            Some(prev_offset) => {
                let mut prev_node = cell::read_tombstone(&self.buf, prev_offset);
                prev_node.next = replacement as u32;
                cell::write_tombstone(&mut self.buf, prev_offset, prev_node);
            }
            None => self.set_tombstone_offset(replacement),
        }
        let bytes = self.tombstone_bytes().saturating_sub(reclaimed);
        self.set_tombstone_bytes(bytes);
        Some(offset)
    }

    fn open_slot(&mut self, offset: usize, idx: usize) {
        let size = self.size();
        let start = PAGE_HDR_LEN + idx * SLOT_LEN;
        let end = PAGE_HDR_LEN + size * SLOT_LEN;
        self.buf.copy_within(start..end, start + SLOT_LEN);
        self.set_slot(idx, offset);
        self.set_size(size + 1);
        if offset < self.cell_offset() {
            self.set_cell_offset(offset as u32);
        }
    }

    /// Writes a leaf cell at a reserved `offset` and links it at slot `idx`.
    pub fn insert_leaf_cell(&mut self, offset: usize, idx: usize, key: &[u8], value: &[u8]) {
        self.open_slot(offset, idx);
        cell::write_leaf(&mut self.buf, offset, key, value, 0);
    }

    /// Writes an internal cell at a reserved `offset` and links it at slot `idx`.
    pub fn insert_internal_cell(&mut self, offset: usize, idx: usize, key: &[u8], child: PageId) {
        self.open_slot(offset, idx);
        cell::write_internal(&mut self.buf, offset, key, child);
    }

    /// Copies an encoded cell verbatim behind a new last slot. Callers append
    /// in key order.
    pub(crate) fn append_raw_cell(&mut self, raw: &[u8]) -> Result<()> {
        let footprint = raw.len();
        if self.slot_end() + SLOT_LEN + footprint > self.cell_offset() {
            return Err(PagetreeError::Corruption("sibling page overflowed during split"));
        }
        let offset = self.cell_offset() - footprint;
        self.buf[offset..offset + footprint].copy_from_slice(raw);
        let size = self.size();
        self.open_slot(offset, size);
        Ok(())
    }

    /// Removes `key`, turning its cell into a tombstone. Returns whether the
    /// key was present.
    pub fn delete_key(&mut self, key: &[u8]) -> bool {
        match self.binary_search(key) {
            Probe::Hit(idx) => {
                self.remove_slot(idx);
                true
            }
            Probe::Miss(_) => false,
        }
    }

    /// Tombstones the cell behind slot `idx` and closes the slot.
    pub(crate) fn remove_slot(&mut self, idx: usize) {
        self.tombstone_slot(idx);
        let size = self.size();
        let start = PAGE_HDR_LEN + (idx + 1) * SLOT_LEN;
        let end = PAGE_HDR_LEN + size * SLOT_LEN;
        self.buf.copy_within(start..end, start - SLOT_LEN);
        self.set_size(size - 1);
    }

    /// Pushes the cell behind slot `idx` onto the free list without touching
    /// the slot array.
    pub(crate) fn tombstone_slot(&mut self, idx: usize) {
        let offset = self.slot(idx);
        let footprint = cell::footprint_at(&self.buf, offset);
        let head = self.tombstone_offset();
        cell::write_tombstone(
            &mut self.buf,
            offset,
            Tombstone {
                size: footprint as u32,
                next: head as u32,
            },
        );
        self.set_tombstone_offset(offset);
        let bytes = self.tombstone_bytes() + footprint;
        self.set_tombstone_bytes(bytes);
    }

    /// Drops every slot at or past `len`. The cells must already be tombstoned.
    pub(crate) fn truncate_slots(&mut self, len: usize) {
        if len < self.size() {
            self.set_size(len);
        }
    }

    /// Sum of live cell footprints.
    pub fn live_bytes(&self) -> usize {
        (0..self.size()).map(|idx| self.cell_footprint(idx)).sum()
    }

    /// Whether rewriting the live cells contiguously would leave room for a
    /// cell of `footprint` bytes plus its slot.
    pub fn fits_after_compaction(&self, footprint: usize) -> bool {
        let used = self.slot_end() + SLOT_LEN + self.live_bytes() + footprint;
        used <= PAGE_SIZE
    }

    /// Repacks live cells against the page end in slot order and empties the
    /// free list. Slot indices are unchanged.
    pub fn compact(&mut self) {
        let scratch = self.buf.clone();
        let mut cursor = PAGE_SIZE;
        for idx in 0..self.size() {
            let old = self.slot(idx);
            let footprint = cell::footprint_at(&scratch, old);
            cursor -= footprint;
            self.buf[cursor..cursor + footprint].copy_from_slice(&scratch[old..old + footprint]);
            self.set_slot(idx, cursor);
        }
        let slot_end = self.slot_end();
        self.buf[slot_end..cursor].fill(0);
        self.set_cell_offset(cursor as u32);
        self.set_tombstone_offset(0);
        self.set_tombstone_bytes(0);
    }

    /// Offsets and sizes of every node on the free list, head first.
    pub fn tombstones(&self) -> Result<Vec<(usize, Tombstone)>> {
        let mut out = Vec::new();
        let mut cur = self.tombstone_offset();
        while cur != 0 {
            if out.len() >= MAX_TOMBSTONE_HOPS {
                return Err(PagetreeError::Corruption("tombstone list is cyclic"));
            }
            if cur < PAGE_HDR_LEN || cur + CELL_HDR_LEN > PAGE_SIZE {
                return Err(PagetreeError::Corruption("tombstone offset outside page"));
            }
            let tombstone = cell::read_tombstone(&self.buf, cur);
            out.push((cur, tombstone));
            cur = tombstone.next as usize;
        }
        Ok(out)
    }

    /// Multi-line dump of the header, cells and, optionally, the free list.
    pub fn describe(&self, show_cells: bool, show_tombstones: bool) -> String {
        let mut out = format!("{self:?}\n");
        if show_cells {
            for idx in 0..self.size() {
                let offset = self.slot(idx);
                let cell = self.cell(idx);
                let _ = write!(
                    out,
                    "  [{idx}] off={offset} key={:?} value_len={}",
                    String::from_utf8_lossy(cell.key),
                    cell.value.len()
                );
                if !self.is_leaf() {
                    let _ = write!(out, " child={}", PageId::to_raw(cell::child(&self.buf, offset)));
                }
                out.push('\n');
            }
        }
        if show_tombstones {
            match self.tombstones() {
                Ok(list) => {
                    for (offset, tombstone) in list {
                        let _ = writeln!(out, "  tombstone off={offset} size={}", tombstone.size);
                    }
                }
                Err(err) => {
                    let _ = writeln!(out, "  tombstones unreadable: {err}");
                }
            }
        }
        out
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("leaf", &self.is_leaf())
            .field("root", &self.is_root())
            .field("size", &self.size())
            .field("cell_offset", &self.cell_offset())
            .field("tombstone_offset", &self.tombstone_offset())
            .field("tombstone_bytes", &self.tombstone_bytes())
            .field("parent", &self.parent())
            .field("rightmost_child", &self.rightmost_child())
            .finish()
    }
}
