//! Cell codec for the variable-length records stored in a page's payload area.
//!
//! Every cell starts with a 16-byte header. The first eight bytes are shape
//! specific:
//!
//! ```text
//! leaf:      flags:u16 | reserved:u16 | value_size:u32 | key_size:u32 | total_size:u32 | key | value
//! internal:  child:u64                                 | key_size:u32 | total_size:u32 | key
//! tombstone: reclaimable_size:u32 | next_offset:u32    | (stale key_size / total_size)
//! ```
//!
//! `total_size` counts the key and value bytes only. The codec performs no
//! bounds checking: callers hand it offsets reserved by the page allocator.

use crate::types::page::{align_up, CELL_HDR_LEN};
use crate::types::PageId;

const FLAGS_OFFSET: usize = 0;
const VALUE_SIZE_OFFSET: usize = 4;
const CHILD_OFFSET: usize = 0;
const TOMBSTONE_SIZE_OFFSET: usize = 0;
const TOMBSTONE_NEXT_OFFSET: usize = 4;
const KEY_SIZE_OFFSET: usize = 8;
const TOTAL_SIZE_OFFSET: usize = 12;

/// Zero-copy view of a cell: key and value slices borrowed from the page.
///
/// `value` is empty for internal cells.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CellRef<'a> {
    /// Key bytes.
    pub key: &'a [u8],
    /// Value bytes (leaf cells only).
    pub value: &'a [u8],
}

/// Free-list node written over a dead cell's header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tombstone {
    /// Bytes reclaimable at this offset.
    pub size: u32,
    /// Page-relative offset of the next tombstone, `0` terminates the list.
    pub next: u32,
}

/// Bytes a cell with the given key and value lengths occupies in the payload area.
#[inline]
pub fn footprint(key_len: usize, value_len: usize) -> usize {
    align_up(CELL_HDR_LEN + key_len + value_len)
}

/// Footprint of the cell already stored at `offset`.
#[inline]
pub fn footprint_at(buf: &[u8], offset: usize) -> usize {
    align_up(CELL_HDR_LEN + read_u32(buf, offset + TOTAL_SIZE_OFFSET) as usize)
}

/// Key bytes of the cell at `offset`.
#[inline]
pub fn key_at(buf: &[u8], offset: usize) -> &[u8] {
    let key_len = read_u32(buf, offset + KEY_SIZE_OFFSET) as usize;
    let start = offset + CELL_HDR_LEN;
    &buf[start..start + key_len]
}

/// Raw `(key_size, value_size, total_size)` fields of the header at `offset`.
/// `value_size` is meaningless for internal cells.
pub fn lengths_at(buf: &[u8], offset: usize) -> (usize, usize, usize) {
    (
        read_u32(buf, offset + KEY_SIZE_OFFSET) as usize,
        read_u32(buf, offset + VALUE_SIZE_OFFSET) as usize,
        read_u32(buf, offset + TOTAL_SIZE_OFFSET) as usize,
    )
}

/// Decodes the cell at `offset`; `is_leaf` selects the header shape.
pub fn decode(buf: &[u8], offset: usize, is_leaf: bool) -> CellRef<'_> {
    let key = key_at(buf, offset);
    if !is_leaf {
        return CellRef { key, value: &[] };
    }
    let value_len = read_u32(buf, offset + VALUE_SIZE_OFFSET) as usize;
    let start = offset + CELL_HDR_LEN + key.len();
    CellRef {
        key,
        value: &buf[start..start + value_len],
    }
}

/// Child reference of the internal cell at `offset`.
#[inline]
pub fn child(buf: &[u8], offset: usize) -> Option<PageId> {
    PageId::from_raw(read_u64(buf, offset + CHILD_OFFSET))
}

/// Rewrites the child reference of the internal cell at `offset`.
#[inline]
pub fn set_child(buf: &mut [u8], offset: usize, child: PageId) {
    write_u64(buf, offset + CHILD_OFFSET, child.0);
}

/// Serialises a leaf cell at `offset`.
pub fn write_leaf(buf: &mut [u8], offset: usize, key: &[u8], value: &[u8], flags: u16) {
    write_u16(buf, offset + FLAGS_OFFSET, flags);
    write_u16(buf, offset + FLAGS_OFFSET + 2, 0);
    write_u32(buf, offset + VALUE_SIZE_OFFSET, value.len() as u32);
    write_u32(buf, offset + KEY_SIZE_OFFSET, key.len() as u32);
    write_u32(
        buf,
        offset + TOTAL_SIZE_OFFSET,
        (key.len() + value.len()) as u32,
    );
    let key_start = offset + CELL_HDR_LEN;
    let value_start = key_start + key.len();
    buf[key_start..value_start].copy_from_slice(key);
    buf[value_start..value_start + value.len()].copy_from_slice(value);
}

/// Serialises an internal cell at `offset`.
pub fn write_internal(buf: &mut [u8], offset: usize, key: &[u8], child: PageId) {
    write_u64(buf, offset + CHILD_OFFSET, child.0);
    write_u32(buf, offset + KEY_SIZE_OFFSET, key.len() as u32);
    write_u32(buf, offset + TOTAL_SIZE_OFFSET, key.len() as u32);
    let key_start = offset + CELL_HDR_LEN;
    buf[key_start..key_start + key.len()].copy_from_slice(key);
}

/// Reads the free-list node at `offset`.
#[inline]
pub fn read_tombstone(buf: &[u8], offset: usize) -> Tombstone {
    Tombstone {
        size: read_u32(buf, offset + TOMBSTONE_SIZE_OFFSET),
        next: read_u32(buf, offset + TOMBSTONE_NEXT_OFFSET),
    }
}

/// Overwrites the header at `offset` with a free-list node.
#[inline]
pub fn write_tombstone(buf: &mut [u8], offset: usize, tombstone: Tombstone) {
    write_u32(buf, offset + TOMBSTONE_SIZE_OFFSET, tombstone.size);
    write_u32(buf, offset + TOMBSTONE_NEXT_OFFSET, tombstone.next);
}

#[inline]
pub(crate) fn read_u16(buf: &[u8], at: usize) -> u16 {
    let mut raw = [0u8; 2];
    raw.copy_from_slice(&buf[at..at + 2]);
    u16::from_le_bytes(raw)
}

#[inline]
pub(crate) fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(raw)
}

#[inline]
pub(crate) fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(raw)
}

#[inline]
pub(crate) fn write_u16(buf: &mut [u8], at: usize, value: u16) {
    buf[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub(crate) fn write_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub(crate) fn write_u64(buf: &mut [u8], at: usize, value: u64) {
    buf[at..at + 8].copy_from_slice(&value.to_le_bytes());
}
