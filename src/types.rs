//! Shared identifiers, error type and page geometry.

use std::fmt;

/// Handle of a page owned by the tree's arena. `0` is reserved for "no page".
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, serde::Serialize)]
pub struct PageId(pub u64);

impl PageId {
    /// Sentinel stored in header fields that point nowhere.
    pub const NONE: PageId = PageId(0);

    /// Decodes a raw header field, mapping `0` to `None`.
    pub fn from_raw(raw: u64) -> Option<Self> {
        if raw == 0 {
            None
        } else {
            Some(PageId(raw))
        }
    }

    /// Encodes an optional id the way header fields store it.
    pub fn to_raw(id: Option<PageId>) -> u64 {
        id.unwrap_or(PageId::NONE).0
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors surfaced by the tree.
///
/// `Corruption` means a structural invariant no longer holds; the tree must
/// not be used afterwards. Every other variant leaves the tree unchanged.
#[derive(thiserror::Error, Debug)]
pub enum PagetreeError {
    /// Insert of a key that is already stored.
    #[error("key already present")]
    DuplicateKey,
    /// Key and value together can never fit in a page.
    #[error("cell footprint {footprint} exceeds the per-cell limit of {limit} bytes")]
    CellTooLarge {
        /// Bytes the cell would occupy.
        footprint: usize,
        /// Largest admissible footprint.
        limit: usize,
    },
    /// The arena reached its configured page limit.
    #[error("page arena exhausted after {limit} pages")]
    OutOfPages {
        /// Configured page limit.
        limit: usize,
    },
    /// A structural invariant was violated.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller misuse, such as a stale slot reference.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, PagetreeError>;

pub mod page {
    //! Fixed geometry of every page in the tree.

    /// Size of every page, leaf or internal.
    pub const PAGE_SIZE: usize = 32 * 1024;

    /// Bytes reserved for the page header ahead of the slot array.
    pub const PAGE_HDR_LEN: usize = 56;

    /// Bytes per slot array entry (a single `u32` cell offset).
    pub const SLOT_LEN: usize = 4;

    /// Bytes of the header shared by every cell shape.
    pub const CELL_HDR_LEN: usize = 16;

    /// Alignment of every cell footprint.
    pub const CELL_ALIGN: usize = 8;

    /// Largest footprint a single cell may occupy. Keeping cells at or below an
    /// eighth of a page leaves room on both halves of any split.
    pub const MAX_CELL_FOOTPRINT: usize = PAGE_SIZE / 8;

    /// Rounds `len` up to the cell alignment.
    #[inline]
    pub const fn align_up(len: usize) -> usize {
        (len + CELL_ALIGN - 1) & !(CELL_ALIGN - 1)
    }
}
