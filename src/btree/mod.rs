#![forbid(unsafe_code)]

//! Slotted-page B-tree over variable-length byte keys.

/// Page arena addressed by [`PageId`](crate::types::PageId).
pub mod arena;
/// Cell codec for the payload area.
pub mod cell;
/// Slotted page layout and in-page operations.
pub mod page;
/// Byte-balanced leaf and internal splits.
pub mod split;
mod stats;
mod tree;
/// Structural verification.
pub mod verify;

pub use cell::{CellRef, Tombstone};
pub use page::{Page, Probe};
pub use stats::{BTreeStats, BTreeStatsSnapshot};
pub use tree::{BTree, BTreeOptions, Iter, SlotRef};
pub use verify::{VerifyCounts, VerifyFinding, VerifyReport, VerifySeverity};

#[cfg(test)]
mod tests;
