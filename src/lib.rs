//! In-memory B-tree index storing variable-length byte keys and values in
//! fixed-size slotted pages.
//!
//! ```
//! use pagetree::BTree;
//!
//! let mut tree = BTree::new()?;
//! tree.insert(b"alpha", b"1")?;
//! assert_eq!(tree.get(b"alpha")?, Some(&b"1"[..]));
//! assert!(tree.delete(b"alpha")?);
//! assert_eq!(tree.search(b"alpha")?, None);
//! # Ok::<(), pagetree::PagetreeError>(())
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod btree;
pub mod types;

pub use btree::{BTree, BTreeOptions, SlotRef, VerifyReport};
pub use types::{PageId, PagetreeError, Result};
