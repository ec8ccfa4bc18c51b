//! Structural checks over single pages and whole trees.

use std::cmp::Ordering;
use std::collections::HashSet;

use serde::Serialize;

use super::cell;
use super::page::{compare_keys, Page};
use super::tree::BTree;
use crate::types::page::{CELL_HDR_LEN, PAGE_SIZE};
use crate::types::{PageId, PagetreeError, Result};

const MAX_FINDINGS: usize = 32;

/// Indicates the severity level of a verification finding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifySeverity {
    /// Suspicious but legal state, such as an unreachable page.
    Warning,
    /// Broken invariant.
    Error,
}

/// A single issue discovered during verification.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyFinding {
    /// The severity level of this finding.
    pub severity: VerifySeverity,
    /// Page the finding refers to, if any.
    pub page: Option<PageId>,
    /// Human-readable description of the issue.
    pub message: String,
}

/// Totals gathered while walking the tree.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct VerifyCounts {
    /// Pages reached from the root.
    pub pages: u64,
    /// Leaf pages reached from the root.
    pub leaf_pages: u64,
    /// Internal pages reached from the root.
    pub internal_pages: u64,
    /// Key/value pairs held by leaves.
    pub entries: u64,
    /// Free-list nodes across all pages.
    pub tombstones: u64,
    /// Reclaimable bytes across all pages.
    pub tombstone_bytes: u64,
}

/// Complete report of a verification pass.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyReport {
    /// Whether verification found no errors.
    pub success: bool,
    /// Levels from root to leaf, when every leaf sits at the same depth.
    pub height: Option<usize>,
    /// Issues discovered, capped at a fixed number.
    pub findings: Vec<VerifyFinding>,
    /// Whether findings were dropped after the cap was hit.
    pub truncated: bool,
    /// Statistics about the pages examined.
    pub counts: VerifyCounts,
}

impl VerifyReport {
    /// True when there are no findings at all, warnings included.
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty() && !self.truncated
    }
}

/// Every page-local invariant violated by `page`.
///
/// Covers the free-space invariant, cell extents, slot sort order and the
/// free list's bookkeeping. Child references are left to the tree walk.
pub fn page_findings(page: &Page) -> Vec<String> {
    let mut out = Vec::new();
    let cell_offset = page.cell_offset();
    let slot_end = page.slot_end();
    if cell_offset > PAGE_SIZE {
        out.push(format!("cell_offset {cell_offset} past end of page"));
        return out;
    }
    if cell_offset < slot_end {
        out.push(format!(
            "cell_offset {cell_offset} below slot array end {slot_end}"
        ));
        return out;
    }

    let buf = page.as_bytes();
    let mut extents = Vec::with_capacity(page.size());
    for idx in 0..page.size() {
        let offset = page.slot(idx);
        if offset < cell_offset || offset + CELL_HDR_LEN > PAGE_SIZE {
            out.push(format!("slot {idx} points outside payload area ({offset})"));
            continue;
        }
        let (key_size, value_size, total) = cell::lengths_at(buf, offset);
        let footprint = cell::footprint_at(buf, offset);
        if offset + footprint > PAGE_SIZE {
            out.push(format!("slot {idx} cell runs past end of page"));
            continue;
        }
        let expected_total = if page.is_leaf() {
            key_size + value_size
        } else {
            key_size
        };
        if expected_total != total {
            out.push(format!(
                "slot {idx} total_size {total} disagrees with its key/value sizes"
            ));
            continue;
        }
        extents.push((offset, offset + footprint));
    }
    let decodable = extents.len() == page.size();

    if decodable {
        for idx in 1..page.size() {
            if compare_keys(page.key_at(idx - 1), page.key_at(idx)) != Ordering::Less {
                out.push(format!("slots {} and {idx} out of order", idx - 1));
            }
        }
    }

    match page.tombstones() {
        Ok(list) => {
            let mut sum = 0usize;
            for (offset, tombstone) in list {
                let size = tombstone.size as usize;
                if offset < cell_offset || offset + size > PAGE_SIZE || size < CELL_HDR_LEN {
                    out.push(format!("tombstone at {offset} has a bad extent ({size} bytes)"));
                    continue;
                }
                sum += size;
                extents.push((offset, offset + size));
            }
            if sum != page.tombstone_bytes() {
                out.push(format!(
                    "free list holds {sum} bytes but header says {}",
                    page.tombstone_bytes()
                ));
            }
        }
        Err(err) => out.push(err.to_string()),
    }

    extents.sort_unstable();
    for pair in extents.windows(2) {
        if pair[1].0 < pair[0].1 {
            out.push(format!(
                "payload extents {}..{} and {}..{} overlap",
                pair[0].0, pair[0].1, pair[1].0, pair[1].1
            ));
        }
    }
    out
}

/// Fails with `Corruption` when [`page_findings`] reports anything.
pub fn check_page(page: &Page) -> Result<()> {
    let findings = page_findings(page);
    if findings.is_empty() {
        return Ok(());
    }
    tracing::warn!(
        target: "pagetree::verify",
        findings = ?findings,
        "page failed verification"
    );
    Err(PagetreeError::Corruption("page failed structural verification"))
}

struct Visit {
    id: PageId,
    parent: Option<PageId>,
    lower: Option<Vec<u8>>,
    upper: Option<Vec<u8>>,
    depth: usize,
}

struct Collector {
    findings: Vec<VerifyFinding>,
    truncated: bool,
}

impl Collector {
    fn push(&mut self, severity: VerifySeverity, page: Option<PageId>, message: impl Into<String>) {
        if self.findings.len() >= MAX_FINDINGS {
            self.truncated = true;
            return;
        }
        self.findings.push(VerifyFinding {
            severity,
            page,
            message: message.into(),
        });
    }

    fn error(&mut self, page: PageId, message: impl Into<String>) {
        self.push(VerifySeverity::Error, Some(page), message);
    }
}

impl BTree {
    /// Walks every page reachable from the root and checks the structural
    /// invariants: page-local layout, key order, separator bounds, parent
    /// links, uniform leaf depth and the entry count.
    pub fn verify(&self) -> Result<VerifyReport> {
        let mut sink = Collector {
            findings: Vec::new(),
            truncated: false,
        };
        let mut counts = VerifyCounts::default();
        let mut leaf_depth: Option<usize> = None;
        let mut balanced = true;
        let mut seen = HashSet::new();
        let mut pending = vec![Visit {
            id: self.root,
            parent: None,
            lower: None,
            upper: None,
            depth: 1,
        }];

        while let Some(visit) = pending.pop() {
            let id = visit.id;
            if !seen.insert(id) {
                sink.error(id, "page reachable through more than one path");
                continue;
            }
            let page = match self.arena.get(id) {
                Ok(page) => page,
                Err(err) => {
                    sink.error(id, err.to_string());
                    continue;
                }
            };
            counts.pages += 1;

            if page.is_root() != (id == self.root) {
                sink.error(id, "root flag does not match tree root");
            }
            if page.parent() != visit.parent {
                sink.error(
                    id,
                    format!(
                        "parent link {:?} but reached from {:?}",
                        page.parent(),
                        visit.parent
                    ),
                );
            }
            let local = page_findings(page);
            let decodable = local.is_empty();
            for message in local {
                sink.error(id, message);
            }
            if let Ok(list) = page.tombstones() {
                counts.tombstones += list.len() as u64;
            }
            counts.tombstone_bytes += page.tombstone_bytes() as u64;
            if !decodable {
                continue;
            }

            for idx in 0..page.size() {
                let key = page.key_at(idx);
                if let Some(lower) = &visit.lower {
                    if compare_keys(key, lower) == Ordering::Less {
                        sink.error(id, format!("slot {idx} key below subtree lower bound"));
                    }
                }
                if let Some(upper) = &visit.upper {
                    if compare_keys(key, upper) != Ordering::Less {
                        sink.error(id, format!("slot {idx} key at or above subtree upper bound"));
                    }
                }
            }

            if page.is_leaf() {
                counts.leaf_pages += 1;
                counts.entries += page.size() as u64;
                match leaf_depth {
                    None => leaf_depth = Some(visit.depth),
                    Some(depth) if depth != visit.depth => {
                        balanced = false;
                        sink.error(
                            id,
                            format!("leaf at depth {} but others at {depth}", visit.depth),
                        );
                    }
                    Some(_) => {}
                }
                continue;
            }

            counts.internal_pages += 1;
            if page.size() == 0 {
                sink.error(id, "internal page has no separators");
            }
            let children = match page.children() {
                Ok(children) => children,
                Err(err) => {
                    sink.error(id, err.to_string());
                    continue;
                }
            };
            let size = page.size();
            // Pushed in reverse so the leftmost subtree is visited first.
            for (idx, child) in children.into_iter().enumerate().rev() {
                let lower = if idx == 0 {
                    visit.lower.clone()
                } else {
                    Some(page.key_at(idx - 1).to_vec())
                };
                let upper = if idx == size {
                    visit.upper.clone()
                } else {
                    Some(page.key_at(idx).to_vec())
                };
                pending.push(Visit {
                    id: child,
                    parent: Some(id),
                    lower,
                    upper,
                    depth: visit.depth + 1,
                });
            }
        }

        if counts.entries != self.len as u64 {
            sink.push(
                VerifySeverity::Error,
                None,
                format!(
                    "leaves hold {} entries but the tree counts {}",
                    counts.entries, self.len
                ),
            );
        }
        let live = self.arena.live_pages() as u64;
        if live > counts.pages {
            sink.push(
                VerifySeverity::Warning,
                None,
                format!("{} live pages are unreachable from the root", live - counts.pages),
            );
        }

        let success = !sink
            .findings
            .iter()
            .any(|f| f.severity == VerifySeverity::Error)
            && !sink.truncated;
        Ok(VerifyReport {
            success,
            height: if balanced { leaf_depth } else { None },
            findings: sink.findings,
            truncated: sink.truncated,
            counts,
        })
    }
}
