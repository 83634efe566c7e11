// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Map entries, their gap augmentation and merge eligibility.

use alloc::sync::Arc;

use nexus_augtree::{AugTree, Augment, NodeId};

use crate::amap::Amap;
use crate::mm::PAGE_SIZE;
use crate::object::MemObject;
use crate::types::{MapFlags, Prot};

/// What a mapping is backed by.
#[derive(Clone)]
pub enum Backing {
    /// Zero-filled private memory.
    Anonymous,
    /// The entry offset is used directly as a physical address.
    Physical,
    /// Pages come from a file's memory object, starting at the entry offset.
    Object(Arc<MemObject>),
}

impl Backing {
    /// Same backing store, in the sense used by merging.
    pub fn same(&self, other: &Backing) -> bool {
        match (self, other) {
            (Backing::Anonymous, Backing::Anonymous) => true,
            (Backing::Physical, Backing::Physical) => true,
            (Backing::Object(a), Backing::Object(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Offsets advance with the virtual address.
    pub fn is_linear(&self) -> bool {
        !matches!(self, Backing::Anonymous)
    }
}

impl core::fmt::Debug for Backing {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Backing::Anonymous => f.write_str("Anonymous"),
            Backing::Physical => f.write_str("Physical"),
            Backing::Object(obj) => write!(f, "Object({})", obj.file()),
        }
    }
}

/// An entry's share of an amap: slot `slot` backs the entry's first page.
#[derive(Clone)]
pub(crate) struct AmapRef {
    pub(crate) amap: Arc<Amap>,
    pub(crate) slot: usize,
}

impl AmapRef {
    pub(crate) fn exclusive(&self) -> bool {
        Arc::strong_count(&self.amap) == 1
    }
}

/// One contiguous virtual range of an address space.
pub(crate) struct MapEntry {
    pub(crate) start: usize,
    pub(crate) end: usize,
    pub(crate) backing: Backing,
    /// Byte offset into the object, or the physical base for raw mappings.
    pub(crate) offset: u64,
    pub(crate) prot: Prot,
    pub(crate) flags: MapFlags,
    pub(crate) amap: Option<AmapRef>,
}

impl MapEntry {
    pub(crate) fn len(&self) -> usize {
        self.end - self.start
    }

    pub(crate) fn pages(&self) -> usize {
        self.len() / PAGE_SIZE
    }

    pub(crate) fn contains(&self, va: usize) -> bool {
        self.start <= va && va < self.end
    }

    /// Backing offset of the page holding `va`.
    pub(crate) fn offset_at(&self, va: usize) -> u64 {
        self.offset + (va - self.start) as u64
    }

    /// Amap slot of the page holding `va`.
    pub(crate) fn slot_at(&self, va: usize) -> Option<usize> {
        self.amap.as_ref().map(|a| a.slot + (va - self.start) / PAGE_SIZE)
    }

    /// Copy of this entry covering `[at, end)`, sharing backing and amap.
    pub(crate) fn tail_from(&self, at: usize) -> MapEntry {
        let delta = at - self.start;
        MapEntry {
            start: at,
            end: self.end,
            backing: self.backing.clone(),
            offset: self.offset + delta as u64,
            prot: self.prot,
            flags: self.flags,
            amap: self
                .amap
                .as_ref()
                .map(|a| AmapRef { amap: Arc::clone(&a.amap), slot: a.slot + delta / PAGE_SIZE }),
        }
    }
}

/// Subtree summary: occupied span plus the largest free gap strictly inside
/// the left and right parts of the subtree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct GapSummary {
    pub(crate) lo: usize,
    pub(crate) hi: usize,
    pub(crate) lmaxgap: usize,
    pub(crate) rmaxgap: usize,
}

impl GapSummary {
    pub(crate) fn max_inner_gap(&self) -> usize {
        self.lmaxgap.max(self.rmaxgap)
    }
}

impl Augment for MapEntry {
    type Key = usize;
    type Summary = GapSummary;

    fn key(&self) -> usize {
        self.start
    }

    fn summarize(&self, left: Option<&GapSummary>, right: Option<&GapSummary>) -> GapSummary {
        let (lo, lmaxgap) = match left {
            Some(l) => (l.lo, l.max_inner_gap().max(self.start - l.hi)),
            None => (self.start, 0),
        };
        let (hi, rmaxgap) = match right {
            Some(r) => (r.hi, r.max_inner_gap().max(r.lo - self.end)),
            None => (self.end, 0),
        };
        GapSummary { lo, hi, lmaxgap, rmaxgap }
    }
}

/// First-fit search for `size` free bytes inside `[lo, hi)`, at or above
/// `hint`.
pub(crate) fn first_fit(
    tree: &AugTree<MapEntry>,
    lo: usize,
    hi: usize,
    hint: usize,
    size: usize,
) -> Option<usize> {
    descend(tree, tree.root(), lo, hi, hint, size)
}

/// `node`'s subtree lies inside the window `[lo, hi)`; everything in the
/// window outside the subtree's entries is free.
fn descend(
    tree: &AugTree<MapEntry>,
    node: Option<NodeId>,
    lo: usize,
    hi: usize,
    hint: usize,
    size: usize,
) -> Option<usize> {
    if hint.max(lo).checked_add(size)? > hi {
        return None;
    }
    let Some(id) = node else {
        return Some(hint.max(lo));
    };
    let s = tree.summary(id);
    let widest = (s.lo - lo).max(hi - s.hi).max(s.max_inner_gap());
    if widest < size {
        return None;
    }
    let entry = tree.get(id);
    descend(tree, tree.left(id), lo, entry.start, hint, size)
        .or_else(|| descend(tree, tree.right(id), entry.end, hi, hint, size))
}

/// `a` ends exactly where `b` starts; can they become one entry?
pub(crate) fn can_merge(a: &MapEntry, b: &MapEntry) -> bool {
    if a.end != b.start || a.prot != b.prot || a.flags != b.flags || !a.backing.same(&b.backing) {
        return false;
    }
    if a.backing.is_linear() && a.offset + a.len() as u64 != b.offset {
        return false;
    }
    match (&a.amap, &b.amap) {
        (None, None) => true,
        (Some(x), None) => {
            let from = x.slot + a.pages();
            x.exclusive() && x.amap.lock().is_unused(from..from + b.pages())
        }
        (None, Some(y)) => {
            y.exclusive()
                && y.slot >= a.pages()
                && y.amap.lock().is_unused(y.slot - a.pages()..y.slot)
        }
        // Two amap-backed entries stay apart.
        (Some(_), Some(_)) => false,
    }
}

/// `l`, `n`, `r` are consecutive and pairwise mergeable; can the middle one
/// glue both neighbours together? `n` carries no amap.
pub(crate) fn can_merge_three(l: &MapEntry, n: &MapEntry, r: &MapEntry) -> bool {
    let gap = l.pages() + n.pages();
    match (&l.amap, &r.amap) {
        (None, None) => true,
        (Some(x), None) => {
            let from = x.slot + l.pages();
            x.exclusive() && x.amap.lock().is_unused(from..from + n.pages() + r.pages())
        }
        (None, Some(y)) => {
            y.exclusive() && y.slot >= gap && y.amap.lock().is_unused(y.slot - gap..y.slot)
        }
        (Some(_), Some(_)) => false,
    }
}
