// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-address-space interval map (vm_map)
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests + tests/{map_ops,fork_cow,props}.rs
//! PUBLIC API: VmMap::{create, map, unmap, copy_from, move_range, destroy,
//!   lookup, dump, stats, translate}, Backing
//! DEPENDS_ON: nexus_augtree::AugTree (entries), nexus_sync::SleepLock,
//!   amap (private pages), object (file pages), fault (eager fill)
//! INVARIANTS: Entries never overlap and stay inside the map bounds; every
//!   gap summary reflects its subtree; every structural change bumps the
//!   generation; each entry owns exactly one object reference and one
//!   reference on each amap slot it covers

mod copy;
mod entry;

pub use entry::Backing;
pub(crate) use entry::{AmapRef, MapEntry};

use alloc::vec::Vec;
use core::ops::Range;
use core::sync::atomic::{AtomicU64, Ordering};

use nexus_augtree::{AugTree, NodeId};
use nexus_sync::{SleepLock, SleepLockGuard};

use crate::amap::{Amap, Anon};
use crate::context::VmContext;
use crate::error::{VmError, VmResult};
use crate::fault;
use crate::hal::{PmapRoot, PteAttrs};
use crate::info::{EntryInfo, MapStats};
use crate::mm::{is_page_aligned, page_align_down, PAGE_SIZE};
use crate::types::{MapFlags, MapId, Prot};

/// Fault counters, kept outside the map lock.
#[derive(Default)]
pub(crate) struct MapCounters {
    pub(crate) faults: AtomicU64,
    pub(crate) zero_fills: AtomicU64,
    pub(crate) cow_copies: AtomicU64,
    pub(crate) fetches: AtomicU64,
}

impl MapCounters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// State guarded by the map lock.
pub(crate) struct MapInner {
    pub(crate) root: PmapRoot,
    pub(crate) min: usize,
    pub(crate) max: usize,
    pub(crate) tree: AugTree<MapEntry>,
    pub(crate) lazy: bool,
    pub(crate) generation: u64,
    /// Object references dropped under the lock, released by [`VmMap::unlock`].
    retired: Vec<Backing>,
}

/// One address space: an interval tree of entries over a page-table root.
pub struct VmMap {
    id: MapId,
    kernel: bool,
    root: PmapRoot,
    pub(crate) inner: SleepLock<MapInner>,
    pub(crate) counters: MapCounters,
}

impl VmMap {
    /// Creates an empty user address space.
    pub fn create(ctx: &VmContext, lazy: bool) -> VmResult<Self> {
        let root = ctx.pmap.create_root()?;
        let cfg = ctx.config();
        let id = ctx.next_map_id();
        let map = Self::assemble(id, false, root, cfg.user_base, cfg.user_limit, lazy);
        log::debug!(target: "vm", "vm: map {:?} created, lazy={}", map.id, lazy);
        Ok(map)
    }

    pub(crate) fn assemble(
        id: MapId,
        kernel: bool,
        root: PmapRoot,
        min: usize,
        max: usize,
        lazy: bool,
    ) -> Self {
        let inner = MapInner {
            root,
            min,
            max,
            tree: AugTree::new(),
            lazy,
            generation: 0,
            retired: Vec::new(),
        };
        Self { id, kernel, root, inner: SleepLock::new(inner), counters: MapCounters::default() }
    }

    pub fn id(&self) -> MapId {
        self.id
    }

    /// True for the kernel's own address space.
    pub fn is_kernel(&self) -> bool {
        self.kernel
    }

    /// Page-table root handed to the HAL.
    pub fn root(&self) -> PmapRoot {
        self.root
    }

    /// Whether `map` leaves pages to the fault path instead of filling them.
    pub fn is_lazy(&self) -> bool {
        self.inner.lock().lazy
    }

    /// Address range entries may occupy.
    pub fn bounds(&self) -> Range<usize> {
        let inner = self.inner.lock();
        inner.min..inner.max
    }

    /// Structural change counter; faults use it to detect a moved map.
    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    pub(crate) fn lock(&self) -> SleepLockGuard<'_, MapInner> {
        self.inner.lock()
    }

    /// Drops the map lock, then releases the object references retired
    /// while it was held. The file server may block.
    fn unlock(ctx: &VmContext, mut inner: SleepLockGuard<'_, MapInner>) {
        let retired = core::mem::take(&mut inner.retired);
        drop(inner);
        for backing in retired {
            ctx.release_backing(backing);
        }
    }

    /// Maps `size` bytes of `backing` at `offset` and returns the chosen
    /// start. Without [`MapFlags::FIXED`], `hint` is only a preference.
    ///
    /// Consumes the object reference carried by `backing`, also on failure.
    #[allow(clippy::too_many_arguments)]
    pub fn map(
        &self,
        ctx: &VmContext,
        hint: usize,
        size: usize,
        prot: Prot,
        backing: Backing,
        offset: u64,
        flags: MapFlags,
    ) -> VmResult<usize> {
        let va = self.insert(ctx, hint, size, prot, backing, offset, flags)?;
        let access = fault::eager_access(prot, flags);
        if !self.is_lazy() && !access.is_empty() {
            if let Err(err) = fault::force(ctx, self, va, size, access) {
                log::warn!(target: "vm", "vm: eager fill of {:#x}+{:#x} failed: {}", va, size, err);
                if let Err(undo) = self.unmap(ctx, va, size) {
                    log::error!(target: "vm", "vm: unwinding {:#x} failed: {}", va, undo);
                }
                return Err(err);
            }
        }
        Ok(va)
    }

    #[allow(clippy::too_many_arguments)]
    fn insert(
        &self,
        ctx: &VmContext,
        hint: usize,
        size: usize,
        prot: Prot,
        backing: Backing,
        offset: u64,
        flags: MapFlags,
    ) -> VmResult<usize> {
        let checked = check_request(hint, size, prot, &backing, offset, flags);
        let mut inner = self.inner.lock();
        let va = match checked.and_then(|()| inner.place(hint, size, flags)) {
            Ok(va) => va,
            Err(err) => {
                drop(inner);
                ctx.release_backing(backing);
                return Err(err);
            }
        };
        let entry = MapEntry {
            start: va,
            end: va + size,
            backing,
            offset,
            prot,
            flags: flags & MapFlags::STORED,
            amap: None,
        };
        log::debug!(
            target: "vm",
            "vm: map {:?} {:#x}..{:#x} {} {:?}",
            self.id,
            va,
            va + size,
            prot,
            entry.backing
        );
        inner.link(entry);
        inner.generation += 1;
        inner.check();
        Self::unlock(ctx, inner);
        Ok(va)
    }

    /// Removes every mapping inside `[va, va + size)`. Unmapped holes are
    /// skipped.
    pub fn unmap(&self, ctx: &VmContext, va: usize, size: usize) -> VmResult<()> {
        if size == 0 {
            return Err(VmError::InvalidArgument);
        }
        if !is_page_aligned(va) || !is_page_aligned(size) {
            return Err(VmError::Misaligned);
        }
        let end = va.checked_add(size).ok_or(VmError::OutOfBounds)?;
        let mut inner = self.inner.lock();
        if va < inner.min || end > inner.max {
            return Err(VmError::OutOfBounds);
        }
        let removed = inner.remove_range(ctx, va, end);
        inner.check();
        Self::unlock(ctx, inner);
        log::debug!(
            target: "vm",
            "vm: unmap {:?} {:#x}..{:#x}, {} entries touched",
            self.id,
            va,
            end,
            removed
        );
        Ok(())
    }

    /// Unmaps everything and releases the page-table root.
    pub fn destroy(self, ctx: &VmContext) {
        let mut inner = self.inner.lock();
        let (min, max) = (inner.min, inner.max);
        inner.remove_range(ctx, min, max);
        Self::unlock(ctx, inner);
        ctx.pmap.destroy_root(self.root);
        log::debug!(target: "vm", "vm: map {:?} destroyed", self.id);
    }

    /// Entry covering `va`.
    pub fn lookup(&self, va: usize) -> Option<EntryInfo> {
        let inner = self.inner.lock();
        let id = inner.entry_at(va)?;
        Some(EntryInfo::of(inner.tree.get(id)))
    }

    /// Every entry in address order.
    pub fn dump(&self) -> Vec<EntryInfo> {
        let inner = self.inner.lock();
        inner.tree.iter().map(|(_, e)| EntryInfo::of(e)).collect()
    }

    /// Fault counters plus a walk over the entries and their translations.
    pub fn stats(&self, ctx: &VmContext) -> MapStats {
        let inner = self.inner.lock();
        let mut stats = MapStats {
            faults: self.counters.faults.load(Ordering::Relaxed),
            zero_fills: self.counters.zero_fills.load(Ordering::Relaxed),
            cow_copies: self.counters.cow_copies.load(Ordering::Relaxed),
            fetches: self.counters.fetches.load(Ordering::Relaxed),
            generation: inner.generation,
            ..MapStats::default()
        };
        for (_, entry) in inner.tree.iter() {
            stats.entries += 1;
            stats.mapped_bytes += entry.len();
            stats.resident_pages += (entry.start..entry.end)
                .step_by(PAGE_SIZE)
                .filter(|va| ctx.pmap.resolve(inner.root, *va).is_some())
                .count();
        }
        stats
    }

    /// Current translation of the page holding `va`.
    pub fn translate(&self, ctx: &VmContext, va: usize) -> Option<(usize, PteAttrs)> {
        let page = page_align_down(va);
        ctx.pmap.resolve(self.root, page).map(|(pa, attrs)| (pa + (va - page), attrs))
    }

    /// Structural check of the entry tree (order, overlap, gap summaries).
    pub fn verify(&self) -> Result<(), &'static str> {
        self.inner.lock().verify()
    }
}

fn check_request(
    hint: usize,
    size: usize,
    prot: Prot,
    backing: &Backing,
    offset: u64,
    flags: MapFlags,
) -> VmResult<()> {
    if size == 0 {
        return Err(VmError::InvalidArgument);
    }
    if !is_page_aligned(size) || offset % PAGE_SIZE as u64 != 0 {
        return Err(VmError::Misaligned);
    }
    if flags.contains(MapFlags::FIXED) && !is_page_aligned(hint) {
        return Err(VmError::Misaligned);
    }
    if prot.contains(Prot::WRITE | Prot::EXEC) {
        return Err(VmError::PermissionDenied);
    }
    let private = flags.contains(MapFlags::NEEDS_COPY);
    if private && (flags.contains(MapFlags::DEVICE) || matches!(backing, Backing::Physical)) {
        return Err(VmError::InvalidArgument);
    }
    Ok(())
}

impl MapInner {
    /// Entry whose range contains `va`.
    pub(crate) fn entry_at(&self, va: usize) -> Option<NodeId> {
        self.tree.floor(va).filter(|id| self.tree.get(*id).contains(va))
    }

    fn is_free(&self, start: usize, end: usize) -> bool {
        let below = self.tree.floor(start).map_or(true, |id| self.tree.get(id).end <= start);
        let above = self.tree.ceil(start).map_or(true, |id| self.tree.get(id).start >= end);
        below && above
    }

    /// Lowest free range of `size` bytes at or above `hint`, falling back to
    /// the lower bound.
    pub(crate) fn find_free(&self, hint: usize, size: usize) -> VmResult<usize> {
        if size > self.max - self.min {
            return Err(VmError::NoVirtualSpace);
        }
        let hint = page_align_down(hint).clamp(self.min, self.max);
        entry::first_fit(&self.tree, self.min, self.max, hint, size)
            .or_else(|| entry::first_fit(&self.tree, self.min, self.max, self.min, size))
            .ok_or(VmError::NoVirtualSpace)
    }

    pub(crate) fn place(&self, hint: usize, size: usize, flags: MapFlags) -> VmResult<usize> {
        if !flags.contains(MapFlags::FIXED) {
            return self.find_free(hint, size);
        }
        let end = hint.checked_add(size).ok_or(VmError::OutOfBounds)?;
        if hint < self.min || end > self.max {
            return Err(VmError::OutOfBounds);
        }
        if !self.is_free(hint, end) {
            return Err(VmError::Overlap);
        }
        Ok(hint)
    }

    /// Files a new amap-less entry, merging it into its neighbours where
    /// possible.
    pub(crate) fn link(&mut self, entry: MapEntry) {
        debug_assert!(entry.amap.is_none());
        let left = self.tree.floor(entry.start).filter(|id| self.tree.get(*id).end == entry.start);
        let right = self.tree.ceil(entry.end).filter(|id| self.tree.get(*id).start == entry.end);
        let left_ok = left.is_some_and(|l| entry::can_merge(self.tree.get(l), &entry));
        let right_ok = right.is_some_and(|r| entry::can_merge(&entry, self.tree.get(r)));

        match (left, right) {
            (Some(l), Some(r))
                if left_ok
                    && right_ok
                    && entry::can_merge_three(self.tree.get(l), &entry, self.tree.get(r)) =>
            {
                self.merge_both(l, entry, r)
            }
            (Some(l), _) if left_ok => self.merge_left(l, entry),
            (_, Some(r)) if right_ok => self.merge_right(entry, r),
            _ => {
                self.file(entry);
            }
        }
    }

    fn merge_left(&mut self, l: NodeId, entry: MapEntry) {
        let left = self.tree.get(l);
        if let Some(x) = &left.amap {
            let from = x.slot + left.pages();
            x.amap.lock().add_refs(from..from + entry.pages());
        }
        let end = entry.end;
        self.tree.update(l, |e| e.end = end);
        log::trace!(target: "vm", "vm: merged {:#x} into left neighbour", entry.start);
        self.retired.push(entry.backing);
    }

    fn merge_right(&mut self, entry: MapEntry, r: NodeId) {
        let pages = entry.pages();
        if let Some(y) = &self.tree.get(r).amap {
            y.amap.lock().add_refs(y.slot - pages..y.slot);
        }
        let (start, offset) = (entry.start, entry.offset);
        self.tree.update(r, |e| {
            e.start = start;
            e.offset = offset;
            if let Some(a) = &mut e.amap {
                a.slot -= pages;
            }
        });
        log::trace!(target: "vm", "vm: merged {:#x} into right neighbour", start);
        self.retired.push(entry.backing);
    }

    fn merge_both(&mut self, l: NodeId, entry: MapEntry, r: NodeId) {
        let right = self.tree.remove(r);
        let left = self.tree.get(l);
        let (lp, np, rp) = (left.pages(), entry.pages(), right.pages());
        let merged = match (&left.amap, right.amap) {
            (None, None) => None,
            (Some(x), None) => {
                let from = x.slot + lp;
                x.amap.lock().add_refs(from..from + np + rp);
                Some(x.clone())
            }
            (None, Some(y)) => {
                let slot = y.slot - lp - np;
                y.amap.lock().add_refs(slot..y.slot);
                Some(AmapRef { amap: y.amap, slot })
            }
            (Some(_), Some(_)) => {
                // can_merge_three only accepts one exclusive amap.
                log::error!(target: "vm", "vm: merge at {:#x} joins two amaps", entry.start);
                panic!("vm: merge at {:#x} joins two amaps", entry.start);
            }
        };
        let end = right.end;
        self.tree.update(l, |e| {
            e.end = end;
            e.amap = merged;
        });
        log::trace!(target: "vm", "vm: {:#x} joined both neighbours", entry.start);
        self.retired.push(entry.backing);
        self.retired.push(right.backing);
    }

    /// Inserts without merging.
    pub(crate) fn file(&mut self, entry: MapEntry) -> NodeId {
        match self.tree.insert(entry) {
            Ok(id) => id,
            Err(dup) => {
                log::error!(target: "vm", "vm: entry at {:#x} filed twice", dup.start);
                panic!("vm: duplicate entry key {:#x}", dup.start);
            }
        }
    }

    /// Splits the entry straddling `at` so that `at` becomes an entry
    /// boundary.
    pub(crate) fn clip(&mut self, at: usize) {
        let Some(id) = self.tree.floor(at) else { return };
        let entry = self.tree.get(id);
        if !(entry.start < at && at < entry.end) {
            return;
        }
        let tail = entry.tail_from(at);
        self.tree.update(id, |e| e.end = at);
        self.file(tail);
    }

    /// Entries inside `[start, end)` after clipping at both ends.
    pub(crate) fn ids_within(&mut self, start: usize, end: usize) -> Vec<NodeId> {
        self.clip(start);
        self.clip(end);
        let mut ids = Vec::new();
        let mut cursor = self.tree.ceil(start);
        while let Some(id) = cursor {
            if self.tree.get(id).start >= end {
                break;
            }
            ids.push(id);
            cursor = self.tree.next(id);
        }
        ids
    }

    /// Drops every translation of `[start, end)`.
    pub(crate) fn remove_translations(&self, ctx: &VmContext, start: usize, end: usize) {
        for va in (start..end).step_by(PAGE_SIZE) {
            ctx.pmap.remove(self.root, va);
        }
    }

    /// Unmaps `[start, end)`, returning the number of entries removed.
    pub(crate) fn remove_range(&mut self, ctx: &VmContext, start: usize, end: usize) -> usize {
        let ids = self.ids_within(start, end);
        for id in &ids {
            let entry = self.tree.remove(*id);
            self.remove_translations(ctx, entry.start, entry.end);
            self.retire(ctx, entry);
        }
        if !ids.is_empty() {
            self.generation += 1;
        }
        ids.len()
    }

    /// Releases the slot references and amap handle of a removed entry. Its
    /// object reference waits in `retired` until the lock is dropped.
    fn retire(&mut self, ctx: &VmContext, entry: MapEntry) {
        let pages = entry.pages();
        if let Some(aref) = entry.amap {
            let released = aref.amap.lock().drop_refs(aref.slot..aref.slot + pages);
            for anon in released {
                Anon::release(&ctx.frames, anon);
            }
            Amap::release(&ctx.frames, aref.amap);
        }
        self.retired.push(entry.backing);
    }

    pub(crate) fn verify(&self) -> Result<(), &'static str> {
        self.tree.verify()?;
        let mut prev_end = self.min;
        for (_, entry) in self.tree.iter() {
            if entry.start >= entry.end {
                return Err("empty or inverted entry");
            }
            if !is_page_aligned(entry.start) || !is_page_aligned(entry.end) {
                return Err("entry not page aligned");
            }
            if entry.start < prev_end {
                return Err("entries overlap or leave the map bounds");
            }
            prev_end = entry.end;
        }
        if prev_end > self.max {
            return Err("entry beyond the map bounds");
        }
        Ok(())
    }

    #[cfg(feature = "debug_verify")]
    pub(crate) fn check(&self) {
        if let Err(what) = self.verify() {
            log::error!(target: "vm", "vm: map corrupt: {}", what);
            panic!("vm: map corrupt: {}", what);
        }
    }

    #[cfg(not(feature = "debug_verify"))]
    pub(crate) fn check(&self) {}
}


#[cfg(test)]
mod tests;
