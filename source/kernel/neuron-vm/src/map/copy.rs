// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Operations spanning two address spaces: copy (fork) and move.
//!
//! Both take the two map locks through `nexus_sync::lock_pair`, ordered by
//! map id, and pre-fault the destination after the locks are gone.

use alloc::vec::Vec;

use nexus_sync::lock_pair;

use super::{MapEntry, VmMap};
use crate::context::VmContext;
use crate::error::{VmError, VmResult};
use crate::fault;
use crate::hal::PteAttrs;
use crate::map::Backing;
use crate::mm::{is_page_aligned, PAGE_SIZE};
use crate::types::{MapFlags, Prot};

/// A range the destination has to pre-fault.
struct Pending {
    start: usize,
    len: usize,
    access: Prot,
}

impl VmMap {
    /// Duplicates every inheritable entry of `src` into this map at the same
    /// addresses. Writable memory becomes copy-on-write on both sides.
    ///
    /// If pre-faulting fails, the copied entries are unmapped from this map
    /// again. `src` keeps its copy-on-write marking.
    pub fn copy_from(&self, ctx: &VmContext, src: &VmMap) -> VmResult<()> {
        if self.id() == src.id() {
            return Err(VmError::InvalidArgument);
        }
        let (mut dst_inner, mut src_inner) =
            lock_pair(&self.inner, self.id().0, &src.inner, src.id().0);

        let ids: Vec<_> = src_inner
            .tree
            .iter()
            .filter(|(_, e)| !e.flags.contains(MapFlags::NO_INHERIT))
            .map(|(id, _)| id)
            .collect();
        for id in &ids {
            let e = src_inner.tree.get(*id);
            if e.start < dst_inner.min || e.end > dst_inner.max {
                return Err(VmError::OutOfBounds);
            }
            if dst_inner.place(e.start, e.len(), MapFlags::FIXED).is_err() {
                return Err(VmError::Overlap);
            }
        }

        let mut pending = Vec::new();
        for id in ids {
            let e = src_inner.tree.get(id);
            let cow = e.prot.contains(Prot::WRITE)
                && !e.flags.contains(MapFlags::DEVICE)
                && !matches!(e.backing, Backing::Physical);
            if cow {
                let (start, end) = (e.start, e.end);
                src_inner.tree.update(id, |e| e.flags.insert(MapFlags::NEEDS_COPY));
                write_protect(ctx, src, start, end);
            }
            let e = src_inner.tree.get(id);
            if let Some(aref) = &e.amap {
                aref.amap.lock().add_refs(aref.slot..aref.slot + e.pages());
            }
            let dup = MapEntry {
                start: e.start,
                end: e.end,
                backing: e.backing.clone(),
                offset: e.offset,
                prot: e.prot,
                flags: e.flags,
                amap: e.amap.clone(),
            };
            let access = fault::eager_access(dup.prot, dup.flags);
            pending.push(Pending { start: dup.start, len: dup.len(), access });
            dst_inner.file(dup);
        }
        src_inner.generation += 1;
        dst_inner.generation += 1;
        src_inner.check();
        dst_inner.check();
        let lazy = dst_inner.lazy;
        drop(src_inner);
        drop(dst_inner);

        log::debug!(
            target: "vm",
            "vm: copied {} entries {:?} -> {:?}",
            pending.len(),
            src.id(),
            self.id()
        );
        if lazy {
            return Ok(());
        }
        if let Err(err) = self.prefault(ctx, &pending) {
            log::warn!(target: "vm", "vm: pre-fault of copy into {:?} failed: {}", self.id(), err);
            for p in &pending {
                if let Err(undo) = self.unmap(ctx, p.start, p.len) {
                    log::error!(target: "vm", "vm: unwinding {:#x} failed: {}", p.start, undo);
                }
            }
            return Err(err);
        }
        Ok(())
    }

    /// Moves the mapped range `[va, va + size)` of this map into `dst`,
    /// placed at or above `hint`, and returns its new start. The range has to
    /// be mapped without holes.
    ///
    /// The move is final once the entries are filed in `dst`. A failed
    /// pre-fault of an eager `dst` is logged and its pages are left to
    /// demand faults.
    pub fn move_range(
        &self,
        ctx: &VmContext,
        va: usize,
        size: usize,
        dst: &VmMap,
        hint: usize,
    ) -> VmResult<usize> {
        if size == 0 || self.id() == dst.id() {
            return Err(VmError::InvalidArgument);
        }
        if !is_page_aligned(va) || !is_page_aligned(size) {
            return Err(VmError::Misaligned);
        }
        let end = va.checked_add(size).ok_or(VmError::OutOfBounds)?;
        let (mut src_inner, mut dst_inner) =
            lock_pair(&self.inner, self.id().0, &dst.inner, dst.id().0);

        let mut cursor = va;
        while cursor < end {
            let id = src_inner.entry_at(cursor).ok_or(VmError::NotMapped)?;
            cursor = src_inner.tree.get(id).end;
        }
        let to = dst_inner.find_free(hint, size)?;

        let mut pending = Vec::new();
        for id in src_inner.ids_within(va, end) {
            let mut entry = src_inner.tree.remove(id);
            src_inner.remove_translations(ctx, entry.start, entry.end);
            entry.end = entry.end - va + to;
            entry.start = entry.start - va + to;
            pending.push(Pending {
                start: entry.start,
                len: entry.len(),
                access: fault::eager_access(entry.prot, entry.flags),
            });
            dst_inner.file(entry);
        }
        src_inner.generation += 1;
        dst_inner.generation += 1;
        src_inner.check();
        dst_inner.check();
        let lazy = dst_inner.lazy;
        drop(src_inner);
        drop(dst_inner);

        log::debug!(
            target: "vm",
            "vm: moved {:#x}..{:#x} {:?} -> {:#x} {:?}",
            va,
            end,
            self.id(),
            to,
            dst.id()
        );
        if !lazy {
            if let Err(err) = dst.prefault(ctx, &pending) {
                log::warn!(target: "vm", "vm: pre-fault of move to {:#x} failed: {}", to, err);
            }
        }
        Ok(to)
    }

    fn prefault(&self, ctx: &VmContext, pending: &[Pending]) -> VmResult<()> {
        for p in pending.iter().filter(|p| !p.access.is_empty()) {
            fault::force(ctx, self, p.start, p.len, p.access)?;
        }
        Ok(())
    }
}

/// Drops WRITE from every resident translation of `[start, end)`. The
/// caller holds the map lock.
fn write_protect(ctx: &VmContext, map: &VmMap, start: usize, end: usize) {
    for va in (start..end).step_by(PAGE_SIZE) {
        let Some((pa, attrs)) = ctx.pmap.resolve(map.root(), va) else { continue };
        if !attrs.prot.contains(Prot::WRITE) {
            continue;
        }
        let attrs = PteAttrs { prot: attrs.prot.difference(Prot::WRITE), ..attrs };
        if let Err(err) = ctx.pmap.enter(map.root(), va, pa, attrs) {
            // Dropping the translation is as good: the next access refaults.
            log::warn!(target: "vm", "vm: write-protect of {:#x} failed ({}), removed", va, err);
            ctx.pmap.remove(map.root(), va);
        }
    }
}
