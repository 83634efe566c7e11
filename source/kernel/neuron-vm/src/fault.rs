// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Page-fault resolver
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests + tests/{fork_cow,object_cache,faults}.rs
//! PUBLIC API: fault(), force(), handle_fault(), read_bytes(), write_bytes(),
//!   Reaper, FaultOutcome, FaultSignal
//! DEPENDS_ON: map (entry lookup), amap, object, hal::Pmap
//! INVARIANTS: No map or amap lock is held across a file fetch or a
//!   copy-on-write copy; after relocking, the map generation and the slot
//!   contents are re-checked and the fault restarts on any change
//!
//! A fault is resolved in rounds. Each round takes the map lock, looks the
//! entry up by address and either installs a translation or decides what to
//! do with the lock dropped (fetch, copy). Work done unlocked is discarded if
//! the map moved underneath it.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::Range;

use nexus_augtree::NodeId;

use crate::amap::{Amap, Anon};
use crate::context::VmContext;
use crate::error::{VmError, VmResult};
use crate::hal::{CacheMode, PteAttrs};
use crate::map::{AmapRef, Backing, MapCounters, MapInner, VmMap};
use crate::mm::{page_align_down, PAGE_SIZE};
use crate::object::MemObject;
use crate::types::{MapFlags, Pid, Prot};

/// Signal delivered to a process whose fault cannot be resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultSignal {
    /// Access to an unmapped address or against the entry protection.
    Segv,
    /// The backing page could not be produced.
    Bus,
}

/// Process layer hook for terminating a faulting process.
pub trait Reaper {
    fn kill(&self, pid: Pid, signal: FaultSignal);
}

/// What the trap handler does after a fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultOutcome {
    Resolved,
    Killed { pid: Pid, error: VmError },
}

enum Step {
    Done,
    Retry,
}

/// What a round decided while holding the map lock.
enum Plan {
    Install { pa: usize, prot: Prot },
    ZeroFill { amap: Arc<Amap>, slot: usize },
    Copy { amap: Arc<Amap>, slot: usize, src: usize, shared: Option<Arc<Anon>> },
    Fetch { obj: Arc<MemObject>, index: usize },
}

/// Access used to pre-fault a fresh mapping: copy-on-write entries are
/// filled read-only.
pub(crate) fn eager_access(prot: Prot, flags: MapFlags) -> Prot {
    if flags.contains(MapFlags::NEEDS_COPY) {
        prot.difference(Prot::WRITE)
    } else {
        prot
    }
}

/// Resolves a fault at `va` for `access` in `map`.
pub fn fault(ctx: &VmContext, map: &VmMap, va: usize, access: Prot) -> VmResult<()> {
    if access.is_empty() {
        return Err(VmError::InvalidArgument);
    }
    MapCounters::bump(&map.counters.faults);
    loop {
        match fault_once(ctx, map, va, access)? {
            Step::Done => return Ok(()),
            Step::Retry => log::trace!(target: "fault", "fault: {:#x} retried", va),
        }
    }
}

/// Eagerly faults `[start, start + size)`. On failure every translation
/// installed by this call is removed again.
pub fn force(
    ctx: &VmContext,
    map: &VmMap,
    start: usize,
    size: usize,
    access: Prot,
) -> VmResult<()> {
    let end = start.checked_add(size).ok_or(VmError::OutOfBounds)?;
    let mut installed = Vec::new();
    for va in (start..end).step_by(PAGE_SIZE) {
        let fresh = ctx.pmap.resolve(map.root(), va).is_none();
        if let Err(err) = fault(ctx, map, va, access) {
            let _guard = map.lock();
            for va in installed {
                ctx.pmap.remove(map.root(), va);
            }
            return Err(err);
        }
        if fresh {
            installed.push(va);
        }
    }
    Ok(())
}

/// Trap-level entry: resolves the fault or kills the faulting process.
///
/// # Panics
///
/// When the fault cannot be resolved and there is no process to kill.
pub fn handle_fault(
    ctx: &VmContext,
    map: &VmMap,
    va: usize,
    access: Prot,
    faulter: Option<Pid>,
    reaper: &dyn Reaper,
) -> FaultOutcome {
    let error = match fault(ctx, map, va, access) {
        Ok(()) => return FaultOutcome::Resolved,
        Err(error) => error,
    };
    let signal = if error.is_exhaustion() { FaultSignal::Bus } else { FaultSignal::Segv };
    match faulter {
        Some(pid) => {
            log::warn!(
                target: "fault",
                "fault: pid {} {} at {:#x} unresolvable ({}), {:?}",
                pid.0,
                access,
                va,
                error,
                signal
            );
            reaper.kill(pid, signal);
            FaultOutcome::Killed { pid, error }
        }
        None => {
            log::error!(target: "fault", "fault: kernel {} at {:#x}: {}", access, va, error);
            panic!("unrecoverable kernel fault at {:#x}: {}", va, error);
        }
    }
}

fn fault_once(ctx: &VmContext, map: &VmMap, va: usize, access: Prot) -> VmResult<Step> {
    let page = page_align_down(va);
    let write = access.contains(Prot::WRITE);
    let mut inner = map.lock();
    let id = inner.entry_at(page).ok_or(VmError::NotMapped)?;
    let entry = inner.tree.get(id);
    if !entry.prot.contains(access) {
        return Err(VmError::PermissionDenied);
    }
    if ctx.pmap.resolve(inner.root, page).is_some_and(|(_, attrs)| attrs.prot.contains(access)) {
        return Ok(Step::Done);
    }
    let unshare = write && entry.flags.contains(MapFlags::NEEDS_COPY);
    if matches!(entry.backing, Backing::Anonymous) || unshare {
        prepare_amap(ctx, &mut inner, id, write);
    }

    let entry = inner.tree.get(id);
    let (prot, flags) = (entry.prot, entry.flags);
    let read_only = prot.difference(Prot::WRITE);
    let plan = match (&entry.backing, &entry.amap) {
        (Backing::Physical, _) => {
            let pa = usize::try_from(entry.offset_at(page)).map_err(|_| VmError::OutOfBounds)?;
            Plan::Install { pa, prot }
        }
        (backing, Some(aref)) => {
            let slot = aref.slot + (page - entry.start) / PAGE_SIZE;
            let current = aref.amap.lock().anon(slot).map(Arc::clone);
            match (current, backing) {
                (Some(anon), _) => {
                    // One handle is the slot's, one is ours.
                    let shared = Arc::strong_count(&anon) > 2;
                    if write && shared {
                        let src = anon.pa();
                        Plan::Copy { amap: Arc::clone(&aref.amap), slot, src, shared: Some(anon) }
                    } else {
                        let pa = anon.pa();
                        Anon::release(&ctx.frames, anon);
                        let private = shared || flags.contains(MapFlags::NEEDS_COPY);
                        Plan::Install { pa, prot: if private { read_only } else { prot } }
                    }
                }
                (None, Backing::Object(obj)) => {
                    let index = object_index(entry.offset_at(page))?;
                    match obj.lookup(index) {
                        Some(src) if write => {
                            Plan::Copy { amap: Arc::clone(&aref.amap), slot, src, shared: None }
                        }
                        Some(pa) => Plan::Install { pa, prot: read_only },
                        None => Plan::Fetch { obj: Arc::clone(obj), index },
                    }
                }
                (None, _) => Plan::ZeroFill { amap: Arc::clone(&aref.amap), slot },
            }
        }
        (Backing::Object(obj), None) => {
            let index = object_index(entry.offset_at(page))?;
            match obj.lookup(index) {
                Some(pa) if flags.contains(MapFlags::NEEDS_COPY) => {
                    Plan::Install { pa, prot: read_only }
                }
                Some(pa) => Plan::Install { pa, prot },
                None => Plan::Fetch { obj: Arc::clone(obj), index },
            }
        }
        (Backing::Anonymous, None) => {
            log::error!(target: "fault", "fault: anonymous entry {:#x} without amap", entry.start);
            return Err(VmError::InvalidArgument);
        }
    };

    match plan {
        Plan::Install { pa, prot } => {
            install(ctx, map, page, pa, prot, flags)?;
            Ok(Step::Done)
        }
        Plan::ZeroFill { amap, slot } => {
            let mut slots = amap.lock();
            if slots.anon(slot).is_some() {
                return Ok(Step::Retry);
            }
            let anon = Anon::zeroed(&ctx.frames)?;
            let pa = anon.pa();
            let displaced = slots.install(slot, anon);
            drop(slots);
            debug_assert!(displaced.is_none());
            if let Some(old) = displaced {
                Anon::release(&ctx.frames, old);
            }
            MapCounters::bump(&map.counters.zero_fills);
            let prot = if flags.contains(MapFlags::NEEDS_COPY) { read_only } else { prot };
            install(ctx, map, page, pa, prot, flags)?;
            Ok(Step::Done)
        }
        Plan::Copy { amap, slot, src, shared } => {
            let generation = inner.generation;
            drop(inner);
            copy_on_write(ctx, map, generation, page, amap, slot, src, shared, prot, flags)
        }
        Plan::Fetch { obj, index } => {
            drop(inner);
            MapCounters::bump(&map.counters.fetches);
            let fetched = obj.fetch(index, &ctx.frames, ctx.objects.server());
            ctx.objects.put(obj, &ctx.frames);
            fetched?;
            Ok(Step::Retry)
        }
    }
}

fn object_index(offset: u64) -> VmResult<usize> {
    usize::try_from(offset / PAGE_SIZE as u64).map_err(|_| VmError::FetchFailed)
}

/// Gives the entry a private amap: creates one if it has none and, for a
/// write to a copy-on-write entry, replaces a shared one by a copy of its
/// slot range.
fn prepare_amap(ctx: &VmContext, inner: &mut MapInner, id: NodeId, write: bool) {
    let entry = inner.tree.get(id);
    let pages = entry.pages();
    let copy = write && entry.flags.contains(MapFlags::NEEDS_COPY);
    let fresh = match &entry.amap {
        None => {
            let amap = Amap::new(pages);
            amap.lock().add_refs(0..pages);
            log::trace!(target: "amap", "amap: new, {} slots for {:#x}", pages, entry.start);
            Some(amap)
        }
        Some(aref) if copy && !aref.exclusive() => {
            let range = aref.slot..aref.slot + pages;
            let amap = Amap::from_slots(aref.amap.lock().copy_range(range));
            log::trace!(target: "amap", "amap: copied {} slots for {:#x}", pages, entry.start);
            Some(amap)
        }
        Some(_) if copy => None,
        Some(_) => return,
    };

    let old = inner.tree.update(id, |e| {
        if copy {
            e.flags.remove(MapFlags::NEEDS_COPY);
        }
        match fresh {
            Some(amap) => e.amap.replace(AmapRef { amap, slot: 0 }),
            None => None,
        }
    });
    inner.generation += 1;
    if let Some(old) = old {
        let released = old.amap.lock().drop_refs(old.slot..old.slot + pages);
        for anon in released {
            Anon::release(&ctx.frames, anon);
        }
        Amap::release(&ctx.frames, old.amap);
    }
}

/// Copies `src` into a fresh anon with every lock dropped, then installs it
/// in `slot` if neither the map nor the slot changed meanwhile.
#[allow(clippy::too_many_arguments)]
fn copy_on_write(
    ctx: &VmContext,
    map: &VmMap,
    generation: u64,
    page: usize,
    amap: Arc<Amap>,
    slot: usize,
    src: usize,
    shared: Option<Arc<Anon>>,
    prot: Prot,
    flags: MapFlags,
) -> VmResult<Step> {
    let copy = match Anon::copy_of(&ctx.frames, src) {
        Ok(copy) => copy,
        Err(err) => {
            if let Some(old) = shared {
                Anon::release(&ctx.frames, old);
            }
            return Err(err);
        }
    };
    let pa = copy.pa();

    let inner = map.lock();
    let mut slots = amap.lock();
    let unchanged = inner.generation == generation
        && match (slots.anon(slot), &shared) {
            (Some(now), Some(old)) => Arc::ptr_eq(now, old),
            (None, None) => true,
            _ => false,
        };
    if !unchanged {
        drop(slots);
        drop(inner);
        log::trace!(target: "fault", "fault: copy of {:#x} lost a race, discarded", src);
        Anon::release(&ctx.frames, copy);
        if let Some(old) = shared {
            Anon::release(&ctx.frames, old);
        }
        return Ok(Step::Retry);
    }
    let displaced = slots.install(slot, copy);
    drop(slots);
    MapCounters::bump(&map.counters.cow_copies);
    let installed = install(ctx, map, page, pa, prot, flags);
    drop(inner);

    for anon in displaced.into_iter().chain(shared) {
        Anon::release(&ctx.frames, anon);
    }
    installed.map(|()| Step::Done)
}

/// Enters `page -> pa`. The caller holds the map lock.
fn install(
    ctx: &VmContext,
    map: &VmMap,
    page: usize,
    pa: usize,
    prot: Prot,
    flags: MapFlags,
) -> VmResult<()> {
    let cache = if flags.contains(MapFlags::DEVICE) {
        CacheMode::Device
    } else if flags.contains(MapFlags::UNCACHED) {
        CacheMode::Uncached
    } else {
        CacheMode::WriteBack
    };
    let attrs = PteAttrs { prot, user: !map.is_kernel(), cache };
    ctx.pmap.enter(map.root(), page, pa, attrs)?;
    log::trace!(target: "fault", "fault: {:?} {:#x} -> {:#x} {}", map.id(), page, pa, prot);
    Ok(())
}

/// Runs `f` on each page of `[va, va + len)` after faulting it for `access`,
/// with the map locked so the translation stays put.
fn with_pages(
    ctx: &VmContext,
    map: &VmMap,
    va: usize,
    len: usize,
    access: Prot,
    mut f: impl FnMut(usize, usize, Range<usize>),
) -> VmResult<()> {
    let mut done = 0;
    while done < len {
        let at = va.checked_add(done).ok_or(VmError::OutOfBounds)?;
        let page = page_align_down(at);
        let offset = at - page;
        let chunk = (PAGE_SIZE - offset).min(len - done);
        loop {
            fault(ctx, map, at, access)?;
            let _guard = map.lock();
            let Some((pa, attrs)) = ctx.pmap.resolve(map.root(), page) else { continue };
            if !attrs.prot.contains(access) {
                continue;
            }
            if ctx.frames.lookup(pa).is_none() {
                return Err(VmError::InvalidArgument);
            }
            f(pa, offset, done..done + chunk);
            break;
        }
        done += chunk;
    }
    Ok(())
}

/// Copies user memory out of `map`, faulting pages in as a load would.
pub fn read_bytes(ctx: &VmContext, map: &VmMap, va: usize, buf: &mut [u8]) -> VmResult<()> {
    with_pages(ctx, map, va, buf.len(), Prot::READ, |pa, offset, range| {
        ctx.frames.read(pa, offset, &mut buf[range]);
    })
}

/// Copies `data` into `map`, faulting pages in as a store would.
pub fn write_bytes(ctx: &VmContext, map: &VmMap, va: usize, data: &[u8]) -> VmResult<()> {
    with_pages(ctx, map, va, data.len(), Prot::WRITE, |pa, offset, range| {
        ctx.frames.write(pa, offset, &data[range]);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eager_fill_of_private_entries_is_read_only() {
        let rw = Prot::READ | Prot::WRITE;
        assert_eq!(eager_access(rw, MapFlags::NEEDS_COPY), Prot::READ);
        assert_eq!(eager_access(rw, MapFlags::empty()), rw);
        assert_eq!(eager_access(Prot::WRITE, MapFlags::NEEDS_COPY), Prot::empty());
    }
}
