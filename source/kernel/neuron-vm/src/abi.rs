// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Memory system-call shims called by the syscall dispatcher
//! OWNERS: @kernel-mm-team
//! PUBLIC API: sys_map, sys_unmap, sys_meminfo, MAP_FAILED, PROT_*, MAP_*
//! INVARIANTS: Decode -> Check -> Execute; W^X for every mapping; failures
//!   surface as MAP_FAILED or a negative errno, never as a signal

use crate::context::VmContext;
use crate::error::VmError;
use crate::info::MemInfo;
use crate::map::{Backing, VmMap};
use crate::mm::is_page_aligned;
use crate::types::{FileId, MapFlags, Prot};

/// Returned by [`sys_map`] on any failure.
pub const MAP_FAILED: usize = usize::MAX;

pub const PROT_READ: u32 = 1 << 0;
pub const PROT_WRITE: u32 = 1 << 1;
pub const PROT_EXEC: u32 = 1 << 2;

/// Copy-on-write view; without it file mappings are shared.
pub const MAP_PRIVATE: u32 = 1 << 0;
pub const MAP_FIXED: u32 = 1 << 1;
pub const MAP_NO_INHERIT: u32 = 1 << 2;
pub const MAP_UNCACHED: u32 = 1 << 3;

const PROT_MASK: u32 = PROT_READ | PROT_WRITE | PROT_EXEC;
const MAP_MASK: u32 = MAP_PRIVATE | MAP_FIXED | MAP_NO_INHERIT | MAP_UNCACHED;

pub const EIO: isize = 5;
pub const ENOMEM: isize = 12;
pub const EACCES: isize = 13;
pub const EFAULT: isize = 14;
pub const EEXIST: isize = 17;
pub const EINVAL: isize = 22;

/// Errno reported for `err`.
pub fn errno(err: VmError) -> isize {
    match err {
        VmError::OutOfMemory | VmError::NoVirtualSpace => ENOMEM,
        VmError::FetchFailed => EIO,
        VmError::PermissionDenied => EACCES,
        VmError::NotMapped | VmError::OutOfBounds => EFAULT,
        VmError::Overlap => EEXIST,
        VmError::Misaligned | VmError::InvalidArgument => EINVAL,
        VmError::Pmap(_) if err.is_exhaustion() => ENOMEM,
        VmError::Pmap(_) => EINVAL,
    }
}

#[derive(Copy, Clone)]
struct MapArgsTyped {
    hint: usize,
    len: usize,
    prot: Prot,
    flags: MapFlags,
    file: Option<FileId>,
    offset: u64,
}

impl MapArgsTyped {
    #[inline]
    fn decode(
        hint: usize,
        len: usize,
        prot: u32,
        flags: u32,
        file: Option<FileId>,
        offset: u64,
    ) -> Result<Self, VmError> {
        if prot & !PROT_MASK != 0 || flags & !MAP_MASK != 0 {
            return Err(VmError::InvalidArgument);
        }
        let mut p = Prot::empty();
        p.set(Prot::READ, prot & PROT_READ != 0);
        p.set(Prot::WRITE, prot & PROT_WRITE != 0);
        p.set(Prot::EXEC, prot & PROT_EXEC != 0);
        let mut f = MapFlags::empty();
        f.set(MapFlags::NEEDS_COPY, flags & MAP_PRIVATE != 0);
        f.set(MapFlags::FIXED, flags & MAP_FIXED != 0);
        f.set(MapFlags::NO_INHERIT, flags & MAP_NO_INHERIT != 0);
        f.set(MapFlags::UNCACHED, flags & MAP_UNCACHED != 0);
        Ok(Self { hint, len, prot: p, flags: f, file, offset })
    }

    #[inline]
    fn check(&self) -> Result<(), VmError> {
        if self.len == 0 {
            return Err(VmError::InvalidArgument);
        }
        // W^X
        if self.prot.contains(Prot::WRITE | Prot::EXEC) {
            return Err(VmError::PermissionDenied);
        }
        if !is_page_aligned(self.len) || self.offset % crate::mm::PAGE_SIZE as u64 != 0 {
            return Err(VmError::Misaligned);
        }
        if self.flags.contains(MapFlags::FIXED) && !is_page_aligned(self.hint) {
            return Err(VmError::Misaligned);
        }
        Ok(())
    }

    fn execute(self, ctx: &VmContext, map: &VmMap) -> Result<usize, VmError> {
        let backing = match self.file {
            Some(file) => Backing::Object(ctx.get_object(file)?),
            None => Backing::Anonymous,
        };
        map.map(ctx, self.hint, self.len, self.prot, backing, self.offset, self.flags)
    }
}

/// Maps anonymous memory (`file == None`) or a view of `file`. Returns the
/// start address or [`MAP_FAILED`].
#[allow(clippy::too_many_arguments)]
pub fn sys_map(
    ctx: &VmContext,
    map: &VmMap,
    hint: usize,
    len: usize,
    prot: u32,
    flags: u32,
    file: Option<FileId>,
    offset: u64,
) -> usize {
    let result = MapArgsTyped::decode(hint, len, prot, flags, file, offset).and_then(|typed| {
        typed.check()?; // Check phase
        typed.execute(ctx, map)
    });
    match result {
        Ok(va) => va,
        Err(err) => {
            log::debug!(target: "vm", "vm: sys_map {:#x}+{:#x} failed: {}", hint, len, err);
            MAP_FAILED
        }
    }
}

/// Returns 0 or a negative errno.
pub fn sys_unmap(ctx: &VmContext, map: &VmMap, va: usize, len: usize) -> isize {
    match map.unmap(ctx, va, len) {
        Ok(()) => 0,
        Err(err) => -errno(err),
    }
}

/// Fills `out` with the memory-info record of `map`; returns 0.
pub fn sys_meminfo(ctx: &VmContext, map: &VmMap, out: &mut MemInfo) -> isize {
    *out = ctx.meminfo(map);
    0
}
