// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Boot-once VM context shared by every address space
//! OWNERS: @kernel-mm-team
//! PUBLIC API: VmContext::{boot, kernel_map, create_map, alloc_pages, free_pages,
//!   get_object, put_object, handle_fault, page_stats, meminfo}
//! INVARIANTS: Constructed once at init and never torn down; the kernel map
//!   translates every kernel image segment before boot returns

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::config::VmConfig;
use crate::error::{VmError, VmResult};
use crate::fault::{self, FaultOutcome, Reaper};
use crate::hal::{BootInfo, PhysWindow, Pmap};
use crate::info::MemInfo;
use crate::map::{Backing, VmMap};
use crate::mm::pmm::PmmStats;
use crate::mm::{is_page_aligned, Frames, PageBlock, PageOwner, PhysAllocator};
use crate::object::{FileServer, MemObject, ObjectCache};
use crate::types::{FileId, MapFlags, MapId, Pid, Prot};

/// Process-wide VM state: frame pool, object registry, kernel map and the
/// collaborators reached through traits.
pub struct VmContext {
    config: VmConfig,
    pub(crate) frames: Frames,
    pub(crate) objects: ObjectCache,
    pub(crate) pmap: Arc<dyn Pmap>,
    kernel: VmMap,
    next_map: AtomicU64,
}

impl VmContext {
    /// Builds the allocator from `boot`, creates the kernel map and maps the
    /// kernel image into it.
    pub fn boot(
        config: VmConfig,
        boot: &BootInfo,
        pmap: Arc<dyn Pmap>,
        window: Arc<dyn PhysWindow>,
        files: Arc<dyn FileServer>,
    ) -> VmResult<Self> {
        config.validate()?;
        let reserved = boot.reserved();
        let pool = PhysAllocator::with_max_order(&boot.regions, &reserved, config.max_order)?;
        let root = pmap.create_root()?;
        let (base, limit) = (config.kernel_base, config.kernel_limit);
        let kernel = VmMap::assemble(MapId(0), true, root, base, limit, false);
        let ctx = Self {
            config,
            frames: Frames::new(pool, window),
            objects: ObjectCache::new(files),
            pmap,
            kernel,
            next_map: AtomicU64::new(1),
        };

        for seg in &boot.kernel_segments {
            if !is_page_aligned(seg.va) || !is_page_aligned(seg.pa) {
                return Err(VmError::Misaligned);
            }
            let size = crate::mm::page_align_up(seg.len).ok_or(VmError::InvalidArgument)?;
            let pa = seg.pa as u64;
            ctx.kernel.map(&ctx, seg.va, size, seg.prot, Backing::Physical, pa, MapFlags::FIXED)?;
            log::info!(
                target: "vm",
                "vm: kernel segment {:#x}..{:#x} -> {:#x} {}",
                seg.va,
                seg.va + size,
                seg.pa,
                seg.prot
            );
        }
        let stats = ctx.page_stats();
        log::info!(
            target: "vm",
            "vm: boot complete, {}/{} pages free",
            stats.free_pages,
            stats.total_pages
        );
        Ok(ctx)
    }

    /// Configuration the context was booted with.
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// The privileged map covering the upper half.
    pub fn kernel_map(&self) -> &VmMap {
        &self.kernel
    }

    /// New empty user address space; `lazy` defaults to the configuration.
    pub fn create_map(&self, lazy: Option<bool>) -> VmResult<VmMap> {
        VmMap::create(self, lazy.unwrap_or(self.config.lazy_user_maps))
    }

    pub(crate) fn next_map_id(&self) -> MapId {
        MapId(self.next_map.fetch_add(1, Ordering::Relaxed))
    }

    /// Physical page pool shared by every map.
    pub fn frames(&self) -> &Frames {
        &self.frames
    }

    /// Raw physical allocation for kernel clients.
    pub fn alloc_pages(&self, size: usize, owner: PageOwner) -> VmResult<PageBlock> {
        self.frames.alloc(size, owner)
    }

    /// Returns a block obtained from [`VmContext::alloc_pages`].
    pub fn free_pages(&self, block: PageBlock) {
        self.frames.free(block);
    }

    /// Opens the memory object of `file`; balance with [`VmContext::put_object`]
    /// unless the object is handed to a mapping.
    pub fn get_object(&self, file: FileId) -> VmResult<Arc<MemObject>> {
        self.objects.get(file)
    }

    /// Drops a reference taken with [`VmContext::get_object`].
    pub fn put_object(&self, obj: Arc<MemObject>) {
        self.objects.put(obj, &self.frames);
    }

    pub fn objects(&self) -> &ObjectCache {
        &self.objects
    }

    /// Trap entry for page faults. Kernel addresses resolve against the
    /// kernel map, everything else against `user`.
    pub fn handle_fault(
        &self,
        user: Option<&VmMap>,
        va: usize,
        access: Prot,
        faulter: Option<Pid>,
        reaper: &dyn Reaper,
    ) -> FaultOutcome {
        let map = match user {
            Some(map) if !self.pmap.is_kernel_address(va) => map,
            _ => &self.kernel,
        };
        fault::handle_fault(self, map, va, access, faulter, reaper)
    }

    /// Allocator counters.
    pub fn page_stats(&self) -> PmmStats {
        self.frames.stats()
    }

    /// Memory-info record for one address space.
    pub fn meminfo(&self, map: &VmMap) -> MemInfo {
        MemInfo::collect(self, map)
    }

    pub(crate) fn release_backing(&self, backing: Backing) {
        if let Backing::Object(obj) = backing {
            self.objects.put(obj, &self.frames);
        }
    }
}
