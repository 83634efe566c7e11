// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Simulated machine for host execution of the VM core
//! OWNERS: @kernel-mm-team
//! PUBLIC API: SimMachine (PhysWindow + Pmap over Sv39 tables), SimFiles
//!   (in-memory FileServer)
//!
//! RAM is a heap arena addressed as if it started at `DRAM_BASE`, mirroring
//! QEMU `virt`. Translations go through the real Sv39 table code.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::ptr::NonNull;

use super::{BootInfo, KernelSegment, PhysRegion, PhysWindow, Pmap, PmapError, PmapRoot, PteAttrs};
use crate::arch::sv39::Sv39Pmap;
use crate::config::KERNEL_BASE;
use crate::error::IoError;
use crate::mm::PAGE_SIZE;
use crate::object::FileServer;
use crate::types::{FileId, Prot};

/// Physical base of RAM on QEMU `virt`.
pub const DRAM_BASE: usize = 0x8000_0000;

/// Host stand-in for RAM plus the MMU.
pub struct SimMachine {
    base: usize,
    ram: Box<[UnsafeCell<u8>]>,
    pmap: Sv39Pmap,
}

// SAFETY: RAM bytes are only reached through raw pointers handed out by
// `page_ptr`; callers synchronise page contents themselves, as on hardware.
unsafe impl Sync for SimMachine {}

impl SimMachine {
    /// Machine with `pages` pages of RAM at [`DRAM_BASE`].
    pub fn new(pages: usize) -> Arc<Self> {
        Self::with_base(DRAM_BASE, pages)
    }

    /// RAM of `pages` pages starting at `base`.
    pub fn with_base(base: usize, pages: usize) -> Arc<Self> {
        assert!(base % PAGE_SIZE == 0, "RAM base must be page aligned");
        let ram = (0..pages * PAGE_SIZE).map(|_| UnsafeCell::new(0)).collect();
        Arc::new(Self { base, ram, pmap: Sv39Pmap::new() })
    }

    /// All of RAM as one region.
    pub fn region(&self) -> PhysRegion {
        PhysRegion { base: self.base, len: self.ram.len() }
    }

    /// Boot geometry with a kernel image in the first `kernel_pages` pages:
    /// text (RX) in the first half, data (RW) in the rest, linked in the
    /// upper half of the address space.
    pub fn boot_info(&self, kernel_pages: usize) -> BootInfo {
        let text = kernel_pages / 2;
        let mut kernel_segments = Vec::new();
        if text > 0 {
            kernel_segments.push(KernelSegment {
                va: KERNEL_BASE + self.base,
                pa: self.base,
                len: text * PAGE_SIZE,
                prot: Prot::READ | Prot::EXEC,
            });
        }
        if kernel_pages > text {
            kernel_segments.push(KernelSegment {
                va: KERNEL_BASE + self.base + text * PAGE_SIZE,
                pa: self.base + text * PAGE_SIZE,
                len: (kernel_pages - text) * PAGE_SIZE,
                prot: Prot::READ | Prot::WRITE,
            });
        }
        BootInfo { regions: vec![self.region()], kernel_segments }
    }

    /// Page tables of the simulated MMU.
    pub fn pmap(&self) -> &Sv39Pmap {
        &self.pmap
    }
}

// SAFETY: every accepted `pa` addresses a whole page inside the arena, which
// lives as long as the machine; pages never overlap.
unsafe impl PhysWindow for SimMachine {
    fn page_ptr(&self, pa: usize) -> Option<NonNull<u8>> {
        if pa % PAGE_SIZE != 0 || pa < self.base || pa - self.base >= self.ram.len() {
            return None;
        }
        // SAFETY: the offset is in bounds; the pointer keeps the provenance
        // of the whole arena.
        let cell = unsafe { self.ram.as_ptr().add(pa - self.base) };
        NonNull::new(UnsafeCell::raw_get(cell))
    }
}

impl Pmap for SimMachine {
    fn create_root(&self) -> Result<PmapRoot, PmapError> {
        self.pmap.create_root()
    }

    fn destroy_root(&self, root: PmapRoot) {
        self.pmap.destroy_root(root);
    }

    fn enter(
        &self,
        root: PmapRoot,
        va: usize,
        pa: usize,
        attrs: PteAttrs,
    ) -> Result<(), PmapError> {
        if self.page_ptr(pa).is_none() && attrs.cache == super::CacheMode::WriteBack {
            // Cacheable translations must point at RAM; device windows may not.
            return Err(PmapError::OutOfRange);
        }
        self.pmap.enter(root, va, pa, attrs)
    }

    fn remove(&self, root: PmapRoot, va: usize) -> Option<usize> {
        self.pmap.remove(root, va)
    }

    fn resolve(&self, root: PmapRoot, va: usize) -> Option<(usize, PteAttrs)> {
        self.pmap.resolve(root, va)
    }

    fn is_kernel_address(&self, va: usize) -> bool {
        self.pmap.is_kernel_address(va)
    }
}

struct SimFile {
    data: Vec<u8>,
    reads: u64,
    releases: u64,
}

/// In-memory file server counting reads and releases per file.
#[derive(Default)]
pub struct SimFiles {
    files: spin::Mutex<BTreeMap<FileId, SimFile>>,
    read_hook: spin::Mutex<Option<fn()>>,
}

impl SimFiles {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates or replaces `file` with `data`.
    pub fn insert(&self, file: FileId, data: Vec<u8>) {
        self.files.lock().insert(file, SimFile { data, reads: 0, releases: 0 });
    }

    /// Runs `hook` inside every read, before data is copied; tests use it to
    /// widen race windows.
    pub fn set_read_hook(&self, hook: fn()) {
        *self.read_hook.lock() = Some(hook);
    }

    /// Reads served for `file`.
    pub fn reads(&self, file: FileId) -> u64 {
        self.files.lock().get(&file).map_or(0, |f| f.reads)
    }

    /// Times the kernel dropped its reference to `file`.
    pub fn releases(&self, file: FileId) -> u64 {
        self.files.lock().get(&file).map_or(0, |f| f.releases)
    }
}

impl FileServer for SimFiles {
    fn size(&self, file: FileId) -> Result<u64, IoError> {
        let files = self.files.lock();
        let entry = files.get(&file).ok_or(IoError::NoSuchFile)?;
        Ok(entry.data.len() as u64)
    }

    fn read(&self, file: FileId, offset: u64, buf: &mut [u8]) -> Result<usize, IoError> {
        let hook = *self.read_hook.lock();
        if let Some(hook) = hook {
            hook();
        }
        let mut files = self.files.lock();
        let entry = files.get_mut(&file).ok_or(IoError::NoSuchFile)?;
        entry.reads += 1;
        let start = usize::try_from(offset).map_err(|_| IoError::EndOfFile)?;
        if start >= entry.data.len() {
            return Err(IoError::EndOfFile);
        }
        let len = buf.len().min(entry.data.len() - start);
        buf[..len].copy_from_slice(&entry.data[start..start + len]);
        Ok(len)
    }

    fn release(&self, file: FileId) {
        if let Some(entry) = self.files.lock().get_mut(&file) {
            entry.releases += 1;
        }
    }
}
