// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Hardware abstraction consumed by the VM core: translation tables, the
//! physical direct map, and boot-time memory geometry.

pub mod sim;

use alloc::vec::Vec;
use core::ptr::NonNull;

use thiserror::Error;

use crate::types::Prot;

/// Handle to one page-table root owned by a [`Pmap`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PmapRoot(pub u32);

/// Memory type of a translation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CacheMode {
    WriteBack,
    Uncached,
    Device,
}

/// Architecture-neutral description of a leaf translation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PteAttrs {
    pub prot: Prot,
    /// Accessible from user mode.
    pub user: bool,
    pub cache: CacheMode,
}

/// Errors reported by a page-table implementation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum PmapError {
    #[error("address not page aligned")]
    Unaligned,
    #[error("address outside the translatable range")]
    OutOfRange,
    #[error("writable and executable translation refused")]
    PermissionDenied,
    #[error("translation already present")]
    Overlap,
    #[error("attributes do not describe a valid leaf")]
    InvalidFlags,
    #[error("unknown page-table root")]
    UnknownRoot,
    #[error("no memory for page-table pages")]
    NoMemory,
}

/// Per-architecture translation tables.
pub trait Pmap: Send + Sync {
    fn create_root(&self) -> Result<PmapRoot, PmapError>;

    /// Releases a root and every intermediate table page it owns.
    fn destroy_root(&self, root: PmapRoot);

    /// Installs `va -> pa`, replacing any translation already present.
    fn enter(&self, root: PmapRoot, va: usize, pa: usize, attrs: PteAttrs) -> Result<(), PmapError>;

    /// Removes the translation of `va`, returning the physical address it
    /// pointed to.
    fn remove(&self, root: PmapRoot, va: usize) -> Option<usize>;

    fn resolve(&self, root: PmapRoot, va: usize) -> Option<(usize, PteAttrs)>;

    /// Faults on kernel addresses are resolved against the kernel map.
    fn is_kernel_address(&self, va: usize) -> bool;
}

/// Direct-map access to physical frames.
///
/// # Safety
///
/// `page_ptr` must return a pointer valid for reads and writes of
/// `PAGE_SIZE` bytes for every page-aligned `pa` it accepts, for as long as
/// the window lives, and distinct frames must never alias.
pub unsafe trait PhysWindow: Send + Sync {
    fn page_ptr(&self, pa: usize) -> Option<NonNull<u8>>;
}

/// A span of physical memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhysRegion {
    pub base: usize,
    pub len: usize,
}

impl PhysRegion {
    pub const fn end(&self) -> usize {
        self.base + self.len
    }
}

/// A kernel image segment, already loaded at `pa` and linked at `va`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelSegment {
    pub va: usize,
    pub pa: usize,
    pub len: usize,
    pub prot: Prot,
}

/// Memory geometry reported by the boot stage.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BootInfo {
    /// Usable RAM.
    pub regions: Vec<PhysRegion>,
    pub kernel_segments: Vec<KernelSegment>,
}

impl BootInfo {
    /// Physical ranges the page allocator must never hand out.
    pub fn reserved(&self) -> Vec<PhysRegion> {
        self.kernel_segments.iter().map(|s| PhysRegion { base: s.pa, len: s.len }).collect()
    }
}
