// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Sv39 page tables with lazy allocation of intermediate levels
//! OWNERS: @kernel-mm-team
//! PUBLIC API: PageTable::{new, map, unmap, lookup}, Sv39Pmap (hal::Pmap)
//! INVARIANTS: W^X on every leaf; intermediate levels live until the table
//!   is dropped; Svpbmt bits only on leaves

extern crate alloc;

use alloc::{boxed::Box, collections::BTreeMap, vec, vec::Vec};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

use crate::config::KERNEL_BASE;
use crate::hal::{CacheMode, Pmap, PmapError, PmapRoot, PteAttrs};
use crate::mm::PAGE_SIZE;
use crate::types::Prot;

/// Number of entries per Sv39 page-table page.
const PT_ENTRIES: usize = 512;
const PPN_MASK: usize = (1 << 44) - 1;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Flags stored in Sv39 page-table entries.
    pub struct PageFlags: usize {
        const VALID = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const EXECUTE = 1 << 3;
        const USER = 1 << 4;
        const GLOBAL = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY = 1 << 7;
        /// Svpbmt non-cacheable main memory.
        const PBMT_NC = 1 << 61;
        /// Svpbmt strongly ordered I/O.
        const PBMT_IO = 1 << 62;
    }
}

const LEAF_PERMS: PageFlags = PageFlags::READ.union(PageFlags::WRITE).union(PageFlags::EXECUTE);

#[repr(align(4096))]
struct PageTablePage {
    entries: [usize; PT_ENTRIES],
}

impl PageTablePage {
    const fn new() -> Self {
        Self { entries: [0; PT_ENTRIES] }
    }
}

/// Three-level Sv39 page table allocating intermediate levels on demand.
pub struct PageTable {
    root: NonNull<PageTablePage>,
    owned: Vec<NonNull<PageTablePage>>,
}

// SAFETY: the table exclusively owns every page reachable from `root`.
unsafe impl Send for PageTable {}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PageTable {
    /// Creates an empty Sv39 page table with a fresh root page.
    pub fn new() -> Self {
        let root = Self::alloc_page();
        Self { root, owned: vec![root] }
    }

    /// Number of table pages (root included) currently owned.
    pub fn table_pages(&self) -> usize {
        self.owned.len()
    }

    /// Returns the leaf mapped at `va` as `(pa, flags)`.
    pub fn lookup(&self, va: usize) -> Option<(usize, PageFlags)> {
        // SAFETY: `leaf` points into a page owned by this table.
        let entry = unsafe { *self.leaf(va)? };
        let pa = ((entry >> 10) & PPN_MASK) << 12;
        Some((pa, PageFlags::from_bits_truncate(entry & !(PPN_MASK << 10))))
    }

    /// Installs a 4 KiB mapping from `va` to `pa` using `flags`.
    pub fn map(&mut self, va: usize, pa: usize, flags: PageFlags) -> Result<(), PmapError> {
        if va % PAGE_SIZE != 0 || pa % PAGE_SIZE != 0 {
            return Err(PmapError::Unaligned);
        }
        if !is_canonical_sv39(va) || (pa / PAGE_SIZE) > PPN_MASK {
            return Err(PmapError::OutOfRange);
        }
        if flags.intersection(LEAF_PERMS).is_empty() || !flags.contains(PageFlags::VALID) {
            return Err(PmapError::InvalidFlags);
        }
        if flags.contains(PageFlags::PBMT_NC | PageFlags::PBMT_IO) {
            return Err(PmapError::InvalidFlags);
        }
        if flags.contains(PageFlags::WRITE) && flags.contains(PageFlags::EXECUTE) {
            return Err(PmapError::PermissionDenied);
        }

        let indices = vpn_indices(va);
        let mut table = self.root;
        for (level, index) in indices.iter().enumerate() {
            // SAFETY: `table` is the root or a page this table allocated.
            let entry = unsafe { &mut (*table.as_ptr()).entries[*index] };
            if level == indices.len() - 1 {
                if *entry & PageFlags::VALID.bits() != 0 {
                    return Err(PmapError::Overlap);
                }
                let ppn = pa / PAGE_SIZE;
                *entry = (ppn << 10) | flags.bits();
                return Ok(());
            }

            if *entry & PageFlags::VALID.bits() != 0 {
                if *entry & LEAF_PERMS.bits() != 0 {
                    return Err(PmapError::Overlap);
                }
                let next = ((*entry >> 10) << 12) as *mut PageTablePage;
                table = NonNull::new(next).ok_or(PmapError::OutOfRange)?;
                continue;
            }

            let next = Self::alloc_page();
            self.owned.push(next);
            let ppn = next.as_ptr() as usize / PAGE_SIZE;
            *entry = (ppn << 10) | PageFlags::VALID.bits();
            table = next;
        }
        Ok(())
    }

    /// Clears the leaf at `va`, returning the physical address it mapped.
    pub fn unmap(&mut self, va: usize) -> Option<usize> {
        let (pa, _) = self.lookup(va)?;
        let entry = self.leaf(va)?;
        // SAFETY: `leaf` points into a page owned by this table, and
        // `&mut self` rules out concurrent walkers.
        unsafe { *entry = 0 };
        Some(pa)
    }

    /// Walks to the valid last-level leaf for `va`.
    fn leaf(&self, va: usize) -> Option<*mut usize> {
        if va % PAGE_SIZE != 0 || !is_canonical_sv39(va) {
            return None;
        }
        let indices = vpn_indices(va);
        let mut table = self.root;
        for (level, index) in indices.iter().enumerate() {
            // SAFETY: `table` is the root or a page this table allocated.
            let slot = unsafe { core::ptr::addr_of_mut!((*table.as_ptr()).entries[*index]) };
            // SAFETY: `slot` lies inside that page.
            let entry = unsafe { *slot };
            if entry & PageFlags::VALID.bits() == 0 {
                return None;
            }
            let is_leaf = entry & LEAF_PERMS.bits() != 0;
            if level == indices.len() - 1 {
                return if is_leaf { Some(slot) } else { None };
            }
            if is_leaf {
                return None;
            }
            let next = ((entry >> 10) << 12) as *mut PageTablePage;
            table = NonNull::new(next)?;
        }
        None
    }

    fn alloc_page() -> NonNull<PageTablePage> {
        let boxed = Box::new(PageTablePage::new());
        // SAFETY: Box never yields a null pointer.
        unsafe { NonNull::new_unchecked(Box::into_raw(boxed)) }
    }
}

impl Drop for PageTable {
    fn drop(&mut self) {
        for page in self.owned.drain(..) {
            // SAFETY: every pointer originates from `alloc_page` and is unique.
            unsafe { drop(Box::from_raw(page.as_ptr())) };
        }
    }
}

/// VPN fields in walk order, root level first.
fn vpn_indices(va: usize) -> [usize; 3] {
    let vpn0 = (va >> 12) & 0x1ff;
    let vpn1 = (va >> 21) & 0x1ff;
    let vpn2 = (va >> 30) & 0x1ff;
    [vpn2, vpn1, vpn0]
}

fn is_canonical_sv39(va: usize) -> bool {
    let sign = (va >> 38) & 1;
    let upper = va >> 39;
    if sign == 0 {
        upper == 0
    } else {
        upper == usize::MAX >> 39
    }
}

/// Translates architecture-neutral attributes into leaf flags.
pub fn encode(attrs: PteAttrs) -> PageFlags {
    let mut flags = PageFlags::VALID | PageFlags::ACCESSED;
    if attrs.prot.intersects(Prot::READ | Prot::WRITE) {
        flags |= PageFlags::READ;
    }
    if attrs.prot.contains(Prot::WRITE) {
        flags |= PageFlags::WRITE | PageFlags::DIRTY;
    }
    if attrs.prot.contains(Prot::EXEC) {
        flags |= PageFlags::EXECUTE;
    }
    if attrs.user {
        flags |= PageFlags::USER;
    } else {
        flags |= PageFlags::GLOBAL;
    }
    match attrs.cache {
        CacheMode::WriteBack => {}
        CacheMode::Uncached => flags |= PageFlags::PBMT_NC,
        CacheMode::Device => flags |= PageFlags::PBMT_IO,
    }
    flags
}

/// Inverse of [`encode`].
pub fn decode(flags: PageFlags) -> PteAttrs {
    let mut prot = Prot::empty();
    prot.set(Prot::READ, flags.contains(PageFlags::READ));
    prot.set(Prot::WRITE, flags.contains(PageFlags::WRITE));
    prot.set(Prot::EXEC, flags.contains(PageFlags::EXECUTE));
    let cache = if flags.contains(PageFlags::PBMT_IO) {
        CacheMode::Device
    } else if flags.contains(PageFlags::PBMT_NC) {
        CacheMode::Uncached
    } else {
        CacheMode::WriteBack
    };
    PteAttrs { prot, user: flags.contains(PageFlags::USER), cache }
}

fn flush_page(va: usize) {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    // SAFETY: sfence.vma only orders address-translation caches.
    unsafe {
        core::arch::asm!("sfence.vma {0}, zero", in(reg) va, options(nostack, preserves_flags));
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    let _ = va;
}

/// [`Pmap`] over a set of Sv39 tables, one per root handle.
pub struct Sv39Pmap {
    tables: spin::Mutex<BTreeMap<PmapRoot, PageTable>>,
    next: AtomicU32,
}

impl Default for Sv39Pmap {
    fn default() -> Self {
        Self::new()
    }
}

impl Sv39Pmap {
    pub const fn new() -> Self {
        Self { tables: spin::Mutex::new(BTreeMap::new()), next: AtomicU32::new(1) }
    }

    /// Live roots.
    pub fn roots(&self) -> usize {
        self.tables.lock().len()
    }
}

impl Pmap for Sv39Pmap {
    fn create_root(&self) -> Result<PmapRoot, PmapError> {
        let root = PmapRoot(self.next.fetch_add(1, Ordering::Relaxed));
        self.tables.lock().insert(root, PageTable::new());
        Ok(root)
    }

    fn destroy_root(&self, root: PmapRoot) {
        self.tables.lock().remove(&root);
    }

    fn enter(
        &self,
        root: PmapRoot,
        va: usize,
        pa: usize,
        attrs: PteAttrs,
    ) -> Result<(), PmapError> {
        let mut tables = self.tables.lock();
        let table = tables.get_mut(&root).ok_or(PmapError::UnknownRoot)?;
        if table.unmap(va).is_some() {
            flush_page(va);
        }
        table.map(va, pa, encode(attrs))
    }

    fn remove(&self, root: PmapRoot, va: usize) -> Option<usize> {
        let pa = self.tables.lock().get_mut(&root)?.unmap(va)?;
        flush_page(va);
        Some(pa)
    }

    fn resolve(&self, root: PmapRoot, va: usize) -> Option<(usize, PteAttrs)> {
        let (pa, flags) = self.tables.lock().get(&root)?.lookup(va)?;
        Some((pa, decode(flags)))
    }

    fn is_kernel_address(&self, va: usize) -> bool {
        va >= KERNEL_BASE
    }
}
