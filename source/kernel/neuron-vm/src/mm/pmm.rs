// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Buddy allocator for physical page frames
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests + proptest (state restoration, coalescing)
//! PUBLIC API: PhysAllocator::{new, alloc, free, lookup, block_at, stats,
//!   free_ranges, allocated_ranges, verify}, PageBlock, PageOwner
//! INVARIANTS: Class `o` holds only free block heads aligned to
//!   `PAGE_SIZE << o`; no two buddies are free in the same class; free and
//!   allocated pages partition the descriptor array
//!
//! One descriptor per managed frame, sorted by physical address. Free lists
//! are doubly linked through descriptor indices (`NIL` terminated), so the
//! allocator owns no pointers and its state can be compared and verified.

use alloc::vec::Vec;
use core::ops::Range;

use bitflags::bitflags;
use static_assertions::const_assert;

use super::{page_align_down, page_align_up, pages_for, PAGE_SIZE};
use crate::error::{VmError, VmResult};
use crate::hal::PhysRegion;

/// Number of block size classes; class `o` holds blocks of `2^o` pages.
pub const NR_ORDERS: usize = 11;
/// Largest class index.
pub const MAX_ORDER: usize = NR_ORDERS - 1;

const_assert!(NR_ORDERS > 0 && NR_ORDERS <= 32);

const NIL: u32 = u32::MAX;

bitflags! {
    /// Who holds an allocated block.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct PageOwner: u8 {
        const KERNEL = 1 << 0;
        const ANON = 1 << 1;
        const OBJECT = 1 << 2;
        const PAGE_TABLE = 1 << 3;
        const USER = 1 << 4;
    }
}

#[derive(Clone, Copy, Debug)]
struct PageDesc {
    pa: usize,
    /// Class of the block this page belongs to; meaningful on free heads and
    /// on every page of an allocated block.
    order: u8,
    free: bool,
    head: bool,
    owner: PageOwner,
    next: u32,
    prev: u32,
}

/// Handle to an allocated block of `2^order` contiguous frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageBlock {
    pa: usize,
    order: u8,
}

impl PageBlock {
    /// Physical address of the first frame.
    pub const fn pa(&self) -> usize {
        self.pa
    }

    /// Size class: the block spans `1 << order` pages.
    pub const fn order(&self) -> usize {
        self.order as usize
    }

    pub const fn pages(&self) -> usize {
        1 << self.order
    }

    pub const fn size(&self) -> usize {
        PAGE_SIZE << self.order
    }
}

/// Snapshot of one descriptor returned by [`PhysAllocator::lookup`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageInfo {
    pub pa: usize,
    pub free: bool,
    pub head: bool,
    pub order: usize,
    pub owner: PageOwner,
}

/// Allocator counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PmmStats {
    pub total_pages: usize,
    pub free_pages: usize,
    /// Free block count per class.
    pub free_blocks: [usize; NR_ORDERS],
    pub allocations: u64,
    pub frees: u64,
    pub failures: u64,
}

/// Buddy allocator over every usable physical page.
pub struct PhysAllocator {
    descs: Vec<PageDesc>,
    heads: [u32; NR_ORDERS],
    free_pages: usize,
    max_order: usize,
    allocations: u64,
    frees: u64,
    failures: u64,
}

impl PhysAllocator {
    /// Builds the allocator from the usable `regions`, keeping every page that
    /// touches a `reserved` range allocated to [`PageOwner::KERNEL`].
    pub fn new(regions: &[PhysRegion], reserved: &[PhysRegion]) -> VmResult<Self> {
        Self::with_max_order(regions, reserved, MAX_ORDER)
    }

    /// Same as [`PhysAllocator::new`] with a lower coalescing ceiling.
    pub fn with_max_order(
        regions: &[PhysRegion],
        reserved: &[PhysRegion],
        max_order: usize,
    ) -> VmResult<Self> {
        if max_order > MAX_ORDER {
            return Err(VmError::InvalidArgument);
        }
        let mut spans: Vec<(usize, usize)> = regions
            .iter()
            .filter_map(|r| {
                let start = page_align_up(r.base)?;
                let end = page_align_down(r.base.checked_add(r.len)?);
                (start < end).then_some((start, end))
            })
            .collect();
        spans.sort_unstable();
        if spans.windows(2).any(|w| w[0].1 > w[1].0) {
            return Err(VmError::Overlap);
        }
        let total: usize = spans.iter().map(|(s, e)| (e - s) / PAGE_SIZE).sum();
        if total >= NIL as usize {
            return Err(VmError::InvalidArgument);
        }

        let mut descs = Vec::with_capacity(total);
        for &(start, end) in &spans {
            for pa in (start..end).step_by(PAGE_SIZE) {
                descs.push(PageDesc {
                    pa,
                    order: 0,
                    free: false,
                    head: true,
                    owner: PageOwner::KERNEL,
                    next: NIL,
                    prev: NIL,
                });
            }
        }

        let mut this = Self {
            descs,
            heads: [NIL; NR_ORDERS],
            free_pages: 0,
            max_order,
            allocations: 0,
            frees: 0,
            failures: 0,
        };

        let is_reserved = |pa: usize| {
            reserved
                .iter()
                .any(|r| pa < r.base.saturating_add(r.len) && pa + PAGE_SIZE > r.base)
        };

        // Carve each run of usable, physically contiguous pages into maximal
        // aligned blocks. Inserting through `release` also joins runs that
        // meet at a region boundary.
        let mut idx = 0;
        while idx < this.descs.len() {
            if is_reserved(this.descs[idx].pa) {
                idx += 1;
                continue;
            }
            let mut run_end = idx + 1;
            while run_end < this.descs.len()
                && this.descs[run_end].pa == this.descs[run_end - 1].pa + PAGE_SIZE
                && !is_reserved(this.descs[run_end].pa)
            {
                run_end += 1;
            }
            while idx < run_end {
                let pa = this.descs[idx].pa;
                let mut order = 0;
                while order < max_order
                    && pa % (PAGE_SIZE << (order + 1)) == 0
                    && idx + (1 << (order + 1)) <= run_end
                {
                    order += 1;
                }
                this.release(idx, order);
                idx += 1 << order;
            }
        }

        log::info!(
            target: "pmm",
            "pmm: {} pages managed, {} free, {} regions",
            this.descs.len(),
            this.free_pages,
            spans.len()
        );
        this.check();
        Ok(this)
    }

    /// Allocates a block covering `size` bytes rounded up to a power-of-two
    /// number of pages. On failure no allocator state changes.
    pub fn alloc(&mut self, size: usize, owner: PageOwner) -> VmResult<PageBlock> {
        if size == 0 {
            return Err(VmError::InvalidArgument);
        }
        let pages = pages_for(size);
        if pages > 1 << self.max_order {
            self.failures += 1;
            log::debug!(target: "pmm", "pmm: {} pages exceed the largest class", pages);
            return Err(VmError::OutOfMemory);
        }
        let want = order_for(pages);
        let Some(mut order) = (want..=self.max_order).find(|o| self.heads[*o] != NIL) else {
            self.failures += 1;
            log::debug!(target: "pmm", "pmm: no free block of order >= {}", want);
            return Err(VmError::OutOfMemory);
        };

        let idx = self.heads[order] as usize;
        self.unlink(order, idx);
        while order > want {
            order -= 1;
            let upper = idx + (1 << order);
            let desc = &mut self.descs[upper];
            desc.head = true;
            desc.order = order as u8;
            self.push(order, upper);
        }
        for desc in &mut self.descs[idx..idx + (1 << want)] {
            desc.free = false;
            desc.head = false;
            desc.order = want as u8;
            desc.owner = owner;
        }
        self.descs[idx].head = true;
        self.free_pages -= 1 << want;
        self.allocations += 1;
        self.check();

        let block = PageBlock { pa: self.descs[idx].pa, order: want as u8 };
        log::trace!(target: "pmm", "pmm: alloc {:#x} order {}", block.pa, want);
        Ok(block)
    }

    /// Returns `block` to the free lists, coalescing with free buddies.
    ///
    /// Freeing anything that is not the head of an allocated block of exactly
    /// this order halts the kernel after dumping the allocator state.
    pub fn free(&mut self, block: PageBlock) {
        let Some(idx) = self.index_of(block.pa) else {
            self.fatal("free of an untracked address", block.pa);
        };
        let desc = self.descs[idx];
        if desc.free {
            self.fatal("double free", block.pa);
        }
        if !desc.head {
            self.fatal("free of a page inside a block", block.pa);
        }
        if desc.order != block.order {
            self.fatal("free with a mismatched order", block.pa);
        }
        self.frees += 1;
        self.release(idx, block.order());
        self.check();
        log::trace!(target: "pmm", "pmm: free {:#x} order {}", block.pa, block.order);
    }

    /// Descriptor covering `pa`, if `pa` is managed memory.
    pub fn lookup(&self, pa: usize) -> Option<PageInfo> {
        let desc = self.descs[self.index_of(page_align_down(pa))?];
        Some(PageInfo {
            pa: desc.pa,
            free: desc.free,
            head: desc.head,
            order: desc.order as usize,
            owner: desc.owner,
        })
    }

    /// Allocated block containing `pa`, if any.
    pub fn block_at(&self, pa: usize) -> Option<PageBlock> {
        let desc = self.descs[self.index_of(page_align_down(pa))?];
        if desc.free {
            return None;
        }
        let head_pa = desc.pa & !((PAGE_SIZE << desc.order) - 1);
        let head = self.descs[self.index_of(head_pa)?];
        head.head.then_some(PageBlock { pa: head.pa, order: head.order })
    }

    pub fn total_pages(&self) -> usize {
        self.descs.len()
    }

    /// Pages on the free lists.
    pub fn free_pages(&self) -> usize {
        self.free_pages
    }

    pub fn max_order(&self) -> usize {
        self.max_order
    }

    /// Page totals plus free blocks per size class.
    pub fn stats(&self) -> PmmStats {
        let mut free_blocks = [0; NR_ORDERS];
        for (order, count) in free_blocks.iter_mut().enumerate() {
            *count = self.list(order).count();
        }
        PmmStats {
            total_pages: self.descs.len(),
            free_pages: self.free_pages,
            free_blocks,
            allocations: self.allocations,
            frees: self.frees,
            failures: self.failures,
        }
    }

    /// Sorted free extents with touching blocks joined.
    pub fn free_ranges(&self) -> Vec<Range<usize>> {
        let mut blocks: Vec<Range<usize>> = (0..NR_ORDERS)
            .flat_map(|order| {
                self.list(order).map(move |idx| {
                    let pa = self.descs[idx].pa;
                    pa..pa + (PAGE_SIZE << order)
                })
            })
            .collect();
        blocks.sort_unstable_by_key(|r| r.start);
        join_ranges(blocks)
    }

    /// Sorted allocated extents (including reserved pages) with touching
    /// blocks joined.
    pub fn allocated_ranges(&self) -> Vec<Range<usize>> {
        let blocks = self
            .descs
            .iter()
            .filter(|d| !d.free)
            .map(|d| d.pa..d.pa + PAGE_SIZE)
            .collect();
        join_ranges(blocks)
    }

    /// Full structural check of the free lists and descriptor array.
    pub fn verify(&self) -> Result<(), &'static str> {
        let mut listed = 0;
        for order in 0..NR_ORDERS {
            let mut prev = NIL;
            let mut idx = self.heads[order];
            let mut steps = 0;
            while idx != NIL {
                steps += 1;
                if steps > self.descs.len() {
                    return Err("free list cycle");
                }
                let at = idx as usize;
                let desc = self.descs[at];
                if !desc.free || !desc.head {
                    return Err("free list holds an allocated or inner page");
                }
                if desc.order as usize != order || order > self.max_order {
                    return Err("free block filed under the wrong class");
                }
                if desc.prev != prev {
                    return Err("free list back link broken");
                }
                if desc.pa % (PAGE_SIZE << order) != 0 {
                    return Err("free block misaligned for its class");
                }
                if at + (1 << order) > self.descs.len() {
                    return Err("free block runs past the descriptor array");
                }
                for k in 1..(1 << order) {
                    let inner = self.descs[at + k];
                    if inner.pa != desc.pa + k * PAGE_SIZE || !inner.free || inner.head {
                        return Err("free block not contiguous");
                    }
                }
                if order < self.max_order {
                    if let Some(b) = self.index_of(desc.pa ^ (PAGE_SIZE << order)) {
                        let buddy = self.descs[b];
                        if buddy.free && buddy.head && buddy.order as usize == order {
                            return Err("two free buddies in one class");
                        }
                    }
                }
                listed += 1 << order;
                prev = idx;
                idx = desc.next;
            }
        }
        if listed != self.free_pages {
            return Err("free page count disagrees with the free lists");
        }
        if self.descs.iter().filter(|d| d.free).count() != self.free_pages {
            return Err("free descriptor outside every free list");
        }

        let mut idx = 0;
        while idx < self.descs.len() {
            let desc = self.descs[idx];
            if desc.free {
                idx += 1;
                continue;
            }
            if !desc.head {
                return Err("allocated page without a block head");
            }
            let pages = 1 << desc.order;
            if idx + pages > self.descs.len() {
                return Err("allocated block runs past the descriptor array");
            }
            if self.descs[idx + 1..idx + pages].iter().any(|d| d.free || d.head) {
                return Err("allocated block partially free");
            }
            idx += pages;
        }
        Ok(())
    }

    /// Logs the free-list state; used before halting on corruption.
    pub fn dump(&self) {
        log::error!(
            target: "pmm",
            "pmm dump: total={} free={} allocs={} frees={} failures={}",
            self.descs.len(),
            self.free_pages,
            self.allocations,
            self.frees,
            self.failures
        );
        for order in 0..NR_ORDERS {
            let count = self.list(order).count();
            if count == 0 {
                continue;
            }
            let first = self.descs[self.heads[order] as usize].pa;
            log::error!(target: "pmm", "  order {:2}: {} blocks, head {:#x}", order, count, first);
        }
    }

    fn fatal(&self, what: &str, pa: usize) -> ! {
        log::error!(target: "pmm", "pmm: FATAL {} at {:#x}", what, pa);
        self.dump();
        panic!("pmm: {} at {:#x}", what, pa);
    }

    #[cfg(feature = "debug_verify")]
    fn check(&self) {
        if let Err(what) = self.verify() {
            self.fatal(what, 0);
        }
    }

    #[cfg(not(feature = "debug_verify"))]
    fn check(&self) {}

    /// Marks the block free and files it, merging upward while the buddy is a
    /// free head of the same class.
    fn release(&mut self, mut idx: usize, mut order: usize) {
        for desc in &mut self.descs[idx..idx + (1 << order)] {
            desc.free = true;
            desc.head = false;
            desc.order = 0;
            desc.owner = PageOwner::empty();
        }
        self.free_pages += 1 << order;

        while order < self.max_order {
            let buddy_pa = self.descs[idx].pa ^ (PAGE_SIZE << order);
            let Some(b) = self.index_of(buddy_pa) else { break };
            let buddy = self.descs[b];
            if !(buddy.free && buddy.head && buddy.order as usize == order) {
                break;
            }
            self.unlink(order, b);
            self.descs[b].head = false;
            self.descs[b].order = 0;
            idx = idx.min(b);
            order += 1;
        }
        let desc = &mut self.descs[idx];
        desc.head = true;
        desc.order = order as u8;
        self.push(order, idx);
    }

    fn index_of(&self, pa: usize) -> Option<usize> {
        self.descs.binary_search_by_key(&pa, |d| d.pa).ok()
    }

    fn push(&mut self, order: usize, idx: usize) {
        let old = self.heads[order];
        self.descs[idx].prev = NIL;
        self.descs[idx].next = old;
        if old != NIL {
            self.descs[old as usize].prev = idx as u32;
        }
        self.heads[order] = idx as u32;
    }

    fn unlink(&mut self, order: usize, idx: usize) {
        let PageDesc { next, prev, .. } = self.descs[idx];
        if prev == NIL {
            self.heads[order] = next;
        } else {
            self.descs[prev as usize].next = next;
        }
        if next != NIL {
            self.descs[next as usize].prev = prev;
        }
        self.descs[idx].next = NIL;
        self.descs[idx].prev = NIL;
    }

    fn list(&self, order: usize) -> impl Iterator<Item = usize> + '_ {
        let mut idx = self.heads[order];
        core::iter::from_fn(move || {
            if idx == NIL {
                return None;
            }
            let at = idx as usize;
            idx = self.descs[at].next;
            Some(at)
        })
    }
}

/// Smallest class holding `pages` pages.
fn order_for(pages: usize) -> usize {
    pages.next_power_of_two().trailing_zeros() as usize
}

fn join_ranges(sorted: Vec<Range<usize>>) -> Vec<Range<usize>> {
    let mut out: Vec<Range<usize>> = Vec::with_capacity(sorted.len());
    for range in sorted {
        match out.last_mut() {
            Some(last) if last.end == range.start => last.end = range.end,
            _ => out.push(range),
        }
    }
    out
}
