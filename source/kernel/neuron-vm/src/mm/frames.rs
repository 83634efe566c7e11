// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Locked page allocator plus direct-map access to frame contents.

use alloc::sync::Arc;
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

use super::pmm::{PageBlock, PageInfo, PageOwner, PhysAllocator, PmmStats};
use super::PAGE_SIZE;
use crate::error::{VmError, VmResult};
use crate::hal::PhysWindow;

/// One-shot failure injection, consumed by the next matching operation.
#[derive(Debug, Default)]
pub struct Failpoints {
    next_alloc: AtomicBool,
    next_fetch: AtomicBool,
}

impl Failpoints {
    /// Makes the next page allocation fail with `OutOfMemory`.
    #[cfg(feature = "failpoints")]
    pub fn fail_next_alloc(&self) {
        self.next_alloc.store(true, Ordering::SeqCst);
    }

    /// Makes the next backing-store read fail with `FetchFailed`.
    #[cfg(feature = "failpoints")]
    pub fn fail_next_fetch(&self) {
        self.next_fetch.store(true, Ordering::SeqCst);
    }

    pub(crate) fn take_alloc(&self) -> bool {
        self.next_alloc.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn take_fetch(&self) -> bool {
        self.next_fetch.swap(false, Ordering::SeqCst)
    }
}

/// The global frame pool: [`PhysAllocator`] behind a spinlock, and the
/// window used to read, write, zero and copy frame contents.
pub struct Frames {
    pool: spin::Mutex<PhysAllocator>,
    window: Arc<dyn PhysWindow>,
    failpoints: Failpoints,
}

impl Frames {
    /// Puts `pool` behind a lock; page contents are reached through `window`.
    pub fn new(pool: PhysAllocator, window: Arc<dyn PhysWindow>) -> Self {
        Self { pool: spin::Mutex::new(pool), window, failpoints: Failpoints::default() }
    }

    /// One-shot failure injection for allocation and fetch.
    pub fn failpoints(&self) -> &Failpoints {
        &self.failpoints
    }

    /// Allocates a block of at least `size` bytes. Never blocks.
    pub fn alloc(&self, size: usize, owner: PageOwner) -> VmResult<PageBlock> {
        if self.failpoints.take_alloc() {
            log::debug!(target: "pmm", "pmm: injected allocation failure");
            return Err(VmError::OutOfMemory);
        }
        self.pool.lock().alloc(size, owner)
    }

    /// Allocates one zero-filled page.
    pub fn alloc_zeroed(&self, owner: PageOwner) -> VmResult<PageBlock> {
        let block = self.alloc(PAGE_SIZE, owner)?;
        self.zero(block.pa());
        Ok(block)
    }

    /// Allocates one page holding a copy of the page at `src`.
    pub fn alloc_copy(&self, src: usize, owner: PageOwner) -> VmResult<PageBlock> {
        let block = self.alloc(PAGE_SIZE, owner)?;
        self.copy(block.pa(), src);
        Ok(block)
    }

    /// Returns `block` to the allocator.
    pub fn free(&self, block: PageBlock) {
        self.pool.lock().free(block);
    }

    /// State of the page holding `pa`, if the allocator tracks it.
    pub fn lookup(&self, pa: usize) -> Option<PageInfo> {
        self.pool.lock().lookup(pa)
    }

    /// Allocator counters.
    pub fn stats(&self) -> PmmStats {
        self.pool.lock().stats()
    }

    /// Runs `f` with the allocator locked; for verification and dumps.
    pub fn with_pool<R>(&self, f: impl FnOnce(&PhysAllocator) -> R) -> R {
        f(&self.pool.lock())
    }

    /// Clears the page at `pa`.
    pub fn zero(&self, pa: usize) {
        let dst = self.page(pa);
        // SAFETY: `page` returns a pointer valid for PAGE_SIZE bytes.
        unsafe { ptr::write_bytes(dst, 0, PAGE_SIZE) };
    }

    /// Copies the page at `src` over the page at `dst`.
    pub fn copy(&self, dst: usize, src: usize) {
        let (d, s) = (self.page(dst), self.page(src));
        // SAFETY: both pointers cover a whole page and distinct frames never
        // alias in the direct map.
        unsafe { ptr::copy_nonoverlapping(s, d, PAGE_SIZE) };
    }

    /// Copies `buf.len()` bytes out of the page at `pa`, starting at `offset`.
    pub fn read(&self, pa: usize, offset: usize, buf: &mut [u8]) {
        assert!(offset + buf.len() <= PAGE_SIZE, "frame read crosses the page");
        let src = self.page(pa);
        // SAFETY: the range stays inside the page checked above.
        unsafe { ptr::copy_nonoverlapping(src.add(offset), buf.as_mut_ptr(), buf.len()) };
    }

    /// Copies `data` into the page at `pa`, starting at `offset`.
    pub fn write(&self, pa: usize, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= PAGE_SIZE, "frame write crosses the page");
        let dst = self.page(pa);
        // SAFETY: the range stays inside the page checked above.
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), dst.add(offset), data.len()) };
    }

    fn page(&self, pa: usize) -> *mut u8 {
        match self.window.page_ptr(pa) {
            Some(ptr) => ptr.as_ptr(),
            None => panic!("frame {:#x} outside the direct map", pa),
        }
    }
}
